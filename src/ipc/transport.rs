//! Worker launchers
//!
//! A launcher starts one worker and hands back the two halves of its
//! connection. [`InProcessLauncher`] runs the worker loop on a tokio task;
//! [`ProcessLauncher`] re-executes a binary and speaks NDJSON over stdio.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::{EventSink, HostMessage, TestOutputPayload, WorkerEvent, WorkerInitParams};
use crate::config::env::ENV_PREFIX;
use crate::error::CoreError;
use crate::models::TestRegistry;

/// How a worker went away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessExitData {
    /// The worker exited without being asked to stop.
    pub unexpectedly: bool,
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ProcessExitData {
    pub fn describe(&self) -> String {
        format!(
            "worker process exited unexpectedly (code={}, signal={})",
            self.code.map_or_else(|| "null".to_string(), |c| c.to_string()),
            self.signal.as_deref().unwrap_or("null")
        )
    }
}

/// Sending half of a worker connection.
#[derive(Clone, Debug)]
pub struct WorkerSender {
    tx: mpsc::UnboundedSender<HostMessage>,
    stop_sent: Arc<AtomicBool>,
}

impl WorkerSender {
    fn new(tx: mpsc::UnboundedSender<HostMessage>) -> Self {
        Self {
            tx,
            stop_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns `false` once the worker is gone.
    pub fn send(&self, message: HostMessage) -> bool {
        if matches!(message, HostMessage::Stop) {
            self.stop_sent.store(true, Ordering::SeqCst);
        }
        self.tx.send(message).is_ok()
    }

    pub fn stop_sent(&self) -> bool {
        self.stop_sent.load(Ordering::SeqCst)
    }
}

pub struct WorkerConnection {
    pub sender: WorkerSender,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    /// Resolves after the last event of the worker has been queued.
    pub exit: oneshot::Receiver<ProcessExitData>,
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, params: &WorkerInitParams) -> Result<WorkerConnection, CoreError>;
}

/// Runs workers as tasks of the current runtime.
pub struct InProcessLauncher {
    registry: Arc<dyn TestRegistry>,
}

impl InProcessLauncher {
    pub fn new(registry: Arc<dyn TestRegistry>) -> Self {
        Self { registry }
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, params: &WorkerInitParams) -> Result<WorkerConnection, CoreError> {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = EventSink::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let sender = WorkerSender::new(host_tx);
        let stop_sent = sender.stop_sent.clone();

        let registry = self.registry.clone();
        let worker_index = params.worker_index;
        let worker = tokio::spawn(crate::worker::serve(registry, host_rx, events));
        tokio::spawn(async move {
            let code = match worker.await {
                Ok(()) => 0,
                Err(e) => {
                    warn!("In-process worker {} failed: {}", worker_index, e);
                    1
                }
            };
            let _ = exit_tx.send(ProcessExitData {
                unexpectedly: !stop_sent.load(Ordering::SeqCst),
                code: Some(code),
                signal: None,
            });
        });

        Ok(WorkerConnection {
            sender,
            events: event_rx,
            exit: exit_rx,
        })
    }
}

/// Runs each worker as a child process.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-execute the running binary with the hidden `worker` subcommand.
    pub fn current_exe() -> Result<Self, CoreError> {
        Ok(Self::new(std::env::current_exe()?).with_arg("worker"))
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, params: &WorkerInitParams) -> Result<WorkerConnection, CoreError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().cloned())
            .env(format!("{ENV_PREFIX}_WORKER_INDEX"), params.worker_index.to_string())
            .env(
                format!("{ENV_PREFIX}_PARALLEL_INDEX"),
                params.parallel_index.to_string(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CoreError::Launch)?;
        debug!(
            "Spawned worker {} (pid {:?})",
            params.worker_index,
            child.id()
        );

        let missing = |pipe: &str| CoreError::Protocol(format!("worker {pipe} is not piped"));
        let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (host_tx, mut host_rx) = mpsc::unbounded_channel::<HostMessage>();
        let (events, event_rx) = EventSink::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let sender = WorkerSender::new(host_tx);
        let stop_sent = sender.stop_sent.clone();

        tokio::spawn(async move {
            while let Some(message) = host_rx.recv().await {
                let mut line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to encode {:?}: {}", message, e);
                        continue;
                    }
                };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
                    trace!("Worker stdin closed");
                    break;
                }
            }
        });

        let stdout_events = events.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<WorkerEvent>(&line) {
                    Ok(event) => stdout_events.dispatch(event),
                    // Anything the worker prints outside the protocol is output.
                    Err(_) => stdout_events.dispatch(WorkerEvent::StdOut(TestOutputPayload {
                        test_id: None,
                        text: format!("{line}\n"),
                    })),
                }
            }
        });

        let stderr_events = events;
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_events.dispatch(WorkerEvent::StdErr(TestOutputPayload {
                    test_id: None,
                    text: format!("{line}\n"),
                }));
            }
        });

        let worker_index = params.worker_index;
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let (code, signal) = match status {
                Ok(status) => (status.code(), exit_signal(&status)),
                Err(e) => {
                    warn!("Failed to wait for worker {}: {}", worker_index, e);
                    (None, None)
                }
            };
            debug!("Worker {} exited (code={:?})", worker_index, code);
            let _ = exit_tx.send(ProcessExitData {
                unexpectedly: !stop_sent.load(Ordering::SeqCst),
                code,
                signal,
            });
        });

        Ok(WorkerConnection {
            sender,
            events: event_rx,
            exit: exit_rx,
        })
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    status.signal().map(|signal| match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    })
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FullConfig;
    use crate::models::StaticRegistry;

    fn init_params() -> WorkerInitParams {
        WorkerInitParams {
            worker_index: 0,
            parallel_index: 0,
            repeat_each_index: 0,
            project_id: "p".to_string(),
            config: FullConfig::default(),
        }
    }

    #[test]
    fn test_exit_description() {
        let exit = ProcessExitData {
            unexpectedly: true,
            code: Some(3),
            signal: None,
        };
        assert_eq!(
            exit.describe(),
            "worker process exited unexpectedly (code=3, signal=null)"
        );
    }

    #[tokio::test]
    async fn test_in_process_worker_exits_after_stop() {
        let registry = Arc::new(StaticRegistry::new(FullConfig::default()));
        let mut connection = InProcessLauncher::new(registry).launch(&init_params()).unwrap();
        assert!(matches!(connection.events.recv().await, Some(WorkerEvent::Ready)));

        assert!(connection.sender.send(HostMessage::Stop));
        let exit = connection.exit.await.unwrap();
        assert!(!exit.unexpectedly);
        assert_eq!(exit.code, Some(0));
    }

    #[tokio::test]
    async fn test_in_process_worker_gone_without_stop_is_unexpected() {
        let registry = Arc::new(StaticRegistry::new(FullConfig::default()));
        let connection = InProcessLauncher::new(registry).launch(&init_params()).unwrap();
        let WorkerConnection { sender, exit, .. } = connection;
        // Dropping the host side before __init__ ends the worker loop.
        drop(sender);
        let exit = exit.await.unwrap();
        assert!(exit.unexpectedly);
    }
}
