//! Host-side handle of one worker

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, trace};

use crate::ipc::{
    HostMessage, InitParams, ProcessExitData, RunPayload, WorkerConnection, WorkerEvent,
    WorkerInitParams, WorkerLauncher, WorkerSender,
};

struct EventChannel {
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    exit: oneshot::Receiver<ProcessExitData>,
    exited: Option<ProcessExitData>,
}

impl EventChannel {
    /// Next event, or `None` once the worker exited and its queue is drained.
    async fn next(&mut self, stop_sent: bool) -> Option<WorkerEvent> {
        if self.exited.is_some() {
            return self.events.try_recv().ok();
        }
        tokio::select! {
            biased;
            event = self.events.recv() => match event {
                Some(event) => Some(event),
                None => {
                    let exit = (&mut self.exit).await.unwrap_or_else(|_| lost(stop_sent));
                    self.exited = Some(exit);
                    None
                }
            },
            exit = &mut self.exit => {
                self.exited = Some(exit.unwrap_or_else(|_| lost(stop_sent)));
                self.events.try_recv().ok()
            }
        }
    }
}

fn lost(stop_sent: bool) -> ProcessExitData {
    ProcessExitData {
        unexpectedly: !stop_sent,
        code: None,
        signal: None,
    }
}

pub struct WorkerHost {
    worker_index: usize,
    parallel_index: usize,
    hash: String,
    project_id: String,
    sender: WorkerSender,
    channel: Mutex<EventChannel>,
    did_fail: AtomicBool,
}

impl WorkerHost {
    /// Launch a worker and wait until it is ready, then initialize it.
    pub async fn start(
        launcher: &dyn WorkerLauncher,
        params: WorkerInitParams,
        hash: String,
    ) -> Result<Self, ProcessExitData> {
        let WorkerConnection {
            sender,
            events,
            exit,
        } = launcher.launch(&params).map_err(|e| {
            error!("Failed to start worker {}: {}", params.worker_index, e);
            lost(false)
        })?;
        let host = Self {
            worker_index: params.worker_index,
            parallel_index: params.parallel_index,
            hash,
            project_id: params.project_id.clone(),
            sender,
            channel: Mutex::new(EventChannel {
                events,
                exit,
                exited: None,
            }),
            did_fail: AtomicBool::new(false),
        };

        loop {
            match host.next_event().await {
                Some(WorkerEvent::Ready) => break,
                Some(other) => trace!("Ignoring {:?} before ready", other),
                None => return Err(host.exit_data().await),
            }
        }
        host.sender.send(HostMessage::Init(InitParams {
            process_name: format!("worker-{}", params.worker_index),
            worker: params,
        }));
        debug!(
            "Worker {} ready in slot {} for {}",
            host.worker_index, host.parallel_index, host.hash
        );
        Ok(host)
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn parallel_index(&self) -> usize {
        self.parallel_index
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn did_send_stop(&self) -> bool {
        self.sender.stop_sent()
    }

    pub fn did_fail(&self) -> bool {
        self.did_fail.load(Ordering::SeqCst)
    }

    pub fn run_test_group(&self, payload: RunPayload) -> bool {
        self.sender.send(HostMessage::RunTestGroup(payload))
    }

    /// Ask the worker to close. Idempotent.
    pub fn stop(&self, did_fail: bool) {
        if did_fail {
            self.did_fail.store(true, Ordering::SeqCst);
        }
        if !self.did_send_stop() {
            debug!("Stopping worker {}", self.worker_index);
            self.sender.send(HostMessage::Stop);
        }
    }

    pub async fn next_event(&self) -> Option<WorkerEvent> {
        let stop_sent = self.did_send_stop();
        self.channel.lock().await.next(stop_sent).await
    }

    /// How the worker exited. Waits for the exit, dropping any events still
    /// in flight.
    pub async fn exit_data(&self) -> ProcessExitData {
        loop {
            if let Some(exit) = self.channel.lock().await.exited.clone() {
                return exit;
            }
            let _ = self.next_event().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FullConfig;
    use crate::ipc::InProcessLauncher;
    use crate::models::StaticRegistry;
    use std::sync::Arc;

    fn params() -> WorkerInitParams {
        WorkerInitParams {
            worker_index: 3,
            parallel_index: 1,
            repeat_each_index: 0,
            project_id: "p".to_string(),
            config: FullConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let registry = Arc::new(StaticRegistry::new(FullConfig::default()));
        let launcher = InProcessLauncher::new(registry);
        let host = WorkerHost::start(&launcher, params(), "p-abc-0".to_string())
            .await
            .unwrap();
        assert_eq!(host.worker_index(), 3);
        assert_eq!(host.parallel_index(), 1);
        assert_eq!(host.hash(), "p-abc-0");
        assert!(!host.did_send_stop());

        host.stop(true);
        host.stop(false);
        assert!(host.did_send_stop());
        assert!(host.did_fail());

        let exit = host.exit_data().await;
        assert!(!exit.unexpectedly);
        assert!(host.next_event().await.is_none());
    }
}
