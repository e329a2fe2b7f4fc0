//! Host/worker protocol
//!
//! Messages exchanged between the dispatcher and worker processes. Every
//! message is a `{"method": ..., "params": ...}` envelope; over stdio each
//! envelope is one line of JSON.

mod transport;

pub use transport::{
    InProcessLauncher, ProcessExitData, ProcessLauncher, WorkerConnection, WorkerLauncher,
    WorkerSender,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::FullConfig;
use crate::models::{Annotation, Attachment, Location, TestError, TestStatus};

/// Host to worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum HostMessage {
    #[serde(rename = "__init__")]
    Init(InitParams),
    #[serde(rename = "runTestGroup")]
    RunTestGroup(RunPayload),
    #[serde(rename = "__stop__")]
    Stop,
    #[serde(rename = "__dispatch__")]
    Dispatch(DispatchRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    pub process_name: String,
    pub worker: WorkerInitParams,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInitParams {
    pub worker_index: usize,
    pub parallel_index: usize,
    pub repeat_each_index: u32,
    pub project_id: String,
    pub config: FullConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEntry {
    pub test_id: String,
    pub retry: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPayload {
    pub file: String,
    pub entries: Vec<TestEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Worker to host.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum WorkerEvent {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "testBegin")]
    TestBegin(TestBeginPayload),
    #[serde(rename = "stepBegin")]
    StepBegin(StepBeginPayload),
    #[serde(rename = "stepEnd")]
    StepEnd(StepEndPayload),
    #[serde(rename = "testEnd")]
    TestEnd(TestEndPayload),
    #[serde(rename = "done")]
    Done(DonePayload),
    #[serde(rename = "stdOut")]
    StdOut(TestOutputPayload),
    #[serde(rename = "stdErr")]
    StdErr(TestOutputPayload),
    #[serde(rename = "teardownErrors")]
    TeardownErrors(TeardownErrorsPayload),
    #[serde(rename = "__response__")]
    Response(DispatchResponse),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestBeginPayload {
    pub test_id: String,
    pub start_wall_time: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEndPayload {
    pub test_id: String,
    pub duration_ms: u64,
    pub status: TestStatus,
    pub errors: Vec<TestError>,
    pub expected_status: TestStatus,
    pub annotations: Vec<Annotation>,
    pub timeout: u64,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepBeginPayload {
    pub test_id: String,
    pub step_id: String,
    pub title: String,
    pub category: String,
    pub wall_time: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<Location>,
    pub can_have_children: bool,
    pub force_no_parent: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEndPayload {
    pub test_id: String,
    pub step_id: String,
    pub wall_time: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<TestError>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonePayload {
    pub fatal_errors: Vec<TestError>,
    pub skip_tests_due_to_setup_failure: Vec<String>,
    #[serde(default)]
    pub fatal_unknown_test_ids: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutputPayload {
    #[serde(default)]
    pub test_id: Option<String>,
    pub text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownErrorsPayload {
    pub fatal_errors: Vec<TestError>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<TestError>,
}

/// Outgoing side of the worker's event stream.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn dispatch(&self, event: WorkerEvent) {
        if self.tx.send(event).is_err() {
            trace!("Dropping worker event: host is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_envelope_shape() {
        let message = HostMessage::RunTestGroup(RunPayload {
            file: "a.spec".to_string(),
            entries: vec![TestEntry {
                test_id: "t1".to_string(),
                retry: 1,
            }],
        });
        let json: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "method": "runTestGroup",
                "params": { "file": "a.spec", "entries": [{ "testId": "t1", "retry": 1 }] }
            })
        );
        let stop = serde_json::to_string(&HostMessage::Stop).unwrap();
        assert_eq!(stop, r#"{"method":"__stop__"}"#);
    }

    #[test]
    fn test_done_payload_parses_without_optional_fields() {
        let event: WorkerEvent = serde_json::from_str(
            r#"{"method":"done","params":{"fatalErrors":[],"skipTestsDueToSetupFailure":["x"]}}"#,
        )
        .unwrap();
        match event {
            WorkerEvent::Done(done) => {
                assert_eq!(done.skip_tests_due_to_setup_failure, vec!["x".to_string()]);
                assert!(done.fatal_unknown_test_ids.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
