//! Worker side of a run
//!
//! A worker owns one fixture runner and executes the test groups the
//! dispatcher hands it, one at a time, streaming lifecycle events back.

mod runtime;
mod test_info;

pub use runtime::{run_stdio, serve, WorkerMain};
pub use test_info::{
    PanicError, SkipError, Stage, StageError, StepInfo, TestInfo, TestInfoParams,
};

use serde::{Deserialize, Serialize};

use crate::ipc::WorkerInitParams;

/// Identity of a worker, handed to worker-scoped fixtures.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub worker_index: usize,
    /// Slot index, reused by the worker that replaces this one.
    pub parallel_index: usize,
    pub project_id: String,
    pub repeat_each_index: u32,
}

impl From<&WorkerInitParams> for WorkerInfo {
    fn from(params: &WorkerInitParams) -> Self {
        Self {
            worker_index: params.worker_index,
            parallel_index: params.parallel_index,
            project_id: params.project_id.clone(),
            repeat_each_index: params.repeat_each_index,
        }
    }
}
