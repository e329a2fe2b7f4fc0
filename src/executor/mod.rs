//! Test execution engine
//!
//! Groups tests into worker-sized units, schedules them over worker slots
//! and turns the worker event streams into results.

mod dispatcher;
mod failure_tracker;
mod groups;
mod job;
mod runner;
mod worker_host;

pub use dispatcher::Dispatcher;
pub use failure_tracker::FailureTracker;
pub use groups::{create_test_groups, filter_for_shard, TestGroup};
pub use job::{Job, JobOutcome, RunContext};
pub use runner::{RunPlan, TestRunner};
pub use worker_host::WorkerHost;
