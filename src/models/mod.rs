//! Data models for test execution
//!
//! The suite tree, test cases and the per-attempt results recorded for them.

mod registry;
mod suite;
mod test_result;

pub use registry::{StaticRegistry, TestRegistry};
pub use suite::{
    bind_file_suite_to_project, filter_tests_remove_empty_suites, worker_hash, Hook, HookType,
    Modifier, ModifierFn, ModifierType, ParallelMode, Suite, SuiteEntry, SuiteInfo, SuiteType,
    TestCase, TestFn,
};
pub use test_result::{
    Annotation, Attachment, Location, TestError, TestOutcome, TestResult, TestStatus, TestStep,
};
