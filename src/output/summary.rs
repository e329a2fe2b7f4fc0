//! Run summary and exit status

use serde::Serialize;
use std::fmt;

use crate::models::{TestCase, TestOutcome, TestStatus};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Passed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Passed => write!(f, "passed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Totals over the final outcome of every test in the run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub status: RunStatus,
    pub total: usize,
    pub expected: usize,
    pub unexpected: usize,
    pub flaky: usize,
    pub skipped: usize,
    /// Tests whose last attempt was interrupted.
    pub interrupted: usize,
    pub duration_ms: u64,
    pub worker_errors: bool,
    pub max_failures_reached: bool,
}

impl RunSummary {
    pub fn from_tests(
        tests: &[&TestCase],
        duration_ms: u64,
        worker_errors: bool,
        max_failures_reached: bool,
    ) -> Self {
        let mut summary = Self {
            total: tests.len(),
            duration_ms,
            worker_errors,
            max_failures_reached,
            ..Default::default()
        };
        for test in tests {
            if test.last_status() == Some(TestStatus::Interrupted) {
                summary.interrupted += 1;
            }
            match TestOutcome::compute(test.expected_status, &test.results) {
                TestOutcome::Expected => summary.expected += 1,
                TestOutcome::Unexpected => summary.unexpected += 1,
                TestOutcome::Flaky => summary.flaky += 1,
                TestOutcome::Skipped => summary.skipped += 1,
            }
        }
        summary.status = if summary.unexpected > 0 || worker_errors || max_failures_reached {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        };
        summary
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Passed => 0,
            RunStatus::Failed => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Suite;

    fn tests_with(statuses: &[&[TestStatus]]) -> Vec<TestCase> {
        let mut suite = Suite::file("a.spec");
        for (i, _) in statuses.iter().enumerate() {
            suite.test(format!("t{i}"), &[], |_args, _info| async { Ok(()) });
        }
        let mut tests = suite.into_tests();
        for (test, results) in tests.iter_mut().zip(statuses) {
            for status in results.iter() {
                test.append_result().status = *status;
            }
        }
        tests
    }

    #[test]
    fn test_outcomes_and_exit_code() {
        let tests = tests_with(&[
            &[TestStatus::Passed],
            &[TestStatus::Failed, TestStatus::Passed],
            &[TestStatus::Skipped],
            &[],
        ]);
        let refs: Vec<&TestCase> = tests.iter().collect();
        let summary = RunSummary::from_tests(&refs, 10, false, false);
        assert_eq!(summary.expected, 1);
        assert_eq!(summary.flaky, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.exit_code(), 0);

        let summary = RunSummary::from_tests(&refs, 10, true, false);
        assert_eq!(summary.status, RunStatus::Failed);
    }

    #[test]
    fn test_unexpected_fails_run() {
        let tests = tests_with(&[&[TestStatus::Failed, TestStatus::Failed]]);
        let refs: Vec<&TestCase> = tests.iter().collect();
        let summary = RunSummary::from_tests(&refs, 0, false, false);
        assert_eq!(summary.unexpected, 1);
        assert_eq!(summary.exit_code(), 1);
    }
}
