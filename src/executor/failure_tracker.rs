//! Run-wide failure accounting

use crate::models::{TestCase, TestResult, TestStatus};

#[derive(Debug, Default)]
pub struct FailureTracker {
    /// 0 disables the limit.
    max_failures: usize,
    failure_count: usize,
    has_worker_errors: bool,
}

impl FailureTracker {
    pub fn new(max_failures: usize) -> Self {
        Self {
            max_failures,
            ..Default::default()
        }
    }

    pub fn on_test_end(&mut self, test: &TestCase, result: &TestResult) {
        if result.status != TestStatus::Skipped && result.status != test.expected_status {
            self.failure_count += 1;
        }
    }

    pub fn on_worker_error(&mut self) {
        self.has_worker_errors = true;
    }

    pub fn has_reached_max_failures(&self) -> bool {
        self.max_failures > 0 && self.failure_count >= self.max_failures
    }

    pub fn has_worker_errors(&self) -> bool {
        self.has_worker_errors
    }

    pub fn max_failures(&self) -> usize {
        self.max_failures
    }

    pub fn failure_count(&self) -> usize {
        self.failure_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Suite;

    fn test_case() -> TestCase {
        let mut suite = Suite::file("a.spec");
        suite.test("t", &[], |_args, _info| async { Ok(()) });
        suite.into_tests().remove(0)
    }

    #[test]
    fn test_counts_unexpected_non_skipped_results() {
        let test = test_case();
        let mut tracker = FailureTracker::new(2);
        let mut result = TestResult::new(0);

        result.status = TestStatus::Skipped;
        tracker.on_test_end(&test, &result);
        result.status = TestStatus::Passed;
        tracker.on_test_end(&test, &result);
        assert!(!tracker.has_reached_max_failures());

        result.status = TestStatus::Failed;
        tracker.on_test_end(&test, &result);
        result.status = TestStatus::TimedOut;
        tracker.on_test_end(&test, &result);
        assert!(tracker.has_reached_max_failures());
        assert_eq!(tracker.failure_count(), 2);
    }

    #[test]
    fn test_zero_means_unlimited() {
        let test = test_case();
        let mut tracker = FailureTracker::new(0);
        let mut result = TestResult::new(0);
        result.status = TestStatus::Failed;
        for _ in 0..10 {
            tracker.on_test_end(&test, &result);
        }
        assert!(!tracker.has_reached_max_failures());
    }
}
