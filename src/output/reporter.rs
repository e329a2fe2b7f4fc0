//! Reporter interface
//!
//! The dispatcher calls a reporter synchronously from its event handlers,
//! in the order events arrive from each worker.

use parking_lot::Mutex;
use std::sync::Arc;

use super::RunSummary;
use crate::config::FullConfig;
use crate::models::{TestCase, TestError, TestResult, TestStatus, TestStep};

#[allow(unused_variables)]
pub trait Reporter: Send {
    fn on_begin(&mut self, config: &FullConfig, tests: &[&TestCase]) {}

    fn on_test_begin(&mut self, test: &TestCase, result: &TestResult) {}

    fn on_step_begin(&mut self, test: &TestCase, result: &TestResult, step: &TestStep) {}

    fn on_step_end(&mut self, test: &TestCase, result: &TestResult, step: &TestStep) {}

    fn on_test_end(&mut self, test: &TestCase, result: &TestResult) {}

    fn on_std_out(&mut self, chunk: &str, test: Option<&TestCase>, result: Option<&TestResult>) {}

    fn on_std_err(&mut self, chunk: &str, test: Option<&TestCase>, result: Option<&TestResult>) {}

    /// Errors that could not be attributed to a test.
    fn on_error(&mut self, error: &TestError) {}

    fn on_end(&mut self, summary: &RunSummary) {}
}

/// One reporter call, as recorded by [`CollectingReporter`].
#[derive(Clone, Debug, PartialEq)]
pub enum ReportedEvent {
    Begin {
        tests: usize,
    },
    TestBegin {
        title: String,
        retry: u32,
    },
    StepBegin {
        test: String,
        title: String,
    },
    StepEnd {
        test: String,
        title: String,
        error: Option<TestError>,
    },
    TestEnd {
        title: String,
        retry: u32,
        status: TestStatus,
        errors: Vec<TestError>,
    },
    StdOut {
        test: Option<String>,
        text: String,
    },
    StdErr {
        test: Option<String>,
        text: String,
    },
    Error(TestError),
    End(RunSummary),
}

/// Records every call. Clones share the same log.
#[derive(Clone, Debug, Default)]
pub struct CollectingReporter {
    events: Arc<Mutex<Vec<ReportedEvent>>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReportedEvent> {
        self.events.lock().clone()
    }

    /// `(title, retry, status)` of every test end, in report order.
    pub fn test_ends(&self) -> Vec<(String, u32, TestStatus)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ReportedEvent::TestEnd {
                    title,
                    retry,
                    status,
                    ..
                } => Some((title.clone(), *retry, *status)),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<TestError> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ReportedEvent::Error(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> Option<RunSummary> {
        self.events.lock().iter().find_map(|e| match e {
            ReportedEvent::End(summary) => Some(summary.clone()),
            _ => None,
        })
    }

    fn push(&self, event: ReportedEvent) {
        self.events.lock().push(event);
    }
}

impl Reporter for CollectingReporter {
    fn on_begin(&mut self, _config: &FullConfig, tests: &[&TestCase]) {
        self.push(ReportedEvent::Begin { tests: tests.len() });
    }

    fn on_test_begin(&mut self, test: &TestCase, result: &TestResult) {
        self.push(ReportedEvent::TestBegin {
            title: test.title.clone(),
            retry: result.retry,
        });
    }

    fn on_step_begin(&mut self, test: &TestCase, _result: &TestResult, step: &TestStep) {
        self.push(ReportedEvent::StepBegin {
            test: test.title.clone(),
            title: step.title.clone(),
        });
    }

    fn on_step_end(&mut self, test: &TestCase, _result: &TestResult, step: &TestStep) {
        self.push(ReportedEvent::StepEnd {
            test: test.title.clone(),
            title: step.title.clone(),
            error: step.error.clone(),
        });
    }

    fn on_test_end(&mut self, test: &TestCase, result: &TestResult) {
        self.push(ReportedEvent::TestEnd {
            title: test.title.clone(),
            retry: result.retry,
            status: result.status,
            errors: result.errors.clone(),
        });
    }

    fn on_std_out(&mut self, chunk: &str, test: Option<&TestCase>, _result: Option<&TestResult>) {
        self.push(ReportedEvent::StdOut {
            test: test.map(|t| t.title.clone()),
            text: chunk.to_string(),
        });
    }

    fn on_std_err(&mut self, chunk: &str, test: Option<&TestCase>, _result: Option<&TestResult>) {
        self.push(ReportedEvent::StdErr {
            test: test.map(|t| t.title.clone()),
            text: chunk.to_string(),
        });
    }

    fn on_error(&mut self, error: &TestError) {
        self.push(ReportedEvent::Error(error.clone()));
    }

    fn on_end(&mut self, summary: &RunSummary) {
        self.push(ReportedEvent::End(summary.clone()));
    }
}
