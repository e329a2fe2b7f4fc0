//! Result models for test execution
//!
//! Defines statuses, errors, steps and per-attempt results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source location of a declaration.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    /// Location of the caller of a `#[track_caller]` function.
    #[track_caller]
    pub fn caller() -> Self {
        let caller = std::panic::Location::caller();
        Self::new(caller.file(), caller.line(), caller.column())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Status of a single test attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
    Interrupted,
}

impl TestStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            TestStatus::Passed => "✓",
            TestStatus::Failed => "✗",
            TestStatus::TimedOut => "✗",
            TestStatus::Skipped => "○",
            TestStatus::Interrupted => "!",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Passed => write!(f, "passed"),
            TestStatus::Failed => write!(f, "failed"),
            TestStatus::TimedOut => write!(f, "timedOut"),
            TestStatus::Skipped => write!(f, "skipped"),
            TestStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Serializable error attached to results and reported to the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl TestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            location: None,
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Convert a user error, keeping the full context chain as the stack.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        let chain: Vec<String> = error.chain().skip(1).map(|e| e.to_string()).collect();
        Self {
            message: error.to_string(),
            stack: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\n"))
            },
            location: None,
        }
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}: {}", location, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Annotation {
    pub fn new(kind: impl Into<String>, description: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            description,
            location: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// A step in the host-side step tree of a result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStep {
    pub title: String,
    pub category: String,
    pub start_time: DateTime<Utc>,
    /// `None` while the step is still running.
    pub duration_ms: Option<u64>,
    pub error: Option<TestError>,
    pub location: Option<Location>,
    pub steps: Vec<TestStep>,
}

/// Result of one attempt of a test.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub retry: u32,
    pub worker_index: i64,
    pub parallel_index: i64,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: TestStatus,
    pub errors: Vec<TestError>,
    pub annotations: Vec<Annotation>,
    pub attachments: Vec<Attachment>,
    pub steps: Vec<TestStep>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl TestResult {
    /// A fresh result for the given attempt. Status starts as skipped until
    /// the worker reports an outcome.
    pub fn new(retry: u32) -> Self {
        Self {
            retry,
            worker_index: -1,
            parallel_index: -1,
            start_time: Utc::now(),
            duration_ms: 0,
            status: TestStatus::Skipped,
            errors: Vec::new(),
            annotations: Vec::new(),
            attachments: Vec::new(),
            steps: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn error(&self) -> Option<&TestError> {
        self.errors.first()
    }
}

/// Aggregate verdict of a test over all of its attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Expected,
    Unexpected,
    Flaky,
    Skipped,
}

impl TestOutcome {
    /// Leading skipped/interrupted attempts are ignored; the remaining
    /// attempts that do not match the expected status decide the verdict.
    pub fn compute(expected: TestStatus, results: &[TestResult]) -> Self {
        let results: Vec<&TestResult> = results
            .iter()
            .skip_while(|r| matches!(r.status, TestStatus::Skipped | TestStatus::Interrupted))
            .collect();
        if results.is_empty() {
            return TestOutcome::Skipped;
        }
        let failures = results
            .iter()
            .filter(|r| {
                !matches!(r.status, TestStatus::Skipped | TestStatus::Interrupted)
                    && r.status != expected
            })
            .count();
        if failures == 0 {
            TestOutcome::Expected
        } else if failures == results.len() {
            TestOutcome::Unexpected
        } else {
            TestOutcome::Flaky
        }
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self, TestOutcome::Unexpected)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestOutcome::Expected => write!(f, "expected"),
            TestOutcome::Unexpected => write!(f, "unexpected"),
            TestOutcome::Flaky => write!(f, "flaky"),
            TestOutcome::Skipped => write!(f, "skipped"),
        }
    }
}
