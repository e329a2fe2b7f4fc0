//! Per-attempt test state inside the worker.
//!
//! `TestInfo` is both the user-facing handle passed to tests, hooks and
//! test-scoped fixtures, and the bookkeeping the worker uses to build the
//! `testEnd` payload.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::ipc::{
    EventSink, StepBeginPayload, StepEndPayload, TestBeginPayload, TestEndPayload,
    TestOutputPayload, WorkerEvent,
};
use crate::models::{Annotation, Attachment, Location, ModifierType, TestError, TestStatus};
use crate::timeout::{Interruption, RunnableDescription, TimeoutManager};

/// Raised by `skip`/`fixme` modifiers.
#[derive(Debug, thiserror::Error)]
#[error("Test is skipped: {}", .description.as_deref().unwrap_or(""))]
pub struct SkipError {
    pub description: Option<String>,
}

/// A panic caught while running user code.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PanicError(pub String);

/// How a stage ended when it did not succeed. The underlying error has
/// already been recorded on the `TestInfo` by the time this is returned.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("test skipped")]
    Skipped,
    #[error("{0}")]
    Failed(String),
    #[error("timed out")]
    TimedOut,
    #[error("interrupted")]
    Interrupted,
}

impl StageError {
    pub fn is_skip(&self) -> bool {
        matches!(self, StageError::Skipped)
    }
}

/// Step bookkeeping attached to a stage.
#[derive(Clone, Debug)]
pub struct StepInfo {
    pub category: &'static str,
    pub location: Option<Location>,
}

/// A unit of work run through [`TestInfo::run_as_stage`].
#[derive(Clone, Debug)]
pub struct Stage {
    pub title: String,
    pub runnable: Option<RunnableDescription>,
    pub step: Option<StepInfo>,
}

impl Stage {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            runnable: None,
            step: None,
        }
    }

    pub fn runnable(mut self, runnable: RunnableDescription) -> Self {
        self.runnable = Some(runnable);
        self
    }

    pub fn step(mut self, category: &'static str, location: Option<Location>) -> Self {
        self.step = Some(StepInfo { category, location });
        self
    }
}

/// Identity of the attempt a `TestInfo` is created for.
#[derive(Clone, Debug, Default)]
pub struct TestInfoParams {
    pub test_id: String,
    pub title: String,
    pub title_path: Vec<String>,
    pub file: String,
    pub project_id: String,
    pub retry: u32,
    pub repeat_each_index: u32,
    pub worker_index: usize,
    pub parallel_index: usize,
    pub timeout_ms: u64,
}

#[derive(Debug)]
struct State {
    expected_status: TestStatus,
    status: TestStatus,
    errors: Vec<TestError>,
    annotations: Vec<Annotation>,
    attachments: Vec<Attachment>,
    duration_ms: u64,
    was_interrupted: bool,
    did_timeout: bool,
    has_unhandled_error: bool,
    allow_skips: bool,
    last_step_id: u64,
}

#[derive(Debug)]
struct Inner {
    params: TestInfoParams,
    timeout_manager: TimeoutManager,
    events: Option<EventSink>,
    start_wall_time: DateTime<Utc>,
    state: Mutex<State>,
}

#[derive(Clone, Debug)]
pub struct TestInfo {
    inner: Arc<Inner>,
}

impl TestInfo {
    pub fn new(params: TestInfoParams, events: EventSink) -> Self {
        Self::build(params, Some(events))
    }

    /// A `TestInfo` that belongs to no test, used for worker cleanup. Its
    /// step events go nowhere.
    pub fn detached(params: TestInfoParams) -> Self {
        Self::build(params, None)
    }

    fn build(params: TestInfoParams, events: Option<EventSink>) -> Self {
        let timeout_manager = TimeoutManager::new(params.timeout_ms);
        Self {
            inner: Arc::new(Inner {
                params,
                timeout_manager,
                events,
                start_wall_time: Utc::now(),
                state: Mutex::new(State {
                    expected_status: TestStatus::Passed,
                    status: TestStatus::Passed,
                    errors: Vec::new(),
                    annotations: Vec::new(),
                    attachments: Vec::new(),
                    duration_ms: 0,
                    was_interrupted: false,
                    did_timeout: false,
                    has_unhandled_error: false,
                    allow_skips: false,
                    last_step_id: 0,
                }),
            }),
        }
    }

    pub fn test_id(&self) -> &str {
        &self.inner.params.test_id
    }

    pub fn title(&self) -> &str {
        &self.inner.params.title
    }

    pub fn title_path(&self) -> &[String] {
        &self.inner.params.title_path
    }

    pub fn file(&self) -> &str {
        &self.inner.params.file
    }

    pub fn project_id(&self) -> &str {
        &self.inner.params.project_id
    }

    pub fn retry(&self) -> u32 {
        self.inner.params.retry
    }

    pub fn repeat_each_index(&self) -> u32 {
        self.inner.params.repeat_each_index
    }

    pub fn worker_index(&self) -> usize {
        self.inner.params.worker_index
    }

    pub fn parallel_index(&self) -> usize {
        self.inner.params.parallel_index
    }

    pub fn status(&self) -> TestStatus {
        self.inner.state.lock().status
    }

    pub fn expected_status(&self) -> TestStatus {
        self.inner.state.lock().expected_status
    }

    pub fn errors(&self) -> Vec<TestError> {
        self.inner.state.lock().errors.clone()
    }

    pub fn annotations(&self) -> Vec<Annotation> {
        self.inner.state.lock().annotations.clone()
    }

    pub fn duration_ms(&self) -> u64 {
        self.inner.state.lock().duration_ms
    }

    /// The test's own timeout, excluding extra slots.
    pub fn timeout(&self) -> u64 {
        self.inner.timeout_manager.default_slot().timeout()
    }

    pub fn set_timeout(&self, timeout_ms: u64) {
        self.inner.timeout_manager.set_timeout(timeout_ms);
    }

    pub fn timeout_manager(&self) -> &TimeoutManager {
        &self.inner.timeout_manager
    }

    /// Mark the test skipped when `condition` holds. Return the error with
    /// `?` to stop the test body.
    pub fn skip(&self, condition: bool, description: Option<&str>) -> anyhow::Result<()> {
        self.modifier(ModifierType::Skip, condition, description.map(str::to_string))
    }

    pub fn fixme(&self, condition: bool, description: Option<&str>) -> anyhow::Result<()> {
        self.modifier(ModifierType::Fixme, condition, description.map(str::to_string))
    }

    /// Expect the test to fail when `condition` holds.
    pub fn fail(&self, condition: bool, description: Option<&str>) {
        let _ = self.modifier(ModifierType::Fail, condition, description.map(str::to_string));
    }

    /// Triple the timeout when `condition` holds.
    pub fn slow(&self, condition: bool, description: Option<&str>) {
        let _ = self.modifier(ModifierType::Slow, condition, description.map(str::to_string));
    }

    pub fn modifier(
        &self,
        kind: ModifierType,
        condition: bool,
        description: Option<String>,
    ) -> anyhow::Result<()> {
        if !condition {
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock();
            state
                .annotations
                .push(Annotation::new(kind.as_str(), description.clone()));
            match kind {
                ModifierType::Skip | ModifierType::Fixme => {
                    state.expected_status = TestStatus::Skipped;
                }
                ModifierType::Fail => {
                    if state.expected_status != TestStatus::Skipped {
                        state.expected_status = TestStatus::Failed;
                    }
                }
                ModifierType::Slow => {}
            }
        }
        match kind {
            ModifierType::Slow => {
                self.inner.timeout_manager.slow();
                Ok(())
            }
            ModifierType::Skip | ModifierType::Fixme => Err(SkipError { description }.into()),
            ModifierType::Fail => Ok(()),
        }
    }

    /// Apply a static annotation declared on the test or a suite.
    pub(crate) fn process_annotation(&self, annotation: &Annotation) {
        let slow = {
            let mut state = self.inner.state.lock();
            state.annotations.push(annotation.clone());
            match annotation.kind.as_str() {
                "skip" | "fixme" => state.expected_status = TestStatus::Skipped,
                "fail" => {
                    if state.expected_status != TestStatus::Skipped {
                        state.expected_status = TestStatus::Failed;
                    }
                }
                _ => {}
            }
            annotation.kind == "slow"
        };
        if slow {
            self.inner.timeout_manager.slow();
        }
    }

    pub fn annotate(&self, kind: impl Into<String>, description: Option<&str>) {
        self.inner
            .state
            .lock()
            .annotations
            .push(Annotation::new(kind, description.map(str::to_string)));
    }

    pub fn attach(&self, name: impl Into<String>, content_type: impl Into<String>, body: impl Into<String>) {
        let name = name.into();
        let step_id = self.begin_step(&format!("attach \"{name}\""), "test.attach", None, false, false);
        self.inner.state.lock().attachments.push(Attachment {
            name,
            content_type: content_type.into(),
            body: Some(body.into()),
        });
        self.end_step(step_id, None);
    }

    /// Report a chunk of test output.
    pub fn stdout(&self, text: impl Into<String>) {
        self.emit(WorkerEvent::StdOut(self.output(text.into())));
    }

    pub fn stderr(&self, text: impl Into<String>) {
        self.emit(WorkerEvent::StdErr(self.output(text.into())));
    }

    fn output(&self, text: String) -> TestOutputPayload {
        TestOutputPayload {
            test_id: Some(self.test_id().to_string()),
            text,
        }
    }

    /// Run `body` as a reported step.
    pub async fn step<T, F>(&self, title: impl Into<String>, body: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let title = title.into();
        let step_id = self.begin_step(&title, "test.step", None, true, false);
        let result = body.await;
        let error = result.as_ref().err().map(TestError::from_anyhow);
        self.end_step(step_id, error);
        result
    }

    /// Run `body` with optional step reporting and timeout enforcement.
    ///
    /// Every user error is recorded exactly once: nested stages see a
    /// [`StageError`] and pass it through without recording it again.
    pub async fn run_as_stage<T, F>(&self, stage: Stage, body: F) -> Result<T, StageError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let step_id = stage
            .step
            .as_ref()
            .map(|s| self.begin_step(&stage.title, s.category, s.location.clone(), true, false));

        let caught = AssertUnwindSafe(body).catch_unwind();
        let result = match stage.runnable {
            Some(runnable) => {
                match self
                    .inner
                    .timeout_manager
                    .with_runnable(runnable, caught)
                    .await
                {
                    Ok(outcome) => self.classify(outcome),
                    Err(Interruption::TimedOut(timeout)) => {
                        let mut state = self.inner.state.lock();
                        if !state.was_interrupted && !state.did_timeout {
                            state.did_timeout = true;
                            let mut error = TestError::new(timeout.message);
                            error.location = timeout.location;
                            state.errors.push(error);
                            if matches!(state.status, TestStatus::Passed | TestStatus::Skipped) {
                                state.status = TestStatus::TimedOut;
                            }
                        }
                        Err(StageError::TimedOut)
                    }
                    Err(Interruption::Interrupted) => Err(StageError::Interrupted),
                }
            }
            None => self.classify(caught.await),
        };

        if let Some(step_id) = step_id {
            let error = match &result {
                Err(StageError::Failed(message)) => Some(TestError::new(message.clone())),
                Err(StageError::TimedOut) => self.errors().last().cloned(),
                _ => None,
            };
            self.end_step(step_id, error);
        }
        result
    }

    fn classify<T>(
        &self,
        outcome: Result<anyhow::Result<T>, Box<dyn Any + Send>>,
    ) -> Result<T, StageError> {
        let error = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => error,
            Err(panic) => anyhow::Error::new(PanicError(panic_message(&panic))),
        };

        if error.downcast_ref::<PanicError>().is_some() {
            self.inner.state.lock().has_unhandled_error = true;
        }
        if let Some(stage_error) = error.downcast_ref::<StageError>() {
            return Err(stage_error.clone());
        }
        if error.downcast_ref::<SkipError>().is_some() {
            let mut state = self.inner.state.lock();
            if state.allow_skips {
                if state.status == TestStatus::Passed {
                    state.status = TestStatus::Skipped;
                }
                return Err(StageError::Skipped);
            }
        }
        self.fail_with_error(&error);
        Err(StageError::Failed(error.to_string()))
    }

    pub(crate) fn fail_with_error(&self, error: &anyhow::Error) {
        let mut state = self.inner.state.lock();
        if matches!(state.status, TestStatus::Passed | TestStatus::Skipped) {
            state.status = TestStatus::Failed;
        }
        state.errors.push(TestError::from_anyhow(error));
    }

    /// Stop whatever is running. Does not overwrite an existing failure.
    pub(crate) fn interrupt(&self) {
        {
            let mut state = self.inner.state.lock();
            state.was_interrupted = true;
            if state.status == TestStatus::Passed {
                state.status = TestStatus::Interrupted;
            }
        }
        self.inner.timeout_manager.interrupt();
    }

    pub(crate) fn is_failure(&self) -> bool {
        let state = self.inner.state.lock();
        state.status != TestStatus::Skipped && state.status != state.expected_status
    }

    pub(crate) fn has_unhandled_error(&self) -> bool {
        self.inner.state.lock().has_unhandled_error
    }

    pub(crate) fn set_allow_skips(&self, allow: bool) {
        self.inner.state.lock().allow_skips = allow;
    }

    pub(crate) fn set_status(&self, status: TestStatus) {
        self.inner.state.lock().status = status;
    }

    pub(crate) fn set_duration(&self, duration_ms: u64) {
        self.inner.state.lock().duration_ms = duration_ms;
    }

    pub(crate) fn begin_payload(&self) -> TestBeginPayload {
        TestBeginPayload {
            test_id: self.test_id().to_string(),
            start_wall_time: self.inner.start_wall_time,
        }
    }

    pub(crate) fn end_payload(&self) -> TestEndPayload {
        let timeout = self.timeout();
        let state = self.inner.state.lock();
        TestEndPayload {
            test_id: self.test_id().to_string(),
            duration_ms: state.duration_ms,
            status: state.status,
            errors: state.errors.clone(),
            expected_status: state.expected_status,
            annotations: state.annotations.clone(),
            timeout,
            attachments: state.attachments.clone(),
        }
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(events) = &self.inner.events {
            events.dispatch(event);
        }
    }

    fn begin_step(
        &self,
        title: &str,
        category: &'static str,
        location: Option<Location>,
        can_have_children: bool,
        force_no_parent: bool,
    ) -> String {
        let step_id = {
            let mut state = self.inner.state.lock();
            state.last_step_id += 1;
            format!("{}@{}", category, state.last_step_id)
        };
        self.emit(WorkerEvent::StepBegin(StepBeginPayload {
            test_id: self.test_id().to_string(),
            step_id: step_id.clone(),
            title: title.to_string(),
            category: category.to_string(),
            wall_time: Utc::now(),
            location,
            can_have_children,
            force_no_parent,
        }));
        step_id
    }

    fn end_step(&self, step_id: String, error: Option<TestError>) {
        self.emit(WorkerEvent::StepEnd(StepEndPayload {
            test_id: self.test_id().to_string(),
            step_id,
            wall_time: Utc::now(),
            error,
        }));
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeout::RunnableType;
    use std::time::Duration;

    fn info(timeout_ms: u64) -> (TestInfo, tokio::sync::mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = EventSink::channel();
        let params = TestInfoParams {
            test_id: "t".to_string(),
            timeout_ms,
            ..Default::default()
        };
        (TestInfo::new(params, events), rx)
    }

    #[tokio::test]
    async fn test_error_recorded_once_across_nested_stages() {
        let (info, _rx) = info(1000);
        let inner_info = info.clone();
        let result: Result<(), StageError> = info
            .run_as_stage(Stage::new("outer"), async move {
                inner_info
                    .run_as_stage(Stage::new("inner"), async {
                        Err::<(), _>(anyhow::anyhow!("boom"))
                    })
                    .await?;
                Ok::<(), anyhow::Error>(())
            })
            .await;
        assert!(matches!(result, Err(StageError::Failed(_))));
        assert_eq!(info.errors().len(), 1);
        assert_eq!(info.status(), TestStatus::Failed);
    }

    #[tokio::test]
    async fn test_skip_converts_status_when_allowed() {
        let (info, _rx) = info(1000);
        info.set_allow_skips(true);
        let handle = info.clone();
        let result = info
            .run_as_stage(Stage::new("body"), async move {
                handle.skip(true, Some("not today"))?;
                Ok::<(), anyhow::Error>(())
            })
            .await;
        assert_eq!(result, Err(StageError::Skipped));
        assert_eq!(info.status(), TestStatus::Skipped);
        assert_eq!(info.expected_status(), TestStatus::Skipped);
        assert!(info.errors().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_marks_timed_out() {
        let (info, _rx) = info(20);
        let result = info
            .run_as_stage(
                Stage::new("test function").runnable(RunnableDescription::new(RunnableType::Test)),
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), anyhow::Error>(())
                },
            )
            .await;
        assert_eq!(result, Err(StageError::TimedOut));
        assert_eq!(info.status(), TestStatus::TimedOut);
        assert_eq!(info.errors()[0].message, "Test timeout of 20ms exceeded.");
    }

    #[tokio::test]
    async fn test_panic_is_recorded_as_failure() {
        let (info, _rx) = info(1000);
        let result: Result<(), StageError> = info
            .run_as_stage(Stage::new("body"), async {
                if true {
                    panic!("kaboom");
                }
                Ok::<(), anyhow::Error>(())
            })
            .await;
        assert!(matches!(result, Err(StageError::Failed(_))));
        assert!(info.has_unhandled_error());
        assert_eq!(info.errors()[0].message, "panicked: kaboom");
    }

    #[tokio::test]
    async fn test_interrupt_keeps_existing_failure() {
        let (info, _rx) = info(0);
        info.fail_with_error(&anyhow::anyhow!("first"));
        info.interrupt();
        assert_eq!(info.status(), TestStatus::Failed);
    }

    #[tokio::test]
    async fn test_step_events() {
        let (info, mut rx) = info(1000);
        let value = info.step("compute", async { Ok::<_, anyhow::Error>(2) }).await.unwrap();
        assert_eq!(value, 2);
        match rx.recv().await {
            Some(WorkerEvent::StepBegin(begin)) => {
                assert_eq!(begin.title, "compute");
                assert_eq!(begin.category, "test.step");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(WorkerEvent::StepEnd(_))));
    }

    #[test]
    fn test_fail_modifier_does_not_override_skip() {
        let (info, _rx) = info(1000);
        info.process_annotation(&Annotation::new("skip", None));
        info.fail(true, None);
        assert_eq!(info.expected_status(), TestStatus::Skipped);
    }
}
