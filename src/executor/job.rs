//! One test group running in one worker
//!
//! A [`Job`] turns the worker's event stream into results on the host-side
//! test cases, and when the worker reports `done` (or goes away) decides
//! which tests are skipped, failed or handed back for another attempt.

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;
use tracing::debug;

use super::{FailureTracker, TestGroup};
use crate::ipc::{
    DonePayload, ProcessExitData, RunPayload, StepBeginPayload, StepEndPayload, TestBeginPayload,
    TestEndPayload, TestEntry, TestOutputPayload, WorkerEvent,
};
use crate::models::{TestCase, TestError, TestStatus, TestStep};
use crate::output::Reporter;

/// Host-side state shared by every job of a run.
pub struct RunContext {
    pub tests: IndexMap<String, TestCase>,
    pub reporter: Box<dyn Reporter>,
    pub failure_tracker: FailureTracker,
    /// Set once the failure limit is reached; the dispatcher stops on it.
    pub stop_requested: bool,
}

impl RunContext {
    pub fn new(tests: Vec<TestCase>, reporter: Box<dyn Reporter>, max_failures: usize) -> Self {
        Self {
            tests: tests.into_iter().map(|t| (t.id.clone(), t)).collect(),
            reporter,
            failure_tracker: FailureTracker::new(max_failures),
            stop_requested: false,
        }
    }

    fn report_test_end(&mut self, test_id: &str) {
        let Some(test) = self.tests.get(test_id) else {
            return;
        };
        let Some(result) = test.results.last() else {
            return;
        };
        self.reporter.on_test_end(test, result);
        let had_max_failures = self.failure_tracker.has_reached_max_failures();
        self.failure_tracker.on_test_end(test, result);
        if self.failure_tracker.has_reached_max_failures() {
            self.stop_requested = true;
            if !had_max_failures {
                let message = format!(
                    "Testing stopped early after {} maximum allowed failures.",
                    self.failure_tracker.max_failures()
                );
                self.reporter.on_error(&TestError::new(message));
            }
        }
    }

    /// Append a skipped result and report it as begun and ended.
    pub fn report_skipped(&mut self, test_id: &str) {
        let Some(test) = self.tests.get_mut(test_id) else {
            return;
        };
        test.append_result();
        let test = &*test;
        if let Some(result) = test.results.last() {
            self.reporter.on_test_begin(test, result);
        }
        self.report_test_end(test_id);
    }

    /// Fail a test whose fixtures could not be resolved, without running it.
    pub fn report_load_failure(&mut self, test_id: &str) {
        let Some(test) = self.tests.get_mut(test_id) else {
            return;
        };
        let errors = test.load_errors.clone();
        let result = test.append_result();
        result.status = TestStatus::Failed;
        result.errors = errors;
        let test = &*test;
        if let Some(result) = test.results.last() {
            self.reporter.on_test_begin(test, result);
        }
        self.report_test_end(test_id);
    }

    /// Errors that belong to no test.
    pub fn report_worker_errors(&mut self, errors: &[TestError]) {
        for error in errors {
            self.failure_tracker.on_worker_error();
            self.reporter.on_error(error);
        }
    }

    pub fn report_output(&mut self, payload: &TestOutputPayload, is_stderr: bool) {
        let target = payload.test_id.as_deref();
        self.output_to(target, &payload.text, is_stderr);
    }

    fn output_to(&mut self, test_id: Option<&str>, text: &str, is_stderr: bool) {
        let test = test_id.and_then(|id| self.tests.get_mut(id));
        let (test, result) = match test {
            Some(test) => {
                if let Some(result) = test.results.last_mut() {
                    if is_stderr {
                        result.stderr.push(text.to_string());
                    } else {
                        result.stdout.push(text.to_string());
                    }
                }
                let test = &*test;
                (Some(test), test.results.last())
            }
            None => (None, None),
        };
        if is_stderr {
            self.reporter.on_std_err(text, test, result);
        } else {
            self.reporter.on_std_out(text, test, result);
        }
    }
}

/// What the dispatcher does once a job is over.
#[derive(Debug, Default)]
pub struct JobOutcome {
    /// Tests to run again, at the front of the queue.
    pub new_job: Option<TestGroup>,
    pub did_fail: bool,
}

#[derive(Default)]
struct RunData {
    /// Step id to its index path in the result's step tree.
    steps: HashMap<String, Vec<usize>>,
    /// Steps still open, innermost last, with their `can_have_children`.
    open: Vec<(String, bool)>,
}

pub struct Job {
    group: TestGroup,
    worker_index: usize,
    parallel_index: usize,
    remaining: IndexSet<String>,
    failed_tests: IndexSet<String>,
    data_by_test_id: HashMap<String, RunData>,
    currently_running: Option<String>,
}

impl Job {
    pub fn new(group: TestGroup, worker_index: usize, parallel_index: usize) -> Self {
        Self {
            remaining: group.tests.iter().cloned().collect(),
            group,
            worker_index,
            parallel_index,
            failed_tests: IndexSet::new(),
            data_by_test_id: HashMap::new(),
            currently_running: None,
        }
    }

    pub fn group(&self) -> &TestGroup {
        &self.group
    }

    pub fn currently_running(&self) -> Option<&str> {
        self.currently_running.as_deref()
    }

    pub fn run_payload(&self, ctx: &RunContext) -> RunPayload {
        RunPayload {
            file: self.group.require_file.clone(),
            entries: self
                .remaining
                .iter()
                .map(|id| TestEntry {
                    test_id: id.clone(),
                    retry: ctx.tests.get(id).map_or(0, |t| t.results.len() as u32),
                })
                .collect(),
        }
    }

    /// Report every test of a group skipped without touching a worker, when
    /// all of them are statically skipped.
    pub fn skip_whole_job(group: &TestGroup, ctx: &mut RunContext) -> bool {
        let all_skipped = group.tests.iter().all(|id| {
            ctx.tests
                .get(id)
                .is_some_and(|t| t.expected_status == TestStatus::Skipped)
        });
        if !all_skipped || ctx.failure_tracker.has_reached_max_failures() {
            return false;
        }
        for id in &group.tests {
            ctx.report_skipped(id);
        }
        true
    }

    /// Handle one worker event. Returns the outcome once the worker reports
    /// `done`.
    pub fn handle_event(
        &mut self,
        ctx: &mut RunContext,
        event: WorkerEvent,
        worker_failed: bool,
    ) -> Option<JobOutcome> {
        match event {
            WorkerEvent::TestBegin(payload) => self.on_test_begin(ctx, payload),
            WorkerEvent::TestEnd(payload) => self.on_test_end(ctx, payload),
            WorkerEvent::StepBegin(payload) => self.on_step_begin(ctx, payload),
            WorkerEvent::StepEnd(payload) => self.on_step_end(ctx, payload),
            WorkerEvent::StdOut(payload) => self.on_output(ctx, payload, false, worker_failed),
            WorkerEvent::StdErr(payload) => self.on_output(ctx, payload, true, worker_failed),
            WorkerEvent::TeardownErrors(payload) => ctx.report_worker_errors(&payload.fatal_errors),
            WorkerEvent::Done(payload) => return Some(self.on_done(ctx, payload, None)),
            WorkerEvent::Ready | WorkerEvent::Response(_) => {}
        }
        None
    }

    /// The worker went away before reporting `done`.
    pub fn on_exit(&mut self, ctx: &mut RunContext, exit: &ProcessExitData) -> JobOutcome {
        let unexpected_exit = exit
            .unexpectedly
            .then(|| TestError::new(format!("Error: {}", exit.describe())));
        self.on_done(ctx, DonePayload::default(), unexpected_exit)
    }

    fn on_test_begin(&mut self, ctx: &mut RunContext, payload: TestBeginPayload) {
        let Some(test) = ctx.tests.get_mut(&payload.test_id) else {
            return;
        };
        let result = test.append_result();
        result.worker_index = self.worker_index as i64;
        result.parallel_index = self.parallel_index as i64;
        result.start_time = payload.start_wall_time;
        let test = &*test;
        if let Some(result) = test.results.last() {
            ctx.reporter.on_test_begin(test, result);
        }
        self.data_by_test_id
            .insert(payload.test_id.clone(), RunData::default());
        self.currently_running = Some(payload.test_id);
    }

    fn on_test_end(&mut self, ctx: &mut RunContext, mut payload: TestEndPayload) {
        if ctx.failure_tracker.has_reached_max_failures() {
            payload.status = TestStatus::Interrupted;
            payload.errors.clear();
        }
        if self.data_by_test_id.remove(&payload.test_id).is_none() {
            return;
        }
        self.remaining.shift_remove(&payload.test_id);
        let Some(test) = ctx.tests.get_mut(&payload.test_id) else {
            return;
        };
        if let Some(result) = test.results.last_mut() {
            result.duration_ms = payload.duration_ms;
            result.errors = payload.errors;
            result.status = payload.status;
            result.annotations = payload.annotations.clone();
            result.attachments = payload.attachments;
        }
        test.annotations = payload.annotations;
        test.expected_status = payload.expected_status;
        test.timeout = payload.timeout;
        let is_failure = payload.status != TestStatus::Skipped && payload.status != test.expected_status;
        if is_failure {
            self.failed_tests.insert(payload.test_id.clone());
        }
        ctx.report_test_end(&payload.test_id);
        self.currently_running = None;
    }

    fn on_step_begin(&mut self, ctx: &mut RunContext, payload: StepBeginPayload) {
        let Some(data) = self.data_by_test_id.get_mut(&payload.test_id) else {
            return;
        };
        let Some(test) = ctx.tests.get_mut(&payload.test_id) else {
            return;
        };
        let Some(result) = test.results.last_mut() else {
            return;
        };
        let parent = if payload.force_no_parent {
            None
        } else {
            data.open
                .iter()
                .rev()
                .find(|(_, can_have_children)| *can_have_children)
                .and_then(|(id, _)| data.steps.get(id).cloned())
        };
        let step = TestStep {
            title: payload.title,
            category: payload.category,
            start_time: payload.wall_time,
            duration_ms: None,
            error: None,
            location: payload.location,
            steps: Vec::new(),
        };
        let path = match parent {
            Some(mut path) => match step_at_mut(&mut result.steps, &path) {
                Some(parent) => {
                    parent.steps.push(step);
                    path.push(parent.steps.len() - 1);
                    path
                }
                None => return,
            },
            None => {
                result.steps.push(step);
                vec![result.steps.len() - 1]
            }
        };
        data.open.push((payload.step_id.clone(), payload.can_have_children));
        data.steps.insert(payload.step_id, path.clone());

        let test = &*test;
        if let Some(result) = test.results.last() {
            if let Some(step) = step_at(&result.steps, &path) {
                ctx.reporter.on_step_begin(test, result, step);
            }
        }
    }

    fn on_step_end(&mut self, ctx: &mut RunContext, payload: StepEndPayload) {
        let Some(data) = self.data_by_test_id.get_mut(&payload.test_id) else {
            return;
        };
        let Some(path) = data.steps.get(&payload.step_id).cloned() else {
            return;
        };
        data.open.retain(|(id, _)| id != &payload.step_id);
        let Some(test) = ctx.tests.get_mut(&payload.test_id) else {
            return;
        };
        let Some(result) = test.results.last_mut() else {
            return;
        };
        let Some(step) = step_at_mut(&mut result.steps, &path) else {
            return;
        };
        step.duration_ms = Some(elapsed_ms(step.start_time, payload.wall_time));
        step.error = payload.error;

        let test = &*test;
        if let Some(result) = test.results.last() {
            if let Some(step) = step_at(&result.steps, &path) {
                ctx.reporter.on_step_end(test, result, step);
            }
        }
    }

    fn on_output(
        &mut self,
        ctx: &mut RunContext,
        payload: TestOutputPayload,
        is_stderr: bool,
        worker_failed: bool,
    ) {
        // Unattributed process output goes to the running test, if any.
        let test_id = payload.test_id.clone().or_else(|| {
            if worker_failed {
                None
            } else {
                self.currently_running.clone()
            }
        });
        ctx.output_to(test_id.as_deref(), &payload.text, is_stderr);
    }

    fn on_done(
        &mut self,
        ctx: &mut RunContext,
        done: DonePayload,
        unexpected_exit: Option<TestError>,
    ) -> JobOutcome {
        if self.remaining.is_empty()
            && self.failed_tests.is_empty()
            && done.fatal_errors.is_empty()
            && done.skip_tests_due_to_setup_failure.is_empty()
            && done.fatal_unknown_test_ids.is_none()
            && unexpected_exit.is_none()
        {
            return JobOutcome::default();
        }

        for test_id in done.fatal_unknown_test_ids.iter().flatten() {
            if self.remaining.shift_remove(test_id) {
                self.fail_test_with_errors(
                    ctx,
                    test_id,
                    vec![TestError::new(
                        "Test not found in the worker process. Make sure test title does not change.",
                    )],
                );
            }
        }

        if !done.fatal_errors.is_empty() {
            let all: IndexSet<String> = self.remaining.clone();
            self.mass_skip_tests_from_remaining(ctx, &all, done.fatal_errors);
        }

        let setup_failures: IndexSet<String> =
            done.skip_tests_due_to_setup_failure.into_iter().collect();
        self.mass_skip_tests_from_remaining(ctx, &setup_failures, Vec::new());

        if let Some(error) = unexpected_exit {
            let targets: IndexSet<String> = match &self.currently_running {
                Some(running) => std::iter::once(running.clone()).collect(),
                None => self.remaining.clone(),
            };
            self.mass_skip_tests_from_remaining(ctx, &targets, vec![error]);
        }

        let mut retry_candidates: IndexSet<String> = IndexSet::new();
        let mut serial_suites_with_failures: IndexSet<String> = IndexSet::new();
        for failed in &self.failed_tests {
            retry_candidates.insert(failed.clone());
            if let Some(serial) = ctx.tests.get(failed).and_then(|t| t.outermost_serial_suite()) {
                serial_suites_with_failures.insert(serial.key.clone());
            }
        }

        let poisoned: IndexSet<String> = self
            .remaining
            .iter()
            .filter(|id| {
                ctx.tests.get(*id).is_some_and(|t| {
                    serial_suites_with_failures
                        .iter()
                        .any(|key| t.is_in_suite(key))
                })
            })
            .cloned()
            .collect();
        self.mass_skip_tests_from_remaining(ctx, &poisoned, Vec::new());

        for id in &self.group.tests {
            let in_failed_serial_suite = ctx.tests.get(id).is_some_and(|t| {
                serial_suites_with_failures
                    .iter()
                    .any(|key| t.is_in_suite(key))
            });
            if in_failed_serial_suite {
                retry_candidates.insert(id.clone());
            }
        }

        let mut tests: Vec<String> = self.remaining.iter().cloned().collect();
        for id in retry_candidates {
            let can_retry = ctx
                .tests
                .get(&id)
                .is_some_and(|t| t.results.len() < t.retries as usize + 1);
            if can_retry && !tests.contains(&id) {
                tests.push(id);
            }
        }
        tests.sort_by_key(|id| ctx.tests.get_index_of(id));

        if !tests.is_empty() {
            debug!(
                "Requeueing {} tests of {} for another attempt",
                tests.len(),
                self.group.require_file
            );
        }
        JobOutcome {
            new_job: (!tests.is_empty()).then(|| self.group.with_tests(tests)),
            did_fail: true,
        }
    }

    /// Fail the first of `test_ids` still remaining with `errors` and skip
    /// the others.
    fn mass_skip_tests_from_remaining(
        &mut self,
        ctx: &mut RunContext,
        test_ids: &IndexSet<String>,
        mut errors: Vec<TestError>,
    ) {
        let targets: Vec<String> = self
            .remaining
            .iter()
            .filter(|id| test_ids.contains(*id))
            .cloned()
            .collect();
        for id in targets {
            if !ctx.failure_tracker.has_reached_max_failures() {
                self.fail_test_with_errors(ctx, &id, std::mem::take(&mut errors));
            }
            self.remaining.shift_remove(&id);
        }
        if !errors.is_empty() {
            // Fatal errors after every test finished, most likely in a teardown.
            ctx.report_worker_errors(&errors);
        }
    }

    fn fail_test_with_errors(&mut self, ctx: &mut RunContext, test_id: &str, errors: Vec<TestError>) {
        let Some(test) = ctx.tests.get_mut(test_id) else {
            return;
        };
        // A test that began but never ended keeps its result.
        let started = self.data_by_test_id.contains_key(test_id) && !test.results.is_empty();
        if !started {
            test.append_result();
            let test = &*test;
            if let Some(result) = test.results.last() {
                ctx.reporter.on_test_begin(test, result);
            }
        }
        let Some(test) = ctx.tests.get_mut(test_id) else {
            return;
        };
        if let Some(result) = test.results.last_mut() {
            result.status = if errors.is_empty() {
                TestStatus::Skipped
            } else {
                TestStatus::Failed
            };
            result.errors = errors;
        }
        ctx.report_test_end(test_id);
        self.failed_tests.insert(test_id.to_string());
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

fn step_at<'a>(steps: &'a [TestStep], path: &[usize]) -> Option<&'a TestStep> {
    let (first, rest) = path.split_first()?;
    let step = steps.get(*first)?;
    if rest.is_empty() {
        Some(step)
    } else {
        step_at(&step.steps, rest)
    }
}

fn step_at_mut<'a>(steps: &'a mut [TestStep], path: &[usize]) -> Option<&'a mut TestStep> {
    let (first, rest) = path.split_first()?;
    let step = steps.get_mut(*first)?;
    if rest.is_empty() {
        Some(step)
    } else {
        step_at_mut(&mut step.steps, rest)
    }
}
