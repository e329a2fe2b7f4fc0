//! Worker runtime
//!
//! Loads the file of each test group from the registry, binds it to the
//! worker's project and repeat index, and runs the requested tests in
//! declaration order. Suites are kept in a side table keyed by suite key
//! so hooks and modifiers can be looked up from a test's parent chain.

use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{Stage, StageError, TestInfo, TestInfoParams, WorkerInfo};
use crate::config::{FullConfig, DEFAULT_TIMEOUT_MS};
use crate::error::CoreError;
use crate::fixtures::{AutoFixtures, FixtureArgs, FixtureRunner, FixtureScope, PoolBuilder};
use crate::ipc::{
    DispatchRequest, DispatchResponse, DonePayload, EventSink, HostMessage, RunPayload,
    TeardownErrorsPayload, TestEntry, WorkerEvent, WorkerInitParams,
};
use crate::models::{
    bind_file_suite_to_project, filter_tests_remove_empty_suites, Annotation, Hook, HookType,
    Location, Modifier, ModifierType, Suite, SuiteEntry, TestCase, TestError, TestRegistry,
    TestStatus,
};
use crate::timeout::{RunnableDescription, RunnableType, TimeSlot};

/// How many recent tests are listed when a worker fails in teardown.
const LAST_RUNNING_TESTS: usize = 10;

struct SuiteNode {
    key: String,
    hooks: Vec<Hook>,
    modifiers: Vec<Modifier>,
}

/// A loaded group: the requested tests with pools attached.
struct GroupPlan {
    suites: HashMap<String, SuiteNode>,
    tests: Vec<TestCase>,
    project_name: String,
    project_timeout: u64,
}

impl GroupPlan {
    /// Enclosing suites of `test` that exist in the file tree, outermost first.
    fn suites_of(&self, test: &TestCase) -> Vec<&SuiteNode> {
        test.parents
            .iter()
            .filter_map(|p| self.suites.get(&p.key))
            .collect()
    }
}

fn collect_suites(suite: &Suite, out: &mut HashMap<String, SuiteNode>) {
    out.insert(
        suite.key.clone(),
        SuiteNode {
            key: suite.key.clone(),
            hooks: suite.hooks.clone(),
            modifiers: suite.modifiers.clone(),
        },
    );
    for entry in &suite.entries {
        if let SuiteEntry::Suite(child) = entry {
            collect_suites(child, out);
        }
    }
}

/// Per-group bookkeeping, reset for every `runTestGroup`.
#[derive(Default)]
struct GroupRun {
    /// Suites whose beforeAll hooks ran and afterAll hooks did not, with
    /// the annotations their beforeAll phase produced.
    active_suites: IndexMap<String, Vec<Annotation>>,
    /// Suite whose beforeAll failed; its remaining tests are not attempted.
    skip_remaining_in_suite: Option<String>,
    did_run_full_cleanup: bool,
}

enum HookBody<'a> {
    Hook(&'a Hook),
    Modifier(&'a Modifier),
}

struct HookRunnable<'a> {
    kind: RunnableType,
    title: String,
    location: &'a Location,
    deps: &'a [String],
    body: HookBody<'a>,
}

impl HookRunnable<'_> {
    fn call(&self, args: FixtureArgs, info: &TestInfo) -> BoxFuture<'static, anyhow::Result<()>> {
        match self.body {
            HookBody::Hook(hook) => (hook.func)(args, info.clone()),
            HookBody::Modifier(modifier) => {
                let condition = (modifier.func)(args);
                let info = info.clone();
                let kind = modifier.kind;
                let description = modifier.description.clone();
                async move {
                    let applies = condition.await?;
                    info.modifier(kind, applies, description)
                }
                .boxed()
            }
        }
    }

    fn runnable(&self, slot: Option<TimeSlot>) -> RunnableDescription {
        let runnable =
            RunnableDescription::new(self.kind).with_location(Some(self.location.clone()));
        match slot {
            Some(slot) => runnable.with_slot(slot),
            None => runnable,
        }
    }

    fn stage(&self) -> Stage {
        Stage::new(self.title.clone()).step("hook", Some(self.location.clone()))
    }
}

fn hook_runnable_type(kind: HookType) -> RunnableType {
    match kind {
        HookType::BeforeAll => RunnableType::BeforeAll,
        HookType::AfterAll => RunnableType::AfterAll,
        HookType::BeforeEach => RunnableType::BeforeEach,
        HookType::AfterEach => RunnableType::AfterEach,
    }
}

fn modifier_runnable_type(kind: ModifierType) -> RunnableType {
    match kind {
        ModifierType::Skip => RunnableType::Skip,
        ModifierType::Fixme => RunnableType::Fixme,
        ModifierType::Fail => RunnableType::Fail,
        ModifierType::Slow => RunnableType::Slow,
    }
}

/// Zero means no timeout.
fn max_timeout(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        0
    } else {
        a.max(b)
    }
}

#[derive(Default)]
struct RunState {
    fatal_errors: Vec<TestError>,
    is_stopped: bool,
    current_test: Option<TestInfo>,
    last_running_tests: VecDeque<String>,
    total_running_tests: usize,
}

struct Inner {
    registry: Arc<dyn TestRegistry>,
    config: FullConfig,
    params: WorkerInitParams,
    worker_info: WorkerInfo,
    events: EventSink,
    fixture_runner: FixtureRunner,
    state: Mutex<RunState>,
}

/// One worker: a fixture runner plus the state of the group being run.
#[derive(Clone)]
pub struct WorkerMain {
    inner: Arc<Inner>,
}

impl WorkerMain {
    pub fn new(registry: Arc<dyn TestRegistry>, params: WorkerInitParams, events: EventSink) -> Self {
        let mut config = params.config.clone();
        config.merge_options_from(&registry.config());
        let worker_info = WorkerInfo::from(&params);
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                fixture_runner: FixtureRunner::new(worker_info.clone()),
                worker_info,
                params,
                events,
                state: Mutex::new(RunState::default()),
            }),
        }
    }

    pub fn worker_info(&self) -> &WorkerInfo {
        &self.inner.worker_info
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.inner.state.lock()
    }

    fn emit(&self, event: WorkerEvent) {
        self.inner.events.dispatch(event);
    }

    fn is_stopped(&self) -> bool {
        self.state().is_stopped
    }

    fn project_timeout(&self) -> u64 {
        self.inner
            .config
            .project(&self.inner.params.project_id)
            .map(|p| p.timeout)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    /// Stop after the current test. The running test is interrupted.
    pub fn stop(&self) {
        let mut state = self.state();
        if !state.is_stopped {
            state.is_stopped = true;
            if let Some(test) = &state.current_test {
                test.interrupt();
            }
        }
    }

    fn fatal(&self, error: CoreError) {
        error!("Worker {} fatal error: {}", self.inner.worker_info.worker_index, error);
        self.state().fatal_errors.push(TestError::new(error.to_string()));
        self.stop();
    }

    pub fn dispatch(&self, request: &DispatchRequest) -> DispatchResponse {
        match request.method.as_str() {
            "workerInfo" => DispatchResponse {
                id: request.id,
                result: serde_json::to_value(&self.inner.worker_info).ok(),
                error: None,
            },
            other => DispatchResponse {
                id: request.id,
                result: None,
                error: Some(TestError::new(format!("Unknown method \"{other}\""))),
            },
        }
    }

    fn load_group(
        &self,
        file: &str,
        entries: &IndexMap<String, TestEntry>,
    ) -> Result<Option<GroupPlan>, CoreError> {
        let project = self.inner.config.project(&self.inner.params.project_id)?;
        let file_suite = self.inner.registry.load_file(file)?;
        if let Some(error) = file_suite.load_errors().into_iter().next() {
            return Err(CoreError::FileLoad {
                file: file.to_string(),
                message: error.message,
            });
        }
        let mut suite =
            bind_file_suite_to_project(project, &file_suite, self.inner.params.repeat_each_index);
        filter_tests_remove_empty_suites(&mut suite, &mut |test| entries.contains_key(&test.id));
        if !suite.has_tests() {
            return Ok(None);
        }
        PoolBuilder::for_worker(project).build_pools(&mut suite)?;

        let mut suites = HashMap::new();
        collect_suites(&suite, &mut suites);
        Ok(Some(GroupPlan {
            suites,
            tests: suite.into_tests(),
            project_name: project.name.clone(),
            project_timeout: project.timeout,
        }))
    }

    /// Run one group and report `done`.
    pub async fn run_test_group(&self, payload: RunPayload) {
        let mut entries: IndexMap<String, TestEntry> = payload
            .entries
            .iter()
            .map(|e| (e.test_id.clone(), e.clone()))
            .collect();
        let mut group = GroupRun::default();
        let mut fatal_unknown_test_ids = None;
        let mut plan = None;

        match self.load_group(&payload.file, &entries) {
            Ok(Some(loaded)) => {
                if let Err(e) = self.run_tests(&loaded, &mut entries, &mut group).await {
                    self.fatal(e);
                }
                plan = Some(loaded);
            }
            Ok(None) => {
                fatal_unknown_test_ids =
                    Some(payload.entries.iter().map(|e| e.test_id.clone()).collect());
                self.stop();
            }
            Err(e) => self.fatal(e),
        }

        let mut done = DonePayload {
            fatal_errors: std::mem::take(&mut self.state().fatal_errors),
            skip_tests_due_to_setup_failure: Vec::new(),
            fatal_unknown_test_ids,
        };
        if let (Some(plan), Some(key)) = (&plan, &group.skip_remaining_in_suite) {
            done.skip_tests_due_to_setup_failure = plan
                .tests
                .iter()
                .filter(|t| t.is_in_suite(key) && entries.contains_key(&t.id))
                .map(|t| t.id.clone())
                .collect();
        }
        self.emit(WorkerEvent::Done(done));
    }

    async fn run_tests(
        &self,
        plan: &GroupPlan,
        entries: &mut IndexMap<String, TestEntry>,
        group: &mut GroupRun,
    ) -> Result<(), CoreError> {
        for (index, test) in plan.tests.iter().enumerate() {
            // Nothing may run once the full cleanup happened.
            if self.is_stopped() && group.did_run_full_cleanup {
                break;
            }
            let retry = entries.shift_remove(&test.id).map(|e| e.retry).unwrap_or(0);
            debug!("test started \"{}\"", test.title);
            self.run_test(plan, test, retry, plan.tests.get(index + 1), group)
                .await?;
            debug!("test finished \"{}\"", test.title);
        }
        Ok(())
    }

    async fn run_test(
        &self,
        plan: &GroupPlan,
        test: &TestCase,
        retry: u32,
        next_test: Option<&TestCase>,
        group: &mut GroupRun,
    ) -> Result<(), CoreError> {
        let info = TestInfo::new(
            TestInfoParams {
                test_id: test.id.clone(),
                title: test.title.clone(),
                title_path: test.title_path.clone(),
                file: test.require_file.clone(),
                project_id: test.project_id.clone(),
                retry,
                repeat_each_index: test.repeat_each_index,
                worker_index: self.inner.worker_info.worker_index,
                parallel_index: self.inner.worker_info.parallel_index,
                timeout_ms: test.timeout,
            },
            self.inner.events.clone(),
        );

        if !self.is_stopped() {
            if let Some(pool) = &test.pool {
                self.inner.fixture_runner.set_pool(pool.clone())?;
            }
        }

        let suites = plan.suites_of(test);
        let reversed_suites: Vec<&SuiteNode> = suites.iter().rev().copied().collect();
        let next_suites: HashSet<&str> = next_test
            .map(|t| t.parents.iter().map(|p| p.key.as_str()).collect())
            .unwrap_or_default();

        for annotation in &test.annotations {
            info.process_annotation(annotation);
        }
        for suite in &suites {
            if let Some(extra) = group.active_suites.get(&suite.key) {
                for annotation in extra {
                    info.process_annotation(annotation);
                }
            }
        }

        self.state().current_test = Some(info.clone());
        self.emit(WorkerEvent::TestBegin(info.begin_payload()));

        let is_skipped = info.expected_status() == TestStatus::Skipped;
        let has_after_all_to_run_before_next_test = reversed_suites.iter().any(|suite| {
            group.active_suites.contains_key(&suite.key)
                && !next_suites.contains(suite.key.as_str())
                && suite.hooks.iter().any(|h| h.kind == HookType::AfterAll)
        });
        if is_skipped && next_test.is_some() && !has_after_all_to_run_before_next_test {
            // Later tests take care of cleanup.
            info.set_status(TestStatus::Skipped);
            self.state().current_test = None;
            self.emit(WorkerEvent::TestEnd(info.end_payload()));
            return Ok(());
        }

        {
            let mut state = self.state();
            state.total_running_tests += 1;
            state
                .last_running_tests
                .push_back(format_test_title(test, &plan.project_name));
            if state.last_running_tests.len() > LAST_RUNNING_TESTS {
                state.last_running_tests.pop_front();
            }
        }

        let mut should_run_after_each_hooks = false;
        info.set_allow_skips(true);
        let _ = info
            .run_as_stage(Stage::new("setup and test"), async {
                if self.is_stopped() || is_skipped {
                    // Either the last test is skipped or the worker is
                    // stopping without having cleaned up: skip, then clean up.
                    info.set_status(TestStatus::Skipped);
                    return Ok(());
                }

                let params = info
                    .run_as_stage(Stage::new("Before Hooks").step("hook", None), async {
                        for suite in &suites {
                            self.run_before_all_hooks_for_suite(plan, suite, &info, group)
                                .await?;
                        }
                        // Once beforeEach started, every afterEach must run.
                        should_run_after_each_hooks = true;
                        self.run_each_hooks(&suites, HookType::BeforeEach, &info, None)
                            .await?;
                        let params = self
                            .inner
                            .fixture_runner
                            .resolve_parameters(
                                &test.deps,
                                &info,
                                &RunnableDescription::new(RunnableType::Test),
                                AutoFixtures::Test,
                            )
                            .await?;
                        Ok::<_, anyhow::Error>(params)
                    })
                    .await?;

                let Some(args) = params else {
                    // A fixture failed or was skipped.
                    return Ok(());
                };
                info.run_as_stage(
                    Stage::new("test function")
                        .runnable(RunnableDescription::new(RunnableType::Test)),
                    (test.func)(args, info.clone()),
                )
                .await?;
                Ok::<(), anyhow::Error>(())
            })
            .await;

        info.set_duration(info.timeout_manager().default_slot().elapsed());
        info.set_allow_skips(true);

        let after_hooks_slot = TimeSlot::new(max_timeout(plan.project_timeout, info.timeout()));
        let _ = info
            .run_as_stage(Stage::new("After Hooks").step("hook", None), async {
                let mut first_error: Option<StageError> = None;
                if should_run_after_each_hooks {
                    if let Err(e) = self
                        .run_each_hooks(
                            &reversed_suites,
                            HookType::AfterEach,
                            &info,
                            Some(after_hooks_slot.clone()),
                        )
                        .await
                    {
                        first_error.get_or_insert(e);
                    }
                }

                // Attributed to the test so the test timeout is what users raise.
                let runnable = RunnableDescription::new(RunnableType::Test)
                    .with_slot(after_hooks_slot.clone());
                if let Err(e) = self
                    .inner
                    .fixture_runner
                    .teardown_scope(FixtureScope::Test, &info, &runnable)
                    .await
                {
                    first_error.get_or_insert(e);
                }

                // afterAll hooks must run before worker fixtures go away on failure.
                for suite in &reversed_suites {
                    if !next_suites.contains(suite.key.as_str()) || info.is_failure() {
                        if let Err(e) = self
                            .run_after_all_hooks_for_suite(plan, suite, &info, group)
                            .await
                        {
                            first_error.get_or_insert(e);
                        }
                    }
                }
                match first_error {
                    Some(e) => Err(anyhow::Error::new(e)),
                    None => Ok(()),
                }
            })
            .await;

        if info.is_failure() || info.has_unhandled_error() {
            self.state().is_stopped = true;
        }

        if self.is_stopped() {
            group.did_run_full_cleanup = true;
            let _ = info
                .run_as_stage(Stage::new("Worker Cleanup").step("hook", None), async {
                    let mut first_error: Option<StageError> = None;
                    let teardown_slot = TimeSlot::new(plan.project_timeout);

                    let runnable = RunnableDescription::new(RunnableType::Test)
                        .with_slot(teardown_slot.clone());
                    if let Err(e) = self
                        .inner
                        .fixture_runner
                        .teardown_scope(FixtureScope::Test, &info, &runnable)
                        .await
                    {
                        first_error.get_or_insert(e);
                    }

                    for suite in &reversed_suites {
                        if let Err(e) = self
                            .run_after_all_hooks_for_suite(plan, suite, &info, group)
                            .await
                        {
                            first_error.get_or_insert(e);
                        }
                    }

                    // Worker fixtures are not part of the test.
                    let runnable = RunnableDescription::new(RunnableType::Teardown)
                        .with_slot(teardown_slot.clone());
                    if let Err(e) = self
                        .inner
                        .fixture_runner
                        .teardown_scope(FixtureScope::Worker, &info, &runnable)
                        .await
                    {
                        first_error.get_or_insert(e);
                    }
                    match first_error {
                        Some(e) => Err(anyhow::Error::new(e)),
                        None => Ok(()),
                    }
                })
                .await;
        }

        info.set_duration(info.timeout_manager().default_slot().elapsed() + after_hooks_slot.elapsed());
        self.state().current_test = None;
        self.emit(WorkerEvent::TestEnd(info.end_payload()));
        Ok(())
    }

    /// Modifiers first, then hooks of `kind`. A modifier runs in the
    /// beforeAll phase when it only needs worker fixtures.
    fn collect_hooks_and_modifiers<'a>(
        &self,
        suite: &'a SuiteNode,
        kind: HookType,
    ) -> Vec<HookRunnable<'a>> {
        let mut runnables = Vec::new();
        for modifier in &suite.modifiers {
            let phase = if self
                .inner
                .fixture_runner
                .depends_on_worker_fixtures_only(&modifier.deps)
            {
                HookType::BeforeAll
            } else {
                HookType::BeforeEach
            };
            if phase != kind {
                continue;
            }
            runnables.push(HookRunnable {
                kind: modifier_runnable_type(modifier.kind),
                title: format!("{} modifier", modifier.kind),
                location: &modifier.location,
                deps: &modifier.deps,
                body: HookBody::Modifier(modifier),
            });
        }
        for hook in suite.hooks.iter().filter(|h| h.kind == kind) {
            runnables.push(HookRunnable {
                kind: hook_runnable_type(hook.kind),
                title: hook.title.clone(),
                location: &hook.location,
                deps: &hook.deps,
                body: HookBody::Hook(hook),
            });
        }
        runnables
    }

    async fn run_function(
        &self,
        hook: &HookRunnable<'_>,
        info: &TestInfo,
        auto: AutoFixtures,
        runnable: &RunnableDescription,
    ) -> Result<(), StageError> {
        let Some(args) = self
            .inner
            .fixture_runner
            .resolve_parameters(hook.deps, info, runnable, auto)
            .await?
        else {
            return Ok(());
        };
        info.run_as_stage(
            Stage::new("run function").runnable(runnable.clone()),
            hook.call(args, info),
        )
        .await
    }

    async fn run_before_all_hooks_for_suite(
        &self,
        plan: &GroupPlan,
        suite: &SuiteNode,
        info: &TestInfo,
        group: &mut GroupRun,
    ) -> Result<(), StageError> {
        if group.active_suites.contains_key(&suite.key) {
            return Ok(());
        }
        group.active_suites.insert(suite.key.clone(), Vec::new());
        self.run_all_hooks_for_suite(plan, suite, info, HookType::BeforeAll, group)
            .await
    }

    async fn run_after_all_hooks_for_suite(
        &self,
        plan: &GroupPlan,
        suite: &SuiteNode,
        info: &TestInfo,
        group: &mut GroupRun,
    ) -> Result<(), StageError> {
        if group.active_suites.shift_remove(&suite.key).is_none() {
            return Ok(());
        }
        self.run_all_hooks_for_suite(plan, suite, info, HookType::AfterAll, group)
            .await
    }

    /// Runs every hook and reports the first error.
    async fn run_all_hooks_for_suite(
        &self,
        plan: &GroupPlan,
        suite: &SuiteNode,
        info: &TestInfo,
        kind: HookType,
        group: &mut GroupRun,
    ) -> Result<(), StageError> {
        let mut first_error: Option<StageError> = None;
        for hook in self.collect_hooks_and_modifiers(suite, kind) {
            // Each beforeAll/afterAll hook gets its own slot.
            let runnable = hook.runnable(Some(TimeSlot::new(plan.project_timeout)));
            let existing_annotations = info.annotations().len();
            let result = info
                .run_as_stage(hook.stage(), async {
                    let result = self
                        .run_function(&hook, info, AutoFixtures::AllHooksOnly, &runnable)
                        .await;
                    // Test fixtures are scoped to the hook, even when it failed.
                    let teardown = self
                        .inner
                        .fixture_runner
                        .teardown_scope(FixtureScope::Test, info, &runnable)
                        .await;
                    result?;
                    teardown?;
                    Ok::<(), anyhow::Error>(())
                })
                .await;

            if kind == HookType::BeforeAll {
                // Later tests of the suite inherit what the beforeAll phase annotated.
                let added: Vec<Annotation> = info
                    .annotations()
                    .into_iter()
                    .skip(existing_annotations)
                    .collect();
                if let Some(extra) = group.active_suites.get_mut(&suite.key) {
                    extra.extend(added);
                }
            }

            if let Err(e) = result {
                let is_skip = e.is_skip();
                first_error.get_or_insert(e);
                if kind == HookType::BeforeAll && is_skip {
                    break;
                }
                if kind == HookType::BeforeAll && group.skip_remaining_in_suite.is_none() {
                    group.skip_remaining_in_suite = Some(suite.key.clone());
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs hooks unless one would time out right away; reports the first
    /// error.
    async fn run_each_hooks(
        &self,
        suites: &[&SuiteNode],
        kind: HookType,
        info: &TestInfo,
        slot: Option<TimeSlot>,
    ) -> Result<(), StageError> {
        let hooks: Vec<HookRunnable<'_>> = suites
            .iter()
            .flat_map(|suite| self.collect_hooks_and_modifiers(suite, kind))
            .collect();
        let mut first_error: Option<StageError> = None;
        for hook in hooks {
            let runnable = hook.runnable(slot.clone());
            if info.timeout_manager().is_time_exhausted_for(&runnable) {
                continue;
            }
            let result = info
                .run_as_stage(hook.stage(), async {
                    self.run_function(&hook, info, AutoFixtures::Test, &runnable)
                        .await?;
                    Ok::<(), anyhow::Error>(())
                })
                .await;
            if let Err(e) = result {
                let is_skip = e.is_skip();
                first_error.get_or_insert(e);
                // A skip in a modifier stops the remaining hooks.
                if is_skip {
                    break;
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear down everything that is left and report errors that belong to
    /// no test.
    pub async fn gracefully_close(&self) {
        self.stop();
        let info = TestInfo::detached(TestInfoParams {
            project_id: self.inner.worker_info.project_id.clone(),
            worker_index: self.inner.worker_info.worker_index,
            parallel_index: self.inner.worker_info.parallel_index,
            timeout_ms: self.project_timeout(),
            ..Default::default()
        });
        let runnable = RunnableDescription::new(RunnableType::Teardown);
        // Errors are collected on `info`.
        let _ = self
            .inner
            .fixture_runner
            .teardown_scope(FixtureScope::Test, &info, &runnable)
            .await;
        let _ = self
            .inner
            .fixture_runner
            .teardown_scope(FixtureScope::Worker, &info, &runnable)
            .await;

        let mut fatal_errors = std::mem::take(&mut self.state().fatal_errors);
        fatal_errors.extend(info.errors());
        if let Some(last) = fatal_errors.last_mut() {
            self.append_teardown_diagnostics(last);
        }
        if !fatal_errors.is_empty() {
            self.emit(WorkerEvent::TeardownErrors(TeardownErrorsPayload { fatal_errors }));
        }
    }

    fn append_teardown_diagnostics(&self, error: &mut TestError) {
        let state = self.state();
        if state.last_running_tests.is_empty() {
            return;
        }
        let count = if state.total_running_tests == 1 {
            "1 test".to_string()
        } else {
            format!("{} tests", state.total_running_tests)
        };
        let last = if state.last_running_tests.len() < state.total_running_tests {
            format!(", last {} tests were", state.last_running_tests.len())
        } else {
            String::new()
        };
        let mut lines = vec![String::new(), String::new(), format!("Failed worker ran {count}{last}:")];
        lines.extend(state.last_running_tests.iter().cloned());
        let message = lines.join("\n");
        if let Some(stack) = &mut error.stack {
            if let Some(index) = stack.find(&error.message) {
                stack.insert_str(index + error.message.len(), &message);
            }
        }
        error.message.push_str(&message);
    }
}

fn format_test_title(test: &TestCase, project_name: &str) -> String {
    let project = if project_name.is_empty() {
        String::new()
    } else {
        format!("[{project_name}] › ")
    };
    let titles: Vec<&str> = test
        .title_path
        .iter()
        .skip(3)
        .map(String::as_str)
        .filter(|t| !t.is_empty())
        .collect();
    format!("{project}{} › {}", test.location, titles.join(" › "))
}

/// Serve one worker over typed channels until `__stop__` or until the host
/// goes away.
pub async fn serve(
    registry: Arc<dyn TestRegistry>,
    mut messages: mpsc::UnboundedReceiver<HostMessage>,
    events: EventSink,
) {
    events.dispatch(WorkerEvent::Ready);
    let params = loop {
        match messages.recv().await {
            Some(HostMessage::Init(init)) => break init.worker,
            Some(other) => warn!("Ignoring {:?} before __init__", other),
            None => return,
        }
    };
    let worker = WorkerMain::new(registry, params, events.clone());
    debug!(
        "worker {} started for project \"{}\"",
        worker.worker_info().worker_index,
        worker.worker_info().project_id
    );

    let mut running: Option<JoinHandle<()>> = None;
    while let Some(message) = messages.recv().await {
        match message {
            HostMessage::RunTestGroup(payload) => {
                if let Some(previous) = running.take() {
                    let _ = previous.await;
                }
                let worker = worker.clone();
                running = Some(tokio::spawn(async move {
                    worker.run_test_group(payload).await;
                }));
            }
            HostMessage::Dispatch(request) => {
                events.dispatch(WorkerEvent::Response(worker.dispatch(&request)));
            }
            HostMessage::Stop => break,
            HostMessage::Init(_) => warn!("Ignoring repeated __init__"),
        }
    }

    worker.stop();
    let abort = running.as_ref().map(|r| r.abort_handle());
    let force_exit_ms = worker.inner.config.force_exit_timeout_ms;
    let close = async {
        if let Some(running) = running {
            if let Err(e) = running.await {
                error!("Test group task failed: {}", e);
            }
        }
        worker.gracefully_close().await;
    };
    if tokio::time::timeout(Duration::from_millis(force_exit_ms), close)
        .await
        .is_err()
    {
        warn!(
            "Worker {} did not close within {}ms, forcing exit",
            worker.worker_info().worker_index,
            force_exit_ms
        );
        if let Some(abort) = abort {
            abort.abort();
        }
    }
    debug!("worker {} exited", worker.worker_info().worker_index);
}

/// Worker process entry point: one JSON envelope per line on stdin and
/// stdout.
pub async fn run_stdio(registry: Arc<dyn TestRegistry>) -> anyhow::Result<()> {
    let (host_tx, host_rx) = mpsc::unbounded_channel();
    let (events, mut event_rx) = EventSink::channel();

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HostMessage>(&line) {
                Ok(message) => {
                    if host_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Ignoring malformed host message: {}", e),
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    let serving = serve(registry, host_rx, events);
    tokio::pin!(serving);
    loop {
        tokio::select! {
            biased;
            Some(event) = event_rx.recv() => write_event(&mut stdout, &event).await?,
            _ = &mut serving => break,
        }
    }
    while let Ok(event) = event_rx.try_recv() {
        write_event(&mut stdout, &event).await?;
    }
    reader.abort();
    Ok(())
}

async fn write_event<W: AsyncWrite + Unpin>(out: &mut W, event: &WorkerEvent) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::fixtures::{FixtureDef, FixtureLayer, TestType};
    use crate::models::StaticRegistry;
    use pretty_assertions::assert_eq;

    fn registry() -> Arc<dyn TestRegistry> {
        let config = FullConfig::empty().with_project(ProjectConfig::new("p"));
        Arc::new(
            StaticRegistry::new(config).file("a.spec", |s| {
                let test_type = TestType::base().extend(FixtureLayer::new().fixture(
                    "answer",
                    FixtureDef::function(&[], |_args, provide, _ctx| async move {
                        provide.provide(42u32).await;
                        Ok(())
                    }),
                ));
                s.with_test_type(test_type);
                s.test("passes", &["answer"], |args, _info| async move {
                    anyhow::ensure!(*args.get::<u32>("answer")? == 42);
                    Ok(())
                });
                s.test("fails", &[], |_args, _info| async {
                    Err(anyhow::anyhow!("nope"))
                });
                s.describe_serial("serial", |s| {
                    s.before_all(&[], |_args, _info| async {
                        Err(anyhow::anyhow!("setup broke"))
                    });
                    s.test("first", &[], |_args, _info| async { Ok(()) });
                    s.test("second", &[], |_args, _info| async { Ok(()) });
                });
            }),
        )
    }

    fn init(registry: &Arc<dyn TestRegistry>) -> WorkerInitParams {
        WorkerInitParams {
            worker_index: 0,
            parallel_index: 0,
            repeat_each_index: 0,
            project_id: "p".to_string(),
            config: registry.config(),
        }
    }

    /// Test ids of file `a.spec` as the host computes them.
    fn ids(registry: &Arc<dyn TestRegistry>) -> Vec<String> {
        let config = registry.config();
        let project = config.project("p").unwrap();
        let suite = registry.load_file("a.spec").unwrap();
        let bound = bind_file_suite_to_project(project, &suite, 0);
        bound.all_tests().iter().map(|t| t.id.clone()).collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn entries(ids: &[String]) -> Vec<TestEntry> {
        ids.iter()
            .map(|id| TestEntry {
                test_id: id.clone(),
                retry: 0,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_runs_group_and_reports_done() {
        let registry = registry();
        let ids = ids(&registry);
        let (events, mut rx) = EventSink::channel();
        let worker = WorkerMain::new(registry.clone(), init(&registry), events);
        worker
            .run_test_group(RunPayload {
                file: "a.spec".to_string(),
                entries: entries(&ids[..1]),
            })
            .await;

        let events = drain(&mut rx);
        let ends: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::TestEnd(end) => Some(end.status),
                _ => None,
            })
            .collect();
        assert_eq!(ends, vec![TestStatus::Passed]);
        match events.last() {
            Some(WorkerEvent::Done(done)) => {
                assert!(done.fatal_errors.is_empty());
                assert!(done.fatal_unknown_test_ids.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failure_stops_worker_for_rest_of_group() {
        let registry = registry();
        let ids = ids(&registry);
        let (events, mut rx) = EventSink::channel();
        let worker = WorkerMain::new(registry.clone(), init(&registry), events);
        worker
            .run_test_group(RunPayload {
                file: "a.spec".to_string(),
                entries: entries(&ids[1..2]),
            })
            .await;
        assert!(worker.is_stopped());
        let statuses: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::TestEnd(end) => Some((end.status, end.errors.len())),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![(TestStatus::Failed, 1)]);
    }

    #[tokio::test]
    async fn test_before_all_failure_skips_rest_of_suite() {
        let registry = registry();
        let ids = ids(&registry);
        let (events, mut rx) = EventSink::channel();
        let worker = WorkerMain::new(registry.clone(), init(&registry), events);
        worker
            .run_test_group(RunPayload {
                file: "a.spec".to_string(),
                entries: entries(&ids[2..]),
            })
            .await;

        let events = drain(&mut rx);
        let ends: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::TestEnd(end) => Some(end.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].errors[0].message, "setup broke");
        match events.last() {
            Some(WorkerEvent::Done(done)) => {
                assert_eq!(done.skip_tests_due_to_setup_failure, vec![ids[3].clone()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_ids_are_fatal() {
        let registry = registry();
        let (events, mut rx) = EventSink::channel();
        let worker = WorkerMain::new(registry.clone(), init(&registry), events);
        worker
            .run_test_group(RunPayload {
                file: "a.spec".to_string(),
                entries: entries(&["missing".to_string()]),
            })
            .await;
        match drain(&mut rx).last() {
            Some(WorkerEvent::Done(done)) => {
                assert_eq!(done.fatal_unknown_test_ids, Some(vec!["missing".to_string()]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_serve_handshake_and_dispatch() {
        let registry = registry();
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (events, mut rx) = EventSink::channel();
        let params = init(&registry);
        let server = tokio::spawn(serve(registry, host_rx, events));

        assert!(matches!(rx.recv().await, Some(WorkerEvent::Ready)));
        host_tx
            .send(HostMessage::Init(crate::ipc::InitParams {
                process_name: "worker".to_string(),
                worker: params,
            }))
            .unwrap();
        host_tx
            .send(HostMessage::Dispatch(DispatchRequest {
                id: 7,
                method: "workerInfo".to_string(),
                params: serde_json::Value::Null,
            }))
            .unwrap();
        match rx.recv().await {
            Some(WorkerEvent::Response(response)) => {
                assert_eq!(response.id, 7);
                assert_eq!(response.result.unwrap()["projectId"], "p");
            }
            other => panic!("unexpected {other:?}"),
        }
        host_tx.send(HostMessage::Stop).unwrap();
        server.await.unwrap();
    }

    #[test]
    fn test_max_timeout_treats_zero_as_unlimited() {
        assert_eq!(max_timeout(0, 100), 0);
        assert_eq!(max_timeout(200, 100), 200);
    }
}
