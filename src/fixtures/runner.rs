//! Fixture runtime
//!
//! Owns the live fixture instances of one worker. Instances live in an arena
//! keyed by registration id; dependency and usage edges are ids into it.
//! Teardown always runs consumers before the fixtures they depend on.

use futures::future::{self, BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::pool::{FixturePool, FixtureRegistration};
use super::{FixtureArgs, FixtureBody, FixtureContext, FixtureScope, FixtureValue, Provide};
use crate::error::CoreError;
use crate::timeout::{FixtureDescription, FixturePhase, RunnableDescription, TimeSlot};
use crate::worker::{PanicError, Stage, StageError, TestInfo, WorkerInfo};

/// Which auto fixtures to install before resolving parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoFixtures {
    /// Worker-scoped auto fixtures only, for modifiers that run in the
    /// beforeAll phase.
    Worker,
    /// Every auto fixture.
    Test,
    /// Worker-scoped ones and test-scoped ones marked for all hooks.
    AllHooksOnly,
}

type TeardownFuture = Shared<BoxFuture<'static, Result<(), StageError>>>;

struct FixtureInstance {
    registration: Arc<FixtureRegistration>,
    value: Option<FixtureValue>,
    failed: bool,
    deps: Vec<String>,
    usages: Vec<String>,
    resume: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<anyhow::Result<()>>>,
    teardown: Option<TeardownFuture>,
    /// Own budget when the registration declares a timeout; shared by setup
    /// and teardown.
    slot: Option<TimeSlot>,
}

impl FixtureInstance {
    fn new(registration: Arc<FixtureRegistration>) -> Self {
        let slot = registration.timeout.map(TimeSlot::new);
        Self {
            registration,
            value: None,
            failed: false,
            deps: Vec::new(),
            usages: Vec::new(),
            resume: None,
            task: None,
            teardown: None,
            slot,
        }
    }

    fn description(&self, phase: FixturePhase) -> FixtureDescription {
        FixtureDescription {
            title: self.registration.title().to_string(),
            phase,
            location: Some(self.registration.location.clone()),
            slot: self.slot.clone(),
        }
    }
}

struct RunnerState {
    pool: Option<Arc<FixturePool>>,
    test_scope_clean: bool,
    instances: IndexMap<String, FixtureInstance>,
}

#[derive(Clone)]
pub struct FixtureRunner {
    worker_info: WorkerInfo,
    state: Arc<Mutex<RunnerState>>,
}

impl FixtureRunner {
    pub fn new(worker_info: WorkerInfo) -> Self {
        Self {
            worker_info,
            state: Arc::new(Mutex::new(RunnerState {
                pool: None,
                test_scope_clean: true,
                instances: IndexMap::new(),
            })),
        }
    }

    /// Switch to the pool of the next test. All pools used by one worker
    /// must share a digest, and the previous test scope must be torn down.
    pub fn set_pool(&self, pool: Arc<FixturePool>) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if !state.test_scope_clean {
            return Err(CoreError::DirtyTestScope);
        }
        if let Some(current) = &state.pool {
            if current.digest() != pool.digest() {
                return Err(CoreError::PoolDigestMismatch {
                    expected: current.digest().to_string(),
                    actual: pool.digest().to_string(),
                });
            }
        }
        state.pool = Some(pool);
        Ok(())
    }

    fn pool(&self) -> Option<Arc<FixturePool>> {
        self.state.lock().pool.clone()
    }

    /// Whether every fixture in `deps` is worker-scoped.
    pub fn depends_on_worker_fixtures_only(&self, deps: &[String]) -> bool {
        let Some(pool) = self.pool() else {
            return deps.is_empty();
        };
        deps.iter().all(|name| {
            pool.resolve(name, None)
                .map(|r| r.scope == FixtureScope::Worker)
                .unwrap_or(false)
        })
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }

    /// Install auto fixtures and the fixtures named in `deps`.
    ///
    /// Returns `Ok(None)` when a fixture failed earlier and the function
    /// must not run. Errors from setups attempted now have already been
    /// recorded on `info`.
    pub async fn resolve_parameters(
        &self,
        deps: &[String],
        info: &TestInfo,
        runnable: &RunnableDescription,
        auto: AutoFixtures,
    ) -> Result<Option<FixtureArgs>, StageError> {
        let Some(pool) = self.pool() else {
            return Ok(Some(FixtureArgs::default()));
        };

        let mut auto_fixtures: Vec<Arc<FixtureRegistration>> = pool
            .auto_fixtures()
            .into_iter()
            .filter(|r| match auto {
                AutoFixtures::Test => true,
                AutoFixtures::Worker => r.scope == FixtureScope::Worker,
                AutoFixtures::AllHooksOnly => {
                    r.scope == FixtureScope::Worker
                        || r.auto == super::FixtureAuto::AllHooksIncluded
                }
            })
            .collect();
        auto_fixtures.sort_by_key(|r| if r.scope == FixtureScope::Worker { 0 } else { 1 });

        let mut order: IndexMap<String, Arc<FixtureRegistration>> = IndexMap::new();
        for registration in &auto_fixtures {
            collect_in_setup_order(&pool, registration, &mut order);
        }
        for name in deps {
            if let Some(registration) = pool.resolve(name, None) {
                collect_in_setup_order(&pool, &registration, &mut order);
            }
        }

        for registration in order.values() {
            if !self.setup(&pool, registration, info, runnable).await? {
                return Ok(None);
            }
        }

        let state = self.state.lock();
        let mut values = std::collections::HashMap::new();
        for name in deps {
            let Some(registration) = pool.resolve(name, None) else {
                return Ok(None);
            };
            match state.instances.get(&registration.id) {
                Some(instance) if !instance.failed => {
                    if let Some(value) = &instance.value {
                        values.insert(name.clone(), value.clone());
                    }
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(FixtureArgs::new(values)))
    }

    /// Set up one registration whose dependencies are already set up.
    /// Returns whether the fixture is usable.
    async fn setup(
        &self,
        pool: &FixturePool,
        registration: &Arc<FixtureRegistration>,
        info: &TestInfo,
        runnable: &RunnableDescription,
    ) -> Result<bool, StageError> {
        let (description, args) = {
            let mut state = self.state.lock();
            if registration.scope == FixtureScope::Test {
                state.test_scope_clean = false;
            }
            if let Some(existing) = state.instances.get(&registration.id) {
                return Ok(!existing.failed);
            }

            let mut instance = FixtureInstance::new(registration.clone());
            let mut values = std::collections::HashMap::new();
            let mut failed = false;
            for name in &registration.deps {
                let dep = match pool.resolve(name, Some(registration)) {
                    Some(dep) => state.instances.get_mut(&dep.id),
                    None => None,
                };
                let Some(dep) = dep else {
                    failed = true;
                    break;
                };
                if !dep.usages.contains(&registration.id) {
                    dep.usages.push(registration.id.clone());
                }
                instance.deps.push(dep.registration.id.clone());
                if dep.failed {
                    failed = true;
                    break;
                }
                if let Some(value) = &dep.value {
                    values.insert(name.clone(), value.clone());
                }
            }

            match &registration.body {
                FixtureBody::Value(value) => instance.value = Some(value.clone()),
                FixtureBody::Undefined => instance.value = Some(Arc::new(())),
                FixtureBody::Function(_) => instance.failed = failed,
            }
            let description = instance.description(FixturePhase::Setup);
            state.instances.insert(registration.id.clone(), instance);
            if !registration.body.is_function() {
                return Ok(true);
            }
            if failed {
                return Ok(false);
            }
            (description, FixtureArgs::new(values))
        };

        let FixtureBody::Function(func) = &registration.body else {
            return Ok(true);
        };
        debug!("setup {}", registration.name);
        let context = match registration.scope {
            FixtureScope::Worker => FixtureContext::Worker(self.worker_info.clone()),
            FixtureScope::Test => FixtureContext::Test(info.clone()),
        };
        let (provide, value_rx, resume) = Provide::channel();
        let mut task = tokio::spawn(func(args, provide, context));

        let stage = self.stage(registration, runnable.with_fixture(description));
        let name = registration.name.as_str();
        let result = info
            .run_as_stage(stage, async {
                match value_rx.await {
                    Ok(value) => Ok(value),
                    Err(_) => {
                        join_fixture_task(&mut task).await?;
                        Err(anyhow::anyhow!(
                            "Fixture \"{name}\" finished without providing a value"
                        ))
                    }
                }
            })
            .await;

        let mut state = self.state.lock();
        let Some(instance) = state.instances.get_mut(&registration.id) else {
            task.abort();
            return Ok(false);
        };
        instance.task = Some(task);
        match result {
            Ok(value) => {
                instance.value = Some(value);
                instance.resume = Some(resume);
                Ok(true)
            }
            Err(e) => {
                instance.failed = true;
                Err(e)
            }
        }
    }

    fn stage(&self, registration: &FixtureRegistration, runnable: RunnableDescription) -> Stage {
        let stage = Stage::new(format!("fixture: {}", registration.name)).runnable(runnable);
        if registration.boxed {
            stage
        } else {
            stage.step("fixture", Some(registration.location.clone()))
        }
    }

    /// Tear down every live fixture of `scope`, consumers first, and report
    /// the first error after attempting all of them.
    pub async fn teardown_scope(
        &self,
        scope: FixtureScope,
        info: &TestInfo,
        runnable: &RunnableDescription,
    ) -> Result<(), StageError> {
        let order = {
            let state = self.state.lock();
            let mut order: Vec<String> = Vec::new();
            for (id, instance) in state.instances.iter().rev() {
                if instance.registration.scope == scope {
                    collect_in_teardown_order(&state.instances, scope, id, &mut order);
                }
            }
            order
        };

        let mut first_error = None;
        for id in order {
            if let Err(e) = self.teardown(&id, info, runnable).await {
                first_error.get_or_insert(e);
            }
        }
        if scope == FixtureScope::Test {
            self.state.lock().test_scope_clean = true;
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear down one instance after its usages. Concurrent calls for the same
    /// instance share one teardown.
    pub fn teardown(
        &self,
        id: &str,
        info: &TestInfo,
        runnable: &RunnableDescription,
    ) -> TeardownFuture {
        let mut state = self.state.lock();
        let Some(instance) = state.instances.get_mut(id) else {
            return future::ready(Ok(())).boxed().shared();
        };
        if let Some(existing) = &instance.teardown {
            return existing.clone();
        }
        let this = self.clone();
        let id = id.to_string();
        let info = info.clone();
        let runnable = runnable.clone();
        let shared = async move { this.teardown_internal(&id, &info, &runnable).await }
            .boxed()
            .shared();
        instance.teardown = Some(shared.clone());
        shared
    }

    async fn teardown_internal(
        &self,
        id: &str,
        info: &TestInfo,
        runnable: &RunnableDescription,
    ) -> Result<(), StageError> {
        let usages = match self.state.lock().instances.get(id) {
            Some(instance) => instance.usages.clone(),
            None => return Ok(()),
        };
        let mut first_error = None;
        for usage in usages {
            if let Err(e) = self.teardown(&usage, info, runnable).await {
                first_error.get_or_insert(e);
            }
        }

        let (registration, description, resume, task) = {
            let mut state = self.state.lock();
            let Some(instance) = state.instances.get_mut(id) else {
                return first_error.map_or(Ok(()), Err);
            };
            if !instance.usages.is_empty() {
                warn!(
                    "fixture \"{}\" still has usages at teardown",
                    instance.registration.name
                );
                instance.usages.clear();
            }
            (
                instance.registration.clone(),
                instance.description(FixturePhase::Teardown),
                instance.resume.take(),
                instance.task.take(),
            )
        };

        let mut result = Ok(());
        if let Some(mut task) = task {
            let fixture_runnable = runnable.with_fixture(description);
            if resume.is_none() || info.timeout_manager().is_time_exhausted_for(&fixture_runnable) {
                // Never provided a value, or no time left to let it finish.
                task.abort();
            } else {
                debug!("teardown {}", registration.name);
                let stage = self.stage(&registration, fixture_runnable);
                result = info
                    .run_as_stage(stage, async move {
                        if let Some(resume) = resume {
                            let _ = resume.send(());
                        }
                        join_fixture_task(&mut task).await
                    })
                    .await;
            }
        }

        let mut state = self.state.lock();
        if let Some(instance) = state.instances.shift_remove(id) {
            for dep in &instance.deps {
                if let Some(dep) = state.instances.get_mut(dep) {
                    dep.usages.retain(|u| u != id);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => result,
        }
    }
}

/// Dependencies first, each registration once.
fn collect_in_setup_order(
    pool: &FixturePool,
    registration: &Arc<FixtureRegistration>,
    order: &mut IndexMap<String, Arc<FixtureRegistration>>,
) {
    if order.contains_key(&registration.id) {
        return;
    }
    for name in &registration.deps {
        if let Some(dep) = pool.resolve(name, Some(registration)) {
            collect_in_setup_order(pool, &dep, order);
        }
    }
    order.insert(registration.id.clone(), registration.clone());
}

/// Usages of the same scope first, each instance once.
fn collect_in_teardown_order(
    instances: &IndexMap<String, FixtureInstance>,
    scope: FixtureScope,
    id: &str,
    order: &mut Vec<String>,
) {
    let Some(instance) = instances.get(id) else {
        return;
    };
    if instance.registration.scope != scope || order.iter().any(|o| o == id) {
        return;
    }
    for usage in &instance.usages {
        collect_in_teardown_order(instances, scope, usage, order);
    }
    order.push(id.to_string());
}

async fn join_fixture_task(task: &mut JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            let message = panic
                .downcast_ref::<&'static str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            Err(PanicError(format!("panicked: {message}")).into())
        }
        Err(e) => Err(anyhow::anyhow!(e)),
    }
}
