//! Fixtures
//!
//! Declaration types for fixtures (`FixtureDef`, `FixtureLayer`, `TestType`),
//! the values handed to user functions, and the registry/runtime that
//! resolves and instantiates them.

mod builder;
mod pool;
mod runner;

pub use builder::{PoolBuilder, PoolBuilderKind};
pub use pool::{FixturePool, FixtureRegistration, LoadError, OptionOverrides, RegistrationIds};
pub(crate) use pool::sha1_hex;
pub use runner::{AutoFixtures, FixtureRunner};

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::models::Location;
use crate::worker::{TestInfo, WorkerInfo};

/// Type-erased fixture value.
pub type FixtureValue = Arc<dyn Any + Send + Sync>;

/// User fixture function: receives its dependencies, a single-use
/// [`Provide`] handle and the scope context.
pub type FixtureFn = Arc<
    dyn Fn(FixtureArgs, Provide, FixtureContext) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixtureScope {
    #[default]
    Test,
    Worker,
}

impl FixtureScope {
    /// Ordering used by the scope check: a fixture may only depend on
    /// fixtures of the same or a wider scope.
    pub fn order(&self) -> u8 {
        match self {
            FixtureScope::Test => 0,
            FixtureScope::Worker => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FixtureScope::Test => "test",
            FixtureScope::Worker => "worker",
        }
    }
}

impl fmt::Display for FixtureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FixtureAuto {
    #[default]
    Off,
    On,
    /// Also instantiated for beforeAll/afterAll hooks.
    AllHooksIncluded,
}

/// Options attached to a fixture declaration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FixtureOptions {
    pub scope: FixtureScope,
    pub auto: FixtureAuto,
    pub option: bool,
    pub timeout: Option<u64>,
    pub title: Option<String>,
    pub boxed: bool,
}

/// Body of a fixture declaration.
#[derive(Clone)]
pub enum FixtureBody {
    Function(FixtureFn),
    Value(FixtureValue),
    /// Resets an option to its configured or declared default.
    Undefined,
}

impl FixtureBody {
    pub fn is_function(&self) -> bool {
        matches!(self, FixtureBody::Function(_))
    }
}

impl fmt::Debug for FixtureBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixtureBody::Function(_) => f.write_str("Function(..)"),
            FixtureBody::Value(_) => f.write_str("Value(..)"),
            FixtureBody::Undefined => f.write_str("Undefined"),
        }
    }
}

/// A single fixture declaration inside a layer.
///
/// `options` is `None` for the plain form, in which case scope and auto are
/// inherited from the declaration being overridden. `site` is where the
/// declaration was written; two declarations from the same site are the same
/// fixture implementation.
#[derive(Clone, Debug)]
pub struct FixtureDef {
    pub body: FixtureBody,
    pub deps: Vec<String>,
    pub options: Option<FixtureOptions>,
    pub site: Location,
}

impl FixtureDef {
    /// Fixture computed by an async function depending on `deps`.
    #[track_caller]
    pub fn function<F, Fut>(deps: &[&str], f: F) -> Self
    where
        F: Fn(FixtureArgs, Provide, FixtureContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let f: FixtureFn = Arc::new(move |args, provide, ctx| f(args, provide, ctx).boxed());
        Self {
            body: FixtureBody::Function(f),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            options: None,
            site: Location::caller(),
        }
    }

    /// Fixture that is a plain value.
    #[track_caller]
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_value(Arc::new(value))
    }

    #[track_caller]
    pub fn from_value(value: FixtureValue) -> Self {
        Self {
            body: FixtureBody::Value(value),
            deps: Vec::new(),
            options: None,
            site: Location::caller(),
        }
    }

    #[track_caller]
    pub fn undefined() -> Self {
        Self {
            body: FixtureBody::Undefined,
            deps: Vec::new(),
            options: None,
            site: Location::caller(),
        }
    }

    fn options_mut(&mut self) -> &mut FixtureOptions {
        self.options.get_or_insert_with(FixtureOptions::default)
    }

    pub fn with_options(mut self, options: FixtureOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn scope(mut self, scope: FixtureScope) -> Self {
        self.options_mut().scope = scope;
        self
    }

    pub fn worker(self) -> Self {
        self.scope(FixtureScope::Worker)
    }

    pub fn auto(mut self, auto: FixtureAuto) -> Self {
        self.options_mut().auto = auto;
        self
    }

    pub fn option(mut self) -> Self {
        self.options_mut().option = true;
        self
    }

    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.options_mut().timeout = Some(timeout_ms);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.options_mut().title = Some(title.into());
        self
    }

    pub fn boxed(mut self) -> Self {
        self.options_mut().boxed = true;
        self
    }
}

/// An ordered set of fixture declarations registered together.
#[derive(Clone, Debug)]
pub struct FixtureLayer {
    pub fixtures: Vec<(String, FixtureDef)>,
    pub location: Location,
}

impl FixtureLayer {
    #[track_caller]
    pub fn new() -> Self {
        Self {
            fixtures: Vec::new(),
            location: Location::caller(),
        }
    }

    pub fn at(location: Location) -> Self {
        Self {
            fixtures: Vec::new(),
            location,
        }
    }

    pub fn fixture(mut self, name: impl Into<String>, def: FixtureDef) -> Self {
        self.fixtures.push((name.into(), def));
        self
    }
}

impl Default for FixtureLayer {
    #[track_caller]
    fn default() -> Self {
        Self::new()
    }
}

static NEXT_TEST_TYPE_ID: AtomicU64 = AtomicU64::new(1);

/// The fixture layers a test was declared with. Each `extend` produces a new
/// test type with a fresh id.
#[derive(Debug)]
pub struct TestType {
    id: u64,
    layers: Vec<FixtureLayer>,
}

impl TestType {
    pub fn base() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TEST_TYPE_ID.fetch_add(1, Ordering::Relaxed),
            layers: Vec::new(),
        })
    }

    pub fn extend(self: &Arc<Self>, layer: FixtureLayer) -> Arc<Self> {
        let mut layers = self.layers.clone();
        layers.push(layer);
        Arc::new(Self {
            id: NEXT_TEST_TYPE_ID.fetch_add(1, Ordering::Relaxed),
            layers,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn layers(&self) -> &[FixtureLayer] {
        &self.layers
    }
}

/// Resolved dependency values passed to a fixture or test function.
#[derive(Clone, Default)]
pub struct FixtureArgs {
    values: HashMap<String, FixtureValue>,
}

impl FixtureArgs {
    pub(crate) fn new(values: HashMap<String, FixtureValue>) -> Self {
        Self { values }
    }

    /// Typed access to a requested fixture.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> anyhow::Result<Arc<T>> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Fixture \"{name}\" was not requested"))?;
        value.clone().downcast::<T>().map_err(|_| {
            anyhow::anyhow!(
                "Fixture \"{name}\" is not of type {}",
                std::any::type_name::<T>()
            )
        })
    }

    pub fn raw(&self, name: &str) -> Option<&FixtureValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Single-use handle a fixture function calls to publish its value.
///
/// `provide` resolves once the fixture is torn down; code after the await is
/// the fixture's teardown. Dropping the handle without providing fails the
/// fixture setup.
pub struct Provide {
    value_tx: oneshot::Sender<FixtureValue>,
    teardown_rx: oneshot::Receiver<()>,
}

impl Provide {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<FixtureValue>, oneshot::Sender<()>) {
        let (value_tx, value_rx) = oneshot::channel();
        let (teardown_tx, teardown_rx) = oneshot::channel();
        (
            Self {
                value_tx,
                teardown_rx,
            },
            value_rx,
            teardown_tx,
        )
    }

    pub async fn provide<T: Any + Send + Sync>(self, value: T) {
        self.provide_value(Arc::new(value)).await
    }

    pub async fn provide_value(self, value: FixtureValue) {
        if self.value_tx.send(value).is_err() {
            return;
        }
        let _ = self.teardown_rx.await;
    }
}

/// Scope context handed to fixture functions.
#[derive(Clone)]
pub enum FixtureContext {
    Worker(WorkerInfo),
    Test(TestInfo),
}

impl FixtureContext {
    pub fn test_info(&self) -> Option<&TestInfo> {
        match self {
            FixtureContext::Test(info) => Some(info),
            FixtureContext::Worker(_) => None,
        }
    }

    pub fn worker_info(&self) -> Option<&WorkerInfo> {
        match self {
            FixtureContext::Worker(info) => Some(info),
            FixtureContext::Test(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_args_typed_access() {
        let mut values: HashMap<String, FixtureValue> = HashMap::new();
        values.insert("count".to_string(), Arc::new(3u32));
        let args = FixtureArgs::new(values);
        assert_eq!(*args.get::<u32>("count").unwrap(), 3);
        assert!(args.get::<String>("count").is_err());
        assert!(args.get::<u32>("missing").is_err());
    }

    #[test]
    fn test_def_builder_sets_options() {
        let def = FixtureDef::value(1u8).worker().option().timeout(500);
        let options = def.options.unwrap();
        assert_eq!(options.scope, FixtureScope::Worker);
        assert!(options.option);
        assert_eq!(options.timeout, Some(500));
        assert!(FixtureDef::value(1u8).options.is_none());
    }

    #[test]
    fn test_extend_assigns_new_ids() {
        let base = TestType::base();
        let extended = base.extend(FixtureLayer::new().fixture("a", FixtureDef::value(1u8)));
        assert_ne!(base.id(), extended.id());
        assert_eq!(extended.layers().len(), 1);
    }

    #[tokio::test]
    async fn test_provide_waits_for_teardown() {
        let (provide, value_rx, teardown_tx) = Provide::channel();
        let task = tokio::spawn(async move { provide.provide(5i32).await });
        let value = value_rx.await.unwrap();
        assert_eq!(*value.downcast::<i32>().unwrap(), 5);
        assert!(!task.is_finished());
        teardown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
