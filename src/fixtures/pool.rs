//! Fixture pool: the registration map visible to a test, with validation
//! and the worker-compatibility digest.

use indexmap::IndexMap;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use super::{FixtureAuto, FixtureBody, FixtureLayer, FixtureScope, FixtureValue};
use crate::error::CoreError;
use crate::models::{Location, TestError};

/// One registered implementation of a fixture name.
#[derive(Debug)]
pub struct FixtureRegistration {
    pub location: Location,
    pub name: String,
    pub scope: FixtureScope,
    pub body: FixtureBody,
    pub auto: FixtureAuto,
    pub option: bool,
    pub custom_title: Option<String>,
    pub timeout: Option<u64>,
    pub deps: Vec<String>,
    pub id: String,
    /// The registration this one overrides.
    pub parent: Option<Arc<FixtureRegistration>>,
    pub option_override: bool,
    pub boxed: bool,
    site: Location,
}

impl FixtureRegistration {
    pub fn title(&self) -> &str {
        self.custom_title.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadError {
    pub message: String,
    pub location: Location,
}

impl From<LoadError> for TestError {
    fn from(e: LoadError) -> Self {
        TestError::new(e.message).with_location(e.location)
    }
}

impl From<LoadError> for CoreError {
    fn from(e: LoadError) -> Self {
        CoreError::Load {
            message: e.message,
            location: e.location,
        }
    }
}

/// Values from the configuration that replace option fixtures.
#[derive(Clone, Debug)]
pub struct OptionOverrides {
    pub overrides: HashMap<String, FixtureValue>,
    pub location: Location,
}

/// Stable registration ids: a registration of the same name, over the same
/// overridden registration, declared at the same site, gets the same id.
///
/// Ids are derived from that content alone, so every builder on the host and
/// in any worker agrees on them regardless of which files it has seen.
#[derive(Debug, Default)]
pub struct RegistrationIds {
    ids: HashMap<(String, String, Location), String>,
}

impl RegistrationIds {
    pub fn new() -> Self {
        Self::default()
    }

    fn id_for(&mut self, name: &str, parent: Option<&FixtureRegistration>, site: &Location) -> String {
        let parent_id = parent.map(|p| p.id.clone()).unwrap_or_default();
        let key = (name.to_string(), parent_id, site.clone());
        self.ids
            .entry(key)
            .or_insert_with_key(|(name, parent_id, site)| {
                let mut id = sha1_hex(&format!("{name}\x1e{parent_id}\x1e{site}"));
                id.truncate(20);
                id
            })
            .clone()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Marker {
    Visiting,
    Visited,
}

/// Name to registration map seen by a test, layered over a parent pool.
#[derive(Debug, Clone)]
pub struct FixturePool {
    digest: String,
    registrations: IndexMap<String, Arc<FixtureRegistration>>,
}

impl FixturePool {
    /// Build a pool from `layers` on top of `parent`.
    ///
    /// With an error sink every problem is reported there and a best-effort
    /// pool is returned. Without one the first problem is returned as `Err`.
    pub fn new(
        layers: &[FixtureLayer],
        ids: &mut RegistrationIds,
        sink: Option<&mut dyn FnMut(LoadError)>,
        parent: Option<&FixturePool>,
        disallow_worker_fixtures: bool,
        option_overrides: Option<&OptionOverrides>,
    ) -> Result<Self, LoadError> {
        let mut errors = Vec::new();
        let mut registrations = parent
            .map(|p| p.registrations.clone())
            .unwrap_or_default();

        for layer in layers {
            append_layer(
                &mut registrations,
                layer,
                ids,
                &mut errors,
                disallow_worker_fixtures,
                false,
            );

            if let Some(overrides) = option_overrides {
                let mut selected = FixtureLayer::at(overrides.location.clone());
                for (name, def) in &layer.fixtures {
                    let is_option = def.options.as_ref().map(|o| o.option).unwrap_or(false);
                    if !is_option {
                        continue;
                    }
                    if let Some(value) = overrides.overrides.get(name) {
                        let mut replaced = def.clone();
                        replaced.body = FixtureBody::Value(value.clone());
                        replaced.deps = Vec::new();
                        replaced.site = overrides.location.clone();
                        selected.fixtures.push((name.clone(), replaced));
                    }
                }
                if !selected.fixtures.is_empty() {
                    append_layer(
                        &mut registrations,
                        &selected,
                        ids,
                        &mut errors,
                        disallow_worker_fixtures,
                        true,
                    );
                }
            }
        }

        let mut pool = Self {
            digest: String::new(),
            registrations,
        };
        pool.digest = pool.validate(&mut errors);

        match sink {
            Some(sink) => {
                for error in errors {
                    sink(error);
                }
                Ok(pool)
            }
            None => match errors.into_iter().next() {
                Some(error) => Err(error),
                None => Ok(pool),
            },
        }
    }

    pub fn empty() -> Self {
        let mut pool = Self {
            digest: String::new(),
            registrations: IndexMap::new(),
        };
        pool.digest = pool.validate(&mut Vec::new());
        pool
    }

    /// Detect unknown dependencies, scope violations and cycles, then hash
    /// the worker-scoped registration ids.
    fn validate(&self, errors: &mut Vec<LoadError>) -> String {
        let mut markers: HashMap<String, Marker> = HashMap::new();
        let mut stack: Vec<Arc<FixtureRegistration>> = Vec::new();
        let mut has_dependency_errors = false;

        let mut names: Vec<&String> = self.registrations.keys().collect();
        names.sort();

        for name in &names {
            let registration = &self.registrations[name.as_str()];
            if !registration.boxed {
                self.visit(
                    registration,
                    true,
                    &mut markers,
                    &mut stack,
                    errors,
                    &mut has_dependency_errors,
                );
            }
        }
        if !has_dependency_errors {
            for name in &names {
                let registration = &self.registrations[name.as_str()];
                if registration.boxed {
                    self.visit(
                        registration,
                        false,
                        &mut markers,
                        &mut stack,
                        errors,
                        &mut has_dependency_errors,
                    );
                }
            }
        }

        let mut hasher = Sha1::new();
        for name in &names {
            let registration = &self.registrations[name.as_str()];
            if registration.scope == FixtureScope::Worker {
                hasher.update(format!("{};", registration.id).as_bytes());
            }
        }
        hex(&hasher.finalize())
    }

    fn visit(
        &self,
        registration: &Arc<FixtureRegistration>,
        boxed_only: bool,
        markers: &mut HashMap<String, Marker>,
        stack: &mut Vec<Arc<FixtureRegistration>>,
        errors: &mut Vec<LoadError>,
        has_dependency_errors: &mut bool,
    ) {
        markers.insert(registration.id.clone(), Marker::Visiting);
        stack.push(registration.clone());
        for name in &registration.deps {
            let Some(dep) = self.resolve(name, Some(registration)) else {
                *has_dependency_errors = true;
                let message = if *name == registration.name {
                    format!(
                        "Fixture \"{}\" references itself, but does not have a base implementation.",
                        registration.name
                    )
                } else {
                    format!(
                        "Fixture \"{}\" has unknown parameter \"{}\".",
                        registration.name, name
                    )
                };
                errors.push(LoadError {
                    message,
                    location: registration.location.clone(),
                });
                continue;
            };
            if registration.scope.order() > dep.scope.order() {
                *has_dependency_errors = true;
                errors.push(LoadError {
                    message: format!(
                        "{} fixture \"{}\" cannot depend on a {} fixture \"{}\" defined in {}.",
                        registration.scope, registration.name, dep.scope, name, dep.location
                    ),
                    location: registration.location.clone(),
                });
                continue;
            }
            match markers.get(&dep.id) {
                None => self.visit(&dep, boxed_only, markers, stack, errors, has_dependency_errors),
                Some(Marker::Visiting) => {
                    *has_dependency_errors = true;
                    let index = stack.iter().position(|r| r.id == dep.id).unwrap_or(0);
                    let regs: Vec<&Arc<FixtureRegistration>> = stack[index..]
                        .iter()
                        .filter(|r| !boxed_only || !r.boxed)
                        .collect();
                    let names: Vec<String> = regs.iter().map(|r| format!("\"{}\"", r.name)).collect();
                    let locations: Vec<String> = regs.iter().map(|r| r.location.to_string()).collect();
                    errors.push(LoadError {
                        message: format!(
                            "Fixtures {} -> \"{}\" form a dependency cycle: {} -> {}",
                            names.join(" -> "),
                            dep.name,
                            locations.join(" -> "),
                            dep.location
                        ),
                        location: dep.location.clone(),
                    });
                    continue;
                }
                Some(Marker::Visited) => {}
            }
        }
        markers.insert(registration.id.clone(), Marker::Visited);
        stack.pop();
    }

    /// Report every name in `fixtures` that this pool does not know.
    pub fn validate_function(
        &self,
        fixtures: &[String],
        prefix: &str,
        location: &Location,
        errors: &mut Vec<LoadError>,
    ) {
        for name in fixtures {
            if !self.registrations.contains_key(name) {
                errors.push(LoadError {
                    message: format!("{prefix} has unknown parameter \"{name}\"."),
                    location: location.clone(),
                });
            }
        }
    }

    /// A fixture naming itself as a dependency resolves to the registration
    /// it overrides.
    pub fn resolve(
        &self,
        name: &str,
        for_fixture: Option<&FixtureRegistration>,
    ) -> Option<Arc<FixtureRegistration>> {
        if let Some(registration) = for_fixture {
            if registration.name == name {
                return registration.parent.clone();
            }
        }
        self.registrations.get(name).cloned()
    }

    pub fn auto_fixtures(&self) -> Vec<Arc<FixtureRegistration>> {
        self.registrations
            .values()
            .filter(|r| r.auto != FixtureAuto::Off)
            .cloned()
            .collect()
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

fn append_layer(
    registrations: &mut IndexMap<String, Arc<FixtureRegistration>>,
    layer: &FixtureLayer,
    ids: &mut RegistrationIds,
    errors: &mut Vec<LoadError>,
    disallow_worker_fixtures: bool,
    is_options_override: bool,
) {
    for (name, def) in &layer.fixtures {
        let previous = registrations.get(name).cloned();
        let location = layer.location.clone();

        let (auto, scope, option, timeout, custom_title, boxed) = match (&previous, &def.options) {
            (Some(previous), Some(options)) => {
                if previous.scope != options.scope {
                    errors.push(LoadError {
                        message: format!(
                            "Fixture \"{}\" has already been registered as a {{ scope: '{}' }} fixture defined in {}.",
                            name, previous.scope, previous.location
                        ),
                        location,
                    });
                    continue;
                }
                if previous.auto != options.auto {
                    errors.push(LoadError {
                        message: format!(
                            "Fixture \"{}\" has already been registered as a {{ auto: '{}' }} fixture defined in {}.",
                            name,
                            auto_label(previous.auto),
                            previous.location
                        ),
                        location,
                    });
                    continue;
                }
                (
                    options.auto,
                    options.scope,
                    options.option,
                    options.timeout,
                    options.title.clone(),
                    options.boxed,
                )
            }
            (Some(previous), None) => (
                previous.auto,
                previous.scope,
                previous.option,
                previous.timeout,
                previous.custom_title.clone(),
                previous.boxed,
            ),
            (None, Some(options)) => (
                options.auto,
                options.scope,
                options.option,
                options.timeout,
                options.title.clone(),
                options.boxed,
            ),
            (None, None) => (FixtureAuto::Off, FixtureScope::Test, false, None, None, false),
        };

        if scope == FixtureScope::Worker && disallow_worker_fixtures {
            errors.push(LoadError {
                message: format!(
                    "Cannot use({{ {name} }}) in a describe group, because it forces a new worker.\nMake it top-level in the test file or put in the configuration file."
                ),
                location,
            });
            continue;
        }

        let mut body = def.body.clone();
        let mut deps = def.deps.clone();
        let mut site = def.site.clone();
        if matches!(body, FixtureBody::Undefined) && option {
            if let Some(previous) = &previous {
                let mut original = previous.clone();
                while !original.option_override {
                    match original.parent.clone() {
                        Some(parent) => original = parent,
                        None => break,
                    }
                }
                body = original.body.clone();
                deps = original.deps.clone();
                site = original.site.clone();
            }
        }
        if !body.is_function() {
            deps.clear();
        }

        let id = ids.id_for(name, previous.as_deref(), &site);
        let registration = FixtureRegistration {
            location,
            name: name.clone(),
            scope,
            body,
            auto,
            option,
            custom_title,
            timeout,
            deps,
            id,
            parent: previous,
            option_override: is_options_override,
            boxed,
            site,
        };
        registrations.insert(name.clone(), Arc::new(registration));
    }
}

fn auto_label(auto: FixtureAuto) -> &'static str {
    match auto {
        FixtureAuto::Off => "false",
        FixtureAuto::On => "true",
        FixtureAuto::AllHooksIncluded => "all-hooks-included",
    }
}

/// Lowercase hex encoding of a hash.
pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// SHA-1 of `text` as lowercase hex.
pub(crate) fn sha1_hex(text: &str) -> String {
    hex(&Sha1::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::FixtureDef;
    use pretty_assertions::assert_eq;

    #[track_caller]
    fn noop(deps: &[&str]) -> FixtureDef {
        FixtureDef::function(deps, |_args, provide, _ctx| async move {
            provide.provide(()).await;
            Ok(())
        })
    }

    fn collect(layers: &[FixtureLayer], ids: &mut RegistrationIds) -> (FixturePool, Vec<LoadError>) {
        let mut errors = Vec::new();
        let mut sink = |e: LoadError| errors.push(e);
        let pool = FixturePool::new(layers, ids, Some(&mut sink), None, false, None).unwrap();
        (pool, errors)
    }

    #[test]
    fn test_cycle_reported_once() {
        let layer = FixtureLayer::new()
            .fixture("a", noop(&["b"]))
            .fixture("b", noop(&["a"]));
        let (_, errors) = collect(&[layer], &mut RegistrationIds::new());
        assert_eq!(errors.len(), 1);
        assert!(errors[0]
            .message
            .starts_with("Fixtures \"a\" -> \"b\" -> \"a\" form a dependency cycle"));
    }

    #[test]
    fn test_unknown_and_self_reference() {
        let layer = FixtureLayer::new()
            .fixture("a", noop(&["missing"]))
            .fixture("b", noop(&["b"]));
        let (_, errors) = collect(&[layer], &mut RegistrationIds::new());
        let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Fixture \"a\" has unknown parameter \"missing\".",
                "Fixture \"b\" references itself, but does not have a base implementation.",
            ]
        );
    }

    #[test]
    fn test_self_reference_resolves_to_parent() {
        let base = FixtureLayer::new().fixture("a", FixtureDef::value(1u32));
        let over = FixtureLayer::new().fixture("a", noop(&["a"]));
        let (pool, errors) = collect(&[base, over], &mut RegistrationIds::new());
        assert!(errors.is_empty());
        let top = pool.resolve("a", None).unwrap();
        let parent = pool.resolve("a", Some(&top)).unwrap();
        assert!(parent.parent.is_none());
    }

    #[test]
    fn test_worker_cannot_depend_on_test_fixture() {
        let layer = FixtureLayer::new()
            .fixture("page", noop(&[]))
            .fixture("browser", noop(&["page"]).worker());
        let (_, errors) = collect(&[layer], &mut RegistrationIds::new());
        assert_eq!(errors.len(), 1);
        assert!(errors[0]
            .message
            .starts_with("worker fixture \"browser\" cannot depend on a test fixture \"page\""));
    }

    #[test]
    fn test_scope_mismatch_rejected() {
        let base = FixtureLayer::new().fixture("db", noop(&[]).worker());
        let over = FixtureLayer::new().fixture("db", noop(&[]).scope(FixtureScope::Test));
        let (_, errors) = collect(&[base, over], &mut RegistrationIds::new());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("has already been registered as a { scope: 'worker' }"));
    }

    #[test]
    fn test_worker_fixture_in_describe_rejected() {
        let layer = FixtureLayer::new().fixture("db", noop(&[]).worker());
        let mut errors = Vec::new();
        let mut sink = |e: LoadError| errors.push(e);
        FixturePool::new(&[layer], &mut RegistrationIds::new(), Some(&mut sink), None, true, None)
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.starts_with("Cannot use({ db }) in a describe group"));
    }

    #[test]
    fn test_no_sink_returns_first_error() {
        let layer = FixtureLayer::new().fixture("a", noop(&["nope"]));
        let result = FixturePool::new(&[layer], &mut RegistrationIds::new(), None, None, false, None);
        assert!(result.is_err());
    }

    #[test]
    fn test_digest_depends_only_on_worker_fixtures() {
        let worker = noop(&[]).worker();
        let mut ids = RegistrationIds::new();
        let first = FixtureLayer::new()
            .fixture("db", worker.clone())
            .fixture("page", FixtureDef::value(1u8));
        let second = FixtureLayer::new()
            .fixture("db", worker)
            .fixture("page", FixtureDef::value(2u8));
        let (a, _) = collect(&[first], &mut ids);
        let (b, _) = collect(&[second], &mut ids);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 40);

        let other = FixtureLayer::new().fixture("db", noop(&[]).worker());
        let (c, _) = collect(&[other], &mut ids);
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_option_override_and_reset() {
        let declared = FixtureLayer::new().fixture("locale", FixtureDef::value("en").option());
        let overrides = OptionOverrides {
            overrides: HashMap::from([("locale".to_string(), Arc::new("fr") as FixtureValue)]),
            location: Location::new("config", 0, 0),
        };
        let user = FixtureLayer::new().fixture("locale", FixtureDef::value("de"));
        let reset = FixtureLayer::new().fixture("locale", FixtureDef::undefined());
        let mut ids = RegistrationIds::new();
        let pool = FixturePool::new(
            &[declared, user, reset],
            &mut ids,
            None,
            None,
            false,
            Some(&overrides),
        )
        .unwrap();
        let registration = pool.resolve("locale", None).unwrap();
        let FixtureBody::Value(value) = &registration.body else {
            panic!("expected value body");
        };
        assert_eq!(*value.clone().downcast::<&'static str>().unwrap(), "fr");
    }

    #[test]
    fn test_registration_ids_are_independent_of_builder() {
        let site = Location::new("a.spec", 3, 9);
        let mut first = RegistrationIds::new();
        first.id_for("warmup", None, &Location::new("other.spec", 1, 1));
        let mut second = RegistrationIds::new();
        assert_eq!(first.id_for("db", None, &site), second.id_for("db", None, &site));
        assert_eq!(first.id_for("db", None, &site).len(), 20);
        assert_ne!(first.id_for("db", None, &site), second.id_for("cache", None, &site));
        assert_ne!(
            first.id_for("db", None, &site),
            second.id_for("db", None, &Location::new("b.spec", 3, 9))
        );
    }

    #[test]
    fn test_digest_differs_for_fresh_builders_with_different_worker_fixtures() {
        let db = FixtureLayer::new().fixture("db", noop(&[]).worker());
        let cache = FixtureLayer::new().fixture("cache", noop(&[]).worker());
        let (a, _) = collect(&[db], &mut RegistrationIds::new());
        let (b, _) = collect(&[cache], &mut RegistrationIds::new());
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_sha1_hex() {
        assert_eq!(sha1_hex("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
