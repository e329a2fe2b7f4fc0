//! Builds the fixture pool of every test in a bound suite.

use std::collections::HashMap;
use std::sync::Arc;

use super::pool::{FixturePool, LoadError, OptionOverrides, RegistrationIds};
use super::TestType;
use crate::config::ProjectConfig;
use crate::models::{worker_hash, Suite, SuiteEntry, SuiteType, TestCase};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolBuilderKind {
    /// Host side: records digests, worker hashes and load errors on tests.
    Loader,
    /// Worker side: attaches pools to tests and fails on the first error.
    Worker,
}

pub struct PoolBuilder {
    kind: PoolBuilderKind,
    option_overrides: Option<OptionOverrides>,
    ids: RegistrationIds,
    test_type_pools: HashMap<u64, (Arc<FixturePool>, Vec<LoadError>)>,
}

impl PoolBuilder {
    pub fn new(kind: PoolBuilderKind, project: &ProjectConfig) -> Self {
        Self {
            kind,
            option_overrides: project.option_overrides(),
            ids: RegistrationIds::new(),
            test_type_pools: HashMap::new(),
        }
    }

    pub fn for_loader(project: &ProjectConfig) -> Self {
        Self::new(PoolBuilderKind::Loader, project)
    }

    pub fn for_worker(project: &ProjectConfig) -> Self {
        Self::new(PoolBuilderKind::Worker, project)
    }

    /// Build pools for every test of `suite`, which must already be bound
    /// to a project.
    pub fn build_pools(&mut self, suite: &mut Suite) -> Result<(), LoadError> {
        let mut built = Vec::new();
        let mut parents = Vec::new();
        self.visit(suite, &mut parents, &mut built);

        if self.kind == PoolBuilderKind::Worker {
            if let Some(error) = built.iter().flat_map(|(_, errors)| errors).next() {
                return Err(error.clone());
            }
        }

        let kind = self.kind;
        let mut built = built.into_iter();
        suite.for_each_test_mut(&mut |test| {
            let Some((pool, errors)) = built.next() else {
                return;
            };
            test.pool_digest = pool.digest().to_string();
            match kind {
                PoolBuilderKind::Loader => {
                    test.worker_hash =
                        worker_hash(&test.project_id, &test.pool_digest, test.repeat_each_index);
                    test.load_errors = errors.into_iter().map(Into::into).collect();
                }
                PoolBuilderKind::Worker => test.pool = Some(pool),
            }
        });
        Ok(())
    }

    fn visit<'a>(
        &mut self,
        suite: &'a Suite,
        parents: &mut Vec<&'a Suite>,
        built: &mut Vec<(Arc<FixturePool>, Vec<LoadError>)>,
    ) {
        parents.push(suite);
        for entry in &suite.entries {
            match entry {
                SuiteEntry::Suite(child) => self.visit(child, parents, built),
                SuiteEntry::Test(test) => built.push(self.build_pool_for_test(test, parents)),
            }
        }
        parents.pop();
    }

    fn build_pool_for_test(
        &mut self,
        test: &TestCase,
        parents: &[&Suite],
    ) -> (Arc<FixturePool>, Vec<LoadError>) {
        let (mut pool, mut errors) = self.build_test_type_pool(&test.test_type);

        for parent in parents {
            if !parent.fixture_overrides.is_empty() {
                let mut sink = |e: LoadError| errors.push(e);
                // A sink is always supplied, so construction cannot fail.
                if let Ok(next) = FixturePool::new(
                    &parent.fixture_overrides,
                    &mut self.ids,
                    Some(&mut sink),
                    Some(pool.as_ref()),
                    parent.kind == SuiteType::Describe,
                    None,
                ) {
                    pool = Arc::new(next);
                }
            }
            for hook in &parent.hooks {
                pool.validate_function(
                    &hook.deps,
                    &format!("{} hook", hook.kind.as_str()),
                    &hook.location,
                    &mut errors,
                );
            }
            for modifier in &parent.modifiers {
                pool.validate_function(
                    &modifier.deps,
                    &format!("{} modifier", modifier.kind.as_str()),
                    &modifier.location,
                    &mut errors,
                );
            }
        }
        pool.validate_function(&test.deps, "Test", &test.location, &mut errors);
        (pool, errors)
    }

    fn build_test_type_pool(&mut self, test_type: &TestType) -> (Arc<FixturePool>, Vec<LoadError>) {
        if let Some((pool, errors)) = self.test_type_pools.get(&test_type.id()) {
            return (pool.clone(), errors.clone());
        }
        let mut errors = Vec::new();
        let mut sink = |e: LoadError| errors.push(e);
        let pool = FixturePool::new(
            test_type.layers(),
            &mut self.ids,
            Some(&mut sink),
            None,
            false,
            self.option_overrides.as_ref(),
        )
        .map(Arc::new)
        .unwrap_or_else(|_| Arc::new(FixturePool::empty()));
        self.test_type_pools
            .insert(test_type.id(), (pool.clone(), errors.clone()));
        (pool, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{FixtureDef, FixtureLayer};
    use crate::models::bind_file_suite_to_project;

    #[track_caller]
    fn worker_fixture() -> FixtureDef {
        FixtureDef::function(&[], |_args, provide, _ctx| async move {
            provide.provide(1u32).await;
            Ok(())
        })
        .worker()
    }

    fn suite() -> Suite {
        let test_type = TestType::base().extend(
            FixtureLayer::new()
                .fixture("db", worker_fixture())
                .fixture("page", FixtureDef::value(2u32)),
        );
        let mut suite = Suite::file("a.spec");
        suite.with_test_type(test_type);
        suite.test("uses db", &["db"], |_args, _info| async { Ok(()) });
        suite.test("unknown", &["nope"], |_args, _info| async { Ok(()) });
        suite.describe("overrides", |s| {
            s.use_fixtures(FixtureLayer::new().fixture("page", FixtureDef::value(3u32)));
            s.test("uses page", &["page"], |_args, _info| async { Ok(()) });
        });
        suite
    }

    #[test]
    fn test_loader_records_hash_and_errors() {
        let project = ProjectConfig::new("p");
        let mut bound = bind_file_suite_to_project(&project, &suite(), 0);
        PoolBuilder::for_loader(&project).build_pools(&mut bound).unwrap();
        let tests = bound.all_tests();
        assert!(tests[0].load_errors.is_empty());
        assert_eq!(
            tests[1].load_errors[0].message,
            "Test has unknown parameter \"nope\"."
        );
        // Test-scoped overrides do not change the worker hash.
        assert_eq!(tests[0].worker_hash, tests[2].worker_hash);
        assert!(tests[0].worker_hash.starts_with("p-"));
        assert!(tests[0].pool.is_none());
    }

    #[test]
    fn test_worker_fails_on_first_error() {
        let project = ProjectConfig::new("p");
        let mut bound = bind_file_suite_to_project(&project, &suite(), 0);
        let result = PoolBuilder::for_worker(&project).build_pools(&mut bound);
        assert!(result.is_err());

        let mut bound = bind_file_suite_to_project(&project, &suite(), 0);
        crate::models::filter_tests_remove_empty_suites(&mut bound, &mut |t| t.title != "unknown");
        PoolBuilder::for_worker(&project).build_pools(&mut bound).unwrap();
        assert!(bound.all_tests().iter().all(|t| t.pool.is_some()));
    }
}
