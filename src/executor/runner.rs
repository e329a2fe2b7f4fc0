//! Test execution runner
//!
//! Plans a run from a registry (load, bind, filter, group, shard) and drives
//! the dispatcher to completion.

use indexmap::IndexSet;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{create_test_groups, filter_for_shard, Dispatcher, RunContext, TestGroup};
use crate::config::FullConfig;
use crate::error::CoreError;
use crate::fixtures::PoolBuilder;
use crate::ipc::WorkerLauncher;
use crate::models::{
    bind_file_suite_to_project, filter_tests_remove_empty_suites, TestCase, TestError,
    TestRegistry,
};
use crate::output::{Reporter, RunSummary};
use crate::utils::Stopwatch;

/// Everything needed to dispatch a run.
pub struct RunPlan {
    /// Tests of the run, in declaration order.
    pub tests: Vec<TestCase>,
    /// Groups to dispatch. Tests with load errors are not in any group.
    pub groups: Vec<TestGroup>,
    /// Errors that belong to no test.
    pub errors: Vec<TestError>,
}

/// Test runner over a registry
pub struct TestRunner {
    registry: Arc<dyn TestRegistry>,
    config: FullConfig,
    launcher: Arc<dyn WorkerLauncher>,
}

impl TestRunner {
    /// Create a runner using the registry's configuration.
    pub fn new(registry: Arc<dyn TestRegistry>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            config: registry.config(),
            registry,
            launcher,
        }
    }

    /// Replace the run configuration, e.g. after command line overrides.
    pub fn with_config(mut self, config: FullConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &FullConfig {
        &self.config
    }

    /// Load every file for every project and repeat index.
    pub fn plan(&self) -> Result<RunPlan, CoreError> {
        let mut errors = Vec::new();
        let mut tests: Vec<TestCase> = Vec::new();
        let mut seen_ids = HashSet::new();

        let mut file_suites = Vec::new();
        for file in self.registry.files() {
            match self.registry.load_file(&file) {
                Ok(suite) => {
                    let load_errors = suite.load_errors();
                    if load_errors.is_empty() {
                        file_suites.push(suite);
                    } else {
                        warn!("{} has {} declaration errors", file, load_errors.len());
                        errors.extend(load_errors);
                    }
                }
                Err(e) => errors.push(TestError::new(e.to_string())),
            }
        }

        for project in &self.config.projects {
            for repeat_each_index in 0..project.repeat_each.max(1) {
                for file_suite in &file_suites {
                    let mut suite =
                        bind_file_suite_to_project(project, file_suite, repeat_each_index);
                    if let Some(grep) = &self.config.grep {
                        filter_tests_remove_empty_suites(&mut suite, &mut |test| {
                            test.grep_title().contains(grep.as_str())
                        });
                    }
                    if !suite.has_tests() {
                        continue;
                    }
                    // Registration ids depend only on the declarations, so
                    // a worker building this file alone computes the same
                    // digests.
                    if let Err(e) = PoolBuilder::for_loader(project).build_pools(&mut suite) {
                        errors.push(e.into());
                        continue;
                    }
                    for test in suite.into_tests() {
                        if seen_ids.insert(test.id.clone()) {
                            tests.push(test);
                        } else {
                            errors.push(
                                TestError::new(format!(
                                    "Duplicate test title \"{}\"",
                                    test.full_title()
                                ))
                                .with_location(test.location.clone()),
                            );
                        }
                    }
                }
            }
        }

        let refs: Vec<&TestCase> = tests.iter().collect();
        let mut groups = create_test_groups(&refs, self.config.workers);
        if let Some(shard) = &self.config.shard {
            groups = filter_for_shard(shard, groups);
            let selected: HashSet<String> =
                groups.iter().flat_map(|g| g.tests.iter().cloned()).collect();
            tests.retain(|t| selected.contains(&t.id));
            debug!("Shard {} selected {} tests", shard, tests.len());
        }

        let failed_to_load: HashSet<&str> = tests
            .iter()
            .filter(|t| !t.load_errors.is_empty())
            .map(|t| t.id.as_str())
            .collect();
        let groups = groups
            .into_iter()
            .filter_map(|group| {
                let runnable: Vec<String> = group
                    .tests
                    .iter()
                    .filter(|id| !failed_to_load.contains(id.as_str()))
                    .cloned()
                    .collect();
                (!runnable.is_empty()).then(|| group.with_tests(runnable))
            })
            .collect();

        for (ordinal, test) in tests.iter_mut().enumerate() {
            test.ordinal = ordinal;
        }
        Ok(RunPlan {
            tests,
            groups,
            errors,
        })
    }

    /// Full titles of every test in the run, in order.
    pub fn list(&self) -> Result<Vec<String>, CoreError> {
        let plan = self.plan()?;
        Ok(plan.tests.iter().map(TestCase::full_title).collect())
    }

    /// Run every planned test and report the outcome to `reporter`.
    pub async fn run(&self, reporter: Box<dyn Reporter>) -> Result<RunSummary, CoreError> {
        let mut stopwatch = Stopwatch::new();
        let plan = self.plan()?;
        stopwatch.lap("plan");
        info!(
            "Running {} tests in {} groups using {} workers",
            plan.tests.len(),
            plan.groups.len(),
            self.config.workers
        );

        let mut run = RunContext::new(plan.tests, reporter, self.config.max_failures);
        {
            let tests: Vec<&TestCase> = run.tests.values().collect();
            run.reporter.on_begin(&self.config, &tests);
        }
        run.report_worker_errors(&plan.errors);
        let failed_to_load: IndexSet<String> = run
            .tests
            .values()
            .filter(|t| !t.load_errors.is_empty())
            .map(|t| t.id.clone())
            .collect();
        for id in &failed_to_load {
            run.report_load_failure(id);
        }

        let dispatcher = Dispatcher::new(
            self.config.clone(),
            self.launcher.clone(),
            run,
            plan.groups,
        );
        let mut run = dispatcher.run().await?;
        stopwatch.lap("dispatch");

        let tests: Vec<&TestCase> = run.tests.values().collect();
        let summary = RunSummary::from_tests(
            &tests,
            stopwatch.total_ms(),
            run.failure_tracker.has_worker_errors(),
            run.failure_tracker.has_reached_max_failures(),
        );
        run.reporter.on_end(&summary);
        debug!("Run phases: {}", stopwatch.format());
        info!(
            "Run {} in {}ms: {} expected, {} unexpected, {} flaky, {} skipped",
            summary.status,
            summary.duration_ms,
            summary.expected,
            summary.unexpected,
            summary.flaky,
            summary.skipped
        );
        Ok(summary)
    }
}
