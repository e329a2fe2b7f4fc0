//! End-to-end runs over in-process workers.

use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use testcore::config::{FullConfig, ProjectConfig, Shard};
use testcore::executor::TestRunner;
use testcore::fixtures::{FixtureDef, FixtureLayer, TestType};
use testcore::ipc::InProcessLauncher;
use testcore::models::{StaticRegistry, Suite, TestStatus};
use testcore::output::{CollectingReporter, ReportedEvent, RunStatus, RunSummary};

fn config(project: ProjectConfig) -> FullConfig {
    FullConfig::empty().with_project(project).with_workers(1)
}

fn runner(registry: StaticRegistry) -> TestRunner {
    let registry = Arc::new(registry);
    let launcher = Arc::new(InProcessLauncher::new(registry.clone()));
    TestRunner::new(registry, launcher)
}

async fn run(registry: StaticRegistry) -> (RunSummary, CollectingReporter) {
    let reporter = CollectingReporter::new();
    let summary = runner(registry)
        .run(Box::new(reporter.clone()))
        .await
        .expect("run completes");
    (summary, reporter)
}

fn ends(title: &str, statuses: &[(u32, TestStatus)]) -> Vec<(String, u32, TestStatus)> {
    statuses
        .iter()
        .map(|(retry, status)| (title.to_string(), *retry, *status))
        .collect()
}

struct Base {
    count: AtomicU32,
}

static BASE_CREATED: AtomicUsize = AtomicUsize::new(0);

fn counter_file(s: &mut Suite) {
    let test_type = TestType::base().extend(
        FixtureLayer::new()
            .fixture(
                "base",
                FixtureDef::function(&[], |_args, provide, _ctx| async move {
                    BASE_CREATED.fetch_add(1, Ordering::SeqCst);
                    provide
                        .provide(Base {
                            count: AtomicU32::new(0),
                        })
                        .await;
                    Ok(())
                })
                .worker(),
            )
            .fixture(
                "counter",
                FixtureDef::function(&["base"], |args, provide, _ctx| async move {
                    let base = args.get::<Base>("base")?;
                    let value = base.count.fetch_add(1, Ordering::SeqCst) + 1;
                    provide.provide(value).await;
                    Ok(())
                }),
            ),
    );
    s.with_test_type(test_type);
    for index in 1..=3 {
        s.test(format!("counts {index}"), &["counter"], |args, info| async move {
            let value = args.get::<u32>("counter")?;
            info.stdout(value.to_string());
            Ok(())
        });
    }
}

#[tokio::test]
async fn test_worker_fixture_is_shared_and_test_fixture_is_fresh() {
    let registry =
        StaticRegistry::new(config(ProjectConfig::new("p"))).file("counter.spec", counter_file);
    let (summary, reporter) = run(registry).await;

    let output: Vec<String> = reporter
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ReportedEvent::StdOut {
                test: Some(_),
                text,
            } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(output, vec!["1", "2", "3"]);
    assert_eq!(BASE_CREATED.load(Ordering::SeqCst), 1);
    assert_eq!(summary.status, RunStatus::Passed);
    assert_eq!(summary.expected, 3);
}

#[tokio::test]
async fn test_retries_produce_one_result_per_attempt() {
    let registry = StaticRegistry::new(config(ProjectConfig::new("p").with_retries(2))).file(
        "retry.spec",
        |s| {
            s.test("always fails", &[], |_args, _info| async {
                anyhow::bail!("still broken")
            });
        },
    );
    let (summary, reporter) = run(registry).await;

    assert_eq!(
        reporter.test_ends(),
        ends(
            "always fails",
            &[
                (0, TestStatus::Failed),
                (1, TestStatus::Failed),
                (2, TestStatus::Failed),
            ]
        )
    );
    assert_eq!(summary.unexpected, 1);
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn test_serial_failure_skips_siblings_and_retries_together() {
    let registry = StaticRegistry::new(config(ProjectConfig::new("p").with_retries(1))).file(
        "serial.spec",
        |s| {
            s.describe_serial("flow", |s| {
                s.test("first", &[], |_args, info| async move {
                    anyhow::ensure!(info.retry() > 0, "first attempt fails");
                    Ok(())
                });
                s.test("second", &[], |_args, _info| async { Ok(()) });
                s.test("third", &[], |_args, _info| async { Ok(()) });
            });
        },
    );
    let (summary, reporter) = run(registry).await;

    assert_eq!(
        reporter.test_ends(),
        vec![
            ("first".to_string(), 0, TestStatus::Failed),
            ("second".to_string(), 0, TestStatus::Skipped),
            ("third".to_string(), 0, TestStatus::Skipped),
            ("first".to_string(), 1, TestStatus::Passed),
            ("second".to_string(), 1, TestStatus::Passed),
            ("third".to_string(), 1, TestStatus::Passed),
        ]
    );
    assert_eq!(summary.flaky, 1);
    assert_eq!(summary.expected, 2);
    assert_eq!(summary.status, RunStatus::Passed);
}

static SETUP_CALLS: AtomicUsize = AtomicUsize::new(0);

#[tokio::test]
async fn test_serial_before_all_failure_is_reported_once() {
    let registry = StaticRegistry::new(config(ProjectConfig::new("p"))).file("setup.spec", |s| {
        s.describe_serial("needs setup", |s| {
            s.before_all(&[], |_args, _info| async {
                if SETUP_CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("database is down");
                }
                Ok(())
            });
            s.test("reads", &[], |_args, _info| async { Ok(()) });
            s.test("writes", &[], |_args, _info| async { Ok(()) });
            s.test("deletes", &[], |_args, _info| async { Ok(()) });
        });
    });
    let (_summary, reporter) = run(registry).await;

    let ends: Vec<(String, TestStatus, Vec<String>)> = reporter
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ReportedEvent::TestEnd {
                title,
                status,
                errors,
                ..
            } => Some((
                title,
                status,
                errors.into_iter().map(|e| e.message).collect(),
            )),
            _ => None,
        })
        .collect();
    assert_eq!(ends.len(), 3);
    assert_eq!(ends[0].0, "reads");
    assert_eq!(ends[0].1, TestStatus::Failed);
    assert_eq!(ends[0].2, vec!["database is down".to_string()]);
    for (title, status, errors) in &ends[1..] {
        assert_eq!(*status, TestStatus::Skipped, "{title}");
        assert!(errors.is_empty(), "{title}");
    }
    assert_eq!(SETUP_CALLS.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_max_failures_interrupts_the_rest() {
    let registry = StaticRegistry::new(config(ProjectConfig::new("p")).with_max_failures(1))
        .file("a.spec", |s| {
            s.test("breaks", &[], |_args, _info| async { anyhow::bail!("boom") });
            s.test("after", &[], |_args, _info| async { Ok(()) });
        })
        .file("b.spec", |s| {
            s.test("other file", &[], |_args, _info| async { Ok(()) });
        });
    let (summary, reporter) = run(registry).await;

    let test_ends = reporter.test_ends();
    assert_eq!(test_ends.len(), 3);
    assert_eq!(test_ends[0], ("breaks".to_string(), 0, TestStatus::Failed));
    for (title, _, status) in &test_ends[1..] {
        assert!(
            matches!(status, TestStatus::Skipped | TestStatus::Interrupted),
            "{title} reported {status}"
        );
    }
    assert!(reporter
        .errors()
        .iter()
        .any(|e| e.message == "Testing stopped early after 1 maximum allowed failures."));
    assert!(summary.max_failures_reached);
    assert_eq!(summary.exit_code(), 1);
}

fn many_files(registry: StaticRegistry) -> StaticRegistry {
    registry
        .file("one.spec", |s| {
            s.test("a", &[], |_args, _info| async { Ok(()) });
            s.test("b", &[], |_args, _info| async { Ok(()) });
        })
        .file("two.spec", |s| {
            s.describe_parallel("parallel", |s| {
                for index in 0..5 {
                    s.test(format!("p{index}"), &[], |_args, _info| async { Ok(()) });
                }
            });
        })
        .file("three.spec", |s| {
            s.test("c", &[], |_args, _info| async { Ok(()) });
        })
}

#[test]
fn test_shards_cover_every_group_exactly_once() {
    let base = FullConfig::empty()
        .with_project(ProjectConfig::new("p"))
        .with_workers(3);
    let registry = many_files(StaticRegistry::new(base.clone()));
    let all: Vec<Vec<String>> = runner(registry.clone())
        .plan()
        .unwrap()
        .groups
        .into_iter()
        .map(|g| g.tests)
        .collect();

    for total in 1..=5 {
        let mut seen = Vec::new();
        for current in 1..=total {
            let config = base.clone().with_shard(Shard { current, total });
            let plan = runner(registry.clone()).with_config(config).plan().unwrap();
            seen.extend(plan.groups.into_iter().map(|g| g.tests));
        }
        let unique: HashSet<&Vec<String>> = seen.iter().collect();
        assert_eq!(unique.len(), seen.len(), "duplicate group with {total} shards");
        let mut seen_sorted = seen.clone();
        seen_sorted.sort();
        let mut all_sorted = all.clone();
        all_sorted.sort();
        assert_eq!(seen_sorted, all_sorted, "{total} shards");
    }
}

fn digest_test_type() -> Arc<TestType> {
    TestType::base().extend(
        FixtureLayer::new()
            .fixture("db", FixtureDef::value(1u32).worker())
            .fixture("page", FixtureDef::value("home".to_string())),
    )
}

fn digest_file(s: &mut Suite) {
    s.with_test_type(digest_test_type());
    s.test("plain", &["db", "page"], |_args, _info| async { Ok(()) });
    s.describe("other page", |s| {
        s.use_fixtures(FixtureLayer::new().fixture("page", FixtureDef::value("cart".to_string())));
        s.test("test override", &["db", "page"], |_args, _info| async { Ok(()) });
    });
}

// Worker fixtures can only be overridden at the top of a file.
fn worker_override_file(s: &mut Suite) {
    s.with_test_type(digest_test_type());
    s.use_fixtures(FixtureLayer::new().fixture("db", FixtureDef::value(2u32)));
    s.test("worker override", &["db", "page"], |_args, _info| async { Ok(()) });
}

#[test]
fn test_worker_hash_follows_worker_fixtures_only() {
    let registry = StaticRegistry::new(config(ProjectConfig::new("p")))
        .file("digest.spec", digest_file)
        .file("worker.spec", worker_override_file);
    let hashes = |registry: &StaticRegistry| -> Vec<String> {
        tokio_test::assert_ok!(runner(registry.clone()).plan())
            .tests
            .into_iter()
            .map(|t| {
                assert!(t.load_errors.is_empty(), "{:?}", t.load_errors);
                t.worker_hash
            })
            .collect()
    };

    let first = hashes(&registry);
    assert_eq!(first, hashes(&registry));
    assert_eq!(first[0], first[1]);
    assert_ne!(first[0], first[2]);
}

fn db_file(s: &mut Suite) {
    s.with_test_type(TestType::base().extend(FixtureLayer::new().fixture(
        "db",
        FixtureDef::value("db-from-a".to_string()).worker(),
    )));
    s.test("a uses db", &["db"], |args, info| async move {
        info.stdout(args.get::<String>("db")?.as_ref().clone());
        Ok(())
    });
}

fn cache_file(s: &mut Suite) {
    s.with_test_type(TestType::base().extend(FixtureLayer::new().fixture(
        "cache",
        FixtureDef::value("cache-from-b".to_string()).worker(),
    )));
    s.test("b uses cache", &["cache"], |args, info| async move {
        info.stdout(args.get::<String>("cache")?.as_ref().clone());
        Ok(())
    });
}

fn stdout_by_test(reporter: &CollectingReporter) -> Vec<(String, String)> {
    reporter
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ReportedEvent::StdOut {
                test: Some(test),
                text,
            } => Some((test, text)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_different_worker_fixtures_in_different_files_get_different_hashes() {
    let registry = StaticRegistry::new(config(ProjectConfig::new("p")))
        .file("a.spec", db_file)
        .file("b.spec", cache_file);
    let plan = tokio_test::assert_ok!(runner(registry).plan());
    assert_eq!(plan.tests.len(), 2);
    assert_ne!(plan.tests[0].pool_digest, plan.tests[1].pool_digest);
    assert_ne!(plan.tests[0].worker_hash, plan.tests[1].worker_hash);
    assert_eq!(plan.groups.len(), 2);
}

#[tokio::test]
async fn test_one_worker_slot_keeps_worker_fixtures_of_files_apart() {
    let registry = StaticRegistry::new(config(ProjectConfig::new("p")))
        .file("a.spec", db_file)
        .file("b.spec", cache_file);
    let (summary, reporter) = run(registry).await;

    let mut seen = stdout_by_test(&reporter);
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("a uses db".to_string(), "db-from-a".to_string()),
            ("b uses cache".to_string(), "cache-from-b".to_string()),
        ]
    );
    assert_eq!(summary.expected, 2);
}

static SHARED_CREATED: AtomicUsize = AtomicUsize::new(0);

fn shared_test_type() -> Arc<TestType> {
    TestType::base().extend(FixtureLayer::new().fixture(
        "pool",
        FixtureDef::function(&[], |_args, provide, _ctx| async move {
            SHARED_CREATED.fetch_add(1, Ordering::SeqCst);
            provide.provide("shared".to_string()).await;
            Ok(())
        })
        .worker(),
    ))
}

#[tokio::test]
async fn test_files_with_the_same_worker_fixtures_share_a_worker() {
    let registry = StaticRegistry::new(config(ProjectConfig::new("p")))
        .file("first.spec", |s| {
            s.with_test_type(shared_test_type());
            s.test("first", &["pool"], |_args, _info| async { Ok(()) });
        })
        .file("second.spec", |s| {
            s.with_test_type(shared_test_type());
            s.test("second", &["pool"], |_args, _info| async { Ok(()) });
        });
    let plan = tokio_test::assert_ok!(runner(registry.clone()).plan());
    assert_eq!(plan.tests[0].worker_hash, plan.tests[1].worker_hash);

    let (summary, _reporter) = run(registry).await;
    assert_eq!(summary.expected, 2);
    assert_eq!(SHARED_CREATED.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fixture_cycle_fails_test_without_running_it() {
    static RAN: AtomicBool = AtomicBool::new(false);
    let registry = StaticRegistry::new(config(ProjectConfig::new("p"))).file("cycle.spec", |s| {
        let test_type = TestType::base().extend(
            FixtureLayer::new()
                .fixture(
                    "a",
                    FixtureDef::function(&["b"], |_args, provide, _ctx| async move {
                        provide.provide(()).await;
                        Ok(())
                    }),
                )
                .fixture(
                    "b",
                    FixtureDef::function(&["a"], |_args, provide, _ctx| async move {
                        provide.provide(()).await;
                        Ok(())
                    }),
                ),
        );
        s.with_test_type(test_type);
        s.test("uses a", &["a"], |_args, _info| async {
            RAN.store(true, Ordering::SeqCst);
            Ok(())
        });
    });
    let (summary, reporter) = run(registry).await;

    let errors: Vec<String> = reporter
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ReportedEvent::TestEnd { errors, .. } => Some(errors),
            _ => None,
        })
        .flatten()
        .map(|e| e.message)
        .collect();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("cycle"), "{}", errors[0]);
    assert!(!RAN.load(Ordering::SeqCst));
    assert_eq!(summary.unexpected, 1);
}

#[tokio::test]
async fn test_parallel_tests_spread_over_workers() {
    let registry = many_files(StaticRegistry::new(
        FullConfig::empty()
            .with_project(ProjectConfig::new("p"))
            .with_workers(3),
    ));
    let (summary, reporter) = run(registry).await;
    assert_eq!(summary.total, 8);
    assert_eq!(summary.expected, 8);
    assert_eq!(reporter.test_ends().len(), 8);
}
