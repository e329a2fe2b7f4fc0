//! Built-in demo registry
//!
//! A small storefront suite exercising worker and test fixtures, a project
//! option, serial and parallel suites, retries and an expected failure.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use testcore::config::{FullConfig, ProjectConfig};
use testcore::fixtures::{FixtureDef, FixtureLayer, TestType};
use testcore::models::{StaticRegistry, Suite};

/// Worker-scoped fake backend shared by the tests of one worker.
pub struct Backend {
    pub browser: String,
    requests: AtomicU32,
}

impl Backend {
    fn request(&self) -> u32 {
        self.requests.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Test-scoped session on the backend.
pub struct Session {
    pub id: u32,
    pub browser: String,
}

fn test_type() -> Arc<TestType> {
    TestType::base().extend(
        FixtureLayer::new()
            .fixture("browser_name", FixtureDef::value("chromium".to_string()).worker().option())
            .fixture(
                "backend",
                FixtureDef::function(&["browser_name"], |args, provide, _ctx| async move {
                    let browser = args.get::<String>("browser_name")?;
                    provide
                        .provide(Backend {
                            browser: browser.as_ref().clone(),
                            requests: AtomicU32::new(0),
                        })
                        .await;
                    Ok(())
                })
                .worker()
                .title("fake backend"),
            )
            .fixture(
                "session",
                FixtureDef::function(&["backend"], |args, provide, _ctx| async move {
                    let backend = args.get::<Backend>("backend")?;
                    provide
                        .provide(Session {
                            id: backend.request(),
                            browser: backend.browser.clone(),
                        })
                        .await;
                    Ok(())
                }),
            ),
    )
}

fn login(s: &mut Suite) {
    s.with_test_type(test_type());
    s.test("opens a session", &["session"], |args, info| async move {
        let session = args.get::<Session>("session")?;
        info.stdout(format!("session {} on {}\n", session.id, session.browser));
        anyhow::ensure!(session.id > 0, "session ids start at 1");
        Ok(())
    });
    s.test("rejects a bad password", &["session"], |_args, info| async move {
        info.step("submit form", async { Ok(()) }).await?;
        Ok(())
    });
    s.test("flaky redirect", &["session"], |_args, info| async move {
        anyhow::ensure!(info.retry() > 0, "redirect raced the first attempt");
        Ok(())
    });
}

fn checkout(s: &mut Suite) {
    s.with_test_type(test_type());
    s.describe_serial("checkout", |s| {
        s.before_all(&["backend"], |args, _info| async move {
            args.get::<Backend>("backend")?.request();
            Ok(())
        });
        s.test("adds to cart", &["session"], |_args, _info| async { Ok(()) });
        s.test("pays", &["session"], |_args, _info| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });
        s.test("shows receipt", &["session"], |_args, _info| async { Ok(()) });
    });
    s.test("known rounding bug", &[], |_args, _info| async {
        anyhow::ensure!(0.1 + 0.2 == 0.3, "0.1 + 0.2 != 0.3");
        Ok(())
    })
    .fail(Some("floating point totals"));
}

fn catalog(s: &mut Suite) {
    s.with_test_type(test_type());
    s.describe_parallel("search", |s| {
        for term in ["shoes", "hats", "socks", "bags"] {
            s.test(format!("finds {term}"), &["session"], move |_args, info| async move {
                info.stdout(format!("searching {term}\n"));
                Ok(())
            });
        }
    });
    s.test("wishlist", &[], |_args, _info| async { Ok(()) })
        .fixme(Some("not built yet"));
}

pub fn registry() -> StaticRegistry {
    let config = FullConfig::empty()
        .with_workers(2)
        .with_project(ProjectConfig::new("chromium").with_retries(1))
        .with_project(
            ProjectConfig::new("firefox")
                .with_retries(1)
                .with_option("browser_name", "firefox".to_string()),
        );
    StaticRegistry::new(config)
        .file("login.spec", login)
        .file("checkout.spec", checkout)
        .file("catalog.spec", catalog)
}
