//! testcore - test execution core
//!
//! Declares suites of tests with name-injected fixtures, splits them into
//! worker-sized groups and runs the groups over a pool of workers with
//! retries, serial suites, sharding and a failure budget.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use testcore::config::{FullConfig, ProjectConfig};
//! use testcore::executor::TestRunner;
//! use testcore::ipc::InProcessLauncher;
//! use testcore::models::StaticRegistry;
//! use testcore::output::{LineReporter, OutputFormat};
//!
//! # async fn demo() -> Result<(), testcore::CoreError> {
//! let config = FullConfig::empty().with_project(ProjectConfig::new("unit"));
//! let registry = Arc::new(StaticRegistry::new(config).file("math.spec", |s| {
//!     s.test("adds", &[], |_args, _info| async {
//!         anyhow::ensure!(1 + 1 == 2);
//!         Ok(())
//!     });
//! }));
//! let launcher = Arc::new(InProcessLauncher::new(registry.clone()));
//! let summary = TestRunner::new(registry, launcher)
//!     .run(Box::new(LineReporter::new(OutputFormat::Line)))
//!     .await?;
//! std::process::exit(summary.exit_code());
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod fixtures;
pub mod ipc;
pub mod models;
pub mod output;
pub mod timeout;
pub mod utils;
pub mod worker;

pub use error::{CoreError, CoreResult};
