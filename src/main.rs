//! testcore - test execution core
//!
//! Runs the built-in demo registry over worker processes.
//!
//! ## Usage
//!
//! ```bash
//! # Run everything with two workers
//! testcore run --workers 2
//!
//! # Run one shard, retrying failures once
//! testcore run --shard 1/2 --retries 1
//!
//! # Stop after the first failure, JSON lines output
//! testcore run -x 1 --reporter json
//!
//! # List tests and their groups
//! testcore list --detailed
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

mod demo;

use testcore::cli::{self, Args};
use testcore::config::{self, EnvConfig};
use testcore::executor::TestRunner;
use testcore::ipc::{InProcessLauncher, ProcessLauncher, WorkerLauncher};
use testcore::models::TestRegistry;
use testcore::output::{LineReporter, OutputFormat};
use testcore::utils::{init_logger, init_worker_logger, LogLevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Warn
    };
    let registry: Arc<dyn TestRegistry> = Arc::new(demo::registry());

    match args.command {
        cli::Command::Worker => {
            init_worker_logger(level);
            testcore::worker::run_stdio(registry).await?;
            // Fixture teardown may leave tasks behind; the host is waiting
            // for the exit.
            std::process::exit(0);
        }
        cli::Command::Run(run_args) => {
            init_logger(level);
            let code = run(registry, run_args).await?;
            std::process::exit(code);
        }
        cli::Command::List(list_args) => {
            init_logger(level);
            list(registry, list_args)?;
        }
        cli::Command::Env => config::env::print_env_help(),
    }

    Ok(())
}

fn resolve_config(registry: &dyn TestRegistry) -> config::FullConfig {
    let mut config = registry.config();
    let env = EnvConfig::load();
    if env.has_any() {
        info!("Applying environment overrides");
        config.apply_env(&env);
    }
    config
}

async fn run(registry: Arc<dyn TestRegistry>, args: cli::RunArgs) -> Result<i32> {
    let mut config = resolve_config(registry.as_ref());
    args.apply(&mut config);

    let format = OutputFormat::from_str(&args.reporter)
        .ok_or_else(|| anyhow::anyhow!("Unknown reporter: {}", args.reporter))?;
    let mut reporter = LineReporter::new(format);
    if args.no_color {
        reporter = reporter.no_color();
    }
    if args.show_output {
        reporter = reporter.show_output();
    }

    let launcher: Arc<dyn WorkerLauncher> = if args.in_process {
        Arc::new(InProcessLauncher::new(registry.clone()))
    } else {
        Arc::new(ProcessLauncher::current_exe().context("Failed to locate the testcore binary")?)
    };

    let summary = TestRunner::new(registry, launcher)
        .with_config(config)
        .run(Box::new(reporter))
        .await?;
    Ok(summary.exit_code())
}

fn list(registry: Arc<dyn TestRegistry>, args: cli::ListArgs) -> Result<()> {
    let mut config = resolve_config(registry.as_ref());
    args.select.apply(&mut config);
    let launcher = Arc::new(InProcessLauncher::new(registry.clone()));
    let runner = TestRunner::new(registry, launcher).with_config(config);

    if !args.detailed {
        for title in runner.list()? {
            println!("  {title}");
        }
        return Ok(());
    }

    let plan = runner.plan()?;
    for error in &plan.errors {
        println!("Error: {}", error.message);
    }
    for (index, group) in plan.groups.iter().enumerate() {
        println!(
            "\nGroup {} [{}] {} ({} tests)",
            index + 1,
            group.project_id,
            group.require_file,
            group.tests.len()
        );
        println!("  worker hash: {}", group.worker_hash);
        for id in &group.tests {
            if let Some(test) = plan.tests.iter().find(|t| &t.id == id) {
                println!("  {}  {}", test.id, test.full_title());
            }
        }
    }
    let failed: Vec<_> = plan
        .tests
        .iter()
        .filter(|t| !t.load_errors.is_empty())
        .collect();
    if !failed.is_empty() {
        println!("\nNot runnable:");
        for test in failed {
            println!("  {}", test.full_title());
            for error in &test.load_errors {
                println!("    {}", error.message);
            }
        }
    }
    println!("\nTotal: {} tests in {} groups", plan.tests.len(), plan.groups.len());
    Ok(())
}
