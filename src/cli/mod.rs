//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};

use crate::config::{FullConfig, Shard};

/// Test execution core with a built-in demo registry
#[derive(Parser, Debug)]
#[command(name = "testcore")]
#[command(author = "hephaex@gmail.com")]
#[command(version)]
#[command(about = "Run tests over worker processes with fixtures, retries and sharding")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the registered tests
    Run(RunArgs),

    /// List the tests a run would execute
    List(ListArgs),

    /// Print the environment variables read at startup
    Env,

    /// Serve one worker over stdin/stdout (spawned by the runner)
    #[command(hide = true)]
    Worker,
}

/// Options shared by `run` and `list`
#[derive(Parser, Debug, Default)]
pub struct SelectArgs {
    /// Only include tests whose full title contains this text
    #[arg(short, long)]
    pub grep: Option<String>,

    /// Only include one shard of the tests, e.g. 1/3
    #[arg(long)]
    pub shard: Option<Shard>,

    /// Run every test this many times
    #[arg(long)]
    pub repeat_each: Option<u32>,

    /// Number of worker slots (affects how parallel suites are split)
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,
}

impl SelectArgs {
    /// Apply to a configuration. Command line wins over the environment.
    pub fn apply(&self, config: &mut FullConfig) {
        if let Some(grep) = &self.grep {
            config.grep = Some(grep.clone());
        }
        if let Some(shard) = self.shard {
            config.shard = Some(shard);
        }
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if let Some(repeat_each) = self.repeat_each {
            for project in &mut config.projects {
                project.repeat_each = repeat_each.max(1);
            }
        }
    }
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Retries for failed tests
    #[arg(short, long)]
    pub retries: Option<u32>,

    /// Stop after this many failures
    #[arg(short = 'x', long)]
    pub max_failures: Option<usize>,

    /// Per-test timeout in milliseconds, 0 for none
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Run workers as tasks in this process instead of child processes
    #[arg(long)]
    pub in_process: bool,

    /// Reporter (line, json, summary)
    #[arg(long, default_value = "line")]
    pub reporter: String,

    /// Print test stdout/stderr as it arrives
    #[arg(long)]
    pub show_output: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

impl RunArgs {
    pub fn apply(&self, config: &mut FullConfig) {
        self.select.apply(config);
        if let Some(max_failures) = self.max_failures {
            config.max_failures = max_failures;
        }
        for project in &mut config.projects {
            if let Some(retries) = self.retries {
                project.retries = retries;
            }
            if let Some(timeout) = self.timeout {
                project.timeout = timeout;
            }
        }
    }
}

/// Arguments for list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Show ids, worker hashes and groups
    #[arg(short, long)]
    pub detailed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["testcore", "list", "--detailed", "--grep", "login"]);
        match args.command {
            Command::List(list_args) => {
                assert!(list_args.detailed);
                assert_eq!(list_args.select.grep.as_deref(), Some("login"));
            }
            _ => panic!("Expected List command"),
        }
    }

    #[test]
    fn test_run_args() {
        let args = Args::parse_from([
            "testcore",
            "run",
            "--workers",
            "2",
            "--retries",
            "3",
            "--shard",
            "2/3",
            "--in-process",
            "-x",
            "1",
        ]);
        match args.command {
            Command::Run(run_args) => {
                let mut config = FullConfig::empty().with_project(ProjectConfig::new("p"));
                run_args.apply(&mut config);
                assert_eq!(config.workers, 2);
                assert_eq!(config.max_failures, 1);
                assert_eq!(config.projects[0].retries, 3);
                assert_eq!(config.shard, Some(Shard { current: 2, total: 3 }));
                assert!(run_args.in_process);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_invalid_shard_is_rejected() {
        assert!(Args::try_parse_from(["testcore", "run", "--shard", "4/3"]).is_err());
    }
}
