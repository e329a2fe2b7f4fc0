//! Configuration module
//!
//! Run-wide and per-project knobs consumed by the scheduler and workers.

pub mod env;

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::CoreError;
use crate::fixtures::{FixtureValue, OptionOverrides};
use crate::models::Location;
pub use env::EnvConfig;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_WORKERS: usize = 4;
/// Grace period before a stopping worker is forced to exit.
pub const FORCE_EXIT_TIMEOUT_MS: u64 = 30_000;

/// Full run configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullConfig {
    /// Number of worker slots
    pub workers: usize,

    /// Stop after this many unexpected results; zero disables the limit
    pub max_failures: usize,

    /// Only run one shard of the test groups
    pub shard: Option<Shard>,

    /// Only run tests whose full title contains this text
    pub grep: Option<String>,

    /// Projects to run, in order
    pub projects: Vec<ProjectConfig>,

    pub force_exit_timeout_ms: u64,
}

impl Default for FullConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_failures: 0,
            shard: None,
            grep: None,
            projects: vec![ProjectConfig::new("default")],
            force_exit_timeout_ms: FORCE_EXIT_TIMEOUT_MS,
        }
    }
}

impl FullConfig {
    /// A configuration without projects; add them with [`with_project`](Self::with_project).
    pub fn empty() -> Self {
        Self {
            projects: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_project(mut self, project: ProjectConfig) -> Self {
        self.projects.push(project);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_failures(mut self, max_failures: usize) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_shard(mut self, shard: Shard) -> Self {
        self.shard = Some(shard);
        self
    }

    pub fn with_grep(mut self, grep: impl Into<String>) -> Self {
        self.grep = Some(grep.into());
        self
    }

    pub fn project(&self, id: &str) -> Result<&ProjectConfig, CoreError> {
        self.projects
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| CoreError::UnknownProject(id.to_string()))
    }

    /// Apply overrides from the environment.
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(workers) = env.workers {
            self.workers = workers.max(1);
        }
        if let Some(max_failures) = env.max_failures {
            self.max_failures = max_failures;
        }
        if let Some(shard) = env.shard {
            self.shard = Some(shard);
        }
        if let Some(grep) = &env.grep {
            self.grep = Some(grep.clone());
        }
        for project in &mut self.projects {
            if let Some(retries) = env.retries {
                project.retries = retries;
            }
            if let Some(timeout) = env.timeout {
                project.timeout = timeout;
            }
            if let Some(repeat_each) = env.repeat_each {
                project.repeat_each = repeat_each.max(1);
            }
        }
    }

    /// Option values never cross the process boundary; take them from a
    /// locally built configuration.
    pub fn merge_options_from(&mut self, local: &FullConfig) {
        for project in &mut self.projects {
            if let Some(source) = local.projects.iter().find(|p| p.id == project.id) {
                project.use_options = source.use_options.clone();
            }
        }
    }
}

/// Per-project configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub id: String,
    pub name: String,

    /// Default per-test timeout in milliseconds; zero means unlimited
    pub timeout: u64,

    pub retries: u32,
    pub repeat_each: u32,
    pub fully_parallel: bool,

    /// Upper bound on concurrent workers for this project
    pub workers: Option<usize>,

    /// Values replacing option fixtures of the same name
    #[serde(skip)]
    pub use_options: HashMap<String, FixtureValue>,
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            timeout: DEFAULT_TIMEOUT_MS,
            retries: 0,
            repeat_each: 1,
            fully_parallel: false,
            workers: None,
            use_options: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = timeout_ms;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_repeat_each(mut self, repeat_each: u32) -> Self {
        self.repeat_each = repeat_each.max(1);
        self
    }

    pub fn fully_parallel(mut self) -> Self {
        self.fully_parallel = true;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn with_option<T: Any + Send + Sync>(mut self, name: impl Into<String>, value: T) -> Self {
        self.use_options.insert(name.into(), Arc::new(value));
        self
    }

    pub fn option_overrides(&self) -> Option<OptionOverrides> {
        if self.use_options.is_empty() {
            return None;
        }
        Some(OptionOverrides {
            overrides: self.use_options.clone(),
            location: Location::new(format!("<project {}>", self.name), 0, 0),
        })
    }
}

/// `current/total`, 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub current: u32,
    pub total: u32,
}

impl FromStr for Shard {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidShard(s.to_string());
        let (current, total) = s.split_once('/').ok_or_else(invalid)?;
        let current: u32 = current.trim().parse().map_err(|_| invalid())?;
        let total: u32 = total.trim().parse().map_err(|_| invalid())?;
        if total == 0 || current == 0 || current > total {
            return Err(invalid());
        }
        Ok(Self { current, total })
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.current, self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FullConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_failures, 0);
        assert_eq!(config.projects[0].timeout, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.projects[0].repeat_each, 1);
    }

    #[test]
    fn test_shard_parsing() {
        assert_eq!(
            "2/3".parse::<Shard>().unwrap(),
            Shard {
                current: 2,
                total: 3
            }
        );
        assert!("0/3".parse::<Shard>().is_err());
        assert!("4/3".parse::<Shard>().is_err());
        assert!("x".parse::<Shard>().is_err());
    }

    #[test]
    fn test_unknown_project() {
        let config = FullConfig::empty().with_project(ProjectConfig::new("chromium"));
        assert!(config.project("chromium").is_ok());
        assert!(matches!(
            config.project("firefox"),
            Err(CoreError::UnknownProject(_))
        ));
    }

    #[test]
    fn test_options_survive_serialization_via_merge() {
        let local = FullConfig::empty()
            .with_project(ProjectConfig::new("p").with_option("locale", "fr".to_string()));
        let json = serde_json::to_string(&local).unwrap();
        let mut remote: FullConfig = serde_json::from_str(&json).unwrap();
        assert!(remote.projects[0].use_options.is_empty());
        remote.merge_options_from(&local);
        assert!(remote.projects[0].option_overrides().is_some());
    }

    #[test]
    fn test_apply_env() {
        let env = EnvConfig {
            workers: Some(2),
            retries: Some(3),
            ..Default::default()
        };
        let mut config = FullConfig::default();
        config.apply_env(&env);
        assert_eq!(config.workers, 2);
        assert_eq!(config.projects[0].retries, 3);
    }
}
