//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

use super::Shard;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "TESTCORE";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Worker slots from TESTCORE_WORKERS
    pub workers: Option<usize>,
    /// Retries from TESTCORE_RETRIES
    pub retries: Option<u32>,
    /// Test timeout (ms) from TESTCORE_TIMEOUT
    pub timeout: Option<u64>,
    /// Failure limit from TESTCORE_MAX_FAILURES
    pub max_failures: Option<usize>,
    /// Shard from TESTCORE_SHARD, e.g. "1/3"
    pub shard: Option<Shard>,
    /// Repeat count from TESTCORE_REPEAT_EACH
    pub repeat_each: Option<u32>,
    /// Title filter from TESTCORE_GREP
    pub grep: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            workers: get_env_parse("WORKERS"),
            retries: get_env_parse("RETRIES"),
            timeout: get_env_parse("TIMEOUT"),
            max_failures: get_env_parse("MAX_FAILURES"),
            shard: get_env_parse("SHARD"),
            repeat_each: get_env_parse("REPEAT_EACH"),
            grep: get_env("GREP"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.workers.is_some()
            || self.retries.is_some()
            || self.timeout.is_some()
            || self.max_failures.is_some()
            || self.shard.is_some()
            || self.repeat_each.is_some()
            || self.grep.is_some()
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Builder for setting environment variables (useful for testing)
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    fn var(mut self, name: &str, value: impl ToString) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_{name}"), value.to_string()));
        self
    }

    pub fn workers(self, workers: usize) -> Self {
        self.var("WORKERS", workers)
    }

    pub fn retries(self, retries: u32) -> Self {
        self.var("RETRIES", retries)
    }

    pub fn timeout(self, timeout_ms: u64) -> Self {
        self.var("TIMEOUT", timeout_ms)
    }

    pub fn shard(self, shard: &str) -> Self {
        self.var("SHARD", shard)
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        for (key, value) in self.vars {
            env::set_var(key, value);
        }

        EnvGuard { previous }
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Print all TESTCORE environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_WORKERS       Number of worker slots");
    println!("  {ENV_PREFIX}_RETRIES       Retries per failed test");
    println!("  {ENV_PREFIX}_TIMEOUT       Per-test timeout in milliseconds");
    println!("  {ENV_PREFIX}_MAX_FAILURES  Stop after this many failures");
    println!("  {ENV_PREFIX}_SHARD         Shard to run, e.g. 1/3");
    println!("  {ENV_PREFIX}_REPEAT_EACH   Run every test this many times");
    println!("  {ENV_PREFIX}_GREP          Only run tests whose title contains this text");
    println!("  {ENV_PREFIX}_LOG           Log filter (trace, debug, info, warn, error)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.workers.is_none());
        assert!(!config.has_any());
    }

    #[test]
    fn test_env_builder() {
        let _guard = EnvBuilder::new()
            .workers(3)
            .timeout(1500)
            .shard("2/4")
            .apply_scoped();

        let config = EnvConfig::load();
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.timeout, Some(1500));
        assert_eq!(
            config.shard,
            Some(Shard {
                current: 2,
                total: 4
            })
        );
        assert!(config.has_any());
    }
}
