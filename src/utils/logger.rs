//! Logging utilities
//!
//! Installs the `tracing` subscriber for the host and for worker processes.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Overrides the filter when set, using `EnvFilter` directive syntax.
pub const LOG_ENV: &str = "TESTCORE_LOG";

/// Log level configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

fn filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(format!("testcore={}", level.to_tracing_level())))
}

/// Initialize the logger with specified level
pub fn init_logger(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(false)
        .compact()
        .init();
}

/// Initialize logging for a worker process. Stdout carries the protocol, so
/// everything goes to stderr without colors.
pub fn init_worker_logger(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_str("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("unknown"), None);
    }
}
