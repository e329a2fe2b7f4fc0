//! Utility modules

pub mod logger;
mod timer;

pub use logger::{init_logger, init_worker_logger, LogLevel};
pub use timer::Stopwatch;
