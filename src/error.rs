//! Framework error types
//!
//! User code (test bodies, hooks, fixtures) returns `anyhow::Result`; the
//! engine itself reports its own failures through [`CoreError`].

use thiserror::Error;

use crate::models::Location;

/// Errors raised by the execution core itself.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{location}: {message}")]
    Load { message: String, location: Location },

    #[error("describe.parallel cannot be nested inside describe.serial ({location})")]
    ParallelInsideSerial { location: Location },

    #[error("Project \"{0}\" is not defined in the configuration")]
    UnknownProject(String),

    #[error("Fixture pool digest mismatch: expected \"{expected}\", got \"{actual}\"")]
    PoolDigestMismatch { expected: String, actual: String },

    #[error("Did not teardown test scope")]
    DirtyTestScope,

    #[error("Test file \"{file}\" could not be loaded: {message}")]
    FileLoad { file: String, message: String },

    #[error("Failed to launch worker: {0}")]
    Launch(#[source] std::io::Error),

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Invalid shard \"{0}\", expected <current>/<total>")]
    InvalidShard(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
