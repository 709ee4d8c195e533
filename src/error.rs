//! Error types for cascade-rs.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command} exited with status {code}: {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("no job id in submit output: {0:?}")]
    JobIdParse(String),

    #[error("unreadable queue listing: {0}")]
    QueueParse(String),

    /// The submit breaker tripped before a single submission was accepted.
    #[error("batch service rejected {failures} consecutive submissions and accepted none")]
    ServiceUnavailable { failures: usize },

    #[error("invalid job manifest {}: {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
