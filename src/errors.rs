//! Error types shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JadeError {
    /// The user configuration cannot be used. Nothing was submitted.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A command or HPC interaction failed after exhausting retries.
    #[error("execution error: {0}")]
    Execution(String),

    /// The cluster lock could not be acquired within the timeout. The run may
    /// be stuck behind an orphaned lock file; see [`crate::jobs::cluster`].
    #[error("timed out after {timeout_secs}s acquiring lock {}", lock_file.display())]
    LockTimeout {
        lock_file: PathBuf,
        timeout_secs: u64,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Hpc(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, JadeError>;
