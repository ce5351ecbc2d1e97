//! Typed errors for the coordination kernel
//!
//! Contention (a busy agent, an already-leased task, a stale lease token) is
//! never an error here: those surface as `None` / `false` from the owning
//! component. Only validation and storage failures are `Err`.

use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to the durable task table.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access task store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize task table: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors returned by [`crate::scheduler::TaskScheduler`].
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Malformed enqueue input, rejected before any state mutation
    #[error("invalid task input: {0}")]
    Validation(String),

    /// Persistence backend failure
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl SchedulerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Errors loading [`crate::config::KernelConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
