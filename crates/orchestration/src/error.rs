use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::TaskStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file {path} I/O failure: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state store worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures surfaced by the task dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// `running >= capacity` at admission time.
    #[error("at_capacity")]
    AtCapacity { capacity: usize },

    #[error("{0}")]
    Validation(String),

    #[error("not_found")]
    NotFound(String),

    #[error("already_completed")]
    AlreadyCompleted { task_id: String, status: TaskStatus },

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl DispatchError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::AtCapacity { .. } => "at_capacity",
            DispatchError::Validation(_) => "validation_failed",
            DispatchError::NotFound(_) => "not_found",
            DispatchError::AlreadyCompleted { .. } => "already_completed",
            DispatchError::Persistence(_) => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("token issuer request failed: {0}")]
    Issuer(String),

    #[error("token issuer returned an unusable credential: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}
