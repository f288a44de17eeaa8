//! Store and log errors

use thiserror::Error;

/// Why a state or log operation failed.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("key already exists: {key}")]
    AlreadyExists { key: String },

    /// Optimistic concurrency violation. The writer saw `expected`, the
    /// store holds `actual`.
    #[error("version conflict on {key}: expected {expected}, actual {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("version {version} not found for key: {key}")]
    VersionNotFound { key: String, version: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock poisoned")]
    LockPoisoned,
}

impl StateError {
    /// Conflicts are the one failure a caller is expected to retry
    /// after re-reading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }
}

pub type StateResult<T> = Result<T, StateError>;
