//! Cortex errors

use keel_state::StateError;
use keel_types::{SnapshotId, WorkflowId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CortexError {
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    /// Fatal to the rollback attempt; state is guaranteed untouched.
    #[error("integrity violation on snapshot {snapshot_id}: computed {expected}, stored {actual}")]
    Integrity {
        snapshot_id: SnapshotId,
        expected: String,
        actual: String,
    },

    #[error("rollback denied by policy: {reason}")]
    PolicyDenied { reason: String },

    #[error("no verified snapshot for workflow {0}")]
    NoVerifiedSnapshot(WorkflowId),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("cortex lock poisoned")]
    LockPoisoned,
}

pub type CortexResult<T> = Result<T, CortexError>;
