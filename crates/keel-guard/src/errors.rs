//! Guard errors

use thiserror::Error;
use uuid::Uuid;

/// Why an approval operation failed.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("approval not found: {0}")]
    UnknownApproval(Uuid),

    #[error("approval {0} expired before resolution")]
    Expired(Uuid),

    #[error("approval {0} was already resolved")]
    AlreadyResolved(Uuid),

    #[error("resolver {0} is not a human principal")]
    NotHuman(String),

    #[error("{0} already approved this request; critical actions need distinct approvers")]
    DuplicateApprover(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

pub type GuardResult<T> = Result<T, GuardError>;
