//! Engine errors

use keel_state::StateError;
use keel_types::{ResourceId, SpecError, TaskId};
use thiserror::Error;

/// Why a workflow run, or one of its tasks, failed.
///
/// Task-level variants are recorded on the task's state and events;
/// only spec, persistence and cancellation failures surface from
/// `Orchestrator::execute` itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow spec: {0}")]
    Spec(#[from] SpecError),

    #[error("task {task} failed: {reason}")]
    Execution { task: TaskId, reason: String },

    #[error("task {task} exceeded its timeout")]
    Timeout { task: TaskId },

    /// Commit validation refused the task's staged writes.
    #[error("task {task} blocked by gate {gate}")]
    CrvBlocked { task: TaskId, gate: String },

    #[error("task {task} denied by policy: {reason}")]
    PolicyDenied { task: TaskId, reason: String },

    #[error("task {task} could not lock resource {resource}")]
    LockUnavailable { task: TaskId, resource: ResourceId },

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("workflow cancelled")]
    Cancelled,

    #[error("internal lock poisoned")]
    LockPoisoned,
}

impl EngineError {
    /// Whether another attempt of the same task could succeed.
    /// Gate blocks and policy denials re-fail deterministically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Execution { .. }
                | EngineError::Timeout { .. }
                | EngineError::LockUnavailable { .. }
                | EngineError::State(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure reported by a task executor.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{0}")]
    Failed(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl ExecError {
    pub fn failed(reason: impl Into<String>) -> Self {
        ExecError::Failed(reason.into())
    }
}
