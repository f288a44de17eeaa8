//! Spec validation errors

use crate::TaskId;
use thiserror::Error;

/// Why a workflow spec failed validation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SpecError {
    #[error("workflow declares no schedulable tasks")]
    EmptyWorkflow,

    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("dependency references unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("task depends on itself: {0}")]
    SelfDependency(TaskId),

    #[error("dependency cycle involving tasks: {0:?}")]
    CycleDetected(Vec<TaskId>),

    #[error("task {task} compensation hook references {hook}, which is not a compensation task")]
    BadCompensationHook { task: TaskId, hook: TaskId },

    #[error("compensation task {0} may not appear in the dependency graph")]
    CompensationInGraph(TaskId),

    #[error("invalid spec: {0}")]
    Validation(String),
}

pub type SpecResult<T> = Result<T, SpecError>;
