//! Runtime workflow state
//!
//! WorkflowState is the durable record of one run. The orchestrator
//! persists it after every transition, so a restarted process can pick
//! a run back up without re-running anything that already committed.

use crate::{TaskId, WorkflowId, WorkflowSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a run is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Succeeded | WorkflowStatus::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Succeeded => write!(f, "succeeded"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Where a task is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    /// Last attempt exceeded its timeout; retry or compensation follows
    TimedOut,
    /// Compensation hook in flight after a failed or timed-out attempt
    Compensating,
    Succeeded,
    Failed,
    /// Idempotency key already recorded; counts as satisfied
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Whether dependents may treat this task as done.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::TimedOut => write!(f, "timed_out"),
            TaskStatus::Compensating => write!(f, "compensating"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Durable per-task record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Executions so far, including the one in flight
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskState {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            output: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_succeeded(&mut self, output: Option<serde_json::Value>) {
        self.status = TaskStatus::Succeeded;
        self.output = output;
        self.last_error = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_skipped(&mut self) {
        self.status = TaskStatus::Skipped;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_timed_out(&mut self, budget_ms: u64) {
        self.status = TaskStatus::TimedOut;
        self.last_error = Some(format!("attempt exceeded {budget_ms}ms"));
    }

    pub fn mark_compensating(&mut self) {
        self.status = TaskStatus::Compensating;
    }
}

/// Durable record of one workflow run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub tasks: BTreeMap<TaskId, TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh state for a validated spec. Compensation tasks are tracked
    /// too; they just never become ready on their own.
    pub fn new(spec: &WorkflowSpec) -> Self {
        let tasks = spec
            .tasks
            .iter()
            .map(|t| (t.id.clone(), TaskState::new(t.id.clone())))
            .collect();
        Self {
            workflow_id: spec.id.clone(),
            status: WorkflowStatus::Pending,
            tasks,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskState> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut TaskState> {
        self.updated_at = Utc::now();
        self.tasks.get_mut(id)
    }

    pub fn status_of(&self, id: &TaskId) -> TaskStatus {
        self.tasks.get(id).map(|t| t.status).unwrap_or_default()
    }

    pub fn mark_running(&mut self) {
        self.status = WorkflowStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Pending tasks whose dependencies are all satisfied, in id order.
    pub fn ready_tasks(&self, spec: &WorkflowSpec) -> Vec<TaskId> {
        spec.schedulable_tasks()
            .filter(|t| self.status_of(&t.id) == TaskStatus::Pending)
            .filter(|t| {
                spec.deps_of(&t.id)
                    .iter()
                    .all(|dep| self.status_of(dep).satisfies_dependency())
            })
            .map(|t| t.id.clone())
            .collect()
    }

    /// Whether every schedulable task reached a terminal status.
    pub fn all_settled(&self, spec: &WorkflowSpec) -> bool {
        spec.schedulable_tasks()
            .all(|t| self.status_of(&t.id).is_terminal())
    }

    /// Final status once no task can make progress.
    pub fn outcome(&self, spec: &WorkflowSpec) -> WorkflowStatus {
        let all_ok = spec
            .schedulable_tasks()
            .all(|t| self.status_of(&t.id).satisfies_dependency());
        if all_ok {
            WorkflowStatus::Succeeded
        } else {
            WorkflowStatus::Failed
        }
    }

    /// Reset in-flight tasks to pending after a crash. Terminal tasks
    /// keep their status, which is what makes resume idempotent.
    pub fn reset_in_flight(&mut self) {
        for task in self.tasks.values_mut() {
            if matches!(
                task.status,
                TaskStatus::Running | TaskStatus::Compensating | TaskStatus::TimedOut
            ) {
                task.status = TaskStatus::Pending;
            }
        }
        self.updated_at = Utc::now();
    }
}
