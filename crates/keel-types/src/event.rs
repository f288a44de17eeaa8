//! Audit events
//!
//! Events are the kernel's ground truth. Every externally visible
//! decision — task lifecycle, commit validation, policy outcomes, lock
//! traffic, rollback — lands in the event log before the caller sees
//! the result.
//!
//! The wire shape is fixed: one JSON object per line with `type`,
//! `workflowId`, optional `taskId`, `seq`, `timestamp` and `metadata`.
//! `seq` is assigned by the log and is strictly increasing per log.

use crate::{TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything the kernel reports on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowStarted,
    WorkflowSucceeded,
    WorkflowFailed,
    WorkflowCancelled,
    TaskStarted,
    TaskSucceeded,
    TaskFailed,
    TaskTimedOut,
    TaskRetried,
    TaskSkipped,
    TaskCompensated,
    StateUpdated,
    StateSnapshot,
    CrvBlocked,
    PolicyDecision,
    ApprovalRequested,
    ApprovalResolved,
    LockAcquired,
    LockReleased,
    DeadlockDetected,
    LivelockDetected,
    MitigationApplied,
    RollbackInitiated,
    RollbackPolicyDecision,
    RollbackCompleted,
    RollbackFailed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Wire spelling, e.g. TASK_STARTED
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

impl EventType {
    /// Terminal workflow events close a run.
    pub fn is_workflow_terminal(&self) -> bool {
        matches!(
            self,
            EventType::WorkflowSucceeded | EventType::WorkflowFailed | EventType::WorkflowCancelled
        )
    }
}

/// One append-only audit record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Strictly increasing per log; 0 until the log assigns it
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, workflow_id: WorkflowId) -> Self {
        Self {
            event_type,
            workflow_id,
            task_id: None,
            seq: 0,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn for_task(event_type: EventType, workflow_id: WorkflowId, task_id: TaskId) -> Self {
        Self {
            event_type,
            workflow_id,
            task_id: Some(task_id),
            seq: 0,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Insert one metadata field, promoting `metadata` to an object if
    /// it was still null.
    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        if !self.metadata.is_object() {
            self.metadata = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }
}
