//! Task specifications
//!
//! A TaskSpec declares everything the orchestrator needs to run one unit
//! of work safely: what kind of task it is, how risky it is, how long it
//! may run, how often it may retry, which resources it locks, and what
//! cleans up after it if it fails.

use crate::{Permission, ResourceId, RiskTier, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What kind of node a task is in the workflow graph.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Performs work and stages state writes.
    #[default]
    Action,
    /// Performs work whose output steers downstream tasks.
    Decision,
    /// Fans out over its dependencies; exists for grouping and reporting.
    Parallel,
    /// Runs only as a compensation hook, never scheduled directly.
    Compensation,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Action => write!(f, "action"),
            TaskType::Decision => write!(f, "decision"),
            TaskType::Parallel => write!(f, "parallel"),
            TaskType::Compensation => write!(f, "compensation"),
        }
    }
}

/// How a lock on a claimed resource is shared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Many readers may hold the resource at once.
    Shared,
    /// Exactly one holder; blocks shared and exclusive alike.
    #[default]
    Exclusive,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// A resource the task must hold before its executor runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub resource: ResourceId,
    #[serde(default)]
    pub mode: LockMode,
}

impl ResourceClaim {
    pub fn exclusive(resource: impl Into<String>) -> Self {
        Self {
            resource: ResourceId::new(resource),
            mode: LockMode::Exclusive,
        }
    }

    pub fn shared(resource: impl Into<String>) -> Self {
        Self {
            resource: ResourceId::new(resource),
            mode: LockMode::Shared,
        }
    }
}

const MAX_BACKOFF_MS: u64 = 60_000;

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1_000
}

fn default_jitter() -> bool {
    true
}

/// Retry budget for a task.
///
/// `max_attempts` counts retries after a failure, not the first
/// execution: a task with `max_attempts: 3` may run four times. Use
/// [`RetryPolicy::none`] for fail-fast tasks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Spread retries by multiplying the delay by a random factor in
    /// [0.5, 1.5] so parallel tasks do not retry in lockstep.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            backoff_ms: 0,
            jitter: false,
        }
    }

    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
            jitter: true,
        }
    }

    /// Base delay before the retry that follows failed attempt number
    /// `attempt` (1-based). Doubles per attempt, capped at 60s. Jitter
    /// is applied by the caller, not here, so this stays deterministic.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(32);
        self.backoff_ms
            .saturating_mul(1u64 << exp)
            .min(MAX_BACKOFF_MS)
    }

    /// Whether another attempt is allowed after `attempts` executions.
    /// The first execution is free; only the re-runs draw on the budget.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_attempts
    }
}

/// Cleanup tasks to run when a task fails or times out.
///
/// Hooks reference tasks of type `Compensation` declared in the same
/// workflow. Both hooks may point at the same task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationHook {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<TaskId>,
}

impl CompensationHook {
    pub fn on_failure(task: impl Into<String>) -> Self {
        Self {
            on_failure: Some(TaskId::new(task)),
            on_timeout: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.on_failure.is_none() && self.on_timeout.is_none()
    }

    /// Every compensation task referenced by this hook.
    pub fn referenced(&self) -> Vec<&TaskId> {
        self.on_failure.iter().chain(self.on_timeout.iter()).collect()
    }
}

/// One unit of work in a workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique within the workflow
    pub id: TaskId,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub risk_tier: RiskTier,
    /// Wall-clock budget for one attempt; the orchestrator default
    /// applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "CompensationHook::is_empty")]
    pub compensation: CompensationHook,
    /// Permissions the submitting principal must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_permissions: Vec<Permission>,
    /// Resources locked before the executor runs, released afterwards
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceClaim>,
    /// Tasks sharing a recorded idempotency key run at most once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Opaque executor input
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub inputs: serde_json::Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(id),
            name: name.into(),
            task_type: TaskType::Action,
            risk_tier: RiskTier::Low,
            timeout_ms: None,
            retry: RetryPolicy::default(),
            compensation: CompensationHook::default(),
            required_permissions: Vec::new(),
            resources: Vec::new(),
            idempotency_key: None,
            inputs: serde_json::Value::Null,
            metadata: HashMap::new(),
        }
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_tier(mut self, tier: RiskTier) -> Self {
        self.risk_tier = tier;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compensation(mut self, compensation: CompensationHook) -> Self {
        self.compensation = compensation;
        self
    }

    pub fn requires(mut self, action: impl Into<String>, resource: impl Into<String>) -> Self {
        self.required_permissions.push(Permission::new(action, resource));
        self
    }

    pub fn claims(mut self, claim: ResourceClaim) -> Self {
        self.resources.push(claim);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn is_compensation(&self) -> bool {
        self.task_type == TaskType::Compensation
    }
}
