//! Locks and per-resource grant policy

use chrono::{DateTime, Utc};
use keel_types::{AgentId, LockMode, ResourceId, WorkflowId};
use serde::{Deserialize, Serialize};

/// How a resource orders its grants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationPolicy {
    /// Every grant is exclusive regardless of the requested mode
    #[default]
    Exclusive,
    /// Shared holders may coexist; FIFO otherwise
    Shared,
    /// Strict FIFO grant order
    Ordered,
    /// Highest declared priority first, FIFO within a priority
    Priority,
}

impl std::fmt::Display for CoordinationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinationPolicy::Exclusive => write!(f, "exclusive"),
            CoordinationPolicy::Shared => write!(f, "shared"),
            CoordinationPolicy::Ordered => write!(f, "ordered"),
            CoordinationPolicy::Priority => write!(f, "priority"),
        }
    }
}

/// A live hold on a resource.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lock {
    pub resource_id: ResourceId,
    pub holder: AgentId,
    pub workflow_id: WorkflowId,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    /// Hold TTL in milliseconds; 0 never expires
    pub timeout_ms: u64,
}

impl Lock {
    pub fn new(
        resource_id: ResourceId,
        holder: AgentId,
        workflow_id: WorkflowId,
        mode: LockMode,
        timeout_ms: u64,
    ) -> Self {
        Self {
            resource_id,
            holder,
            workflow_id,
            mode,
            acquired_at: Utc::now(),
            timeout_ms,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.timeout_ms > 0
            && Utc::now() - self.acquired_at > chrono::Duration::milliseconds(self.timeout_ms as i64)
    }
}

/// Shared holders tolerate more shared holders; an exclusive hold
/// tolerates nothing and nothing tolerates it.
pub(crate) fn compatible(holders: &[Lock], mode: LockMode) -> bool {
    holders.is_empty()
        || (mode == LockMode::Shared && holders.iter().all(|l| l.mode == LockMode::Shared))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(holder: &str, mode: LockMode, timeout_ms: u64) -> Lock {
        Lock::new(
            ResourceId::new("db"),
            AgentId::new(holder),
            WorkflowId::new("wf-1"),
            mode,
            timeout_ms,
        )
    }

    #[test]
    fn shared_holders_coexist() {
        let holders = vec![lock("a", LockMode::Shared, 0), lock("b", LockMode::Shared, 0)];
        assert!(compatible(&holders, LockMode::Shared));
        assert!(!compatible(&holders, LockMode::Exclusive));
    }

    #[test]
    fn exclusive_excludes_everyone() {
        let holders = vec![lock("a", LockMode::Exclusive, 0)];
        assert!(!compatible(&holders, LockMode::Shared));
        assert!(!compatible(&holders, LockMode::Exclusive));
        assert!(compatible(&[], LockMode::Exclusive));
    }

    #[test]
    fn zero_timeout_never_expires() {
        let held = lock("a", LockMode::Exclusive, 0);
        assert!(!held.is_expired());
        let mut overdue = lock("a", LockMode::Exclusive, 10);
        overdue.acquired_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(overdue.is_expired());
    }
}
