//! The guard's audit trail

use crate::GuardState;
use chrono::{DateTime, Utc};
use keel_types::RiskTier;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use uuid::Uuid;

/// One recorded transition of the policy machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub state: GuardState,
    pub action: String,
    pub resource: String,
    pub principal: String,
    pub tier: RiskTier,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
}

impl AuditRecord {
    pub fn new(
        state: GuardState,
        action: &str,
        resource: &str,
        principal: &str,
        tier: RiskTier,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            at: Utc::now(),
            state,
            action: action.to_string(),
            resource: resource.to_string(),
            principal: principal.to_string(),
            tier,
            reason: reason.into(),
            approval_id: None,
        }
    }

    pub fn with_approval(mut self, approval_id: Uuid) -> Self {
        self.approval_id = Some(approval_id);
        self
    }
}

/// Append-only record of every guard transition.
#[derive(Debug, Default)]
pub struct AuditTrail {
    records: RwLock<Vec<AuditRecord>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: AuditRecord) {
        tracing::debug!(
            state = %record.state,
            action = %record.action,
            principal = %record.principal,
            "guard transition"
        );
        if let Ok(mut records) = self.records.write() {
            records.push(record);
        }
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.read().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records touching one action, in order.
    pub fn for_action(&self, action: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.action == action)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
