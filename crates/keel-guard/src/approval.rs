//! Approval tokens

use chrono::{DateTime, Duration, Utc};
use keel_types::RiskTier;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A parked approval awaiting human resolution.
///
/// Tokens are single-use and expire. `approvals` collects the ids of
/// humans who have said yes so far; CRITICAL needs two distinct ones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub id: Uuid,
    pub action: String,
    pub resource: String,
    /// Principal that triggered the evaluation
    pub requested_by: String,
    pub tier: RiskTier,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    #[serde(default)]
    pub approvals: Vec<String>,
}

impl ApprovalToken {
    pub fn new(
        action: impl Into<String>,
        resource: impl Into<String>,
        requested_by: impl Into<String>,
        tier: RiskTier,
        ttl_ms: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            resource: resource.into(),
            requested_by: requested_by.into(),
            tier,
            created_at: now,
            expires_at: now + Duration::milliseconds(ttl_ms as i64),
            used: false,
            approvals: Vec::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Approvals still missing before the token clears its tier.
    pub fn remaining_approvals(&self) -> usize {
        self.tier.approvals_needed().saturating_sub(self.approvals.len())
    }
}
