//! Guard states and policy decisions

use chrono::{DateTime, Utc};
use keel_types::RiskTier;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// States of the policy machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Idle,
    Evaluating,
    Approved,
    Rejected,
    PendingHuman,
}

impl GuardState {
    /// Legal transitions of the machine. Terminal states go nowhere.
    pub fn may_transition(&self, next: GuardState) -> bool {
        matches!(
            (self, next),
            (GuardState::Idle, GuardState::Evaluating)
                | (GuardState::Evaluating, GuardState::Approved)
                | (GuardState::Evaluating, GuardState::Rejected)
                | (GuardState::Evaluating, GuardState::PendingHuman)
                | (GuardState::PendingHuman, GuardState::Approved)
                | (GuardState::PendingHuman, GuardState::Rejected)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GuardState::Approved | GuardState::Rejected)
    }
}

impl std::fmt::Display for GuardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardState::Idle => write!(f, "idle"),
            GuardState::Evaluating => write!(f, "evaluating"),
            GuardState::Approved => write!(f, "approved"),
            GuardState::Rejected => write!(f, "rejected"),
            GuardState::PendingHuman => write!(f, "pending_human"),
        }
    }
}

/// The guard's answer for one action.
///
/// Callers branch on `state`; a `PendingHuman` decision carries the
/// approval id to resolve or wait on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub state: GuardState,
    pub action: String,
    pub resource: String,
    /// Requesting principal id
    pub principal: String,
    /// Effective tier after policy escalation
    pub tier: RiskTier,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
    pub decided_at: DateTime<Utc>,
}

impl PolicyDecision {
    pub fn approved(
        action: &str,
        resource: &str,
        principal: &str,
        tier: RiskTier,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            state: GuardState::Approved,
            action: action.to_string(),
            resource: resource.to_string(),
            principal: principal.to_string(),
            tier,
            reason: reason.into(),
            approval_id: None,
            decided_at: Utc::now(),
        }
    }

    pub fn rejected(
        action: &str,
        resource: &str,
        principal: &str,
        tier: RiskTier,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            state: GuardState::Rejected,
            action: action.to_string(),
            resource: resource.to_string(),
            principal: principal.to_string(),
            tier,
            reason: reason.into(),
            approval_id: None,
            decided_at: Utc::now(),
        }
    }

    pub fn pending(
        action: &str,
        resource: &str,
        principal: &str,
        tier: RiskTier,
        approval_id: Uuid,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            state: GuardState::PendingHuman,
            action: action.to_string(),
            resource: resource.to_string(),
            principal: principal.to_string(),
            tier,
            reason: reason.into(),
            approval_id: Some(approval_id),
            decided_at: Utc::now(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.state == GuardState::Approved
    }

    pub fn is_rejected(&self) -> bool {
        self.state == GuardState::Rejected
    }

    pub fn is_pending(&self) -> bool {
        self.state == GuardState::PendingHuman
    }
}
