//! Risk tiers
//!
//! Every task carries a tier. The tier is the single input that decides
//! how much autonomy the kernel grants: LOW and MEDIUM commit on their
//! own, HIGH parks for a human, CRITICAL parks for two.

use serde::{Deserialize, Serialize};

/// How dangerous a task is if it goes wrong.
///
/// Tiers are totally ordered so policies can be expressed as "at least
/// this careful": `max(declared, rule minimum)` is always well defined.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Reversible, low-blast-radius work. Commits autonomously.
    #[default]
    Low,
    /// Autonomous, but logged with full diffs for later review.
    Medium,
    /// Parks in PENDING_HUMAN until one human principal resolves it.
    High,
    /// Parks until two distinct human principals approve.
    Critical,
}

impl RiskTier {
    /// Whether committing at this tier needs an approval decision at all.
    pub fn requires_approval(&self) -> bool {
        matches!(self, RiskTier::High | RiskTier::Critical)
    }

    /// Whether the approval must come from a human principal.
    pub fn requires_human(&self) -> bool {
        self.requires_approval()
    }

    /// Whether two distinct human approvers are needed.
    pub fn requires_multi_party(&self) -> bool {
        matches!(self, RiskTier::Critical)
    }

    /// Number of distinct human approvals needed to clear this tier.
    pub fn approvals_needed(&self) -> usize {
        match self {
            RiskTier::Low | RiskTier::Medium => 0,
            RiskTier::High => 1,
            RiskTier::Critical => 2,
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskTier::Low => write!(f, "low"),
            RiskTier::Medium => write!(f, "medium"),
            RiskTier::High => write!(f, "high"),
            RiskTier::Critical => write!(f, "critical"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered() {
        assert!(RiskTier::Low < RiskTier::Medium);
        assert!(RiskTier::Medium < RiskTier::High);
        assert!(RiskTier::High < RiskTier::Critical);
    }

    #[test]
    fn approval_thresholds() {
        assert!(!RiskTier::Low.requires_approval());
        assert!(!RiskTier::Medium.requires_approval());
        assert!(RiskTier::High.requires_approval());
        assert!(RiskTier::Critical.requires_multi_party());
        assert_eq!(RiskTier::High.approvals_needed(), 1);
        assert_eq!(RiskTier::Critical.approvals_needed(), 2);
    }

    #[test]
    fn serde_uses_snake_case() {
        assert_eq!(serde_json::to_string(&RiskTier::High).unwrap(), "\"high\"");
        let tier: RiskTier = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(tier, RiskTier::Critical);
    }
}
