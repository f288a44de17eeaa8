//! The Goal-Guard itself

use crate::{
    ApprovalToken, AuditRecord, AuditTrail, GuardError, GuardResult, GuardState, PolicyDecision,
};
use keel_types::{Principal, RiskTier, SafetyPolicy};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

fn default_approval_ttl_ms() -> u64 {
    300_000
}

/// Guard configuration.
#[derive(Clone, Debug)]
pub struct GuardConfig {
    /// How long a parked approval stays resolvable
    pub approval_ttl_ms: u64,
    /// Optional tier-escalation rules applied before routing
    pub policy: Option<SafetyPolicy>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            approval_ttl_ms: default_approval_ttl_ms(),
            policy: None,
        }
    }
}

impl GuardConfig {
    pub fn with_policy(mut self, policy: SafetyPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_approval_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.approval_ttl_ms = ttl_ms;
        self
    }
}

struct PendingApproval {
    token: ApprovalToken,
    tx: Option<oneshot::Sender<PolicyDecision>>,
    rx: Option<oneshot::Receiver<PolicyDecision>>,
}

/// The risk-tiered policy gate.
///
/// `evaluate` is synchronous and never blocks; a HIGH or CRITICAL
/// action comes back `PendingHuman` with an approval id. Callers either
/// `resolve` it directly (a human at a CLI) or `wait_for_decision`
/// under a deadline (the orchestrator parking a task).
pub struct GoalGuard {
    config: GuardConfig,
    audit: AuditTrail,
    pending: Mutex<HashMap<Uuid, PendingApproval>>,
}

impl GoalGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            audit: AuditTrail::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Run one action through the machine.
    ///
    /// The effective tier is the declared tier raised by any matching
    /// policy rule. Default is deny: an unknown permission or an
    /// unavailable guard rejects.
    pub fn evaluate(
        &self,
        action: &str,
        resource: &str,
        principal: &Principal,
        declared: RiskTier,
    ) -> PolicyDecision {
        let tier = self
            .config
            .policy
            .as_ref()
            .map(|p| p.tier_for(action, declared))
            .unwrap_or(declared);

        self.audit.append(AuditRecord::new(
            GuardState::Evaluating,
            action,
            resource,
            &principal.id,
            tier,
            "evaluation started",
        ));

        if !principal.can(action, resource) {
            let decision = PolicyDecision::rejected(
                action,
                resource,
                &principal.id,
                tier,
                format!("{} lacks permission {action} on {resource}", principal.id),
            );
            self.record(&decision);
            return decision;
        }

        if !tier.requires_approval() {
            let decision = PolicyDecision::approved(
                action,
                resource,
                &principal.id,
                tier,
                format!("tier {tier} commits autonomously"),
            );
            self.record(&decision);
            return decision;
        }

        // HIGH and CRITICAL park for humans
        let token = ApprovalToken::new(
            action,
            resource,
            &principal.id,
            tier,
            self.config.approval_ttl_ms,
        );
        let approval_id = token.id;
        let (tx, rx) = oneshot::channel();
        let decision = PolicyDecision::pending(
            action,
            resource,
            &principal.id,
            tier,
            approval_id,
            format!("tier {tier} requires {} human approval(s)", tier.approvals_needed()),
        );

        match self.pending.lock() {
            Ok(mut pending) => {
                pending.insert(
                    approval_id,
                    PendingApproval {
                        token,
                        tx: Some(tx),
                        rx: Some(rx),
                    },
                );
                self.record(&decision);
                decision
            }
            // Fail closed if the registry is unusable
            Err(_) => {
                let rejected = PolicyDecision::rejected(
                    action,
                    resource,
                    &principal.id,
                    tier,
                    "guard approval registry unavailable",
                );
                self.record(&rejected);
                rejected
            }
        }
    }

    /// Resolve a parked approval.
    ///
    /// Only humans resolve. CRITICAL tokens need a second, distinct
    /// human; the first approval leaves the token parked. A rejection
    /// by anyone is final.
    pub fn resolve(
        &self,
        approval_id: Uuid,
        approve: bool,
        resolver: &Principal,
    ) -> GuardResult<PolicyDecision> {
        let mut pending = self.pending.lock().map_err(|_| GuardError::LockPoisoned)?;

        let expired = pending
            .get(&approval_id)
            .map(|entry| entry.token.is_expired())
            .ok_or(GuardError::UnknownApproval(approval_id))?;

        if expired {
            let mut entry = pending
                .remove(&approval_id)
                .ok_or(GuardError::UnknownApproval(approval_id))?;
            let decision = PolicyDecision::rejected(
                &entry.token.action,
                &entry.token.resource,
                &entry.token.requested_by,
                entry.token.tier,
                "approval expired before resolution",
            );
            self.record_with_approval(&decision, approval_id);
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(decision);
            }
            return Err(GuardError::Expired(approval_id));
        }

        if !resolver.is_human() {
            return Err(GuardError::NotHuman(resolver.id.clone()));
        }

        if !approve {
            let mut entry = pending
                .remove(&approval_id)
                .ok_or(GuardError::UnknownApproval(approval_id))?;
            let decision = PolicyDecision::rejected(
                &entry.token.action,
                &entry.token.resource,
                &entry.token.requested_by,
                entry.token.tier,
                format!("rejected by {}", resolver.id),
            );
            self.record_with_approval(&decision, approval_id);
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(decision.clone());
            }
            return Ok(decision);
        }

        let remaining = {
            let entry = pending
                .get_mut(&approval_id)
                .ok_or(GuardError::UnknownApproval(approval_id))?;
            if entry.token.approvals.iter().any(|a| a == &resolver.id) {
                return Err(GuardError::DuplicateApprover(resolver.id.clone()));
            }
            entry.token.approvals.push(resolver.id.clone());
            entry.token.remaining_approvals()
        };

        if remaining > 0 {
            let entry = pending
                .get(&approval_id)
                .ok_or(GuardError::UnknownApproval(approval_id))?;
            let decision = PolicyDecision::pending(
                &entry.token.action,
                &entry.token.resource,
                &entry.token.requested_by,
                entry.token.tier,
                approval_id,
                format!(
                    "approved by {resolver_id}; awaiting {remaining} more approval(s)",
                    resolver_id = resolver.id
                ),
            );
            self.record_with_approval(&decision, approval_id);
            return Ok(decision);
        }

        let mut entry = pending
            .remove(&approval_id)
            .ok_or(GuardError::UnknownApproval(approval_id))?;
        entry.token.used = true;
        let decision = PolicyDecision::approved(
            &entry.token.action,
            &entry.token.resource,
            &entry.token.requested_by,
            entry.token.tier,
            format!("approved by {}", entry.token.approvals.join(", ")),
        );
        self.record_with_approval(&decision, approval_id);
        if let Some(tx) = entry.tx.take() {
            let _ = tx.send(decision.clone());
        }
        Ok(decision)
    }

    /// Park until the approval resolves or `timeout` elapses.
    ///
    /// Timing out rejects: the token is withdrawn and the returned
    /// decision is `Rejected`, so an unattended approval can never
    /// default to allow.
    pub async fn wait_for_decision(
        &self,
        approval_id: Uuid,
        timeout: Duration,
    ) -> GuardResult<PolicyDecision> {
        let mut rx = {
            let mut pending = self.pending.lock().map_err(|_| GuardError::LockPoisoned)?;
            let entry = pending
                .get_mut(&approval_id)
                .ok_or(GuardError::UnknownApproval(approval_id))?;
            entry
                .rx
                .take()
                .ok_or(GuardError::AlreadyResolved(approval_id))?
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(_)) => Err(GuardError::UnknownApproval(approval_id)),
            Err(_) => {
                // Lost the race? The resolution may have landed between
                // the deadline and here.
                if let Ok(decision) = rx.try_recv() {
                    return Ok(decision);
                }
                let mut pending = self.pending.lock().map_err(|_| GuardError::LockPoisoned)?;
                let decision = match pending.remove(&approval_id) {
                    Some(entry) => {
                        let decision = PolicyDecision::rejected(
                            &entry.token.action,
                            &entry.token.resource,
                            &entry.token.requested_by,
                            entry.token.tier,
                            format!("approval timed out after {}ms", timeout.as_millis()),
                        );
                        self.record_with_approval(&decision, approval_id);
                        decision
                    }
                    None => return Err(GuardError::UnknownApproval(approval_id)),
                };
                Ok(decision)
            }
        }
    }

    /// Withdraw every expired approval, rejecting each. Returns how
    /// many were withdrawn.
    pub fn expire_overdue(&self) -> usize {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(_) => return 0,
        };
        let expired: Vec<Uuid> = pending
            .iter()
            .filter(|(_, entry)| entry.token.is_expired())
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(mut entry) = pending.remove(id) {
                let decision = PolicyDecision::rejected(
                    &entry.token.action,
                    &entry.token.resource,
                    &entry.token.requested_by,
                    entry.token.tier,
                    "approval expired before resolution",
                );
                self.record_with_approval(&decision, *id);
                if let Some(tx) = entry.tx.take() {
                    let _ = tx.send(decision);
                }
            }
        }
        expired.len()
    }

    fn record(&self, decision: &PolicyDecision) {
        let mut record = AuditRecord::new(
            decision.state,
            &decision.action,
            &decision.resource,
            &decision.principal,
            decision.tier,
            decision.reason.clone(),
        );
        if let Some(id) = decision.approval_id {
            record = record.with_approval(id);
        }
        self.audit.append(record);
    }

    fn record_with_approval(&self, decision: &PolicyDecision, approval_id: Uuid) {
        self.audit.append(
            AuditRecord::new(
                decision.state,
                &decision.action,
                &decision.resource,
                &decision.principal,
                decision.tier,
                decision.reason.clone(),
            )
            .with_approval(approval_id),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::SafetyRule;
    use std::sync::Arc;

    fn agent() -> Principal {
        Principal::agent("agent:planner").with_permission("*", "*")
    }

    fn guard() -> GoalGuard {
        GoalGuard::new(GuardConfig::default())
    }

    #[test]
    fn low_tier_approves_autonomously() {
        let guard = guard();
        let decision = guard.evaluate("state:write", "inventory", &agent(), RiskTier::Low);
        assert!(decision.is_approved());
        // Evaluating + Approved both audited
        let states: Vec<GuardState> = guard.audit().records().iter().map(|r| r.state).collect();
        assert_eq!(states, vec![GuardState::Evaluating, GuardState::Approved]);
    }

    #[test]
    fn missing_permission_rejects_any_tier() {
        let guard = guard();
        let principal = Principal::agent("agent:limited").with_permission("read", "docs");
        let decision = guard.evaluate("state:write", "inventory", &principal, RiskTier::Low);
        assert!(decision.is_rejected());
        assert!(decision.reason.contains("lacks permission"));
    }

    #[test]
    fn high_tier_parks_pending() {
        let guard = guard();
        let decision = guard.evaluate("deploy", "api", &agent(), RiskTier::High);
        assert!(decision.is_pending());
        assert!(decision.approval_id.is_some());
        assert_eq!(guard.pending_count(), 1);
    }

    #[test]
    fn policy_escalates_declared_tier() {
        let policy = SafetyPolicy::new("prod").with_rule(SafetyRule::new("deploy:*", RiskTier::High));
        let guard = GoalGuard::new(GuardConfig::default().with_policy(policy));
        let decision = guard.evaluate("deploy:api", "prod", &agent(), RiskTier::Low);
        assert!(decision.is_pending());
        assert_eq!(decision.tier, RiskTier::High);
    }

    #[test]
    fn human_approval_resolves_high() {
        let guard = guard();
        let decision = guard.evaluate("deploy", "api", &agent(), RiskTier::High);
        let id = decision.approval_id.unwrap();
        let resolved = guard.resolve(id, true, &Principal::human("alice")).unwrap();
        assert!(resolved.is_approved());
        assert!(resolved.reason.contains("alice"));
        assert_eq!(guard.pending_count(), 0);
    }

    #[test]
    fn agent_cannot_resolve() {
        let guard = guard();
        let decision = guard.evaluate("deploy", "api", &agent(), RiskTier::High);
        let id = decision.approval_id.unwrap();
        let err = guard.resolve(id, true, &Principal::agent("agent:sneaky"));
        assert!(matches!(err, Err(GuardError::NotHuman(_))));
        // Still parked
        assert_eq!(guard.pending_count(), 1);
    }

    #[test]
    fn rejection_is_final() {
        let guard = guard();
        let decision = guard.evaluate("deploy", "api", &agent(), RiskTier::High);
        let id = decision.approval_id.unwrap();
        let resolved = guard.resolve(id, false, &Principal::human("alice")).unwrap();
        assert!(resolved.is_rejected());
        assert!(matches!(
            guard.resolve(id, true, &Principal::human("bob")),
            Err(GuardError::UnknownApproval(_))
        ));
    }

    #[test]
    fn critical_needs_two_distinct_humans() {
        let guard = guard();
        let decision = guard.evaluate("wipe", "db", &agent(), RiskTier::Critical);
        let id = decision.approval_id.unwrap();

        let first = guard.resolve(id, true, &Principal::human("alice")).unwrap();
        assert!(first.is_pending());

        // Same human cannot double-count
        assert!(matches!(
            guard.resolve(id, true, &Principal::human("alice")),
            Err(GuardError::DuplicateApprover(_))
        ));

        let second = guard.resolve(id, true, &Principal::human("bob")).unwrap();
        assert!(second.is_approved());
        assert!(second.reason.contains("alice"));
        assert!(second.reason.contains("bob"));
    }

    #[test]
    fn expired_approval_rejects_on_resolution() {
        let guard = GoalGuard::new(GuardConfig::default().with_approval_ttl_ms(0));
        let decision = guard.evaluate("deploy", "api", &agent(), RiskTier::High);
        let id = decision.approval_id.unwrap();
        assert!(matches!(
            guard.resolve(id, true, &Principal::human("alice")),
            Err(GuardError::Expired(_))
        ));
        let last = guard.audit().records().pop().unwrap();
        assert_eq!(last.state, GuardState::Rejected);
        assert!(last.reason.contains("expired"));
    }

    #[test]
    fn expire_overdue_sweeps_all() {
        let guard = GoalGuard::new(GuardConfig::default().with_approval_ttl_ms(0));
        guard.evaluate("a", "r", &agent(), RiskTier::High);
        guard.evaluate("b", "r", &agent(), RiskTier::High);
        assert_eq!(guard.expire_overdue(), 2);
        assert_eq!(guard.pending_count(), 0);
    }

    #[tokio::test]
    async fn wait_sees_resolution() {
        let guard = Arc::new(guard());
        let decision = guard.evaluate("deploy", "api", &agent(), RiskTier::High);
        let id = decision.approval_id.unwrap();

        let resolver = Arc::clone(&guard);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.resolve(id, true, &Principal::human("alice")).unwrap();
        });

        let decision = guard
            .wait_for_decision(id, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(decision.is_approved());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_timeout_rejects() {
        let guard = guard();
        let decision = guard.evaluate("deploy", "api", &agent(), RiskTier::High);
        let id = decision.approval_id.unwrap();

        let decision = guard
            .wait_for_decision(id, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(decision.is_rejected());
        assert!(decision.reason.contains("timed out"));
        assert_eq!(guard.pending_count(), 0);
    }

    #[tokio::test]
    async fn second_waiter_is_refused() {
        let guard = guard();
        let decision = guard.evaluate("deploy", "api", &agent(), RiskTier::High);
        let id = decision.approval_id.unwrap();

        // Take the receiver, then try again
        let first = guard.wait_for_decision(id, Duration::from_millis(10)).await;
        assert!(first.is_ok());
        let second = guard.wait_for_decision(id, Duration::from_millis(10)).await;
        assert!(matches!(second, Err(GuardError::UnknownApproval(_))));
    }
}
