//! The snapshot service

use crate::errors::{CortexError, CortexResult};
use crate::snapshot::{CombinedSnapshot, MemoryPointer, RollbackReport};
use chrono::Utc;
use keel_crv::GateResult;
use keel_guard::{GoalGuard, GuardState, PolicyDecision};
use keel_state::{EventLog, StateStore};
use keel_types::{Event, EventType, Principal, SnapshotId, TaskId, WorkflowId};
use serde_json::json;
use std::sync::{Arc, RwLock};

fn default_max_snapshots() -> usize {
    256
}

#[derive(Clone, Debug)]
pub struct CortexConfig {
    /// Snapshot retention; the oldest is evicted past this count.
    /// Zero keeps everything.
    pub max_snapshots: usize,
}

impl Default for CortexConfig {
    fn default() -> Self {
        Self {
            max_snapshots: default_max_snapshots(),
        }
    }
}

impl CortexConfig {
    pub fn with_max_snapshots(mut self, max: usize) -> Self {
        self.max_snapshots = max;
        self
    }
}

/// Content-addressed snapshot and rollback service.
///
/// Snapshots start unverified; a passing CRV gate result flips them.
/// Rollback to an unverified snapshot is a HIGH-tier action and routes
/// through the Goal-Guard; a verified one restores autonomously.
pub struct HipCortex {
    store: Arc<dyn StateStore>,
    events: Arc<dyn EventLog>,
    guard: Arc<GoalGuard>,
    config: CortexConfig,
    snapshots: RwLock<Vec<CombinedSnapshot>>,
    memory: RwLock<Vec<MemoryPointer>>,
}

impl HipCortex {
    pub fn new(
        store: Arc<dyn StateStore>,
        events: Arc<dyn EventLog>,
        guard: Arc<GoalGuard>,
        config: CortexConfig,
    ) -> Self {
        Self {
            store,
            events,
            guard,
            config,
            snapshots: RwLock::new(Vec::new()),
            memory: RwLock::new(Vec::new()),
        }
    }

    // ── Memory trace ─────────────────────────────────────────────────

    /// Append a content-addressed pointer to the memory trace. The
    /// payload itself lives wherever the caller keeps it; the trace
    /// records what it hashed to and when.
    pub fn record_memory(
        &self,
        entry_type: &str,
        payload: &serde_json::Value,
    ) -> CortexResult<MemoryPointer> {
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        let pointer = MemoryPointer::new(entry_type, &bytes);
        let mut memory = self.memory.write().map_err(|_| CortexError::LockPoisoned)?;
        memory.push(pointer.clone());
        tracing::debug!(entry_type, hash = %pointer.content_hash, "memory recorded");
        Ok(pointer)
    }

    // ── Snapshots ────────────────────────────────────────────────────

    /// Capture the store and the memory trace as one sealed snapshot.
    pub fn take_snapshot(
        &self,
        workflow_id: &WorkflowId,
        task_id: &TaskId,
        step_id: &str,
    ) -> CortexResult<CombinedSnapshot> {
        self.take_snapshot_with_metadata(workflow_id, task_id, step_id, serde_json::Value::Null)
    }

    /// Like [`HipCortex::take_snapshot`], carrying caller metadata.
    /// `{"critical": true}` marks the snapshot so a later rollback is
    /// classified Critical.
    pub fn take_snapshot_with_metadata(
        &self,
        workflow_id: &WorkflowId,
        task_id: &TaskId,
        step_id: &str,
        metadata: serde_json::Value,
    ) -> CortexResult<CombinedSnapshot> {
        let world = self.store.snapshot()?;
        let pointers = self
            .memory
            .read()
            .map_err(|_| CortexError::LockPoisoned)?
            .clone();
        let snapshot = CombinedSnapshot::new(
            workflow_id.clone(),
            task_id.clone(),
            step_id,
            world,
            pointers,
        )
        .with_metadata(metadata);

        {
            let mut snapshots = self
                .snapshots
                .write()
                .map_err(|_| CortexError::LockPoisoned)?;
            if self.config.max_snapshots > 0 && snapshots.len() >= self.config.max_snapshots {
                snapshots.remove(0);
            }
            snapshots.push(snapshot.clone());
        }

        tracing::info!(
            snapshot_id = %snapshot.id,
            workflow_id = %workflow_id,
            keys = snapshot.world_state.entries.len(),
            root = %snapshot.merkle_root,
            "snapshot taken"
        );
        self.events.append(
            Event::for_task(EventType::StateSnapshot, workflow_id.clone(), task_id.clone())
                .with_meta("snapshotId", json!(snapshot.id.as_str()))
                .with_meta("merkleRoot", json!(snapshot.merkle_root.to_hex()))
                .with_meta("stepId", json!(snapshot.step_id)),
        )?;
        Ok(snapshot)
    }

    /// Flip a snapshot to verified, but only on a clean gate pass.
    /// Returns whether it flipped.
    pub fn mark_verified(&self, id: &SnapshotId, gate: &GateResult) -> CortexResult<bool> {
        if !gate.passed || gate.blocked {
            return Ok(false);
        }
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| CortexError::LockPoisoned)?;
        match snapshots.iter_mut().find(|s| s.id == *id) {
            Some(snapshot) => {
                snapshot.verified = true;
                tracing::debug!(snapshot_id = %id, gate = %gate.gate, "snapshot verified");
                Ok(true)
            }
            None => Err(CortexError::SnapshotNotFound(id.clone())),
        }
    }

    /// Adopt a previously captured snapshot, stored hashes and all.
    /// Integrity is still checked at rollback time, so a snapshot
    /// tampered while persisted can never restore.
    pub fn import_snapshot(&self, snapshot: CombinedSnapshot) -> CortexResult<()> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| CortexError::LockPoisoned)?;
        if !snapshots.iter().any(|s| s.id == snapshot.id) {
            snapshots.push(snapshot);
        }
        Ok(())
    }

    pub fn get(&self, id: &SnapshotId) -> CortexResult<Option<CombinedSnapshot>> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| CortexError::LockPoisoned)?;
        Ok(snapshots.iter().find(|s| s.id == *id).cloned())
    }

    pub fn snapshots_for(&self, workflow_id: &WorkflowId) -> CortexResult<Vec<CombinedSnapshot>> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| CortexError::LockPoisoned)?;
        Ok(snapshots
            .iter()
            .filter(|s| s.workflow_id == *workflow_id)
            .cloned()
            .collect())
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }

    // ── Rollback ─────────────────────────────────────────────────────

    /// Restore the world to a snapshot.
    ///
    /// Ordered so that nothing mutates until every check has passed:
    /// fetch, integrity, tier classification, policy. The restore
    /// itself is a single atomic store operation, and the marker event
    /// references both the restored-from snapshot and a fresh capture
    /// of the pre-rollback world.
    pub fn rollback(
        &self,
        snapshot_id: &SnapshotId,
        principal: &Principal,
    ) -> CortexResult<RollbackReport> {
        let snapshot = self
            .get(snapshot_id)?
            .ok_or_else(|| CortexError::SnapshotNotFound(snapshot_id.clone()))?;
        let workflow_id = snapshot.workflow_id.clone();

        self.append_best_effort(
            Event::for_task(
                EventType::RollbackInitiated,
                workflow_id.clone(),
                snapshot.task_id.clone(),
            )
            .with_meta("snapshotId", json!(snapshot_id.as_str()))
            .with_meta("principal", json!(principal.id)),
        );

        if let Some((computed, stored)) = snapshot.integrity_violation() {
            let err = CortexError::Integrity {
                snapshot_id: snapshot_id.clone(),
                expected: computed.to_hex(),
                actual: stored.to_hex(),
            };
            tracing::error!(snapshot_id = %snapshot_id, "rollback refused: {err}");
            self.append_best_effort(
                Event::new(EventType::RollbackFailed, workflow_id)
                    .with_meta("snapshotId", json!(snapshot_id.as_str()))
                    .with_meta("reason", json!("integrity"))
                    .with_meta("computed", json!(computed.to_hex()))
                    .with_meta("stored", json!(stored.to_hex())),
            );
            return Err(err);
        }

        let tier = snapshot.classify_tier();
        let decision = if tier.requires_approval() {
            let decision = self.consult_guard(&snapshot, principal)?;
            self.append_best_effort(
                Event::new(EventType::RollbackPolicyDecision, workflow_id.clone())
                    .with_meta("snapshotId", json!(snapshot_id.as_str()))
                    .with_meta("state", json!(decision.state.to_string()))
                    .with_meta("reason", json!(decision.reason)),
            );
            if !decision.is_approved() {
                self.append_best_effort(
                    Event::new(EventType::RollbackFailed, workflow_id)
                        .with_meta("snapshotId", json!(snapshot_id.as_str()))
                        .with_meta("reason", json!("policy")),
                );
                return Err(CortexError::PolicyDenied {
                    reason: decision.reason,
                });
            }
            decision.state
        } else {
            GuardState::Approved
        };

        // Capture the outgoing world so the marker names both sides
        let previous = self.take_snapshot(&workflow_id, &snapshot.task_id, "pre_rollback")?;

        let live = self.store.snapshot()?;
        let restored_keys: Vec<String> = snapshot.world_state.entries.keys().cloned().collect();
        let removed_keys: Vec<String> = live
            .entries
            .keys()
            .filter(|key| !snapshot.world_state.entries.contains_key(*key))
            .cloned()
            .collect();

        self.store.restore(&snapshot.world_state)?;

        let report = RollbackReport {
            snapshot_id: snapshot_id.clone(),
            restored_keys,
            removed_keys,
            tier,
            decision,
            completed_at: Utc::now(),
        };
        tracing::info!(
            snapshot_id = %snapshot_id,
            workflow_id = %workflow_id,
            restored = report.restored_keys.len(),
            removed = report.removed_keys.len(),
            "rollback completed"
        );
        self.events.append(
            Event::new(EventType::RollbackCompleted, workflow_id)
                .with_meta("snapshotId", json!(snapshot_id.as_str()))
                .with_meta("previousSnapshotId", json!(previous.id.as_str()))
                .with_meta("restoredKeys", json!(report.restored_keys.len()))
                .with_meta("removedKeys", json!(report.removed_keys.len())),
        )?;
        Ok(report)
    }

    /// Roll back to the most recent verified snapshot of a workflow.
    pub fn rollback_to_last_verified(
        &self,
        workflow_id: &WorkflowId,
        principal: &Principal,
    ) -> CortexResult<RollbackReport> {
        let last = {
            let snapshots = self
                .snapshots
                .read()
                .map_err(|_| CortexError::LockPoisoned)?;
            snapshots
                .iter()
                .rev()
                .find(|s| s.workflow_id == *workflow_id && s.verified)
                .map(|s| s.id.clone())
        };
        match last {
            Some(id) => self.rollback(&id, principal),
            None => Err(CortexError::NoVerifiedSnapshot(workflow_id.clone())),
        }
    }

    /// One human requester resolves their own HIGH approval; CRITICAL
    /// still needs the second approver, so a lone principal is denied.
    fn consult_guard(
        &self,
        snapshot: &CombinedSnapshot,
        principal: &Principal,
    ) -> CortexResult<PolicyDecision> {
        let resource = snapshot.workflow_id.as_str().to_string();
        let mut decision =
            self.guard
                .evaluate("rollback", &resource, principal, snapshot.classify_tier());
        if decision.is_pending() && principal.is_human() {
            if let Some(approval_id) = decision.approval_id {
                decision = match self.guard.resolve(approval_id, true, principal) {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        return Err(CortexError::PolicyDenied {
                            reason: err.to_string(),
                        })
                    }
                };
            }
        }
        Ok(decision)
    }

    fn append_best_effort(&self, event: Event) {
        if let Err(err) = self.events.append(event) {
            tracing::error!("event append failed: {err}");
        }
    }
}
