//! Combined snapshots and their Merkle layout
//!
//! Leaf order is fixed: state entries sorted by key, then memory
//! pointers in the order they were recorded. Two processes hashing the
//! same snapshot always agree on the root.

use crate::hash::{merkle_root, ContentHash};
use chrono::{DateTime, Utc};
use keel_guard::GuardState;
use keel_types::{RiskTier, SnapshotId, StateEntry, StateSnapshot, TaskId, WorkflowId};
use serde::{Deserialize, Serialize};

/// Content-addressed reference to one memory trace entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPointer {
    pub entry_id: String,
    pub entry_type: String,
    pub content_hash: ContentHash,
    pub timestamp: DateTime<Utc>,
}

impl MemoryPointer {
    pub fn new(entry_type: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            entry_type: entry_type.into(),
            content_hash: ContentHash::hash(payload),
            timestamp: Utc::now(),
        }
    }
}

/// A point-in-time capture of the world plus the memory that shaped it.
///
/// `content_hash` and `merkle_root` are both the root at creation time;
/// storing the address twice means a tamper of either field is caught
/// by the integrity check.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedSnapshot {
    pub id: SnapshotId,
    pub taken_at: DateTime<Utc>,
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
    pub step_id: String,
    pub world_state: StateSnapshot,
    pub memory_pointers: Vec<MemoryPointer>,
    pub content_hash: ContentHash,
    pub merkle_root: ContentHash,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl CombinedSnapshot {
    pub fn new(
        workflow_id: WorkflowId,
        task_id: TaskId,
        step_id: impl Into<String>,
        world_state: StateSnapshot,
        memory_pointers: Vec<MemoryPointer>,
    ) -> Self {
        let mut snapshot = Self {
            id: SnapshotId::generate(),
            taken_at: Utc::now(),
            workflow_id,
            task_id,
            step_id: step_id.into(),
            world_state,
            memory_pointers,
            content_hash: ContentHash::hash(b""),
            merkle_root: ContentHash::hash(b""),
            verified: false,
            metadata: serde_json::Value::Null,
        };
        let root = snapshot.compute_root();
        snapshot.content_hash = root;
        snapshot.merkle_root = root;
        snapshot
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// State leaves first (key order), then memory leaves
    /// (recording order).
    pub fn leaves(&self) -> Vec<ContentHash> {
        let mut leaves: Vec<ContentHash> = self
            .world_state
            .entries
            .iter()
            .map(|(key, entry)| entry_leaf(key, entry))
            .collect();
        leaves.extend(self.memory_pointers.iter().map(|p| p.content_hash));
        leaves
    }

    pub fn compute_root(&self) -> ContentHash {
        merkle_root(&self.leaves())
    }

    /// `None` when intact; otherwise `(computed, stored)` for the first
    /// stored address that disagrees.
    pub fn integrity_violation(&self) -> Option<(ContentHash, ContentHash)> {
        let computed = self.compute_root();
        if computed != self.merkle_root {
            return Some((computed, self.merkle_root));
        }
        if computed != self.content_hash {
            return Some((computed, self.content_hash));
        }
        None
    }

    /// Restore risk: critical-marked snapshots are Critical, anything
    /// unverified is High, a verified snapshot restores autonomously.
    pub fn classify_tier(&self) -> RiskTier {
        if self
            .metadata
            .get("critical")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            RiskTier::Critical
        } else if !self.verified {
            RiskTier::High
        } else {
            RiskTier::Low
        }
    }
}

fn entry_leaf(key: &str, entry: &StateEntry) -> ContentHash {
    // Canonical leaf bytes: key, version, serialized value
    let value = serde_json::to_vec(&entry.value).unwrap_or_default();
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(&entry.version.to_le_bytes());
    hasher.update(&value);
    ContentHash::from(*hasher.finalize().as_bytes())
}

/// What a completed rollback did.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub snapshot_id: SnapshotId,
    /// Keys now matching the snapshot
    pub restored_keys: Vec<String>,
    /// Live keys absent from the snapshot, removed by the restore
    pub removed_keys: Vec<String>,
    pub tier: RiskTier,
    pub decision: GuardState,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn world(pairs: &[(&str, serde_json::Value)]) -> StateSnapshot {
        let entries: BTreeMap<String, StateEntry> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), StateEntry::new(*key, value.clone())))
            .collect();
        StateSnapshot::new(entries)
    }

    fn snapshot(pairs: &[(&str, serde_json::Value)]) -> CombinedSnapshot {
        CombinedSnapshot::new(
            WorkflowId::new("wf-1"),
            TaskId::new("t1"),
            "step-1",
            world(pairs),
            Vec::new(),
        )
    }

    #[test]
    fn fresh_snapshot_is_intact_and_unverified() {
        let snap = snapshot(&[("a", json!(1)), ("b", json!("x"))]);
        assert!(snap.integrity_violation().is_none());
        assert!(!snap.verified);
        assert_eq!(snap.content_hash, snap.merkle_root);
    }

    #[test]
    fn root_depends_on_values_and_versions() {
        let a = snapshot(&[("k", json!(1))]);
        let b = snapshot(&[("k", json!(2))]);
        assert_ne!(a.merkle_root, b.merkle_root);

        let mut versioned = world(&[("k", json!(1))]);
        if let Some(entry) = versioned.entries.get_mut("k") {
            entry.version = 7;
        }
        let c = CombinedSnapshot::new(
            WorkflowId::new("wf-1"),
            TaskId::new("t1"),
            "step-1",
            versioned,
            Vec::new(),
        );
        assert_ne!(a.merkle_root, c.merkle_root);
    }

    #[test]
    fn memory_pointers_extend_the_leaf_layer() {
        let bare = snapshot(&[("a", json!(1))]);
        let with_memory = CombinedSnapshot::new(
            WorkflowId::new("wf-1"),
            TaskId::new("t1"),
            "step-1",
            world(&[("a", json!(1))]),
            vec![MemoryPointer::new("audit", b"observed")],
        );
        assert_ne!(bare.merkle_root, with_memory.merkle_root);
    }

    #[test]
    fn tampered_root_is_a_violation() {
        let mut snap = snapshot(&[("a", json!(1))]);
        snap.merkle_root = ContentHash::hash(b"forged");
        let (computed, stored) = snap.integrity_violation().unwrap();
        assert_eq!(stored, ContentHash::hash(b"forged"));
        assert_ne!(computed, stored);
    }

    #[test]
    fn tampered_content_hash_is_also_a_violation() {
        let mut snap = snapshot(&[("a", json!(1))]);
        snap.content_hash = ContentHash::hash(b"forged");
        assert!(snap.integrity_violation().is_some());
    }

    #[test]
    fn tier_classification() {
        let mut snap = snapshot(&[("a", json!(1))]);
        assert_eq!(snap.classify_tier(), RiskTier::High);
        snap.verified = true;
        assert_eq!(snap.classify_tier(), RiskTier::Low);
        let critical = snap.with_metadata(json!({"critical": true}));
        assert_eq!(critical.classify_tier(), RiskTier::Critical);
    }
}
