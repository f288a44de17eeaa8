//! Versioned world state
//!
//! World state is a key/value map where every write bumps a per-key
//! version. Snapshots are immutable copies; diffs are the reviewable
//! unit of change that flows through commit validation.

use crate::SnapshotId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One versioned key in the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: serde_json::Value,
    /// Monotonic per key, starting at 1
    pub version: u64,
    /// Caller annotation for this version; carried, never interpreted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StateEntry {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            value,
            version: 1,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Successor entry holding `value` at version + 1. Metadata describes
    /// one version and does not carry forward.
    pub fn next(&self, value: serde_json::Value) -> Self {
        Self {
            key: self.key.clone(),
            value,
            version: self.version + 1,
            metadata: None,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }
}

/// Immutable copy of the whole store at one instant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: SnapshotId,
    pub taken_at: DateTime<Utc>,
    /// Key-ordered so iteration and hashing are deterministic
    pub entries: BTreeMap<String, StateEntry>,
}

impl StateSnapshot {
    pub fn new(entries: BTreeMap<String, StateEntry>) -> Self {
        Self {
            id: SnapshotId::generate(),
            taken_at: Utc::now(),
            entries,
        }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&StateEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changes that turn `self` into `later`, ordered by key.
    pub fn diff(&self, later: &StateSnapshot) -> Vec<StateDiff> {
        let now = Utc::now();
        let mut diffs = Vec::new();
        for (key, after) in &later.entries {
            match self.entries.get(key) {
                None => diffs.push(StateDiff {
                    key: key.clone(),
                    op: DiffOp::Create,
                    before: None,
                    after: Some(after.clone()),
                    timestamp: now,
                }),
                Some(before) if before.version != after.version || before.value != after.value => {
                    diffs.push(StateDiff {
                        key: key.clone(),
                        op: DiffOp::Update,
                        before: Some(before.clone()),
                        after: Some(after.clone()),
                        timestamp: now,
                    })
                }
                Some(_) => {}
            }
        }
        for (key, before) in &self.entries {
            if !later.entries.contains_key(key) {
                diffs.push(StateDiff {
                    key: key.clone(),
                    op: DiffOp::Delete,
                    before: Some(before.clone()),
                    after: None,
                    timestamp: now,
                });
            }
        }
        diffs.sort_by(|a, b| a.key.cmp(&b.key));
        diffs
    }

    /// Value-level equality, ignoring snapshot ids and capture times.
    pub fn same_world(&self, other: &StateSnapshot) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries.iter().all(|(key, entry)| {
            other
                .entries
                .get(key)
                .map(|o| o.value == entry.value && o.version == entry.version)
                .unwrap_or(false)
        })
    }
}

/// The kind of change a diff describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffOp {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for DiffOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiffOp::Create => write!(f, "create"),
            DiffOp::Update => write!(f, "update"),
            DiffOp::Delete => write!(f, "delete"),
        }
    }
}

/// One key's change between two snapshots.
///
/// `before` is absent for creates, `after` for deletes. This is the
/// only shape commit validation ever sees.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    pub key: String,
    pub op: DiffOp,
    pub before: Option<StateEntry>,
    pub after: Option<StateEntry>,
    pub timestamp: DateTime<Utc>,
}

impl StateDiff {
    pub fn new(key: impl Into<String>, op: DiffOp, before: Option<StateEntry>, after: Option<StateEntry>) -> Self {
        Self {
            key: key.into(),
            op,
            before,
            after,
            timestamp: Utc::now(),
        }
    }

    /// The value being written, when the diff writes one.
    pub fn new_value(&self) -> Option<&serde_json::Value> {
        self.after.as_ref().map(|e| &e.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(pairs: &[(&str, serde_json::Value, u64)]) -> StateSnapshot {
        let entries = pairs
            .iter()
            .map(|(key, value, version)| {
                let mut entry = StateEntry::new(*key, value.clone());
                entry.version = *version;
                ((*key).to_string(), entry)
            })
            .collect();
        StateSnapshot::new(entries)
    }

    #[test]
    fn entry_next_bumps_version() {
        let entry = StateEntry::new("k", json!(1));
        assert_eq!(entry.version, 1);
        let next = entry.next(json!(2));
        assert_eq!(next.version, 2);
        assert_eq!(next.created_at, entry.created_at);
    }

    #[test]
    fn diff_classifies_ops() {
        let before = snap(&[("a", json!(1), 1), ("b", json!(2), 1)]);
        let after = snap(&[("b", json!(3), 2), ("c", json!(4), 1)]);
        let diffs = before.diff(&after);
        assert_eq!(diffs.len(), 3);
        assert_eq!(diffs[0].key, "a");
        assert_eq!(diffs[0].op, DiffOp::Delete);
        assert_eq!(diffs[1].key, "b");
        assert_eq!(diffs[1].op, DiffOp::Update);
        assert_eq!(diffs[2].key, "c");
        assert_eq!(diffs[2].op, DiffOp::Create);
    }

    #[test]
    fn identical_snapshots_diff_empty() {
        let a = snap(&[("a", json!(1), 1)]);
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn diffs_are_key_sorted() {
        let before = snap(&[]);
        let after = snap(&[("z", json!(1), 1), ("a", json!(1), 1), ("m", json!(1), 1)]);
        let keys: Vec<_> = before.diff(&after).into_iter().map(|d| d.key).collect();
        assert_eq!(keys, vec!["a", "m", "z"]);
    }

    #[test]
    fn same_world_ignores_snapshot_identity() {
        let a = snap(&[("a", json!(1), 1)]);
        let mut b = a.clone();
        b.id = SnapshotId::generate();
        assert!(a.same_world(&b));
        let c = snap(&[("a", json!(2), 1)]);
        assert!(!a.same_world(&c));
    }
}
