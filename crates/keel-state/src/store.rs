//! The versioned state store
//!
//! Conflict detection is optimistic: readers take no locks, writers name
//! the version they based their write on. History is append-only per
//! key; a delete hides the key from reads but keeps its versions, so
//! audits and rollbacks can still see them.

use crate::{StateError, StateResult};
use chrono::Utc;
use keel_types::{StateEntry, StateSnapshot};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Versioned key/value storage with optimistic concurrency.
///
/// Implementations must keep per-key versions strictly increasing for
/// every path except [`StateStore::restore`], which deliberately rewinds
/// live versions to the snapshot's recorded ones.
pub trait StateStore: Send + Sync {
    /// Insert a fresh key. Fails with `AlreadyExists` if the key is live.
    fn create(&self, key: &str, value: serde_json::Value) -> StateResult<StateEntry> {
        self.create_with_metadata(key, value, None)
    }

    /// [`StateStore::create`] with an annotation carried on the entry.
    fn create_with_metadata(
        &self,
        key: &str,
        value: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> StateResult<StateEntry>;

    /// Latest live version of a key.
    fn read(&self, key: &str) -> StateResult<StateEntry>;

    /// A specific historical version, whether or not the key is live.
    fn read_version(&self, key: &str, version: u64) -> StateResult<StateEntry>;

    /// Replace a key's value. `expected_version` must match the live
    /// version or the call fails with `Conflict` and changes nothing.
    fn update(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: u64,
    ) -> StateResult<StateEntry> {
        self.update_with_metadata(key, value, expected_version, None)
    }

    /// [`StateStore::update`] with an annotation carried on the entry.
    fn update_with_metadata(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: u64,
        metadata: Option<serde_json::Value>,
    ) -> StateResult<StateEntry>;

    /// Remove a key from reads. History is retained.
    fn delete(&self, key: &str, expected_version: u64) -> StateResult<()>;

    /// Immutable copy of all live entries.
    fn snapshot(&self) -> StateResult<StateSnapshot>;

    /// Replace the live world with the snapshot's entries, verbatim.
    /// Keys absent from the snapshot become deleted. The restore itself
    /// is appended to each key's history.
    fn restore(&self, snapshot: &StateSnapshot) -> StateResult<()>;

    /// Full version history of a key, oldest first.
    fn history(&self, key: &str) -> StateResult<Vec<StateEntry>>;

    fn exists(&self, key: &str) -> bool {
        self.read(key).is_ok()
    }
}

#[derive(Debug, Default)]
struct KeyHistory {
    live: bool,
    versions: Vec<StateEntry>,
}

impl KeyHistory {
    fn current(&self) -> Option<&StateEntry> {
        if self.live {
            self.versions.last()
        } else {
            None
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.last().map(|e| e.version + 1).unwrap_or(1)
    }
}

/// In-memory [`StateStore`].
///
/// The kernel's default store; also what the tests run against. All
/// operations take the single map lock, so multi-key restore is atomic.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, KeyHistory>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn create_with_metadata(
        &self,
        key: &str,
        value: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> StateResult<StateEntry> {
        let mut entries = self.entries.write().map_err(|_| StateError::LockPoisoned)?;
        let history = entries.entry(key.to_string()).or_default();
        if history.live {
            return Err(StateError::AlreadyExists {
                key: key.to_string(),
            });
        }
        // A re-created key continues its version sequence so versions
        // stay strictly increasing across delete/create.
        let now = Utc::now();
        let entry = StateEntry {
            key: key.to_string(),
            value,
            version: history.next_version(),
            metadata,
            created_at: now,
            updated_at: now,
        };
        history.versions.push(entry.clone());
        history.live = true;
        Ok(entry)
    }

    fn read(&self, key: &str) -> StateResult<StateEntry> {
        let entries = self.entries.read().map_err(|_| StateError::LockPoisoned)?;
        entries
            .get(key)
            .and_then(KeyHistory::current)
            .cloned()
            .ok_or_else(|| StateError::NotFound {
                key: key.to_string(),
            })
    }

    fn read_version(&self, key: &str, version: u64) -> StateResult<StateEntry> {
        let entries = self.entries.read().map_err(|_| StateError::LockPoisoned)?;
        let history = entries.get(key).ok_or_else(|| StateError::NotFound {
            key: key.to_string(),
        })?;
        history
            .versions
            .iter()
            .rev()
            .find(|e| e.version == version)
            .cloned()
            .ok_or(StateError::VersionNotFound {
                key: key.to_string(),
                version,
            })
    }

    fn update_with_metadata(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: u64,
        metadata: Option<serde_json::Value>,
    ) -> StateResult<StateEntry> {
        let mut entries = self.entries.write().map_err(|_| StateError::LockPoisoned)?;
        let history = entries.get_mut(key).ok_or_else(|| StateError::NotFound {
            key: key.to_string(),
        })?;
        let current = history.current().ok_or_else(|| StateError::NotFound {
            key: key.to_string(),
        })?;
        if current.version != expected_version {
            return Err(StateError::Conflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }
        let mut entry = current.next(value);
        entry.metadata = metadata;
        history.versions.push(entry.clone());
        Ok(entry)
    }

    fn delete(&self, key: &str, expected_version: u64) -> StateResult<()> {
        let mut entries = self.entries.write().map_err(|_| StateError::LockPoisoned)?;
        let history = entries.get_mut(key).ok_or_else(|| StateError::NotFound {
            key: key.to_string(),
        })?;
        let current = history.current().ok_or_else(|| StateError::NotFound {
            key: key.to_string(),
        })?;
        if current.version != expected_version {
            return Err(StateError::Conflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }
        history.live = false;
        Ok(())
    }

    fn snapshot(&self) -> StateResult<StateSnapshot> {
        let entries = self.entries.read().map_err(|_| StateError::LockPoisoned)?;
        let live: BTreeMap<String, StateEntry> = entries
            .iter()
            .filter_map(|(key, history)| history.current().map(|e| (key.clone(), e.clone())))
            .collect();
        Ok(StateSnapshot::new(live))
    }

    fn restore(&self, snapshot: &StateSnapshot) -> StateResult<()> {
        let mut entries = self.entries.write().map_err(|_| StateError::LockPoisoned)?;
        for history in entries.values_mut() {
            history.live = false;
        }
        for (key, entry) in &snapshot.entries {
            let history = entries.entry(key.clone()).or_default();
            history.versions.push(entry.clone());
            history.live = true;
        }
        tracing::info!(
            snapshot_id = %snapshot.id,
            keys = snapshot.entries.len(),
            "state restored from snapshot"
        );
        Ok(())
    }

    fn history(&self, key: &str) -> StateResult<Vec<StateEntry>> {
        let entries = self.entries.read().map_err(|_| StateError::LockPoisoned)?;
        entries
            .get(key)
            .map(|h| h.versions.clone())
            .ok_or_else(|| StateError::NotFound {
                key: key.to_string(),
            })
    }
}
