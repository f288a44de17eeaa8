//! Run and task contexts
//!
//! Executors never touch the store directly. They stage writes into a
//! TaskContext; the orchestrator diffs, validates and commits them
//! after the executor returns. A failed or blocked attempt discards
//! the staged set and the world is untouched.

use keel_state::{StateError, StateResult, StateStore};
use keel_types::{AgentId, Principal, StateEntry, StateSnapshot, TaskId, WorkflowId};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Identity under which a workflow run executes.
#[derive(Clone, Debug)]
pub struct RunContext {
    /// Principal the policy guard evaluates
    pub principal: Principal,
    /// Agent identity used for resource locks
    pub agent: AgentId,
    pub correlation_id: Uuid,
}

impl RunContext {
    pub fn new(principal: Principal) -> Self {
        let agent = AgentId::new(format!("agent:{}", principal.id));
        Self {
            principal,
            agent,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn with_agent(mut self, agent: AgentId) -> Self {
        self.agent = agent;
        self
    }
}

/// One staged mutation, applied at commit time.
#[derive(Clone, Debug, PartialEq)]
pub enum StagedWrite {
    Put(serde_json::Value),
    Delete,
}

/// Read-through store view with a buffered write set.
///
/// Reads see staged writes layered over the live store. Prior task
/// outputs are available by task id.
pub struct TaskContext {
    store: Arc<dyn StateStore>,
    workflow_id: WorkflowId,
    task_id: TaskId,
    outputs: BTreeMap<TaskId, serde_json::Value>,
    staged: BTreeMap<String, StagedWrite>,
}

impl TaskContext {
    pub(crate) fn new(
        store: Arc<dyn StateStore>,
        workflow_id: WorkflowId,
        task_id: TaskId,
        outputs: BTreeMap<TaskId, serde_json::Value>,
    ) -> Self {
        Self {
            store,
            workflow_id,
            task_id,
            outputs,
            staged: BTreeMap::new(),
        }
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Current value of a key, staged writes included.
    pub fn get(&self, key: &str) -> StateResult<Option<serde_json::Value>> {
        match self.staged.get(key) {
            Some(StagedWrite::Put(value)) => Ok(Some(value.clone())),
            Some(StagedWrite::Delete) => Ok(None),
            None => match self.store.read(key) {
                Ok(entry) => Ok(Some(entry.value)),
                Err(StateError::NotFound { .. }) => Ok(None),
                Err(err) => Err(err),
            },
        }
    }

    /// Stage a create-or-update for `key`.
    pub fn put(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.staged.insert(key.into(), StagedWrite::Put(value));
    }

    /// Stage a delete for `key`.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.staged.insert(key.into(), StagedWrite::Delete);
    }

    /// Output of an already-completed task in this run.
    pub fn output_of(&self, task: &TaskId) -> Option<&serde_json::Value> {
        self.outputs.get(task)
    }

    pub fn has_staged_writes(&self) -> bool {
        !self.staged.is_empty()
    }

    pub fn staged_keys(&self) -> impl Iterator<Item = &str> {
        self.staged.keys().map(String::as_str)
    }

    pub(crate) fn discard(&mut self) {
        self.staged.clear();
    }

    /// The world as it would look after committing the staged set on
    /// top of `before`. Used to compute the diff the gates review.
    pub(crate) fn projected(&self, before: &StateSnapshot) -> StateSnapshot {
        let mut entries = before.entries.clone();
        for (key, write) in &self.staged {
            match write {
                StagedWrite::Put(value) => {
                    let entry = match entries.get(key) {
                        Some(current) => current.next(value.clone()),
                        None => StateEntry::new(key.clone(), value.clone()),
                    };
                    entries.insert(key.clone(), entry);
                }
                StagedWrite::Delete => {
                    entries.remove(key);
                }
            }
        }
        StateSnapshot::new(entries)
    }

    /// Apply the staged set through the store's optimistic operations,
    /// using the versions observed in `before`. A concurrent writer
    /// surfaces as `Conflict`; the caller retries the whole attempt.
    pub(crate) fn commit(&self, before: &StateSnapshot) -> StateResult<usize> {
        let mut applied = 0;
        for (key, write) in &self.staged {
            match write {
                StagedWrite::Put(value) => match before.get(key) {
                    Some(entry) => {
                        self.store.update(key, value.clone(), entry.version)?;
                    }
                    None => {
                        self.store.create(key, value.clone())?;
                    }
                },
                StagedWrite::Delete => {
                    if let Some(entry) = before.get(key) {
                        self.store.delete(key, entry.version)?;
                    }
                }
            }
            applied += 1;
        }
        Ok(applied)
    }
}
