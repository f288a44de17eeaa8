//! Task executors
//!
//! The orchestrator is generic over how a task actually runs. An
//! executor receives the task spec and a context, stages writes and
//! returns an output value. Side effects outside the context are the
//! executor's own responsibility.

use crate::context::TaskContext;
use crate::errors::ExecError;
use async_trait::async_trait;
use keel_types::{TaskId, TaskSpec};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Runs a single task attempt.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &TaskSpec, ctx: &mut TaskContext) -> Result<Value, ExecError>;
}

/// Interpreter for declarative task inputs.
///
/// Drives tasks whose `inputs` describe what to do instead of pointing
/// at external code:
///
/// ```json
/// {
///   "writes": [
///     { "key": "orders:42", "op": "put", "value": { "status": "paid" } },
///     { "key": "counters:paid", "op": "increment", "value": 1 },
///     { "key": "carts:42", "op": "delete" }
///   ],
///   "fail_times": 2,
///   "sleep_ms": 50,
///   "output": { "done": true }
/// }
/// ```
///
/// `fail_times` fails the first N attempts of the task, which is how
/// retry behavior is exercised end to end.
pub struct BuiltinExecutor {
    invocations: Mutex<HashMap<TaskId, u32>>,
}

impl BuiltinExecutor {
    pub fn new() -> Self {
        Self {
            invocations: Mutex::new(HashMap::new()),
        }
    }

    fn bump_invocation(&self, task: &TaskId) -> Result<u32, ExecError> {
        let mut counts = self
            .invocations
            .lock()
            .map_err(|_| ExecError::failed("invocation counter poisoned"))?;
        let count = counts.entry(task.clone()).or_insert(0);
        *count += 1;
        Ok(*count)
    }
}

impl Default for BuiltinExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for BuiltinExecutor {
    async fn execute(&self, task: &TaskSpec, ctx: &mut TaskContext) -> Result<Value, ExecError> {
        let inputs = &task.inputs;
        let invocation = self.bump_invocation(&task.id)?;

        if let Some(fail_times) = inputs.get("fail_times").and_then(Value::as_u64) {
            if u64::from(invocation) <= fail_times {
                return Err(ExecError::failed(format!(
                    "simulated failure {invocation} of {fail_times}"
                )));
            }
        }

        if let Some(sleep_ms) = inputs.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }

        if let Some(writes) = inputs.get("writes").and_then(Value::as_array) {
            for write in writes {
                let Some(key) = write.get("key").and_then(Value::as_str) else {
                    return Err(ExecError::failed("write entry missing 'key'"));
                };
                let op = write.get("op").and_then(Value::as_str).unwrap_or("put");
                match op {
                    "put" => {
                        let value = write.get("value").cloned().unwrap_or(Value::Null);
                        ctx.put(key, value);
                    }
                    "delete" => ctx.delete(key),
                    "increment" => {
                        let step = write.get("value").and_then(Value::as_i64).unwrap_or(1);
                        let current = ctx
                            .get(key)?
                            .as_ref()
                            .and_then(Value::as_i64)
                            .unwrap_or(0);
                        ctx.put(key, json!(current + step));
                    }
                    other => {
                        return Err(ExecError::failed(format!("unknown write op '{other}'")));
                    }
                }
            }
        }

        let output = inputs
            .get("output")
            .cloned()
            .unwrap_or_else(|| json!({ "task": task.id.as_str(), "ok": true }));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_state::{MemoryStateStore, StateStore};
    use keel_types::WorkflowId;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn ctx_for(store: &Arc<MemoryStateStore>, task: &str) -> TaskContext {
        TaskContext::new(
            Arc::clone(store) as Arc<dyn StateStore>,
            WorkflowId::new("wf"),
            TaskId::new(task),
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn stages_declared_writes() {
        let store = Arc::new(MemoryStateStore::new());
        store.create("stock", json!(5)).unwrap();
        let exec = BuiltinExecutor::new();
        let task = TaskSpec::new("t", "t").with_inputs(json!({
            "writes": [
                { "key": "order", "op": "put", "value": { "id": 42 } },
                { "key": "stock", "op": "increment", "value": -1 }
            ],
            "output": { "placed": true }
        }));
        let mut ctx = ctx_for(&store, "t");

        let output = exec.execute(&task, &mut ctx).await.unwrap();
        assert_eq!(output, json!({ "placed": true }));
        assert_eq!(ctx.get("order").unwrap(), Some(json!({ "id": 42 })));
        assert_eq!(ctx.get("stock").unwrap(), Some(json!(4)));
    }

    #[tokio::test]
    async fn fails_the_first_n_attempts() {
        let store = Arc::new(MemoryStateStore::new());
        let exec = BuiltinExecutor::new();
        let task = TaskSpec::new("flaky", "flaky").with_inputs(json!({ "fail_times": 2 }));

        for _ in 0..2 {
            let mut ctx = ctx_for(&store, "flaky");
            assert!(exec.execute(&task, &mut ctx).await.is_err());
        }
        let mut ctx = ctx_for(&store, "flaky");
        assert!(exec.execute(&task, &mut ctx).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_unknown_ops() {
        let store = Arc::new(MemoryStateStore::new());
        let exec = BuiltinExecutor::new();
        let task = TaskSpec::new("bad", "bad").with_inputs(json!({
            "writes": [{ "key": "k", "op": "merge" }]
        }));
        let mut ctx = ctx_for(&store, "bad");
        let err = exec.execute(&task, &mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("unknown write op"));
    }

    #[tokio::test]
    async fn default_output_names_the_task() {
        let store = Arc::new(MemoryStateStore::new());
        let exec = BuiltinExecutor::new();
        let task = TaskSpec::new("quiet", "quiet");
        let mut ctx = ctx_for(&store, "quiet");
        let output = exec.execute(&task, &mut ctx).await.unwrap();
        assert_eq!(output, json!({ "task": "quiet", "ok": true }));
    }
}
