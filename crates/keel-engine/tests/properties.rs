//! Property tests: scheduling order, conflict resolution, gate
//! containment, snapshot integrity and retry budgets hold for random
//! inputs, not just the curated scenarios.

use keel_coord::{Coordinator, CoordinatorConfig};
use keel_cortex::{CortexConfig, CortexError, HipCortex};
use keel_crv::{Gate, GateChain, GateConfig, NotNullValidator};
use keel_engine::{BuiltinExecutor, EngineConfig, Orchestrator, RunContext};
use keel_guard::{GoalGuard, GuardConfig};
use keel_state::{EventLog, MemoryEventLog, MemoryStateStore, StateStore};
use keel_types::{
    EventType, Principal, RetryPolicy, TaskId, TaskSpec, WorkflowId, WorkflowSpec, WorkflowStatus,
};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

// ── Helpers ──────────────────────────────────────────────────────────

struct Rig {
    store: Arc<MemoryStateStore>,
    events: Arc<MemoryEventLog>,
    orchestrator: Arc<Orchestrator>,
}

fn rig() -> Rig {
    let store = Arc::new(MemoryStateStore::new());
    let events = Arc::new(MemoryEventLog::new());
    let guard = Arc::new(GoalGuard::new(GuardConfig::default()));
    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default()));
    let cortex = Arc::new(HipCortex::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        Arc::clone(&events) as Arc<dyn EventLog>,
        Arc::clone(&guard),
        CortexConfig::default(),
    ));
    let gates = Arc::new(GateChain::new().with_gate(
        Gate::new(GateConfig::new("pre_commit")).with_validator(Arc::new(NotNullValidator)),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        Arc::clone(&events) as Arc<dyn EventLog>,
        gates,
        guard,
        coordinator,
        Arc::clone(&cortex),
        Arc::new(BuiltinExecutor::new()),
        EngineConfig::default(),
    ));
    Rig {
        store,
        events,
        orchestrator,
    }
}

fn operator() -> RunContext {
    RunContext::new(Principal::human("operator").with_permission("*", "*"))
}

/// Dependency lists for a random DAG: `deps[i]` only references tasks
/// with a smaller index, so the graph is acyclic by construction.
fn arb_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (2usize..8).prop_flat_map(|n| {
        prop::collection::vec(any::<bool>(), n * (n - 1) / 2).prop_map(move |bits| {
            let mut deps = vec![Vec::new(); n];
            let mut edge = 0;
            for i in 1..n {
                for j in 0..i {
                    if bits[edge] {
                        deps[i].push(j);
                    }
                    edge += 1;
                }
            }
            deps
        })
    })
}

// ── Property tests ───────────────────────────────────────────────────

proptest! {
    /// Every dependency sorts before its dependent, for any acyclic
    /// dependency structure.
    #[test]
    fn topo_order_respects_dependencies(dag in arb_dag()) {
        let names: Vec<String> = (0..dag.len()).map(|i| format!("t{i}")).collect();
        let mut spec = WorkflowSpec::new("wf-dag", "random dag");
        for name in &names {
            spec = spec.add_task(TaskSpec::new(name.clone(), name.clone()));
        }
        for (i, deps) in dag.iter().enumerate() {
            if deps.is_empty() {
                continue;
            }
            let after: Vec<&str> = deps.iter().map(|d| names[*d].as_str()).collect();
            spec = spec.depends(names[i].clone(), &after);
        }

        prop_assert!(spec.validate().is_ok());
        let order = spec.topological_order().unwrap();
        prop_assert_eq!(order.len(), dag.len());

        let position: HashMap<&TaskId, usize> =
            order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        for (i, deps) in dag.iter().enumerate() {
            let task = TaskId::new(names[i].clone());
            for dep in deps {
                let dep = TaskId::new(names[*dep].clone());
                prop_assert!(
                    position[&dep] < position[&task],
                    "{dep} must sort before {task}"
                );
            }
        }
    }

    /// N workflows incrementing one key concurrently never lose an
    /// update: version conflicts force the losers to re-read.
    #[test]
    fn concurrent_increments_never_lose_updates(writers in 2usize..=3) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let rig = rig();
            rig.store.create("counter", json!(0)).unwrap();

            let specs: Vec<WorkflowSpec> = (0..writers)
                .map(|i| {
                    WorkflowSpec::new(format!("wf-{i}"), "bump").add_task(
                        TaskSpec::new(format!("bump{i}"), "bump")
                            .with_inputs(json!({
                                "writes": [{ "key": "counter", "op": "increment", "value": 1 }]
                            }))
                            .with_retry(RetryPolicy::new(8, 2)),
                    )
                })
                .collect();

            let run = operator();
            let reports = futures::future::join_all(
                specs.iter().map(|spec| rig.orchestrator.execute(spec, &run)),
            )
            .await;
            for report in reports {
                prop_assert!(report.unwrap().succeeded());
            }

            let value = rig.store.read("counter").unwrap();
            prop_assert_eq!(value.value, json!(writers));
            prop_assert_eq!(value.version, writers as u64 + 1);
            Ok(())
        })?;
    }

    /// A blocked gate leaves the store exactly as it was: no key from
    /// the rejected write set may land, whatever else the set held.
    #[test]
    fn blocked_gates_leave_no_trace(
        valid in prop::collection::btree_map("[a-z]{2,8}", "[a-z]{0,12}", 1..5),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let rig = rig();
            let mut writes: Vec<serde_json::Value> = valid
                .iter()
                .map(|(key, value)| json!({ "key": key, "op": "put", "value": value }))
                .collect();
            // The poison key cannot collide with the generated ones
            writes.push(json!({ "key": "poison_key", "op": "put", "value": null }));

            let spec = WorkflowSpec::new("wf-block", "blocked")
                .add_task(TaskSpec::new("stage", "stage").with_inputs(json!({ "writes": writes })));
            let report = rig.orchestrator.execute(&spec, &operator()).await.unwrap();

            prop_assert_eq!(report.status, WorkflowStatus::Failed);
            prop_assert!(!rig.store.exists("poison_key"));
            for key in valid.keys() {
                prop_assert!(!rig.store.exists(key), "{key} leaked past a blocked gate");
            }
            Ok(())
        })?;
    }

    /// A snapshot whose content no longer matches its recorded Merkle
    /// root can never restore, wherever it was tampered.
    #[test]
    fn tampered_snapshots_never_restore(
        world in prop::collection::btree_map("[a-z]{1,6}", "[a-z]{1,12}", 1..6),
    ) {
        let source = rig();
        for (key, value) in &world {
            source.store.create(key, json!(value)).unwrap();
        }
        let guard = Arc::new(GoalGuard::new(GuardConfig::default()));
        let cortex = HipCortex::new(
            Arc::clone(&source.store) as Arc<dyn StateStore>,
            Arc::clone(&source.events) as Arc<dyn EventLog>,
            Arc::clone(&guard),
            CortexConfig::default(),
        );
        let snapshot = cortex
            .take_snapshot(&WorkflowId::new("wf-tamper"), &TaskId::new("seed"), "case")
            .unwrap();

        let mut forged = snapshot.clone();
        let key = world.keys().next().unwrap().clone();
        forged
            .world_state
            .entries
            .get_mut(&key)
            .unwrap()
            .value = json!({ "tampered": true });

        // A fresh cortex adopts the forged snapshot, as a restarted
        // process would from persisted history
        let adopted = rig();
        let other = HipCortex::new(
            Arc::clone(&adopted.store) as Arc<dyn StateStore>,
            Arc::clone(&adopted.events) as Arc<dyn EventLog>,
            guard,
            CortexConfig::default(),
        );
        other.import_snapshot(forged.clone()).unwrap();

        let auditor = Principal::human("auditor").with_permission("rollback", "*");
        let err = other.rollback(&forged.id, &auditor).unwrap_err();
        prop_assert!(
            matches!(err, CortexError::Integrity { .. }),
            "tamper must surface as an integrity error, got {err}"
        );
        prop_assert!(!adopted.store.exists(&key), "tampered restore must not mutate");
    }

    /// A task never executes more often than its retry budget allows.
    #[test]
    fn retry_budget_is_never_exceeded(max_attempts in 1u32..=4) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let rig = rig();
            let spec = WorkflowSpec::new("wf-budget", "budget").add_task(
                TaskSpec::new("doomed", "doomed")
                    .with_inputs(json!({ "fail_times": 1_000_000 }))
                    .with_retry(RetryPolicy::new(max_attempts, 1)),
            );

            let report = rig.orchestrator.execute(&spec, &operator()).await.unwrap();
            prop_assert_eq!(report.status, WorkflowStatus::Failed);

            let events = rig.events.events_for(&spec.id).unwrap();
            let started = events
                .iter()
                .filter(|e| e.event_type == EventType::TaskStarted)
                .count();
            let retried = events
                .iter()
                .filter(|e| e.event_type == EventType::TaskRetried)
                .count();
            // The first run is free; each retry draws on the budget
            prop_assert_eq!(started, max_attempts as usize + 1);
            prop_assert_eq!(retried, max_attempts as usize);

            let state = rig.orchestrator.workflow_state(&spec.id).unwrap().unwrap();
            prop_assert_eq!(
                state.task(&TaskId::new("doomed")).unwrap().attempts,
                max_attempts + 1
            );
            Ok(())
        })?;
    }
}
