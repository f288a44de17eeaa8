//! Subcommand handlers.
//!
//! `run` builds the full kernel stack over an in-memory store, seeds it
//! from any state recorded by an earlier invocation, executes the
//! workflow and persists the outcome. Two files live next to the JSONL
//! event log under `<state-dir>/<workflow-id>/`: `state.json`, the
//! committed world at the end of the run, and `snapshots.json`, the
//! content-addressed snapshot index `rollback` restores from.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use keel_coord::{Coordinator, CoordinatorConfig};
use keel_cortex::{CombinedSnapshot, CortexConfig, HipCortex};
use keel_crv::{Gate, GateChain, GateConfig, MonotonicVersionValidator, NotNullValidator};
use keel_engine::{BuiltinExecutor, EngineConfig, Orchestrator, RunContext};
use keel_guard::{GoalGuard, GuardConfig};
use keel_state::{EventLog, JsonlEventLog, MemoryStateStore, StateStore};
use keel_types::{Principal, SnapshotId, StateSnapshot, TaskSpec, WorkflowId, WorkflowSpec};

use crate::errors::{CliError, CliResult};
use crate::{RollbackArgs, RunArgs};

// ── Run ──────────────────────────────────────────────────────────────

pub async fn run(args: RunArgs) -> CliResult<()> {
    let spec = load_spec(&args.file)?;
    let workflow_id = spec.id.clone();

    let store = Arc::new(MemoryStateStore::new());
    let resumed = seed_store(&store, &state_path(&args.state_dir, &workflow_id))?;
    if resumed {
        println!("resuming workflow {workflow_id} from recorded state");
    }

    let events = Arc::new(JsonlEventLog::new(&args.state_dir));
    let guard = Arc::new(GoalGuard::new(GuardConfig::default()));
    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default()));
    let _sweep = coordinator.spawn_sweep();

    let cortex = Arc::new(HipCortex::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        Arc::clone(&events) as Arc<dyn EventLog>,
        Arc::clone(&guard),
        CortexConfig::default(),
    ));
    seed_snapshots(&cortex, &snapshots_path(&args.state_dir, &workflow_id))?;

    let gates = Arc::new(
        GateChain::new().with_gate(
            Gate::new(GateConfig::new("pre_commit"))
                .with_validator(Arc::new(NotNullValidator))
                .with_validator(Arc::new(MonotonicVersionValidator)),
        ),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        Arc::clone(&events) as Arc<dyn EventLog>,
        gates,
        guard,
        Arc::clone(&coordinator),
        Arc::clone(&cortex),
        Arc::new(BuiltinExecutor::new()),
        EngineConfig::default(),
    ));
    let _bridge = orchestrator.spawn_event_bridge();

    let principal = Principal::human(&args.principal).with_permission("*", "*");
    let outcome = orchestrator
        .execute(&spec, &RunContext::new(principal))
        .await;

    // Persist whatever committed, even when the run errored out.
    persist(&store, &cortex, &args.state_dir, &workflow_id)?;

    let report = outcome?;
    for (task_id, status) in &report.tasks {
        println!("  {task_id}: {status}");
    }
    if report.succeeded() {
        println!("workflow {workflow_id} succeeded");
        Ok(())
    } else {
        println!("workflow {workflow_id} failed");
        Err(CliError::RunFailed)
    }
}

// ── Rollback ─────────────────────────────────────────────────────────

pub fn rollback(args: RollbackArgs) -> CliResult<()> {
    let workflow_id = WorkflowId::new(&args.workflow);
    let snapshot_id = SnapshotId::new(&args.snapshot);

    let store = Arc::new(MemoryStateStore::new());
    if !seed_store(&store, &state_path(&args.state_dir, &workflow_id))? {
        return Err(CliError::NoRecordedState(workflow_id));
    }

    let events = Arc::new(JsonlEventLog::new(&args.state_dir));
    let guard = Arc::new(GoalGuard::new(GuardConfig::default()));
    let cortex = HipCortex::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        Arc::clone(&events) as Arc<dyn EventLog>,
        guard,
        CortexConfig::default(),
    );
    seed_snapshots(&cortex, &snapshots_path(&args.state_dir, &workflow_id))?;

    let principal = Principal::human(&args.user).with_permission("rollback", "*");
    let report = cortex.rollback(&snapshot_id, &principal)?;

    persist(&store, &cortex, &args.state_dir, &workflow_id)?;

    println!(
        "rolled back workflow {workflow_id} to snapshot {}: {} keys restored, {} removed",
        report.snapshot_id,
        report.restored_keys.len(),
        report.removed_keys.len()
    );
    Ok(())
}

// ── Inspect ──────────────────────────────────────────────────────────

pub fn inspect(file: &Path) -> CliResult<()> {
    let spec = load_spec(file)?;
    let order = spec.topological_order()?;

    println!(
        "workflow {} v{}: {} schedulable tasks",
        spec.id,
        spec.version,
        order.len()
    );
    for (position, task_id) in order.iter().enumerate() {
        let Some(task) = spec.task(task_id) else {
            continue;
        };
        let mut line = format!("  {:>2}. {} [{}]", position + 1, task_id, task.risk_tier);
        let deps = spec.deps_of(task_id);
        if !deps.is_empty() {
            let after: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
            line.push_str(&format!("  after {}", after.join(", ")));
        }
        if !task.resources.is_empty() {
            let locks: Vec<String> = task
                .resources
                .iter()
                .map(|claim| format!("{}:{}", claim.resource, claim.mode))
                .collect();
            line.push_str(&format!("  locks {}", locks.join(", ")));
        }
        if let Some(on_failure) = &task.compensation.on_failure {
            line.push_str(&format!("  compensated by {on_failure}"));
        }
        println!("{line}");
    }

    let hooks: Vec<&TaskSpec> = spec.tasks.iter().filter(|t| t.is_compensation()).collect();
    if !hooks.is_empty() {
        let names: Vec<&str> = hooks.iter().map(|t| t.id.as_str()).collect();
        println!("compensation tasks (run via hooks only): {}", names.join(", "));
    }
    Ok(())
}

// ── Persistence ──────────────────────────────────────────────────────

fn run_dir(state_dir: &Path, workflow_id: &WorkflowId) -> PathBuf {
    state_dir.join(workflow_id.as_str())
}

fn state_path(state_dir: &Path, workflow_id: &WorkflowId) -> PathBuf {
    run_dir(state_dir, workflow_id).join("state.json")
}

fn snapshots_path(state_dir: &Path, workflow_id: &WorkflowId) -> PathBuf {
    run_dir(state_dir, workflow_id).join("snapshots.json")
}

fn load_spec(file: &Path) -> CliResult<WorkflowSpec> {
    let raw = fs::read_to_string(file).map_err(|source| CliError::Io {
        path: file.to_path_buf(),
        source,
    })?;
    let spec: WorkflowSpec = serde_yaml::from_str(&raw)?;
    spec.validate()?;
    Ok(spec)
}

/// Restore the live store from `state.json` if present. Returns whether
/// anything was seeded.
fn seed_store(store: &MemoryStateStore, path: &Path) -> CliResult<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    let raw = fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let world: StateSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("parsing recorded state at {}", path.display()))?;
    store.restore(&world).context("restoring recorded state")?;
    Ok(true)
}

/// Import the snapshot index from `snapshots.json` if present.
fn seed_snapshots(cortex: &HipCortex, path: &Path) -> CliResult<()> {
    if !path.is_file() {
        return Ok(());
    }
    let raw = fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshots: Vec<CombinedSnapshot> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing snapshot index at {}", path.display()))?;
    for snapshot in snapshots {
        cortex.import_snapshot(snapshot)?;
    }
    Ok(())
}

/// Write the committed world and the snapshot index back to disk.
fn persist(
    store: &MemoryStateStore,
    cortex: &HipCortex,
    state_dir: &Path,
    workflow_id: &WorkflowId,
) -> CliResult<()> {
    let dir = run_dir(state_dir, workflow_id);
    fs::create_dir_all(&dir).map_err(|source| CliError::Io {
        path: dir.clone(),
        source,
    })?;

    let world = store.snapshot().context("capturing committed state")?;
    let encoded = serde_json::to_string_pretty(&world).context("encoding committed state")?;
    let path = state_path(state_dir, workflow_id);
    fs::write(&path, encoded).map_err(|source| CliError::Io { path, source })?;

    let snapshots = cortex.snapshots_for(workflow_id)?;
    let encoded = serde_json::to_string_pretty(&snapshots).context("encoding snapshot index")?;
    let path = snapshots_path(state_dir, workflow_id);
    fs::write(&path, encoded).map_err(|source| CliError::Io { path, source })?;
    Ok(())
}
