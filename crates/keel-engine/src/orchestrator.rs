//! The workflow orchestrator
//!
//! One `Orchestrator` drives validated workflow specs to completion:
//! topologically ordered waves of tasks, each attempt bracketed by
//! lock acquisition, a pre-state snapshot, CRV gate review of the
//! staged diff, a Goal-Guard consult for HIGH and CRITICAL tiers, and
//! an optimistic commit. Progress is persisted to the state store
//! after every transition under a reserved key, so a run that dies can
//! resume without re-running what already committed.
//!
//! Failure handling is per attempt: retryable errors back off with
//! jitter and try again, gate blocks and policy denials fail the task
//! deterministically, and a declared compensation hook runs before
//! the task either retries or settles. Cancellation is cooperative,
//! delivered over a watch channel that every await point observes.

use crate::config::EngineConfig;
use crate::context::{RunContext, TaskContext};
use crate::errors::{EngineError, EngineResult};
use crate::executor::TaskExecutor;
use chrono::{DateTime, Utc};
use keel_coord::{CoordError, CoordEvent, Coordinator, MitigationStrategy};
use keel_cortex::{CombinedSnapshot, HipCortex};
use keel_crv::{ChainResult, GateChain};
use keel_guard::GoalGuard;
use keel_state::{EventLog, StateError, StateStore};
use keel_types::{
    Event, EventType, RetryPolicy, RiskTier, TaskId, TaskSpec, TaskState, TaskStatus, WorkflowId,
    WorkflowSpec, WorkflowState, WorkflowStatus,
};
use rand::Rng;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;

/// Reserved key prefix for durable run state.
fn state_key(workflow_id: &WorkflowId) -> String {
    format!("keel::wf::{workflow_id}")
}

/// Reserved key prefix for the idempotency ledger.
fn idem_key(key: &str) -> String {
    format!("keel::idem::{key}")
}

type SharedState = Arc<Mutex<WorkflowState>>;

/// How one task attempt ended, before retry policy is applied.
enum AttemptEnd {
    Committed {
        output: serde_json::Value,
        gates: Option<ChainResult>,
    },
    Failed(EngineError),
    Cancelled,
}

/// Caller-facing summary of a finished run.
#[derive(Clone, Debug)]
pub struct WorkflowReport {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub tasks: BTreeMap<TaskId, TaskStatus>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowReport {
    fn from_state(state: &WorkflowState) -> Self {
        Self {
            workflow_id: state.workflow_id.clone(),
            status: state.status,
            tasks: state
                .tasks
                .iter()
                .map(|(id, task)| (id.clone(), task.status))
                .collect(),
            finished_at: state.finished_at,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == WorkflowStatus::Succeeded
    }

    pub fn status_of(&self, task: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(task).copied()
    }
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    events: Arc<dyn EventLog>,
    gates: Arc<GateChain>,
    guard: Arc<GoalGuard>,
    coordinator: Arc<Coordinator>,
    cortex: Arc<HipCortex>,
    executor: Arc<dyn TaskExecutor>,
    config: EngineConfig,
    cancellations: Mutex<HashMap<WorkflowId, watch::Sender<bool>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        events: Arc<dyn EventLog>,
        gates: Arc<GateChain>,
        guard: Arc<GoalGuard>,
        coordinator: Arc<Coordinator>,
        cortex: Arc<HipCortex>,
        executor: Arc<dyn TaskExecutor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            events,
            gates,
            guard,
            coordinator,
            cortex,
            executor,
            config,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Run a workflow to a terminal status.
    ///
    /// Task-level failures land in the returned report, not in `Err`;
    /// `Err` is reserved for invalid specs, cancellation and
    /// infrastructure faults. Calling again with the same workflow id
    /// resumes from persisted state, and a run that already reached a
    /// terminal status returns its report without executing anything.
    pub async fn execute(
        &self,
        spec: &WorkflowSpec,
        run: &RunContext,
    ) -> EngineResult<WorkflowReport> {
        spec.validate()?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut cancellations = self
                .cancellations
                .lock()
                .map_err(|_| EngineError::LockPoisoned)?;
            cancellations.insert(spec.id.clone(), cancel_tx);
        }
        let result = self.drive(spec, run, cancel_rx).await;
        if let Ok(mut cancellations) = self.cancellations.lock() {
            cancellations.remove(&spec.id);
        }
        result
    }

    /// Request cooperative cancellation of a running workflow. Returns
    /// whether a run was listening.
    pub fn cancel(&self, workflow_id: &WorkflowId) -> bool {
        let cancellations = match self.cancellations.lock() {
            Ok(cancellations) => cancellations,
            Err(_) => return false,
        };
        match cancellations.get(workflow_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    async fn drive(
        &self,
        spec: &WorkflowSpec,
        run: &RunContext,
        cancel: watch::Receiver<bool>,
    ) -> EngineResult<WorkflowReport> {
        let state = self.load_or_init(spec)?;

        let (terminal, resumed) = self.with_state(&state, |s| {
            (s.status.is_terminal(), s.status == WorkflowStatus::Running)
        })?;
        if terminal {
            return self.with_state(&state, |s| WorkflowReport::from_state(s));
        }

        self.with_state(&state, |s| s.mark_running())?;
        self.save(&state)?;
        self.append(
            Event::new(EventType::WorkflowStarted, spec.id.clone())
                .with_meta("principal", json!(run.principal.id))
                .with_meta("correlationId", json!(run.correlation_id.to_string()))
                .with_meta("tasks", json!(spec.schedulable_tasks().count()))
                .with_meta("resumed", json!(resumed)),
        )?;
        tracing::info!(workflow_id = %spec.id, resumed, "workflow started");

        let semaphore = Semaphore::new(self.config.max_parallel_tasks);
        loop {
            if *cancel.borrow() {
                return self.finish_cancelled(spec, &state);
            }
            let ready = self.with_state(&state, |s| s.ready_tasks(spec))?;
            if ready.is_empty() {
                break;
            }
            let wave = ready.iter().filter_map(|id| spec.task(id)).map(|task| {
                self.run_task(spec, task, run, &state, &semaphore, cancel.clone())
            });
            for result in futures::future::join_all(wave).await {
                match result {
                    Ok(()) => {}
                    Err(EngineError::Cancelled) => {
                        return self.finish_cancelled(spec, &state);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // Tasks stranded behind a failure settle the run as failed and
        // are reported skipped; they stay pending in state so nothing
        // downstream of them ever unblocks.
        let stranded = self.with_state(&state, |s| {
            spec.schedulable_tasks()
                .filter(|t| s.status_of(&t.id) == TaskStatus::Pending)
                .map(|t| t.id.clone())
                .collect::<Vec<_>>()
        })?;
        for task_id in &stranded {
            self.append(
                Event::for_task(EventType::TaskSkipped, spec.id.clone(), task_id.clone())
                    .with_meta("reason", json!("upstream_failed")),
            )?;
        }

        let report = self.with_state(&state, |s| {
            let outcome = s.outcome(spec);
            s.finish(outcome);
            WorkflowReport::from_state(s)
        })?;
        self.save(&state)?;

        let event_type = match report.status {
            WorkflowStatus::Succeeded => EventType::WorkflowSucceeded,
            _ => EventType::WorkflowFailed,
        };
        self.append(Event::new(event_type, spec.id.clone()))?;
        tracing::info!(workflow_id = %spec.id, status = %report.status, "workflow finished");
        Ok(report)
    }

    fn finish_cancelled(
        &self,
        spec: &WorkflowSpec,
        state: &SharedState,
    ) -> EngineResult<WorkflowReport> {
        let released = self.coordinator.release_workflow(&spec.id);
        self.with_state(state, |s| s.finish(WorkflowStatus::Failed))?;
        self.save(state)?;
        self.append(
            Event::new(EventType::WorkflowCancelled, spec.id.clone())
                .with_meta("releasedLocks", json!(released.len())),
        )?;
        self.append(
            Event::new(EventType::WorkflowFailed, spec.id.clone())
                .with_meta("reason", json!("cancelled")),
        )?;
        tracing::warn!(workflow_id = %spec.id, released = released.len(), "workflow cancelled");
        Err(EngineError::Cancelled)
    }

    // ── Task lifecycle ───────────────────────────────────────────────

    async fn run_task(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        run: &RunContext,
        state: &SharedState,
        semaphore: &Semaphore,
        mut cancel: watch::Receiver<bool>,
    ) -> EngineResult<()> {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| EngineError::Cancelled)?;
        if *cancel.borrow() {
            return Err(EngineError::Cancelled);
        }

        // A committed idempotency key means the work already happened,
        // possibly under a different workflow id.
        if let Some(key) = &task.idempotency_key {
            if self.store.exists(&idem_key(key)) {
                self.with_task(state, &task.id, |t| t.mark_skipped())?;
                self.save(state)?;
                self.append(
                    Event::for_task(EventType::TaskSkipped, spec.id.clone(), task.id.clone())
                        .with_meta("reason", json!("idempotent_replay"))
                        .with_meta("idempotencyKey", json!(key)),
                )?;
                tracing::info!(task_id = %task.id, key, "idempotent replay skipped");
                return Ok(());
            }
        }

        let tier = effective_tier(spec, task);

        loop {
            self.with_task(state, &task.id, |t| t.mark_running())?;
            self.save(state)?;
            let attempt = self.with_state(state, |s| {
                s.task(&task.id).map(|t| t.attempts).unwrap_or(1)
            })?;
            self.append(
                Event::for_task(EventType::TaskStarted, spec.id.clone(), task.id.clone())
                    .with_meta("attempt", json!(attempt))
                    .with_meta("tier", json!(tier.to_string())),
            )?;

            let end = self
                .run_attempt(spec, task, run, state, tier, &mut cancel, attempt)
                .await?;
            match end {
                AttemptEnd::Committed { output, gates } => {
                    self.with_task(state, &task.id, |t| t.mark_succeeded(Some(output)))?;
                    self.save(state)?;
                    self.append(
                        Event::for_task(EventType::TaskSucceeded, spec.id.clone(), task.id.clone())
                            .with_meta("attempts", json!(attempt)),
                    )?;
                    tracing::info!(task_id = %task.id, attempts = attempt, "task succeeded");
                    if self.config.snapshot_on_success {
                        self.snapshot_after_commit(spec, task, gates.as_ref());
                    }
                    return Ok(());
                }
                AttemptEnd::Cancelled => {
                    self.compensate(spec, task, run, state, task.compensation.on_failure.as_ref())
                        .await?;
                    self.with_task(state, &task.id, |t| t.mark_failed("cancelled"))?;
                    self.save(state)?;
                    return Err(EngineError::Cancelled);
                }
                AttemptEnd::Failed(err) => {
                    let timed_out = matches!(err, EngineError::Timeout { .. });
                    let reason = err.to_string();
                    if timed_out {
                        let budget = task_budget_ms(task, &self.config);
                        self.with_task(state, &task.id, |t| t.mark_timed_out(budget))?;
                        self.save(state)?;
                        self.append(
                            Event::for_task(
                                EventType::TaskTimedOut,
                                spec.id.clone(),
                                task.id.clone(),
                            )
                            .with_meta("attempt", json!(attempt))
                            .with_meta("budgetMs", json!(budget)),
                        )?;
                    } else {
                        self.with_task(state, &task.id, |t| {
                            t.last_error = Some(reason.clone());
                        })?;
                        self.save(state)?;
                        self.append(
                            Event::for_task(EventType::TaskFailed, spec.id.clone(), task.id.clone())
                                .with_meta("attempt", json!(attempt))
                                .with_meta("reason", json!(reason)),
                        )?;
                    }
                    tracing::warn!(task_id = %task.id, attempt, %reason, "task attempt failed");

                    let hook = if timed_out {
                        // A timeout with no dedicated hook still cleans up
                        task.compensation
                            .on_timeout
                            .as_ref()
                            .or(task.compensation.on_failure.as_ref())
                    } else {
                        task.compensation.on_failure.as_ref()
                    };
                    self.compensate(spec, task, run, state, hook).await?;

                    let retry =
                        err.is_retryable() && task.retry.allows_retry(attempt) && !*cancel.borrow();
                    if !retry {
                        self.with_task(state, &task.id, |t| t.mark_failed(reason.clone()))?;
                        self.save(state)?;
                        return Ok(());
                    }

                    let delay = backoff_delay(&task.retry, attempt);
                    self.append(
                        Event::for_task(EventType::TaskRetried, spec.id.clone(), task.id.clone())
                            .with_meta("attempt", json!(attempt))
                            .with_meta("nextAttempt", json!(attempt + 1))
                            .with_meta("delayMs", json!(delay.as_millis() as u64)),
                    )?;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled(&mut cancel) => {
                            self.with_task(state, &task.id, |t| t.mark_failed("cancelled"))?;
                            self.save(state)?;
                            return Err(EngineError::Cancelled);
                        }
                    }
                }
            }
        }
    }

    /// One attempt: permissions, locks, execute, gate, guard, commit.
    /// Locks taken here are released on every exit path.
    async fn run_attempt(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        run: &RunContext,
        state: &SharedState,
        tier: RiskTier,
        cancel: &mut watch::Receiver<bool>,
        attempt: u32,
    ) -> EngineResult<AttemptEnd> {
        for permission in &task.required_permissions {
            if !run.principal.can(&permission.action, &permission.resource) {
                let reason = format!(
                    "{} lacks permission {permission}",
                    run.principal.id
                );
                self.append(
                    Event::for_task(EventType::PolicyDecision, spec.id.clone(), task.id.clone())
                        .with_meta("state", json!("rejected"))
                        .with_meta("reason", json!(reason)),
                )?;
                return Ok(AttemptEnd::Failed(EngineError::PolicyDenied {
                    task: task.id.clone(),
                    reason,
                }));
            }
        }

        if !task.resources.is_empty() {
            let budget = Duration::from_millis(self.config.lock_acquire_timeout_ms);
            // Retries bid with their attempt number so a starved task
            // eventually wins under a priority policy
            match self
                .coordinator
                .acquire_all(&task.resources, &run.agent, &spec.id, budget, attempt)
                .await
            {
                Ok(()) => {}
                Err(CoordError::AcquireTimeout { resource, .. }) => {
                    return Ok(AttemptEnd::Failed(EngineError::LockUnavailable {
                        task: task.id.clone(),
                        resource,
                    }));
                }
                Err(err) => {
                    return Ok(AttemptEnd::Failed(EngineError::Execution {
                        task: task.id.clone(),
                        reason: err.to_string(),
                    }));
                }
            }
        }

        let end = self
            .attempt_with_locks(spec, task, run, state, tier, cancel)
            .await;
        for claim in &task.resources {
            let _ = self.coordinator.release(&claim.resource, &run.agent);
        }
        end
    }

    async fn attempt_with_locks(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        run: &RunContext,
        state: &SharedState,
        tier: RiskTier,
        cancel: &mut watch::Receiver<bool>,
    ) -> EngineResult<AttemptEnd> {
        let before = match self.store.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => return Ok(AttemptEnd::Failed(EngineError::State(err))),
        };
        let outputs = self.with_state(state, |s| {
            s.tasks
                .iter()
                .filter_map(|(id, t)| t.output.clone().map(|o| (id.clone(), o)))
                .collect::<BTreeMap<_, _>>()
        })?;
        let mut ctx = TaskContext::new(
            Arc::clone(&self.store),
            spec.id.clone(),
            task.id.clone(),
            outputs,
        );

        let budget = Duration::from_millis(task_budget_ms(task, &self.config));
        let executed = tokio::select! {
            result = tokio::time::timeout(budget, self.executor.execute(task, &mut ctx)) => result,
            _ = cancelled(cancel) => return Ok(AttemptEnd::Cancelled),
        };
        let output = match executed {
            Err(_) => {
                return Ok(AttemptEnd::Failed(EngineError::Timeout {
                    task: task.id.clone(),
                }));
            }
            Ok(Err(exec_err)) => {
                return Ok(AttemptEnd::Failed(EngineError::Execution {
                    task: task.id.clone(),
                    reason: exec_err.to_string(),
                }));
            }
            Ok(Ok(output)) => output,
        };

        // Gate review runs on the projected diff, before anything lands
        let after = ctx.projected(&before);
        let diffs = before.diff(&after);
        let gates = if diffs.is_empty() || self.gates.is_empty() {
            None
        } else {
            let chain = self.gates.evaluate(&diffs);
            if chain.blocked {
                ctx.discard();
                let (gate, confidence) = chain
                    .first_block()
                    .map(|g| (g.gate.clone(), g.confidence))
                    .unwrap_or_default();
                self.append(
                    Event::for_task(EventType::CrvBlocked, spec.id.clone(), task.id.clone())
                        .with_meta("gate", json!(gate))
                        .with_meta("confidence", json!(confidence))
                        .with_meta("diffs", json!(diffs.len())),
                )?;
                return Ok(AttemptEnd::Failed(EngineError::CrvBlocked {
                    task: task.id.clone(),
                    gate,
                }));
            }
            Some(chain)
        };

        if tier.requires_approval() {
            if let Some(end) = self
                .consult_guard(spec, task, run, tier, budget, cancel, &mut ctx)
                .await?
            {
                return Ok(end);
            }
        }

        if ctx.has_staged_writes() {
            let applied = match ctx.commit(&before) {
                Ok(applied) => applied,
                Err(err) => {
                    ctx.discard();
                    return Ok(AttemptEnd::Failed(EngineError::State(err)));
                }
            };
            self.append(
                Event::for_task(EventType::StateUpdated, spec.id.clone(), task.id.clone())
                    .with_meta("keys", json!(applied))
                    .with_meta("diffs", serde_json::to_value(&diffs).unwrap_or_default()),
            )?;
        }

        if let Some(key) = &task.idempotency_key {
            let record = json!({
                "workflowId": spec.id.as_str(),
                "taskId": task.id.as_str(),
                "committedAt": Utc::now(),
            });
            match self.store.create(&idem_key(key), record) {
                Ok(_) | Err(StateError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(AttemptEnd::Committed { output, gates })
    }

    /// HIGH parks for one human, CRITICAL for two. The wait runs under
    /// the task budget; an unattended approval rejects, never allows.
    async fn consult_guard(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        run: &RunContext,
        tier: RiskTier,
        budget: Duration,
        cancel: &mut watch::Receiver<bool>,
        ctx: &mut TaskContext,
    ) -> EngineResult<Option<AttemptEnd>> {
        let mut decision = self
            .guard
            .evaluate("commit", task.id.as_str(), &run.principal, tier);

        if decision.is_pending() {
            if let Some(approval_id) = decision.approval_id {
                self.append(
                    Event::for_task(
                        EventType::ApprovalRequested,
                        spec.id.clone(),
                        task.id.clone(),
                    )
                    .with_meta("approvalId", json!(approval_id.to_string()))
                    .with_meta("tier", json!(tier.to_string())),
                )?;
                tracing::info!(task_id = %task.id, %approval_id, %tier, "awaiting human approval");
                let waited = tokio::select! {
                    waited = self.guard.wait_for_decision(approval_id, budget) => waited,
                    _ = cancelled(cancel) => {
                        ctx.discard();
                        return Ok(Some(AttemptEnd::Cancelled));
                    }
                };
                decision = match waited {
                    Ok(decision) => decision,
                    Err(err) => {
                        ctx.discard();
                        return Ok(Some(AttemptEnd::Failed(EngineError::PolicyDenied {
                            task: task.id.clone(),
                            reason: err.to_string(),
                        })));
                    }
                };
                self.append(
                    Event::for_task(
                        EventType::ApprovalResolved,
                        spec.id.clone(),
                        task.id.clone(),
                    )
                    .with_meta("approvalId", json!(approval_id.to_string()))
                    .with_meta("state", json!(decision.state.to_string())),
                )?;
            }
        }

        self.append(
            Event::for_task(EventType::PolicyDecision, spec.id.clone(), task.id.clone())
                .with_meta("state", json!(decision.state.to_string()))
                .with_meta("tier", json!(tier.to_string()))
                .with_meta("reason", json!(decision.reason)),
        )?;

        if decision.is_approved() {
            Ok(None)
        } else {
            ctx.discard();
            Ok(Some(AttemptEnd::Failed(EngineError::PolicyDenied {
                task: task.id.clone(),
                reason: decision.reason,
            })))
        }
    }

    /// Post-commit snapshot, verified when the commit's gate chain
    /// passed cleanly. Best effort: a snapshot failure never fails the
    /// task that already committed.
    fn snapshot_after_commit(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        gates: Option<&ChainResult>,
    ) {
        let snapshot = match self.cortex.take_snapshot(&spec.id, &task.id, "post_commit") {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(task_id = %task.id, "post-commit snapshot failed: {err}");
                return;
            }
        };
        if let Some(result) = gates.and_then(|chain| chain.results.last()) {
            if let Err(err) = self.cortex.mark_verified(&snapshot.id, result) {
                tracing::warn!(snapshot_id = %snapshot.id, "snapshot verification failed: {err}");
            }
        }
    }

    /// Run a declared compensation hook, best effort. The hook's own
    /// writes still go through the gate chain; a blocked compensation
    /// is discarded rather than forced.
    async fn compensate(
        &self,
        spec: &WorkflowSpec,
        failed: &TaskSpec,
        run: &RunContext,
        state: &SharedState,
        hook: Option<&TaskId>,
    ) -> EngineResult<()> {
        let Some(hook_id) = hook else {
            return Ok(());
        };
        let Some(hook_task) = spec.task(hook_id) else {
            return Ok(());
        };

        self.with_task(state, &failed.id, |t| t.mark_compensating())?;
        self.save(state)?;
        tracing::info!(task_id = %failed.id, hook = %hook_id, "running compensation");

        let ok = self.run_hook(spec, hook_task, run, state).await;
        self.append(
            Event::for_task(EventType::TaskCompensated, spec.id.clone(), failed.id.clone())
                .with_meta("hook", json!(hook_id.as_str()))
                .with_meta("ok", json!(ok)),
        )?;
        Ok(())
    }

    async fn run_hook(
        &self,
        spec: &WorkflowSpec,
        hook: &TaskSpec,
        _run: &RunContext,
        state: &SharedState,
    ) -> bool {
        let before = match self.store.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(hook = %hook.id, "compensation skipped: {err}");
                return false;
            }
        };
        let outputs = self
            .with_state(state, |s| {
                s.tasks
                    .iter()
                    .filter_map(|(id, t)| t.output.clone().map(|o| (id.clone(), o)))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();
        let mut ctx = TaskContext::new(
            Arc::clone(&self.store),
            spec.id.clone(),
            hook.id.clone(),
            outputs,
        );
        let budget = Duration::from_millis(task_budget_ms(hook, &self.config));

        match tokio::time::timeout(budget, self.executor.execute(hook, &mut ctx)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::warn!(hook = %hook.id, "compensation failed: {err}");
                return false;
            }
            Err(_) => {
                tracing::warn!(hook = %hook.id, budget_ms = budget.as_millis() as u64, "compensation timed out");
                return false;
            }
        }

        let after = ctx.projected(&before);
        let diffs = before.diff(&after);
        if diffs.is_empty() {
            return true;
        }
        if !self.gates.is_empty() {
            let chain = self.gates.evaluate(&diffs);
            if chain.blocked {
                tracing::warn!(hook = %hook.id, "compensation writes blocked by gates");
                return false;
            }
        }
        match ctx.commit(&before) {
            Ok(applied) => {
                self.append_best_effort(
                    Event::for_task(EventType::StateUpdated, spec.id.clone(), hook.id.clone())
                        .with_meta("keys", json!(applied))
                        .with_meta("compensation", json!(true)),
                );
                true
            }
            Err(err) => {
                tracing::warn!(hook = %hook.id, "compensation commit failed: {err}");
                false
            }
        }
    }

    // ── Durable run state ────────────────────────────────────────────

    fn load_or_init(&self, spec: &WorkflowSpec) -> EngineResult<SharedState> {
        let key = state_key(&spec.id);
        let state = match self.store.read(&key) {
            Ok(entry) => {
                let mut persisted: WorkflowState =
                    serde_json::from_value(entry.value).map_err(StateError::from)?;
                persisted.reset_in_flight();
                persisted
            }
            Err(StateError::NotFound { .. }) => WorkflowState::new(spec),
            Err(err) => return Err(err.into()),
        };
        Ok(Arc::new(Mutex::new(state)))
    }

    fn save(&self, state: &SharedState) -> EngineResult<()> {
        let (key, value) = {
            let guard = state.lock().map_err(|_| EngineError::LockPoisoned)?;
            let value = serde_json::to_value(&*guard).map_err(StateError::from)?;
            (state_key(&guard.workflow_id), value)
        };
        match self.store.read(&key) {
            Ok(entry) => {
                self.store.update(&key, value, entry.version)?;
            }
            Err(StateError::NotFound { .. }) => {
                self.store.create(&key, value)?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    fn with_state<T>(
        &self,
        state: &SharedState,
        f: impl FnOnce(&mut WorkflowState) -> T,
    ) -> EngineResult<T> {
        let mut guard = state.lock().map_err(|_| EngineError::LockPoisoned)?;
        Ok(f(&mut guard))
    }

    fn with_task(
        &self,
        state: &SharedState,
        task: &TaskId,
        f: impl FnOnce(&mut TaskState),
    ) -> EngineResult<()> {
        self.with_state(state, |s| {
            if let Some(t) = s.task_mut(task) {
                f(t);
            }
        })
    }

    fn append(&self, event: Event) -> EngineResult<Event> {
        self.events.append(event).map_err(EngineError::State)
    }

    fn append_best_effort(&self, event: Event) {
        if let Err(err) = self.events.append(event) {
            tracing::error!("event append failed: {err}");
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Persisted run state for a workflow, if any run has started.
    pub fn workflow_state(&self, workflow_id: &WorkflowId) -> EngineResult<Option<WorkflowState>> {
        match self.store.read(&state_key(workflow_id)) {
            Ok(entry) => Ok(Some(
                serde_json::from_value(entry.value).map_err(StateError::from)?,
            )),
            Err(StateError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Audit events for a workflow, in append order.
    pub fn events_for(&self, workflow_id: &WorkflowId) -> EngineResult<Vec<Event>> {
        self.events
            .events_for(workflow_id)
            .map_err(EngineError::State)
    }

    /// Snapshots the cortex holds for a workflow.
    pub fn snapshots_for(&self, workflow_id: &WorkflowId) -> Vec<CombinedSnapshot> {
        self.cortex.snapshots_for(workflow_id).unwrap_or_default()
    }

    // ── Coordinator bridge ───────────────────────────────────────────

    /// Mirror coordinator transitions into the event log and apply
    /// abort mitigations to running workflows. One bridge per
    /// orchestrator; the handle owns the loop.
    pub fn spawn_event_bridge(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut rx = orchestrator.coordinator.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => orchestrator.bridge_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "coordinator event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn bridge_event(&self, event: CoordEvent) {
        match event {
            CoordEvent::Acquired(lock) => {
                self.append_best_effort(
                    Event::new(EventType::LockAcquired, lock.workflow_id.clone())
                        .with_meta("resource", json!(lock.resource_id.as_str()))
                        .with_meta("agent", json!(lock.holder.as_str()))
                        .with_meta("mode", json!(lock.mode.to_string())),
                );
            }
            CoordEvent::Released(lock) => {
                self.append_best_effort(
                    Event::new(EventType::LockReleased, lock.workflow_id.clone())
                        .with_meta("resource", json!(lock.resource_id.as_str()))
                        .with_meta("agent", json!(lock.holder.as_str())),
                );
            }
            CoordEvent::Expired(lock) => {
                self.append_best_effort(
                    Event::new(EventType::LockReleased, lock.workflow_id.clone())
                        .with_meta("resource", json!(lock.resource_id.as_str()))
                        .with_meta("agent", json!(lock.holder.as_str()))
                        .with_meta("reason", json!("expired")),
                );
            }
            CoordEvent::Waiting { .. } => {}
            CoordEvent::DeadlockDetected(report) => {
                let mut workflows: Vec<WorkflowId> = report
                    .cycle
                    .iter()
                    .flat_map(|agent| self.coordinator.workflows_of(agent))
                    .collect();
                workflows.sort();
                workflows.dedup();
                for workflow_id in workflows {
                    self.append_best_effort(
                        Event::new(EventType::DeadlockDetected, workflow_id)
                            .with_meta("cycle", json!(cycle_ids(&report.cycle)))
                            .with_meta(
                                "resources",
                                json!(report
                                    .resources
                                    .iter()
                                    .map(|r| r.as_str())
                                    .collect::<Vec<_>>()),
                            ),
                    );
                }
            }
            CoordEvent::LivelockDetected(report) => {
                let mut workflows: Vec<WorkflowId> = report
                    .agents
                    .iter()
                    .flat_map(|agent| self.coordinator.workflows_of(agent))
                    .collect();
                workflows.sort();
                workflows.dedup();
                for workflow_id in workflows {
                    self.append_best_effort(
                        Event::new(EventType::LivelockDetected, workflow_id)
                            .with_meta("agents", json!(cycle_ids(&report.agents)))
                            .with_meta("repeats", json!(report.repeats)),
                    );
                }
            }
            CoordEvent::MitigationApplied {
                trigger,
                outcome,
                workflows,
            } => {
                for workflow_id in &workflows {
                    self.append_best_effort(
                        Event::new(EventType::MitigationApplied, workflow_id.clone())
                            .with_meta("trigger", json!(trigger.to_string()))
                            .with_meta("strategy", json!(format!("{:?}", outcome.strategy)))
                            .with_meta("victims", json!(cycle_ids(&outcome.victims)))
                            .with_meta("released", json!(outcome.released.len())),
                    );
                }
                if outcome.strategy == MitigationStrategy::Abort {
                    for workflow_id in &workflows {
                        if self.cancel(workflow_id) {
                            tracing::warn!(
                                workflow_id = %workflow_id,
                                %trigger,
                                "workflow aborted by mitigation"
                            );
                        }
                    }
                }
            }
        }
    }
}

fn cycle_ids(agents: &[keel_types::AgentId]) -> Vec<&str> {
    agents.iter().map(|a| a.as_str()).collect()
}

/// Declared tier raised by any matching workflow policy rule.
fn effective_tier(spec: &WorkflowSpec, task: &TaskSpec) -> RiskTier {
    match &spec.policy {
        Some(policy) => policy.tier_for(task.id.as_str(), task.risk_tier),
        None => task.risk_tier,
    }
}

fn task_budget_ms(task: &TaskSpec, config: &EngineConfig) -> u64 {
    task.timeout_ms.unwrap_or(config.default_task_timeout_ms)
}

/// Exponential backoff with jitter in [0.5, 1.5] of the base delay.
fn backoff_delay(retry: &RetryPolicy, attempt: u32) -> Duration {
    let base = retry.base_delay_ms(attempt);
    let ms = if retry.jitter {
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
        (base as f64 * factor) as u64
    } else {
        base
    };
    Duration::from_millis(ms)
}

/// Resolves when cancellation fires. If the sender is gone the run can
/// no longer be cancelled, so the future parks forever.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
