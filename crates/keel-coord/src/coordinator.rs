//! The lock table and its sweep
//!
//! One `Coordinator` owns every resource the engine hands out. Grants
//! go through a per-resource waiter queue; holds carry a TTL that the
//! background sweep enforces. Detection and mitigation operate on the
//! same live table, so a mitigation's releases immediately unblock the
//! surviving waiters.

use crate::config::CoordinatorConfig;
use crate::deadlock::{DeadlockReport, WaitForGraph};
use crate::errors::{CoordError, CoordResult};
use crate::livelock::{LivelockReport, TransitionTracker};
use crate::lock::{compatible, CoordinationPolicy, Lock};
use crate::mitigation::{MitigationOutcome, MitigationStrategy};
use chrono::Utc;
use dashmap::DashMap;
use keel_types::{AgentId, LockMode, ResourceClaim, ResourceId, WorkflowId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// What a detection was triggered by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentionKind {
    Deadlock,
    Livelock,
}

impl std::fmt::Display for ContentionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentionKind::Deadlock => write!(f, "deadlock"),
            ContentionKind::Livelock => write!(f, "livelock"),
        }
    }
}

/// Broadcast on every observable coordinator transition. The engine
/// subscribes and turns these into event-log records.
#[derive(Clone, Debug)]
pub enum CoordEvent {
    Acquired(Lock),
    Waiting {
        resource: ResourceId,
        agent: AgentId,
        workflow: WorkflowId,
        mode: LockMode,
        priority: u32,
    },
    Released(Lock),
    Expired(Lock),
    DeadlockDetected(DeadlockReport),
    LivelockDetected(LivelockReport),
    MitigationApplied {
        trigger: ContentionKind,
        outcome: MitigationOutcome,
        /// Workflows the victims held locks under, captured before release
        workflows: Vec<WorkflowId>,
    },
}

/// Flat discriminant, mostly for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordEventKind {
    Acquired,
    Waiting,
    Released,
    Expired,
    DeadlockDetected,
    LivelockDetected,
    MitigationApplied,
}

impl CoordEvent {
    pub fn kind(&self) -> CoordEventKind {
        match self {
            CoordEvent::Acquired(_) => CoordEventKind::Acquired,
            CoordEvent::Waiting { .. } => CoordEventKind::Waiting,
            CoordEvent::Released(_) => CoordEventKind::Released,
            CoordEvent::Expired(_) => CoordEventKind::Expired,
            CoordEvent::DeadlockDetected(_) => CoordEventKind::DeadlockDetected,
            CoordEvent::LivelockDetected(_) => CoordEventKind::LivelockDetected,
            CoordEvent::MitigationApplied { .. } => CoordEventKind::MitigationApplied,
        }
    }
}

struct Waiter {
    id: u64,
    agent: AgentId,
    workflow: WorkflowId,
    mode: LockMode,
    priority: u32,
    timeout_ms: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct ResourceEntry {
    policy: CoordinationPolicy,
    holders: Vec<Lock>,
    waiters: VecDeque<Waiter>,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    resources: DashMap<ResourceId, ResourceEntry>,
    tracker: TransitionTracker,
    events: broadcast::Sender<CoordEvent>,
    next_waiter: AtomicU64,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            tracker: TransitionTracker::new(config.livelock_window),
            config,
            resources: DashMap::new(),
            events,
            next_waiter: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordEvent> {
        self.events.subscribe()
    }

    /// Set the grant policy for a resource; unknown resources default
    /// to [`CoordinationPolicy::Exclusive`] on first contact.
    pub fn register_resource(&self, resource: ResourceId, policy: CoordinationPolicy) {
        self.resources.entry(resource).or_default().policy = policy;
    }

    // ── Acquisition ──────────────────────────────────────────────────

    /// Take a lock, waiting up to `timeout` for a grant.
    ///
    /// `timeout` doubles as the hold TTL: the sweep revokes the lock
    /// that long after the grant. A zero timeout means try-once and
    /// hold without expiry. Returns `Ok(false)` when the wait budget
    /// runs out.
    pub async fn acquire(
        &self,
        resource: &ResourceId,
        agent: &AgentId,
        workflow: &WorkflowId,
        mode: LockMode,
        timeout: Duration,
        priority: u32,
    ) -> CoordResult<bool> {
        let timeout_ms = timeout.as_millis() as u64;
        let waiter_id;
        let mut rx = {
            let mut entry = self.resources.entry(resource.clone()).or_default();
            let effective_mode = match entry.policy {
                CoordinationPolicy::Exclusive => LockMode::Exclusive,
                _ => mode,
            };

            // Keep the fast path honest between sweeps
            if Self::drop_expired(resource, &mut entry, &self.events) > 0 {
                Self::promote(resource, &mut entry, &self.events);
            }

            // Re-entrant holds refresh rather than queue
            if let Some(idx) = entry.holders.iter().position(|l| l.holder == *agent) {
                let held_mode = entry.holders[idx].mode;
                if held_mode == LockMode::Exclusive || held_mode == effective_mode {
                    entry.holders[idx].acquired_at = Utc::now();
                    return Ok(true);
                }
                if entry.holders.len() == 1 {
                    // Sole shared holder upgrading in place
                    entry.holders[idx].mode = LockMode::Exclusive;
                    entry.holders[idx].acquired_at = Utc::now();
                    return Ok(true);
                }
                // Other sharers present; the upgrade queues like anyone else
            }

            if entry.waiters.is_empty() && compatible(&entry.holders, effective_mode) {
                let lock = Lock::new(
                    resource.clone(),
                    agent.clone(),
                    workflow.clone(),
                    effective_mode,
                    timeout_ms,
                );
                entry.holders.push(lock.clone());
                tracing::debug!(resource = %resource, agent = %agent, mode = %effective_mode, "lock granted");
                let _ = self.events.send(CoordEvent::Acquired(lock));
                return Ok(true);
            }

            if timeout.is_zero() {
                return Ok(false);
            }

            let (tx, rx) = oneshot::channel();
            waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            entry.waiters.push_back(Waiter {
                id: waiter_id,
                agent: agent.clone(),
                workflow: workflow.clone(),
                mode: effective_mode,
                priority,
                timeout_ms,
                tx,
            });
            let _ = self.events.send(CoordEvent::Waiting {
                resource: resource.clone(),
                agent: agent.clone(),
                workflow: workflow.clone(),
                mode: effective_mode,
                priority,
            });
            rx
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Err(CoordError::Closed),
            Err(_) => {
                // A grant may have raced the deadline
                if rx.try_recv().is_ok() {
                    return Ok(true);
                }
                if let Some(mut entry) = self.resources.get_mut(resource) {
                    let len_before = entry.waiters.len();
                    entry.waiters.retain(|w| w.id != waiter_id);
                    if entry.waiters.len() == len_before
                        && entry.holders.iter().any(|l| l.holder == *agent)
                    {
                        return Ok(true);
                    }
                }
                let err = CoordError::AcquireTimeout {
                    resource: resource.clone(),
                    agent: agent.clone(),
                };
                tracing::debug!(error = %err, "waiter withdrawn");
                Ok(false)
            }
        }
    }

    /// Acquire every claim or none. Claims are taken in resource-id
    /// order so two agents with interleaved claim lists cannot deadlock
    /// against each other through this path.
    pub async fn acquire_all(
        &self,
        claims: &[ResourceClaim],
        agent: &AgentId,
        workflow: &WorkflowId,
        timeout: Duration,
        priority: u32,
    ) -> CoordResult<()> {
        let mut ordered: Vec<&ResourceClaim> = claims.iter().collect();
        ordered.sort_by(|a, b| a.resource.cmp(&b.resource));
        ordered.dedup_by(|a, b| a.resource == b.resource);

        let mut acquired: Vec<ResourceId> = Vec::new();
        for claim in ordered {
            let granted = match self
                .acquire(&claim.resource, agent, workflow, claim.mode, timeout, priority)
                .await
            {
                Ok(granted) => granted,
                Err(err) => {
                    self.unwind(&acquired, agent);
                    return Err(err);
                }
            };
            if !granted {
                self.unwind(&acquired, agent);
                return Err(CoordError::AcquireTimeout {
                    resource: claim.resource.clone(),
                    agent: agent.clone(),
                });
            }
            acquired.push(claim.resource.clone());
        }
        Ok(())
    }

    fn unwind(&self, acquired: &[ResourceId], agent: &AgentId) {
        for resource in acquired {
            let _ = self.release(resource, agent);
        }
    }

    // ── Release ──────────────────────────────────────────────────────

    pub fn release(&self, resource: &ResourceId, agent: &AgentId) -> CoordResult<()> {
        let mut entry = self
            .resources
            .get_mut(resource)
            .ok_or_else(|| CoordError::UnknownResource(resource.clone()))?;
        let (released, kept): (Vec<Lock>, Vec<Lock>) =
            entry.holders.drain(..).partition(|l| l.holder == *agent);
        entry.holders = kept;
        if released.is_empty() {
            return Err(CoordError::NotHolder {
                resource: resource.clone(),
                agent: agent.clone(),
            });
        }
        for lock in released {
            tracing::debug!(resource = %resource, agent = %agent, "lock released");
            let _ = self.events.send(CoordEvent::Released(lock));
        }
        Self::promote(resource, &mut entry, &self.events);
        Ok(())
    }

    /// Drop every hold an agent has, anywhere. Returns the freed
    /// resources.
    pub fn release_agent(&self, agent: &AgentId) -> Vec<ResourceId> {
        let mut freed = Vec::new();
        for mut entry in self.resources.iter_mut() {
            let resource = entry.key().clone();
            let e = entry.value_mut();
            let (released, kept): (Vec<Lock>, Vec<Lock>) =
                e.holders.drain(..).partition(|l| l.holder == *agent);
            e.holders = kept;
            if released.is_empty() {
                continue;
            }
            for lock in released {
                let _ = self.events.send(CoordEvent::Released(lock));
            }
            freed.push(resource.clone());
            Self::promote(&resource, e, &self.events);
        }
        if !freed.is_empty() {
            tracing::debug!(agent = %agent, resources = freed.len(), "agent released everywhere");
        }
        freed
    }

    /// A finished workflow releases all its locks and abandons its
    /// parked waiters (their acquires resolve `Closed`).
    pub fn release_workflow(&self, workflow: &WorkflowId) -> Vec<ResourceId> {
        let mut freed = Vec::new();
        for mut entry in self.resources.iter_mut() {
            let resource = entry.key().clone();
            let e = entry.value_mut();
            e.waiters.retain(|w| w.workflow != *workflow);
            let (released, kept): (Vec<Lock>, Vec<Lock>) =
                e.holders.drain(..).partition(|l| l.workflow_id == *workflow);
            e.holders = kept;
            if released.is_empty() {
                Self::promote(&resource, e, &self.events);
                continue;
            }
            for lock in released {
                let _ = self.events.send(CoordEvent::Released(lock));
            }
            freed.push(resource.clone());
            Self::promote(&resource, e, &self.events);
        }
        freed
    }

    // ── Expiry and the sweep ─────────────────────────────────────────

    /// Revoke every hold past its TTL and hand the freed capacity to
    /// waiters. Returns how many holds were revoked.
    pub fn expire_overdue(&self) -> usize {
        let mut revoked = 0;
        for mut entry in self.resources.iter_mut() {
            let resource = entry.key().clone();
            let e = entry.value_mut();
            revoked += Self::drop_expired(&resource, e, &self.events);
            Self::promote(&resource, e, &self.events);
        }
        revoked
    }

    /// Spawn the background sweep: expiry, then detection, then the
    /// configured auto-mitigation. The handle owns the loop; abort it
    /// to stop sweeping.
    pub fn spawn_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let coord = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(coord.config.sweep_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                coord.expire_overdue();
                for report in coord.detect_deadlocks() {
                    if let Some(strategy) = coord.config.auto_mitigate {
                        coord.mitigate_deadlock(&report, strategy);
                    }
                }
                for report in coord.detect_livelocks() {
                    if let Some(strategy) = coord.config.auto_mitigate {
                        coord.mitigate_livelock(&report, strategy);
                    }
                }
            }
        })
    }

    fn drop_expired(
        resource: &ResourceId,
        entry: &mut ResourceEntry,
        events: &broadcast::Sender<CoordEvent>,
    ) -> usize {
        let (dead, kept): (Vec<Lock>, Vec<Lock>) =
            entry.holders.drain(..).partition(|l| l.is_expired());
        entry.holders = kept;
        let revoked = dead.len();
        for lock in dead {
            tracing::warn!(
                resource = %resource,
                agent = %lock.holder,
                ttl_ms = lock.timeout_ms,
                "lock hold expired"
            );
            let _ = events.send(CoordEvent::Expired(lock));
        }
        revoked
    }

    /// Grant as many queued waiters as the current holders allow, in
    /// the resource's policy order. A waiter whose acquire already gave
    /// up is skipped and its slot recovered.
    fn promote(
        resource: &ResourceId,
        entry: &mut ResourceEntry,
        events: &broadcast::Sender<CoordEvent>,
    ) {
        loop {
            let idx = match entry.policy {
                CoordinationPolicy::Priority => {
                    let mut best: Option<(usize, u32)> = None;
                    for (i, w) in entry.waiters.iter().enumerate() {
                        match best {
                            Some((_, p)) if p >= w.priority => {}
                            _ => best = Some((i, w.priority)),
                        }
                    }
                    match best {
                        Some((i, _)) => i,
                        None => break,
                    }
                }
                _ => {
                    if entry.waiters.is_empty() {
                        break;
                    }
                    0
                }
            };

            let mode = entry.waiters[idx].mode;
            if !compatible(&entry.holders, mode) {
                break;
            }
            let Some(waiter) = entry.waiters.remove(idx) else {
                break;
            };
            let Waiter {
                agent,
                workflow,
                timeout_ms,
                tx,
                ..
            } = waiter;
            let lock = Lock::new(resource.clone(), agent, workflow, mode, timeout_ms);
            if tx.send(()).is_ok() {
                tracing::debug!(resource = %resource, agent = %lock.holder, "waiter promoted to holder");
                let _ = events.send(CoordEvent::Acquired(lock.clone()));
                entry.holders.push(lock);
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn holders_of(&self, resource: &ResourceId) -> Vec<Lock> {
        self.resources
            .get(resource)
            .map(|e| e.holders.clone())
            .unwrap_or_default()
    }

    pub fn locks_of(&self, agent: &AgentId) -> Vec<Lock> {
        self.resources
            .iter()
            .flat_map(|e| {
                e.holders
                    .iter()
                    .filter(|l| l.holder == *agent)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn workflows_of(&self, agent: &AgentId) -> Vec<WorkflowId> {
        let mut out: Vec<WorkflowId> = self
            .locks_of(agent)
            .into_iter()
            .map(|l| l.workflow_id)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    // ── Detection ────────────────────────────────────────────────────

    /// Feed the livelock tracker with an agent state transition.
    pub fn record_transition(&self, agent: &AgentId, state: impl Into<String>) {
        self.tracker.record(agent, state);
    }

    /// A progress signal wipes the agent's pattern history.
    pub fn signal_progress(&self, agent: &AgentId) {
        self.tracker.progress(agent);
    }

    /// Build the wait-for graph from the live table and look for
    /// cycles. Edges run waiter to holder; self-edges are skipped.
    pub fn detect_deadlocks(&self) -> Vec<DeadlockReport> {
        let mut graph = WaitForGraph::new();
        for entry in self.resources.iter() {
            for waiter in &entry.waiters {
                for holder in &entry.holders {
                    if holder.holder != waiter.agent {
                        graph.add_edge(
                            waiter.agent.clone(),
                            holder.holder.clone(),
                            entry.key().clone(),
                        );
                    }
                }
            }
        }
        let reports = graph.detect();
        for report in &reports {
            tracing::warn!(cycle = ?report.cycle, resources = ?report.resources, "deadlock detected");
            let _ = self
                .events
                .send(CoordEvent::DeadlockDetected(report.clone()));
        }
        reports
    }

    pub fn detect_livelocks(&self) -> Vec<LivelockReport> {
        let reports = self.tracker.detect(
            self.config.livelock_min_repeats,
            self.config.livelock_max_period,
            self.config.progress_timeout,
        );
        for report in &reports {
            tracing::warn!(agents = ?report.agents, repeats = report.repeats, "livelock detected");
            let _ = self
                .events
                .send(CoordEvent::LivelockDetected(report.clone()));
        }
        reports
    }

    // ── Mitigation ───────────────────────────────────────────────────

    /// Break a deadlock. Abort evicts the cycle agent holding the most
    /// resources; Replan displaces the one holding the fewest; Escalate
    /// raises an incident and touches nothing.
    pub fn mitigate_deadlock(
        &self,
        report: &DeadlockReport,
        strategy: MitigationStrategy,
    ) -> MitigationOutcome {
        let (outcome, workflows) = match strategy {
            MitigationStrategy::Abort => match self.pick_victim(&report.cycle, true) {
                Some(victim) => {
                    let workflows = self.workflows_of(&victim);
                    let released = self.release_agent(&victim);
                    self.purge_waiters(&victim);
                    self.tracker.clear(&victim);
                    (
                        MitigationOutcome {
                            strategy,
                            victims: vec![victim],
                            released,
                            incident: None,
                        },
                        workflows,
                    )
                }
                None => (
                    MitigationOutcome {
                        strategy,
                        victims: Vec::new(),
                        released: Vec::new(),
                        incident: None,
                    },
                    Vec::new(),
                ),
            },
            MitigationStrategy::Replan => match self.pick_victim(&report.cycle, false) {
                Some(victim) => {
                    let workflows = self.workflows_of(&victim);
                    let released = self.release_agent(&victim);
                    (
                        MitigationOutcome {
                            strategy,
                            victims: vec![victim],
                            released,
                            incident: None,
                        },
                        workflows,
                    )
                }
                None => (
                    MitigationOutcome {
                        strategy,
                        victims: Vec::new(),
                        released: Vec::new(),
                        incident: None,
                    },
                    Vec::new(),
                ),
            },
            MitigationStrategy::Escalate => {
                let incident = format!(
                    "deadlock between agents [{}] over resources [{}]; awaiting operator",
                    join_ids(&report.cycle),
                    join_ids(&report.resources),
                );
                (
                    MitigationOutcome {
                        strategy,
                        victims: report.cycle.clone(),
                        released: Vec::new(),
                        incident: Some(incident),
                    },
                    Vec::new(),
                )
            }
        };
        self.emit_mitigation(ContentionKind::Deadlock, outcome, workflows)
    }

    /// Break a livelock. Abort evicts every cycling agent; Replan just
    /// clears their histories so a changed schedule gets a fresh read;
    /// Escalate raises an incident.
    pub fn mitigate_livelock(
        &self,
        report: &LivelockReport,
        strategy: MitigationStrategy,
    ) -> MitigationOutcome {
        let (outcome, workflows) = match strategy {
            MitigationStrategy::Abort => {
                let victims = report.agents.clone();
                let mut workflows = Vec::new();
                let mut released = Vec::new();
                for victim in &victims {
                    workflows.extend(self.workflows_of(victim));
                    released.extend(self.release_agent(victim));
                    self.purge_waiters(victim);
                    self.tracker.clear(victim);
                }
                workflows.sort();
                workflows.dedup();
                released.sort();
                released.dedup();
                (
                    MitigationOutcome {
                        strategy,
                        victims,
                        released,
                        incident: None,
                    },
                    workflows,
                )
            }
            MitigationStrategy::Replan => {
                for agent in &report.agents {
                    self.tracker.clear(agent);
                }
                (
                    MitigationOutcome {
                        strategy,
                        victims: report.agents.clone(),
                        released: Vec::new(),
                        incident: None,
                    },
                    Vec::new(),
                )
            }
            MitigationStrategy::Escalate => {
                let incident = format!(
                    "livelock among agents [{}] repeating [{}] x{}; awaiting operator",
                    join_ids(&report.agents),
                    report.pattern.join(" -> "),
                    report.repeats,
                );
                (
                    MitigationOutcome {
                        strategy,
                        victims: report.agents.clone(),
                        released: Vec::new(),
                        incident: Some(incident),
                    },
                    Vec::new(),
                )
            }
        };
        self.emit_mitigation(ContentionKind::Livelock, outcome, workflows)
    }

    /// Most (or fewest) resources held decides the victim; id order
    /// breaks ties so repeated runs pick the same agent.
    fn pick_victim(&self, cycle: &[AgentId], most: bool) -> Option<AgentId> {
        let mut ranked: Vec<(usize, &AgentId)> = cycle
            .iter()
            .map(|agent| (self.locks_of(agent).len(), agent))
            .collect();
        ranked.sort_by(|a, b| {
            let by_count = if most { b.0.cmp(&a.0) } else { a.0.cmp(&b.0) };
            by_count.then_with(|| a.1.cmp(b.1))
        });
        ranked.first().map(|(_, agent)| (*agent).clone())
    }

    fn purge_waiters(&self, agent: &AgentId) {
        for mut entry in self.resources.iter_mut() {
            let resource = entry.key().clone();
            let e = entry.value_mut();
            let before = e.waiters.len();
            e.waiters.retain(|w| w.agent != *agent);
            if e.waiters.len() != before {
                Self::promote(&resource, e, &self.events);
            }
        }
    }

    fn emit_mitigation(
        &self,
        trigger: ContentionKind,
        outcome: MitigationOutcome,
        workflows: Vec<WorkflowId>,
    ) -> MitigationOutcome {
        tracing::warn!(
            trigger = %trigger,
            strategy = %outcome.strategy,
            victims = ?outcome.victims,
            released = ?outcome.released,
            "mitigation applied"
        );
        let _ = self.events.send(CoordEvent::MitigationApplied {
            trigger,
            outcome: outcome.clone(),
            workflows,
        });
        outcome
    }
}

fn join_ids<T: std::fmt::Display>(ids: &[T]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
