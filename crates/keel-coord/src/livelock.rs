//! Livelock detection from transition histories
//!
//! A livelocked agent is busy but going nowhere: it cycles through the
//! same short state pattern without ever signalling progress. The
//! tracker keeps a bounded history of state names per agent; detection
//! looks for a periodic suffix whose period is short and whose repeat
//! count is high, on an agent that has been silent past the progress
//! timeout.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keel_types::AgentId;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Agents caught in the same repeating pattern.
#[derive(Clone, Debug, Serialize)]
pub struct LivelockReport {
    pub agents: Vec<AgentId>,
    /// One period of the repeating pattern, oldest state first
    pub pattern: Vec<String>,
    pub repeats: usize,
    pub detected_at: DateTime<Utc>,
}

struct AgentHistory {
    states: VecDeque<String>,
    last_progress: DateTime<Utc>,
}

impl AgentHistory {
    fn new() -> Self {
        Self {
            states: VecDeque::new(),
            last_progress: Utc::now(),
        }
    }
}

pub(crate) struct TransitionTracker {
    histories: DashMap<AgentId, AgentHistory>,
    window: usize,
}

impl TransitionTracker {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            histories: DashMap::new(),
            window,
        }
    }

    pub(crate) fn record(&self, agent: &AgentId, state: impl Into<String>) {
        let mut history = self
            .histories
            .entry(agent.clone())
            .or_insert_with(AgentHistory::new);
        if history.states.len() == self.window {
            history.states.pop_front();
        }
        history.states.push_back(state.into());
    }

    pub(crate) fn progress(&self, agent: &AgentId) {
        let mut history = self
            .histories
            .entry(agent.clone())
            .or_insert_with(AgentHistory::new);
        history.last_progress = Utc::now();
        history.states.clear();
    }

    pub(crate) fn clear(&self, agent: &AgentId) {
        self.histories.remove(agent);
    }

    pub(crate) fn detect(
        &self,
        min_repeats: usize,
        max_period: usize,
        progress_timeout: Duration,
    ) -> Vec<LivelockReport> {
        let stale_after = chrono::Duration::from_std(progress_timeout)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(i64::MAX));
        let now = Utc::now();

        // Group stuck agents by their repeating pattern
        let mut by_pattern: BTreeMap<Vec<String>, (Vec<AgentId>, usize)> = BTreeMap::new();
        for entry in self.histories.iter() {
            if now - entry.last_progress < stale_after {
                continue;
            }
            let states: Vec<String> = entry.states.iter().cloned().collect();
            if let Some((pattern, repeats)) = repeating_suffix(&states, min_repeats, max_period) {
                let slot = by_pattern.entry(pattern).or_insert_with(|| (Vec::new(), 0));
                slot.0.push(entry.key().clone());
                slot.1 = slot.1.max(repeats);
            }
        }

        by_pattern
            .into_iter()
            .map(|(pattern, (mut agents, repeats))| {
                agents.sort();
                LivelockReport {
                    agents,
                    pattern,
                    repeats,
                    detected_at: now,
                }
            })
            .collect()
    }
}

/// Shortest period whose periodic suffix repeats at least `min_repeats`
/// times. Returns the pattern (one period, oldest first) and the count.
fn repeating_suffix(
    states: &[String],
    min_repeats: usize,
    max_period: usize,
) -> Option<(Vec<String>, usize)> {
    let n = states.len();
    for period in 1..=max_period.min(n) {
        let mut matched = 0;
        while matched + period < n && states[n - 1 - matched] == states[n - 1 - matched - period] {
            matched += 1;
        }
        let repeats = (matched + period) / period;
        if repeats >= min_repeats {
            return Some((states[n - period..].to_vec(), repeats));
        }
    }
    None
}
