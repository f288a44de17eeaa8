//! Wait-for graph and cycle detection
//!
//! Edges run from a waiting agent to every current holder of the
//! resource it wants. A cycle in that graph is a deadlock: nobody on
//! the cycle can proceed until somebody is released. The graph is
//! rebuilt from the live lock table on every detection pass, so
//! reports are always derived, never stored.

use chrono::{DateTime, Utc};
use keel_types::{AgentId, ResourceId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// One detected cycle.
#[derive(Clone, Debug, Serialize)]
pub struct DeadlockReport {
    /// Agents on the cycle, rotated so the smallest id leads
    pub cycle: Vec<AgentId>,
    /// Resources the cycle is contended on
    pub resources: Vec<ResourceId>,
    pub detected_at: DateTime<Utc>,
}

impl DeadlockReport {
    pub fn involves(&self, agent: &AgentId) -> bool {
        self.cycle.iter().any(|a| a == agent)
    }
}

#[derive(Default)]
pub(crate) struct WaitForGraph {
    edges: BTreeMap<AgentId, Vec<(AgentId, ResourceId)>>,
}

impl WaitForGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_edge(&mut self, from: AgentId, to: AgentId, resource: ResourceId) {
        self.edges.entry(from).or_default().push((to, resource));
    }

    /// DFS over agent ids. Every distinct cycle is reported once, in a
    /// canonical rotation, so repeated sweeps stay deterministic.
    pub(crate) fn detect(&self) -> Vec<DeadlockReport> {
        let mut reports = Vec::new();
        let mut seen: BTreeSet<Vec<AgentId>> = BTreeSet::new();
        let mut visited: BTreeSet<AgentId> = BTreeSet::new();

        for start in self.edges.keys() {
            if visited.contains(start) {
                continue;
            }
            let mut stack: Vec<(AgentId, Option<ResourceId>)> = Vec::new();
            self.visit(start, None, &mut stack, &mut visited, &mut seen, &mut reports);
        }
        reports
    }

    fn visit(
        &self,
        node: &AgentId,
        via: Option<ResourceId>,
        stack: &mut Vec<(AgentId, Option<ResourceId>)>,
        visited: &mut BTreeSet<AgentId>,
        seen: &mut BTreeSet<Vec<AgentId>>,
        reports: &mut Vec<DeadlockReport>,
    ) {
        stack.push((node.clone(), via));

        if let Some(edges) = self.edges.get(node) {
            for (to, resource) in edges {
                if let Some(pos) = stack.iter().position(|(a, _)| a == to) {
                    // Back edge: stack[pos..] plus this edge closes a cycle
                    let mut cycle: Vec<AgentId> =
                        stack[pos..].iter().map(|(a, _)| a.clone()).collect();
                    let mut resources: Vec<ResourceId> = stack[pos + 1..]
                        .iter()
                        .filter_map(|(_, r)| r.clone())
                        .collect();
                    resources.push(resource.clone());
                    resources.sort();
                    resources.dedup();

                    rotate_to_smallest(&mut cycle);
                    if seen.insert(cycle.clone()) {
                        reports.push(DeadlockReport {
                            cycle,
                            resources,
                            detected_at: Utc::now(),
                        });
                    }
                } else if !visited.contains(to) {
                    self.visit(to, Some(resource.clone()), stack, visited, seen, reports);
                }
            }
        }

        stack.pop();
        visited.insert(node.clone());
    }
}

fn rotate_to_smallest(cycle: &mut [AgentId]) {
    if let Some(min) = cycle.iter().min().cloned() {
        if let Some(pos) = cycle.iter().position(|a| *a == min) {
            cycle.rotate_left(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str) -> AgentId {
        AgentId::new(name)
    }

    fn resource(name: &str) -> ResourceId {
        ResourceId::new(name)
    }

    #[test]
    fn two_agent_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(agent("a"), agent("b"), resource("r2"));
        graph.add_edge(agent("b"), agent("a"), resource("r1"));

        let reports = graph.detect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].cycle, vec![agent("a"), agent("b")]);
        assert_eq!(reports[0].resources, vec![resource("r1"), resource("r2")]);
    }

    #[test]
    fn waiting_chain_without_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(agent("a"), agent("b"), resource("r1"));
        graph.add_edge(agent("b"), agent("c"), resource("r2"));

        assert!(graph.detect().is_empty());
    }

    #[test]
    fn three_agent_cycle_reported_once() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(agent("c"), agent("a"), resource("r1"));
        graph.add_edge(agent("a"), agent("b"), resource("r2"));
        graph.add_edge(agent("b"), agent("c"), resource("r3"));

        let reports = graph.detect();
        assert_eq!(reports.len(), 1);
        // Canonical rotation puts "a" first
        assert_eq!(reports[0].cycle[0], agent("a"));
        assert_eq!(reports[0].cycle.len(), 3);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(agent("a"), agent("b"), resource("r1"));
        graph.add_edge(agent("a"), agent("c"), resource("r2"));
        graph.add_edge(agent("b"), agent("d"), resource("r3"));
        graph.add_edge(agent("c"), agent("d"), resource("r4"));

        assert!(graph.detect().is_empty());
    }

    #[test]
    fn self_wait_is_a_cycle_of_one() {
        // A shared holder queued behind its own exclusive upgrade
        let mut graph = WaitForGraph::new();
        graph.add_edge(agent("a"), agent("a"), resource("r1"));

        let reports = graph.detect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].cycle, vec![agent("a")]);
    }
}
