//! Workflow specifications
//!
//! A WorkflowSpec is a dependency DAG of tasks. Specs are validated once,
//! up front: duplicate ids, dangling dependencies, miswired compensation
//! hooks and cycles are all load-time errors. A spec that validates is
//! guaranteed to schedule.

use crate::{RiskTier, SpecError, SpecResult, TaskId, TaskSpec, TaskType, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

// ── Safety policy ────────────────────────────────────────────────────

/// Raises the effective risk tier of matching actions.
///
/// `action` is an exact verb or a prefix pattern ending in `*`
/// (e.g. `deploy:*`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyRule {
    pub action: String,
    pub min_tier: RiskTier,
}

impl SafetyRule {
    pub fn new(action: impl Into<String>, min_tier: RiskTier) -> Self {
        Self {
            action: action.into(),
            min_tier,
        }
    }

    pub fn matches(&self, action: &str) -> bool {
        if self.action == "*" {
            return true;
        }
        if let Some(prefix) = self.action.strip_suffix('*') {
            return action.starts_with(prefix);
        }
        self.action == action
    }
}

/// A named set of tier-escalation rules.
///
/// Policies can only raise tiers. A task declared CRITICAL stays
/// CRITICAL no matter what the policy says.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyPolicy {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rules: Vec<SafetyRule>,
}

impl SafetyPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: SafetyRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Effective tier for `action`: the declared tier, raised to the
    /// highest minimum among matching rules.
    pub fn tier_for(&self, action: &str, declared: RiskTier) -> RiskTier {
        self.rules
            .iter()
            .filter(|r| r.matches(action))
            .map(|r| r.min_tier)
            .fold(declared, RiskTier::max)
    }
}

// ── Workflow spec ────────────────────────────────────────────────────

fn default_version() -> u32 {
    1
}

/// A validated DAG of tasks — the unit of submission to the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: WorkflowId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub tasks: Vec<TaskSpec>,
    /// task id -> ids it depends on; absent keys have no dependencies
    #[serde(default)]
    pub dependencies: BTreeMap<TaskId, Vec<TaskId>>,
    /// Optional tier-escalation rules applied by the policy guard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<SafetyPolicy>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl WorkflowSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(id),
            name: name.into(),
            version: 1,
            tasks: Vec::new(),
            dependencies: BTreeMap::new(),
            policy: None,
            metadata: HashMap::new(),
        }
    }

    pub fn add_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    /// Declare that `task` runs only after every id in `after` succeeded.
    pub fn depends(mut self, task: impl Into<String>, after: &[&str]) -> Self {
        self.dependencies.insert(
            TaskId::new(task),
            after.iter().map(|id| TaskId::new(*id)).collect(),
        );
        self
    }

    pub fn with_policy(mut self, policy: SafetyPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    /// Dependencies of `id`, empty when none were declared.
    pub fn deps_of(&self, id: &TaskId) -> &[TaskId] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tasks that list `id` as a dependency.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&TaskId> {
        self.dependencies
            .iter()
            .filter(|(_, deps)| deps.contains(id))
            .map(|(task, _)| task)
            .collect()
    }

    /// Tasks the scheduler runs, i.e. everything except compensation
    /// tasks, which only run via hooks.
    pub fn schedulable_tasks(&self) -> impl Iterator<Item = &TaskSpec> {
        self.tasks.iter().filter(|t| !t.is_compensation())
    }

    /// Validate the spec for structural correctness.
    pub fn validate(&self) -> SpecResult<()> {
        if self.tasks.is_empty() {
            return Err(SpecError::EmptyWorkflow);
        }

        // Task ids are unique
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(&task.id) {
                return Err(SpecError::DuplicateTask(task.id.clone()));
            }
        }

        // Dependencies reference known tasks and never self-reference
        for (task, deps) in &self.dependencies {
            if !seen.contains(task) {
                return Err(SpecError::UnknownTask(task.clone()));
            }
            for dep in deps {
                if !seen.contains(dep) {
                    return Err(SpecError::UnknownTask(dep.clone()));
                }
                if dep == task {
                    return Err(SpecError::SelfDependency(task.clone()));
                }
            }
        }

        // Compensation hooks point at compensation tasks
        for task in &self.tasks {
            for hook in task.compensation.referenced() {
                match self.task(hook) {
                    Some(target) if target.is_compensation() => {}
                    _ => {
                        return Err(SpecError::BadCompensationHook {
                            task: task.id.clone(),
                            hook: hook.clone(),
                        })
                    }
                }
            }
        }

        // Compensation tasks stay out of the dependency graph
        for task in self.tasks.iter().filter(|t| t.is_compensation()) {
            let in_graph = self.dependencies.contains_key(&task.id)
                || self.dependencies.values().any(|deps| deps.contains(&task.id));
            if in_graph {
                return Err(SpecError::CompensationInGraph(task.id.clone()));
            }
        }

        if self.schedulable_tasks().next().is_none() {
            return Err(SpecError::EmptyWorkflow);
        }

        self.topological_order().map(|_| ())
    }

    /// Deterministic topological order over schedulable tasks.
    ///
    /// Kahn's algorithm; ties are broken by task id so the same spec
    /// always yields the same order. Compensation tasks are excluded.
    pub fn topological_order(&self) -> SpecResult<Vec<TaskId>> {
        let schedulable: BTreeSet<TaskId> =
            self.schedulable_tasks().map(|t| t.id.clone()).collect();

        let mut indegree: BTreeMap<TaskId, usize> =
            schedulable.iter().map(|id| (id.clone(), 0)).collect();
        let mut dependents: BTreeMap<TaskId, Vec<TaskId>> = BTreeMap::new();

        for (task, deps) in &self.dependencies {
            if !schedulable.contains(task) {
                continue;
            }
            for dep in deps {
                if let Some(count) = indegree.get_mut(task) {
                    *count += 1;
                }
                dependents.entry(dep.clone()).or_default().push(task.clone());
            }
        }

        let mut ready: BTreeSet<TaskId> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let mut ordered = Vec::with_capacity(schedulable.len());
        while let Some(next) = ready.iter().next().cloned() {
            ready.remove(&next);
            ordered.push(next.clone());
            if let Some(children) = dependents.get(&next) {
                for child in children {
                    let count = match indegree.get_mut(child) {
                        Some(count) => count,
                        None => continue,
                    };
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(child.clone());
                    }
                }
            }
        }

        if ordered.len() != schedulable.len() {
            let placed: HashSet<&TaskId> = ordered.iter().collect();
            let stuck: Vec<TaskId> = schedulable
                .iter()
                .filter(|id| !placed.contains(id))
                .cloned()
                .collect();
            return Err(SpecError::CycleDetected(stuck));
        }

        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompensationHook;

    fn diamond() -> WorkflowSpec {
        WorkflowSpec::new("wf-diamond", "Diamond")
            .add_task(TaskSpec::new("a", "A"))
            .add_task(TaskSpec::new("b", "B"))
            .add_task(TaskSpec::new("c", "C"))
            .add_task(TaskSpec::new("d", "D"))
            .depends("b", &["a"])
            .depends("c", &["a"])
            .depends("d", &["b", "c"])
    }

    #[test]
    fn diamond_validates_and_orders() {
        let spec = diamond();
        spec.validate().unwrap();
        let order = spec.topological_order().unwrap();
        assert_eq!(
            order,
            vec![
                TaskId::new("a"),
                TaskId::new("b"),
                TaskId::new("c"),
                TaskId::new("d"),
            ]
        );
    }

    #[test]
    fn order_is_deterministic_across_calls() {
        let spec = diamond();
        let first = spec.topological_order().unwrap();
        for _ in 0..10 {
            assert_eq!(spec.topological_order().unwrap(), first);
        }
    }

    #[test]
    fn cycle_is_rejected() {
        let spec = WorkflowSpec::new("wf-cycle", "Cycle")
            .add_task(TaskSpec::new("a", "A"))
            .add_task(TaskSpec::new("b", "B"))
            .depends("a", &["b"])
            .depends("b", &["a"]);
        match spec.validate() {
            Err(SpecError::CycleDetected(stuck)) => {
                assert_eq!(stuck.len(), 2);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_rejected() {
        let spec = WorkflowSpec::new("wf-self", "Self")
            .add_task(TaskSpec::new("a", "A"))
            .depends("a", &["a"]);
        assert!(matches!(
            spec.validate(),
            Err(SpecError::SelfDependency(_))
        ));
    }

    #[test]
    fn duplicate_task_is_rejected() {
        let spec = WorkflowSpec::new("wf-dup", "Dup")
            .add_task(TaskSpec::new("a", "A"))
            .add_task(TaskSpec::new("a", "Again"));
        assert!(matches!(spec.validate(), Err(SpecError::DuplicateTask(_))));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let spec = WorkflowSpec::new("wf-ghost", "Ghost")
            .add_task(TaskSpec::new("a", "A"))
            .depends("a", &["ghost"]);
        assert!(matches!(spec.validate(), Err(SpecError::UnknownTask(_))));
    }

    #[test]
    fn hook_must_point_at_compensation_task() {
        let spec = WorkflowSpec::new("wf-hook", "Hook")
            .add_task(
                TaskSpec::new("a", "A").with_compensation(CompensationHook::on_failure("b")),
            )
            .add_task(TaskSpec::new("b", "B"));
        assert!(matches!(
            spec.validate(),
            Err(SpecError::BadCompensationHook { .. })
        ));
    }

    #[test]
    fn compensation_task_cannot_join_graph() {
        let spec = WorkflowSpec::new("wf-comp", "Comp")
            .add_task(TaskSpec::new("a", "A"))
            .add_task(TaskSpec::new("undo", "Undo").with_type(TaskType::Compensation))
            .depends("undo", &["a"]);
        assert!(matches!(
            spec.validate(),
            Err(SpecError::CompensationInGraph(_))
        ));
    }

    #[test]
    fn compensation_tasks_are_not_scheduled() {
        let spec = WorkflowSpec::new("wf", "Wf")
            .add_task(TaskSpec::new("a", "A"))
            .add_task(TaskSpec::new("undo", "Undo").with_type(TaskType::Compensation));
        spec.validate().unwrap();
        let order = spec.topological_order().unwrap();
        assert_eq!(order, vec![TaskId::new("a")]);
    }

    #[test]
    fn policy_raises_tier_but_never_lowers() {
        let policy = SafetyPolicy::new("prod")
            .with_rule(SafetyRule::new("deploy:*", RiskTier::High))
            .with_rule(SafetyRule::new("state:write", RiskTier::Medium));
        assert_eq!(policy.tier_for("deploy:api", RiskTier::Low), RiskTier::High);
        assert_eq!(
            policy.tier_for("deploy:api", RiskTier::Critical),
            RiskTier::Critical
        );
        assert_eq!(
            policy.tier_for("state:write", RiskTier::Low),
            RiskTier::Medium
        );
        assert_eq!(policy.tier_for("noop", RiskTier::Low), RiskTier::Low);
    }

    #[test]
    fn dependents_lookup() {
        let spec = diamond();
        let deps = spec.dependents_of(&TaskId::new("a"));
        assert_eq!(deps.len(), 2);
    }
}
