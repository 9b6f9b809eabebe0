//! Deployment plan types and construction.
//!
//! A plan is built fresh on every run from the diff of the desired and live
//! graphs and is never persisted. Actions are stored in execution order:
//! every index in [`PlannedAction::dependencies`] is lower than the index of
//! the action that lists it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::config::GuardrailsConfig;
use crate::error::ProviderError;
use crate::graph::{LiveGraph, NodeKey, ResourceGraph, ResourceKind, ResourceSpec};

use super::diff::{DiffDetail, DiffResult, DiffType};

/// What a run is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanMode {
    /// Create and update only.
    Apply,
    /// Create and update, then delete owned resources no longer declared.
    ApplyPrune,
    /// Delete every owned resource.
    Destroy,
}

/// A complete deployment plan.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Fingerprint of the desired graph this plan is based on.
    pub config_hash: String,
    /// Mode the plan was built for.
    pub mode: PlanMode,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
    /// Whether the plan passes guardrails.
    pub passes_guardrails: bool,
    /// Guardrail violations (if any).
    pub guardrail_violations: Vec<String>,
}

/// A single planned action.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    /// Action type.
    pub action_type: ActionType,
    /// Resource address.
    pub key: NodeKey,
    /// Remote id of the live resource (if any).
    pub remote_id: Option<String>,
    /// Reason for this action.
    pub reason: String,
    /// Attribute-level changes for updates.
    pub details: Vec<DiffDetail>,
    /// Dependencies (action indices that must succeed first).
    pub dependencies: Vec<usize>,
    /// Set when the live state of this kind could not be read; the action
    /// is failed with this error instead of being attempted.
    pub blocked: Option<ProviderError>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Create a missing resource.
    Create,
    /// Change mutable attributes in place.
    Update,
    /// Delete an owned resource.
    Delete,
    /// No operation (for tracking).
    Noop,
}

impl DeploymentPlan {
    /// Creates an apply plan from a diff result.
    ///
    /// Create, update and noop actions follow the desired graph's
    /// dependency order. With `prune`, deletes of undeclared resources are
    /// appended in reverse live dependency order.
    #[must_use]
    pub fn from_diff(
        diff: &DiffResult,
        desired: &ResourceGraph,
        live: &LiveGraph,
        prune: bool,
        guardrails: Option<&GuardrailsConfig>,
        config_hash: &str,
    ) -> Self {
        let mut actions = Vec::new();
        let mut index: HashMap<NodeKey, usize> = HashMap::new();

        for resource_diff in diff.diffs.iter().filter(|d| d.diff_type != DiffType::Delete) {
            let (action_type, reason) = match resource_diff.diff_type {
                DiffType::Create => (ActionType::Create, String::from("not found in live state")),
                DiffType::Update => (
                    ActionType::Update,
                    format!("{} attribute(s) changed", resource_diff.details.len()),
                ),
                DiffType::NoChange | DiffType::Delete => (ActionType::Noop, String::from("up to date")),
            };

            let dependencies = desired
                .dag()
                .dependencies(&resource_diff.key)
                .filter_map(|dep| index.get(dep).copied())
                .collect();

            index.insert(resource_diff.key.clone(), actions.len());
            actions.push(PlannedAction {
                action_type,
                key: resource_diff.key.clone(),
                remote_id: resource_diff.remote_id.clone(),
                reason,
                details: resource_diff.details.clone(),
                dependencies,
                blocked: None,
            });
        }

        if prune {
            let orphans: BTreeMap<NodeKey, Option<String>> = diff
                .diffs
                .iter()
                .filter(|d| d.diff_type == DiffType::Delete)
                .map(|d| (d.key.clone(), d.remote_id.clone()))
                .collect();
            append_deletes(&mut actions, &mut index, live, &orphans, "no longer declared");
        }

        let mode = if prune { PlanMode::ApplyPrune } else { PlanMode::Apply };
        let violations = check_guardrails(guardrails, desired, &actions, mode);

        debug!(actions = actions.len(), ?mode, "Built plan");
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            mode,
            actions,
            passes_guardrails: violations.is_empty(),
            guardrail_violations: violations,
        }
    }

    /// Creates a teardown plan deleting every owned live resource.
    #[must_use]
    pub fn destroy(live: &LiveGraph, config_hash: &str) -> Self {
        let mut actions = Vec::new();
        let mut index = HashMap::new();
        let everything: BTreeMap<NodeKey, Option<String>> = live
            .iter()
            .map(|r| (r.key.clone(), Some(r.remote_id.clone())))
            .collect();
        append_deletes(&mut actions, &mut index, live, &everything, "environment teardown");

        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            mode: PlanMode::Destroy,
            actions,
            passes_guardrails: true,
            guardrail_violations: Vec::new(),
        }
    }

    /// Marks every action on an unreadable kind as blocked.
    pub fn block_kinds(&mut self, unavailable: &BTreeMap<ResourceKind, ProviderError>) {
        for action in &mut self.actions {
            if let Some(error) = unavailable.get(&action.key.kind) {
                action.blocked = Some(error.clone());
            }
        }
    }

    /// Returns true if every action is a noop.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.actions.iter().all(|a| a.action_type == ActionType::Noop)
    }

    /// Returns true if the plan is empty (no actions at all).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Returns the number of actions of a type.
    #[must_use]
    pub fn count(&self, action_type: ActionType) -> usize {
        self.actions.iter().filter(|a| a.action_type == action_type).count()
    }

    /// Returns the number of create actions.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(ActionType::Create)
    }

    /// Returns the number of update actions.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(ActionType::Update)
    }

    /// Returns the number of delete actions.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(ActionType::Delete)
    }

    /// Returns actions that can be executed immediately (no dependencies).
    #[must_use]
    pub fn ready_actions(&self) -> Vec<&PlannedAction> {
        self.actions.iter().filter(|a| a.dependencies.is_empty()).collect()
    }

    /// Gets actions that depend on a specific action index.
    #[must_use]
    pub fn dependent_actions(&self, action_idx: usize) -> Vec<(usize, &PlannedAction)> {
        self.actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.dependencies.contains(&action_idx))
            .collect()
    }

    /// Every action that transitively depends on `action_idx`.
    #[must_use]
    pub fn downstream(&self, action_idx: usize) -> Vec<usize> {
        let mut affected = vec![false; self.actions.len()];
        if let Some(slot) = affected.get_mut(action_idx) {
            *slot = true;
        }
        // Dependencies always point backwards, so one forward pass suffices.
        for (i, action) in self.actions.iter().enumerate().skip(action_idx + 1) {
            if action.dependencies.iter().any(|d| affected.get(*d).copied().unwrap_or(false)) {
                affected[i] = true;
            }
        }
        affected
            .iter()
            .enumerate()
            .filter(|(i, hit)| **hit && *i != action_idx)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Appends deletes for `targets` in reverse live dependency order.
///
/// A delete waits for every action already planned on one of its live
/// dependents: their deletes, or updates that move them off the target.
fn append_deletes(
    actions: &mut Vec<PlannedAction>,
    index: &mut HashMap<NodeKey, usize>,
    live: &LiveGraph,
    targets: &BTreeMap<NodeKey, Option<String>>,
    reason: &str,
) {
    if targets.is_empty() {
        return;
    }

    let dag = live.dag();
    let order = dag.reverse_order().unwrap_or_else(|e| {
        warn!(error = %e, "Live graph has a cycle, deleting in reverse kind order");
        let mut keys: Vec<NodeKey> = dag.nodes().cloned().collect();
        keys.sort_by(|a, b| b.cmp(a));
        keys
    });

    for key in order {
        let Some(remote_id) = targets.get(&key) else {
            continue;
        };
        let mut dependencies: Vec<usize> = dag
            .dependents(&key)
            .into_iter()
            .filter_map(|dependent| index.get(dependent).copied())
            .collect();
        dependencies.sort_unstable();

        // Deletes and updates of the same key never coexist; the index now
        // points at the delete.
        index.insert(key.clone(), actions.len());
        actions.push(PlannedAction {
            action_type: ActionType::Delete,
            key,
            remote_id: remote_id.clone(),
            reason: reason.to_string(),
            details: Vec::new(),
            dependencies,
            blocked: None,
        });
    }
}

/// Checks guardrails for the plan.
fn check_guardrails(
    guardrails: Option<&GuardrailsConfig>,
    desired: &ResourceGraph,
    actions: &[PlannedAction],
    mode: PlanMode,
) -> Vec<String> {
    let mut violations = Vec::new();
    let Some(guardrails) = guardrails else {
        return violations;
    };

    if let Some(max_instances) = guardrails.max_instances {
        let total: u32 = desired
            .ordered()
            .filter_map(|n| match &n.spec {
                ResourceSpec::InstanceGroup(group) => Some(group.count),
                _ => None,
            })
            .sum();
        if total > max_instances {
            violations.push(format!(
                "Plan requires {total} instances but max_instances is {max_instances}"
            ));
        }
    }

    if mode == PlanMode::ApplyPrune
        && let Some(max_deletes) = guardrails.max_deletes
    {
        let deletes = actions.iter().filter(|a| a.action_type == ActionType::Delete).count();
        if deletes > max_deletes {
            violations.push(format!(
                "Plan deletes {deletes} resources but max_deletes is {max_deletes}"
            ));
        }
    }

    violations
}

impl PlannedAction {
    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action_type {
            ActionType::Create => format!("Create {}", self.key),
            ActionType::Update => format!("Update {}", self.key),
            ActionType::Delete => format!("Delete {}", self.key),
            ActionType::Noop => format!("No change for {}", self.key),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Noop => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Apply => "apply",
            Self::ApplyPrune => "apply --prune",
            Self::Destroy => "destroy",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action_type, self.key)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        for detail in &self.details {
            write!(
                f,
                "\n       {}: {} -> {}",
                detail.field,
                detail.old_value.as_deref().unwrap_or("-"),
                detail.new_value.as_deref().unwrap_or("-")
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({}, {} actions):", self.mode, self.actions.len())?;
        for (i, action) in self.actions.iter().enumerate() {
            writeln!(f, "  {i}. {action}")?;
        }

        if !self.guardrail_violations.is_empty() {
            writeln!(f, "\nGuardrail violations:")?;
            for violation in &self.guardrail_violations {
                writeln!(f, "  - {violation}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::{GraphBuilder, LiveResource};
    use crate::planner::DiffEngine;

    const SCENARIO: &str = r"
environment: staging
network: { cidr: 10.0.0.0/16 }
route_tables:
  private: { routes: [[0.0.0.0/0, nat]] }
subnets:
  private-1: { size: 24, route_table: private }
  private-2: { size: 24, route_table: private }
";

    fn graph(yaml: &str) -> ResourceGraph {
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        GraphBuilder::new(&config).build().unwrap()
    }

    fn mirror(graph: &ResourceGraph) -> LiveGraph {
        let mut live = LiveGraph::new(graph.network());
        for (i, node) in graph.ordered().enumerate() {
            live.insert(LiveResource {
                key: node.key.clone(),
                remote_id: format!("id-{i}"),
                tags: BTreeMap::new(),
                spec: node.spec.clone(),
            });
        }
        live
    }

    fn plan(desired: &ResourceGraph, live: &LiveGraph, prune: bool, guardrails: Option<&GuardrailsConfig>) -> DeploymentPlan {
        let diff = DiffEngine::new().compute_diff(desired, live, prune).unwrap();
        DeploymentPlan::from_diff(&diff, desired, live, prune, guardrails, "hash")
    }

    fn assert_backward_dependencies(plan: &DeploymentPlan) {
        for (i, action) in plan.actions.iter().enumerate() {
            for dep in &action.dependencies {
                assert!(*dep < i, "action {i} depends on later action {dep}");
            }
        }
    }

    #[test]
    fn test_scenario_first_apply() {
        let desired = graph(SCENARIO);
        let plan = plan(&desired, &LiveGraph::new("staging"), false, None);

        let summary: Vec<(ActionType, String)> = plan
            .actions
            .iter()
            .map(|a| (a.action_type, a.key.to_string()))
            .collect();
        assert_eq!(plan.action_count(), 4);
        assert_eq!(summary[0].1, NodeKey::new(ResourceKind::Network, "staging").to_string());
        assert_eq!(summary[1].1, NodeKey::new(ResourceKind::RouteTable, "private").to_string());
        assert!(summary.iter().all(|(t, _)| *t == ActionType::Create));

        // Both subnets wait for the route table.
        for action in &plan.actions[2..] {
            assert!(action.dependencies.contains(&1));
            assert!(action.dependencies.contains(&0));
        }
        assert_backward_dependencies(&plan);
    }

    #[test]
    fn test_second_apply_all_noop() {
        let desired = graph(SCENARIO);
        let plan = plan(&desired, &mirror(&desired), false, None);
        assert_eq!(plan.action_count(), 4);
        assert!(plan.is_converged());
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_removed_entry_not_deleted_without_prune() {
        let live = mirror(&graph(SCENARIO));
        let shrunk = graph(&SCENARIO.replace("  private-2: { size: 24, route_table: private }\n", ""));

        let apply = plan(&shrunk, &live, false, None);
        assert_eq!(apply.delete_count(), 0);

        let pruned = plan(&shrunk, &live, true, None);
        assert_eq!(pruned.delete_count(), 1);
        assert_eq!(pruned.mode, PlanMode::ApplyPrune);
        let delete = pruned.actions.last().unwrap();
        assert_eq!(delete.key, NodeKey::new(ResourceKind::Subnet, "private-2"));
        assert_backward_dependencies(&pruned);
    }

    #[test]
    fn test_destroy_deletes_dependents_first() {
        let live = mirror(&graph(SCENARIO));
        let plan = DeploymentPlan::destroy(&live, "hash");

        assert_eq!(plan.delete_count(), 4);
        let position = |kind: ResourceKind| plan.actions.iter().position(|a| a.key.kind == kind).unwrap();
        assert!(position(ResourceKind::Subnet) < position(ResourceKind::RouteTable));
        assert!(position(ResourceKind::RouteTable) < position(ResourceKind::Network));

        let network = plan.actions.last().unwrap();
        assert_eq!(network.key.kind, ResourceKind::Network);
        assert_eq!(network.dependencies.len(), 3);
        assert_backward_dependencies(&plan);
    }

    #[test]
    fn test_guardrails() {
        let yaml = r"
environment: staging
subnets:
  a: { size: 24 }
instance_groups:
  web: { ami: ami-123, instance_type: t3.small, count: 5, subnets: [a] }
";
        let desired = graph(yaml);
        let guardrails = GuardrailsConfig {
            max_instances: Some(3),
            max_deletes: None,
        };
        let plan = plan(&desired, &LiveGraph::new("staging"), false, Some(&guardrails));
        assert!(!plan.passes_guardrails);
        assert!(plan.guardrail_violations[0].contains("max_instances"));
    }

    #[test]
    fn test_max_deletes_only_in_prune() {
        let live = mirror(&graph(SCENARIO));
        let shrunk = graph("environment: staging\nnetwork: { cidr: 10.0.0.0/16 }\n");
        let guardrails = GuardrailsConfig {
            max_instances: None,
            max_deletes: Some(2),
        };

        assert!(plan(&shrunk, &live, false, Some(&guardrails)).passes_guardrails);
        let pruned = plan(&shrunk, &live, true, Some(&guardrails));
        assert_eq!(pruned.delete_count(), 3);
        assert!(!pruned.passes_guardrails);
    }

    #[test]
    fn test_downstream_and_blocking() {
        let desired = graph(SCENARIO);
        let mut plan = plan(&desired, &LiveGraph::new("staging"), false, None);

        assert_eq!(plan.downstream(1), vec![2, 3]);
        assert_eq!(plan.downstream(0), vec![1, 2, 3]);

        let unavailable = BTreeMap::from([(ResourceKind::Subnet, ProviderError::rate_limited("throttled"))]);
        plan.block_kinds(&unavailable);
        assert_eq!(plan.actions.iter().filter(|a| a.blocked.is_some()).count(), 2);
    }
}
