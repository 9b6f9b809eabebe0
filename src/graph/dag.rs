//! Dependency DAG shared by the desired and live graphs.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::ConfigError;

use super::cidr::Cidr;
use super::kind::{Edge, EdgeKind, NodeKey};
use super::node::{LiveResource, ResourceNode, ResourceSpec};

/// Pure topology: nodes plus typed "depends on" edges.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    nodes: BTreeSet<NodeKey>,
    deps: BTreeMap<NodeKey, BTreeMap<NodeKey, EdgeKind>>,
}

impl Dag {
    /// Creates an empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node.
    pub fn add_node(&mut self, key: NodeKey) {
        self.deps.entry(key.clone()).or_default();
        self.nodes.insert(key);
    }

    /// Adds an edge: `from` depends on `to`. Both nodes must already exist.
    pub fn add_edge(&mut self, from: &NodeKey, to: NodeKey, kind: EdgeKind) {
        if let Some(deps) = self.deps.get_mut(from) {
            deps.insert(to, kind);
        }
    }

    /// Returns true if the node exists.
    #[must_use]
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains(key)
    }

    /// All nodes, in key order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeKey> {
        self.nodes.iter()
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, key: &NodeKey) -> impl Iterator<Item = &NodeKey> {
        self.deps.get(key).into_iter().flat_map(BTreeMap::keys)
    }

    /// Direct dependents of a node.
    #[must_use]
    pub fn dependents(&self, key: &NodeKey) -> Vec<&NodeKey> {
        self.deps
            .iter()
            .filter(|(_, deps)| deps.contains_key(key))
            .map(|(k, _)| k)
            .collect()
    }

    /// Every typed edge.
    #[must_use]
    pub fn edges(&self) -> Vec<Edge> {
        self.deps
            .iter()
            .flat_map(|(from, deps)| {
                deps.iter().map(move |(to, kind)| Edge {
                    from: from.clone(),
                    to: to.clone(),
                    kind: *kind,
                })
            })
            .collect()
    }

    /// Orders nodes so every node follows its dependencies.
    ///
    /// Kahn's algorithm with a sorted ready set, so ties resolve by kind
    /// then name and the order is stable across runs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DependencyCycle`] naming one cycle.
    pub fn topological_order(&self) -> Result<Vec<NodeKey>, ConfigError> {
        let mut in_degree: BTreeMap<&NodeKey, usize> = self
            .nodes
            .iter()
            .map(|k| (k, self.dependencies(k).filter(|d| self.nodes.contains(*d)).count()))
            .collect();

        let mut dependents: BTreeMap<&NodeKey, Vec<&NodeKey>> = BTreeMap::new();
        for (from, deps) in &self.deps {
            for to in deps.keys().filter(|d| self.nodes.contains(*d)) {
                dependents.entry(to).or_default().push(from);
            }
        }

        let mut ready: BTreeSet<&NodeKey> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(next) = ready.pop_first() {
            order.push(next.clone());
            for dependent in dependents.get(next).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let stuck: BTreeSet<&NodeKey> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(k, _)| k)
                .collect();
            Err(ConfigError::DependencyCycle {
                cycle: self.describe_cycle(&stuck),
            })
        }
    }

    /// Reverse of [`Self::topological_order`]: dependents before dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph has a cycle.
    pub fn reverse_order(&self) -> Result<Vec<NodeKey>, ConfigError> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }

    /// Every node that transitively depends on `key`.
    #[must_use]
    pub fn downstream(&self, key: &NodeKey) -> BTreeSet<NodeKey> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent.clone()) {
                    stack.push(dependent);
                }
            }
        }
        seen
    }

    /// Walks dependencies inside the stuck set until a node repeats.
    fn describe_cycle(&self, stuck: &BTreeSet<&NodeKey>) -> String {
        let Some(start) = stuck.first() else {
            return String::from("<unknown>");
        };
        let mut path: Vec<&NodeKey> = vec![*start];
        loop {
            let Some(current) = path.last() else { break };
            let Some(next) = self.dependencies(current).find(|d| stuck.contains(d)) else {
                break;
            };
            if let Some(pos) = path.iter().position(|k| *k == next) {
                let mut cycle: Vec<String> = path[pos..].iter().map(ToString::to_string).collect();
                cycle.push(next.to_string());
                return cycle.join(" -> ");
            }
            path.push(next);
        }
        path.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
    }
}

/// The desired graph produced by the builder.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    network: String,
    nodes: BTreeMap<NodeKey, ResourceNode>,
    dag: Dag,
    order: Vec<NodeKey>,
}

impl ResourceGraph {
    /// Assembles a validated graph. Intended for the builder.
    pub(crate) fn from_parts(network: String, nodes: BTreeMap<NodeKey, ResourceNode>, dag: Dag, order: Vec<NodeKey>) -> Self {
        Self {
            network,
            nodes,
            dag,
            order,
        }
    }

    /// Logical name of the network node.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Looks up a node.
    #[must_use]
    pub fn get(&self, key: &NodeKey) -> Option<&ResourceNode> {
        self.nodes.get(key)
    }

    /// Nodes in dependency order.
    pub fn ordered(&self) -> impl Iterator<Item = &ResourceNode> {
        self.order.iter().filter_map(|k| self.nodes.get(k))
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The underlying topology.
    #[must_use]
    pub const fn dag(&self) -> &Dag {
        &self.dag
    }
}

/// The as-is graph, built by discovery and mutated by the execution engine.
#[derive(Debug, Clone, Default)]
pub struct LiveGraph {
    network: String,
    resources: BTreeMap<NodeKey, LiveResource>,
}

impl LiveGraph {
    /// Creates an empty live graph for the environment's network.
    #[must_use]
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            resources: BTreeMap::new(),
        }
    }

    /// Logical name of the network node.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Looks up a resource.
    #[must_use]
    pub fn get(&self, key: &NodeKey) -> Option<&LiveResource> {
        self.resources.get(key)
    }

    /// Remote identifier of a resource.
    #[must_use]
    pub fn remote_id(&self, key: &NodeKey) -> Option<&str> {
        self.resources.get(key).map(|r| r.remote_id.as_str())
    }

    /// Inserts or replaces a resource.
    pub fn insert(&mut self, resource: LiveResource) {
        self.resources.insert(resource.key.clone(), resource);
    }

    /// Removes a resource.
    pub fn remove(&mut self, key: &NodeKey) -> Option<LiveResource> {
        self.resources.remove(key)
    }

    /// All resources, in key order.
    pub fn iter(&self) -> impl Iterator<Item = &LiveResource> {
        self.resources.values()
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if nothing was discovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Address blocks of the live subnets, by logical name.
    #[must_use]
    pub fn subnet_blocks(&self) -> BTreeMap<String, Cidr> {
        self.resources
            .values()
            .filter_map(|r| match &r.spec {
                ResourceSpec::Subnet(subnet) => Some((r.key.name.clone(), subnet.cidr.parse().ok()?)),
                _ => None,
            })
            .collect()
    }

    /// Topology of the live resources. References to resources that are not
    /// owned (or not visible) are dropped.
    #[must_use]
    pub fn dag(&self) -> Dag {
        let mut dag = Dag::new();
        for key in self.resources.keys() {
            dag.add_node(key.clone());
        }
        for resource in self.resources.values() {
            for (dep, kind) in resource.dependencies(&self.network) {
                if self.resources.contains_key(&dep) {
                    dag.add_edge(&resource.key, dep, kind);
                }
            }
        }
        dag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;

    fn key(name: &str) -> NodeKey {
        NodeKey::new(ResourceKind::Subnet, name)
    }

    fn chain() -> Dag {
        let mut dag = Dag::new();
        for name in ["a", "b", "c", "d"] {
            dag.add_node(key(name));
        }
        dag.add_edge(&key("b"), key("a"), EdgeKind::Placement);
        dag.add_edge(&key("c"), key("b"), EdgeKind::Placement);
        dag.add_edge(&key("d"), key("a"), EdgeKind::Placement);
        dag
    }

    #[test]
    fn test_topological_order() {
        let order = chain().topological_order().unwrap();
        assert_eq!(order, vec![key("a"), key("b"), key("c"), key("d")]);
    }

    #[test]
    fn test_reverse_order() {
        let order = chain().reverse_order().unwrap();
        assert_eq!(order.first(), Some(&key("d")));
        assert_eq!(order.last(), Some(&key("a")));
    }

    #[test]
    fn test_downstream() {
        let dag = chain();
        let down = dag.downstream(&key("a"));
        assert_eq!(down.len(), 3);
        assert!(dag.downstream(&key("c")).is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let mut dag = chain();
        dag.add_edge(&key("a"), key("c"), EdgeKind::Association);
        let err = dag.topological_order().unwrap_err();
        match err {
            ConfigError::DependencyCycle { cycle } => {
                assert!(cycle.contains("subnet(a)"));
                assert!(cycle.contains("subnet(c)"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
