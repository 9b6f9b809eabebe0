//! Fingerprinting of the desired graph.
//!
//! The fingerprint is computed over canonical nodes, not over the YAML
//! text, so reordering rules, routes or listeners leaves it unchanged. It
//! is printed with every plan and run report to tell two runs of the same
//! description apart from runs of an edited one.

use sha2::{Digest, Sha256};

use crate::graph::{ResourceGraph, ResourceNode};

/// Hasher for computing graph fingerprints.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a fingerprint of the whole desired graph.
    #[must_use]
    pub fn hash_graph(&self, graph: &ResourceGraph) -> String {
        let mut hasher = Sha256::new();
        hasher.update(graph.network().as_bytes());

        // Sorted by key for determinism
        let mut nodes: Vec<&ResourceNode> = graph.ordered().collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        for node in nodes {
            hasher.update(self.hash_node(node).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a fingerprint of one node's canonical attributes.
    #[must_use]
    pub fn hash_node(&self, node: &ResourceNode) -> String {
        let mut hasher = Sha256::new();
        hasher.update(node.key.to_string().as_bytes());
        // Specs only hold sets and maps with ordered iteration, so the JSON
        // form is canonical.
        match serde_json::to_vec(&node.spec) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(format!("{:?}", node.spec).as_bytes()),
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::GraphBuilder;

    fn fingerprint(yaml: &str) -> String {
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let graph = GraphBuilder::new(&config).build().unwrap();
        ConfigHasher::new().hash_graph(&graph)
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let yaml = "environment: staging\nsubnets:\n  a: { size: 24 }\n";
        assert_eq!(fingerprint(yaml), fingerprint(yaml));
    }

    #[test]
    fn test_rule_order_does_not_change_fingerprint() {
        let a = r"
environment: staging
security_groups:
  web: { inbound: [[0.0.0.0/0, tcp, 443], [10.0.0.0/8, tcp, 22]] }
";
        let b = r"
environment: staging
security_groups:
  web: { inbound: [[10.0.0.0/8, tcp, 22], [0.0.0.0/0, tcp, 443]] }
";
        assert_eq!(fingerprint(a), fingerprint(b));
    }

    #[test]
    fn test_edit_changes_fingerprint() {
        let a = "environment: staging\nsubnets:\n  a: { size: 24 }\n";
        let b = "environment: staging\nsubnets:\n  a: { size: 24, public: true }\n";
        assert_ne!(fingerprint(a), fingerprint(b));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }
}
