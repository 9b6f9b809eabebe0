//! Resource kinds, node addressing and edge types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed enumeration of resource kinds managed by the engine.
///
/// Variant order is the tie-break order used when several nodes are ready at
/// once, so plans list the network first and load balancers last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// The environment network (VPC) and its internet gateway.
    Network,
    /// DHCP option set associated with the network.
    DhcpOptions,
    /// Route table and its routes.
    RouteTable,
    /// Subnet carved from the network CIDR.
    Subnet,
    /// Security group, without rules.
    SecurityGroup,
    /// The rule set of one security group.
    SecurityGroupRules,
    /// SSH key pair.
    KeyPair,
    /// Gateway endpoint attached to route tables.
    Endpoint,
    /// A homogeneous group of compute instances.
    InstanceGroup,
    /// Load balancer in front of an instance group.
    LoadBalancer,
}

impl ResourceKind {
    /// Every kind, in scheduling order.
    pub const ALL: [Self; 10] = [
        Self::Network,
        Self::DhcpOptions,
        Self::RouteTable,
        Self::Subnet,
        Self::SecurityGroup,
        Self::SecurityGroupRules,
        Self::KeyPair,
        Self::Endpoint,
        Self::InstanceGroup,
        Self::LoadBalancer,
    ];

    /// Returns the kebab-case name used in tags and output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::DhcpOptions => "dhcp-options",
            Self::RouteTable => "route-table",
            Self::Subnet => "subnet",
            Self::SecurityGroup => "security-group",
            Self::SecurityGroupRules => "security-group-rules",
            Self::KeyPair => "key-pair",
            Self::Endpoint => "endpoint",
            Self::InstanceGroup => "instance-group",
            Self::LoadBalancer => "load-balancer",
        }
    }

    /// Returns true if resources of this kind carry their own tags.
    ///
    /// A rule set lives on its group and is identified through the group's tags.
    #[must_use]
    pub const fn is_taggable(self) -> bool {
        !matches!(self, Self::SecurityGroupRules)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind '{s}'"))
    }
}

/// Address of a node: its kind plus its logical name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Logical name, unique within the kind.
    pub name: String,
}

impl NodeKey {
    /// Creates a new node key.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.name)
    }
}

/// Typed relationship between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    /// The resource lives inside the network.
    Placement,
    /// The resource is associated with another (subnet to route table).
    Association,
    /// A rule set belongs to its security group.
    RuleTarget,
    /// A rule admits traffic from another security group.
    RuleSource,
    /// A route sends traffic through an instance group.
    RouteTarget,
    /// Instances use the target for network access or login.
    Access,
    /// A load balancer fronts the target instance group.
    Membership,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Placement => "placement",
            Self::Association => "association",
            Self::RuleTarget => "rule-target",
            Self::RuleSource => "rule-source",
            Self::RouteTarget => "route-target",
            Self::Access => "access",
            Self::Membership => "membership",
        };
        f.write_str(s)
    }
}

/// A directed edge: `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// The dependent node.
    pub from: NodeKey,
    /// The dependency.
    pub to: NodeKey,
    /// Relationship type.
    pub kind: EdgeKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>(), Ok(kind));
        }
        assert!("vpc".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_kind_order_puts_network_first() {
        let mut kinds = ResourceKind::ALL.to_vec();
        kinds.reverse();
        kinds.sort();
        assert_eq!(kinds.first(), Some(&ResourceKind::Network));
        assert_eq!(kinds.last(), Some(&ResourceKind::LoadBalancer));
    }

    #[test]
    fn test_node_key_display() {
        let key = NodeKey::new(ResourceKind::Subnet, "private-1");
        assert_eq!(key.to_string(), "subnet(private-1)");
    }
}
