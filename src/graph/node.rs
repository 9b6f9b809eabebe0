//! Resource nodes and their kind-specific attribute sets.
//!
//! References to other resources are stored as logical names in desired
//! nodes. Providers store and report remote identifiers instead; discovery
//! maps those back to logical names with [`ResourceSpec::map_refs`] so both
//! graphs share one addressing scheme.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::kind::{EdgeKind, NodeKey, ResourceKind};

/// A vertex of the desired graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Kind and logical name.
    pub key: NodeKey,
    /// Desired attributes.
    pub spec: ResourceSpec,
}

/// The as-is counterpart of a [`ResourceNode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveResource {
    /// Kind and logical name, derived from the name tag.
    pub key: NodeKey,
    /// Identifier assigned by the control plane.
    pub remote_id: String,
    /// Tags as reported by the provider.
    pub tags: BTreeMap<String, String>,
    /// Reported attributes, references expressed as logical names.
    pub spec: ResourceSpec,
}

/// Kind-specific attribute set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceSpec {
    /// Network attributes.
    Network(NetworkSpec),
    /// DHCP option set attributes.
    DhcpOptions(DhcpOptionsSpec),
    /// Route table attributes.
    RouteTable(RouteTableSpec),
    /// Subnet attributes.
    Subnet(SubnetSpec),
    /// Security group attributes.
    SecurityGroup(SecurityGroupSpec),
    /// Security group rule set.
    SecurityGroupRules(RuleSetSpec),
    /// Key pair attributes.
    KeyPair(KeyPairSpec),
    /// Endpoint attributes.
    Endpoint(EndpointSpec),
    /// Instance group attributes.
    InstanceGroup(InstanceGroupSpec),
    /// Load balancer attributes.
    LoadBalancer(LoadBalancerSpec),
}

/// Network (VPC) attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Address block.
    pub cidr: String,
    /// Instance tenancy (`default` or `dedicated`).
    pub tenancy: String,
    /// DNS support and hostnames enabled.
    pub enable_dns: bool,
    /// An internet gateway is attached.
    pub internet_gateway: bool,
    /// Virtual private gateway attached to the network. It is created
    /// outside the environment and only attached or detached here.
    pub vpn_gateway: Option<String>,
}

/// DHCP option set attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpOptionsSpec {
    /// Search domain.
    pub domain_name: Option<String>,
    /// Name servers, in resolution order.
    pub domain_name_servers: Vec<String>,
}

/// Route table attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTableSpec {
    /// Whether this is the network's main route table.
    pub main: bool,
    /// Routes, compared as a set.
    pub routes: BTreeSet<Route>,
}

/// A single route entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR.
    pub destination: String,
    /// Where matching traffic goes.
    pub target: RouteTarget,
}

/// Target of a route.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    /// The network's internet gateway.
    InternetGateway,
    /// The virtual private gateway attached to the network.
    VpnGateway,
    /// The network's NAT gateway.
    NatGateway,
    /// A literal gateway identifier managed outside this environment.
    Gateway(String),
    /// A NAT instance group declared in this environment.
    InstanceGroup(String),
}

/// Subnet attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetSpec {
    /// Address block.
    pub cidr: String,
    /// Availability zone, either a full zone name or a bare zone letter.
    pub availability_zone: Option<String>,
    /// Map public addresses on launch.
    pub public: bool,
    /// Associated route table.
    pub route_table: Option<String>,
}

/// Security group attributes. Rules live on the companion rule-set node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupSpec {
    /// Group description.
    pub description: String,
}

/// Canonical rule set of one security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSetSpec {
    /// Inbound rules.
    pub inbound: BTreeSet<Rule>,
    /// Outbound rules; `None` leaves the provider's default egress alone.
    pub outbound: Option<BTreeSet<Rule>>,
}

/// A single firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rule {
    /// Where traffic comes from (inbound) or goes to (outbound).
    pub source: RuleSource,
    /// IP protocol.
    pub protocol: Protocol,
    /// Port range (inclusive).
    pub ports: PortRange,
}

/// Peer of a rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    /// An address block.
    Cidr(String),
    /// Another security group, by logical name (or remote id when reported).
    Group(String),
}

/// IP protocol of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP.
    Icmp,
    /// Every protocol.
    All,
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    pub from: u16,
    /// Last port.
    pub to: u16,
}

impl PortRange {
    /// The full range.
    pub const ALL: Self = Self { from: 0, to: 65535 };

    /// A single port.
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self { from: port, to: port }
    }

    /// Returns true if this covers every port.
    #[must_use]
    pub const fn is_all(self) -> bool {
        self.from == 0 && self.to == 65535
    }
}

/// Key pair attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairSpec {
    /// Public key to import; generated by the provider when absent.
    pub public_key: Option<String>,
}

/// Gateway endpoint attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Service short name (e.g. `s3`) or full service name.
    pub service: String,
    /// Route tables the endpoint is attached to.
    pub route_tables: BTreeSet<String>,
}

/// Instance group attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroupSpec {
    /// Machine image id.
    pub ami: String,
    /// Instance type.
    pub instance_type: String,
    /// Number of instances.
    pub count: u32,
    /// Subnets instances are spread over, round-robin in name order.
    pub subnets: BTreeSet<String>,
    /// Security groups attached to every instance.
    pub security_groups: BTreeSet<String>,
    /// Login key pair.
    pub key_pair: Option<String>,
    /// Boot script.
    pub user_data: Option<String>,
    /// Instance profile name.
    pub instance_profile: Option<String>,
    /// Source/destination checking (disable for NAT instances).
    pub source_dest_check: bool,
    /// Give every member its own elastic address.
    pub eip: bool,
    /// Protect members against API termination.
    pub termination_protection: bool,
    /// Fixed private address; only valid for a single-member group.
    pub private_ip_address: Option<String>,
    /// Extra block devices attached at launch.
    pub volumes: Vec<Volume>,
}

/// An EBS volume attached at launch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Volume {
    /// Device name, e.g. `/dev/xvdf`.
    pub device: String,
    /// Size in GiB.
    pub size_gb: u32,
    /// Volume type, e.g. `gp3`.
    pub volume_type: Option<String>,
    /// Delete the volume when the instance terminates.
    pub delete_on_termination: bool,
}

/// Load balancer attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    /// Instance group registered behind the balancer.
    pub instance_group: Option<String>,
    /// Internal scheme instead of internet-facing.
    pub internal: bool,
    /// Subnets the balancer is attached to.
    pub subnets: BTreeSet<String>,
    /// Security groups applied to the balancer.
    pub security_groups: BTreeSet<String>,
    /// Listeners, compared as a set.
    pub listeners: BTreeSet<Listener>,
    /// Health check.
    pub health_check: HealthCheck,
}

/// A load balancer listener.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Listener {
    /// Port on the balancer.
    pub port: u16,
    /// Port on the instances.
    pub instance_port: u16,
    /// Protocol, upper-case (`TCP`, `HTTP`, ...).
    pub protocol: String,
}

/// Load balancer health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Check target, e.g. `TCP:8080`.
    pub target: String,
    /// Seconds between checks.
    pub interval: u32,
    /// Seconds before a check times out.
    pub timeout: u32,
    /// Successes before an instance is healthy.
    pub healthy_threshold: u32,
    /// Failures before an instance is unhealthy.
    pub unhealthy_threshold: u32,
}

impl ResourceSpec {
    /// Returns the kind this attribute set belongs to.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Network(_) => ResourceKind::Network,
            Self::DhcpOptions(_) => ResourceKind::DhcpOptions,
            Self::RouteTable(_) => ResourceKind::RouteTable,
            Self::Subnet(_) => ResourceKind::Subnet,
            Self::SecurityGroup(_) => ResourceKind::SecurityGroup,
            Self::SecurityGroupRules(_) => ResourceKind::SecurityGroupRules,
            Self::KeyPair(_) => ResourceKind::KeyPair,
            Self::Endpoint(_) => ResourceKind::Endpoint,
            Self::InstanceGroup(_) => ResourceKind::InstanceGroup,
            Self::LoadBalancer(_) => ResourceKind::LoadBalancer,
        }
    }

    /// Returns the references this spec makes to other declared nodes.
    ///
    /// Structural edges (placement in the network, a rule set's own group)
    /// are not included; see [`ResourceNode::dependencies`].
    #[must_use]
    pub fn references(&self) -> Vec<(NodeKey, EdgeKind)> {
        let mut refs = Vec::new();
        match self {
            Self::Network(_) | Self::DhcpOptions(_) | Self::SecurityGroup(_) | Self::KeyPair(_) => {}
            Self::RouteTable(rt) => {
                for route in &rt.routes {
                    if let RouteTarget::InstanceGroup(group) = &route.target {
                        refs.push((
                            NodeKey::new(ResourceKind::InstanceGroup, group),
                            EdgeKind::RouteTarget,
                        ));
                    }
                }
            }
            Self::Subnet(subnet) => {
                if let Some(rt) = &subnet.route_table {
                    refs.push((NodeKey::new(ResourceKind::RouteTable, rt), EdgeKind::Association));
                }
            }
            Self::SecurityGroupRules(rules) => {
                let outbound = rules.outbound.iter().flatten();
                for rule in rules.inbound.iter().chain(outbound) {
                    if let RuleSource::Group(group) = &rule.source {
                        refs.push((
                            NodeKey::new(ResourceKind::SecurityGroup, group),
                            EdgeKind::RuleSource,
                        ));
                    }
                }
            }
            Self::Endpoint(endpoint) => {
                for rt in &endpoint.route_tables {
                    refs.push((NodeKey::new(ResourceKind::RouteTable, rt), EdgeKind::Association));
                }
            }
            Self::InstanceGroup(group) => {
                for subnet in &group.subnets {
                    refs.push((NodeKey::new(ResourceKind::Subnet, subnet), EdgeKind::Placement));
                }
                for sg in &group.security_groups {
                    refs.push((NodeKey::new(ResourceKind::SecurityGroup, sg), EdgeKind::Access));
                }
                if let Some(key) = &group.key_pair {
                    refs.push((NodeKey::new(ResourceKind::KeyPair, key), EdgeKind::Access));
                }
            }
            Self::LoadBalancer(lb) => {
                if let Some(group) = &lb.instance_group {
                    refs.push((
                        NodeKey::new(ResourceKind::InstanceGroup, group),
                        EdgeKind::Membership,
                    ));
                }
                for sg in &lb.security_groups {
                    refs.push((NodeKey::new(ResourceKind::SecurityGroup, sg), EdgeKind::Access));
                }
                for subnet in &lb.subnets {
                    refs.push((NodeKey::new(ResourceKind::Subnet, subnet), EdgeKind::Placement));
                }
            }
        }
        refs.sort();
        refs.dedup();
        refs
    }

    /// Rewrites every reference through `f`, keeping references `f` declines.
    ///
    /// Used in both directions: providers map logical names to remote ids
    /// before calling the control plane, and discovery maps reported ids
    /// back to logical names.
    pub fn map_refs<F>(&mut self, mut f: F)
    where
        F: FnMut(ResourceKind, &str) -> Option<String>,
    {
        let mut map = |kind: ResourceKind, value: &str| f(kind, value).unwrap_or_else(|| value.to_string());
        let map_set = |kind: ResourceKind, set: &BTreeSet<String>, map: &mut dyn FnMut(ResourceKind, &str) -> String| {
            set.iter().map(|v| map(kind, v)).collect::<BTreeSet<_>>()
        };

        match self {
            Self::Network(_) | Self::DhcpOptions(_) | Self::SecurityGroup(_) | Self::KeyPair(_) => {}
            Self::RouteTable(rt) => {
                rt.routes = rt
                    .routes
                    .iter()
                    .map(|route| match &route.target {
                        RouteTarget::InstanceGroup(group) => Route {
                            destination: route.destination.clone(),
                            target: RouteTarget::InstanceGroup(map(ResourceKind::InstanceGroup, group)),
                        },
                        _ => route.clone(),
                    })
                    .collect();
            }
            Self::Subnet(subnet) => {
                if let Some(rt) = &subnet.route_table {
                    subnet.route_table = Some(map(ResourceKind::RouteTable, rt));
                }
            }
            Self::SecurityGroupRules(rules) => {
                let mut map_rule = |rule: &Rule| match &rule.source {
                    RuleSource::Group(group) => Rule {
                        source: RuleSource::Group(map(ResourceKind::SecurityGroup, group)),
                        ..rule.clone()
                    },
                    RuleSource::Cidr(_) => rule.clone(),
                };
                rules.inbound = rules.inbound.iter().map(&mut map_rule).collect();
                if let Some(outbound) = &rules.outbound {
                    rules.outbound = Some(outbound.iter().map(&mut map_rule).collect());
                }
            }
            Self::Endpoint(endpoint) => {
                endpoint.route_tables = map_set(ResourceKind::RouteTable, &endpoint.route_tables, &mut map);
            }
            Self::InstanceGroup(group) => {
                group.subnets = map_set(ResourceKind::Subnet, &group.subnets, &mut map);
                group.security_groups =
                    map_set(ResourceKind::SecurityGroup, &group.security_groups, &mut map);
                if let Some(key) = &group.key_pair {
                    group.key_pair = Some(map(ResourceKind::KeyPair, key));
                }
            }
            Self::LoadBalancer(lb) => {
                if let Some(group) = &lb.instance_group {
                    lb.instance_group = Some(map(ResourceKind::InstanceGroup, group));
                }
                lb.subnets = map_set(ResourceKind::Subnet, &lb.subnets, &mut map);
                lb.security_groups = map_set(ResourceKind::SecurityGroup, &lb.security_groups, &mut map);
            }
        }
    }
}

impl ResourceNode {
    /// Creates a node from its logical name and attributes.
    #[must_use]
    pub fn new(name: impl Into<String>, spec: ResourceSpec) -> Self {
        Self {
            key: NodeKey::new(spec.kind(), name),
            spec,
        }
    }

    /// Every dependency of this node, structural edges included.
    #[must_use]
    pub fn dependencies(&self, network: &str) -> Vec<(NodeKey, EdgeKind)> {
        dependencies_of(&self.key, &self.spec, network)
    }
}

impl LiveResource {
    /// Every dependency of this resource as currently reported.
    #[must_use]
    pub fn dependencies(&self, network: &str) -> Vec<(NodeKey, EdgeKind)> {
        dependencies_of(&self.key, &self.spec, network)
    }
}

fn dependencies_of(key: &NodeKey, spec: &ResourceSpec, network: &str) -> Vec<(NodeKey, EdgeKind)> {
    let mut deps = spec.references();
    match key.kind {
        ResourceKind::Network => {}
        ResourceKind::SecurityGroupRules => deps.push((
            NodeKey::new(ResourceKind::SecurityGroup, &key.name),
            EdgeKind::RuleTarget,
        )),
        _ => deps.push((NodeKey::new(ResourceKind::Network, network), EdgeKind::Placement)),
    }
    deps.retain(|(dep, _)| dep != key);
    deps.sort();
    deps.dedup_by(|a, b| a.0 == b.0);
    deps
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peer = match &self.source {
            RuleSource::Cidr(cidr) => cidr.clone(),
            RuleSource::Group(group) => format!("sg:{group}"),
        };
        if self.protocol == Protocol::All || self.ports.is_all() {
            write!(f, "{peer} {} all", self.protocol)
        } else if self.ports.from == self.ports.to {
            write!(f, "{peer} {} {}", self.protocol, self.ports.from)
        } else {
            write!(f, "{peer} {} {}-{}", self.protocol, self.ports.from, self.ports.to)
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::All => "all",
        };
        f.write_str(s)
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InternetGateway => f.write_str("internet_gateway"),
            Self::VpnGateway => f.write_str("vpn_gateway"),
            Self::NatGateway => f.write_str("nat"),
            Self::Gateway(id) => f.write_str(id),
            Self::InstanceGroup(group) => write!(f, "instance_group:{group}"),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.destination, self.target)
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> {}", self.protocol, self.port, self.instance_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(inbound: Vec<Rule>) -> ResourceSpec {
        ResourceSpec::SecurityGroupRules(RuleSetSpec {
            inbound: inbound.into_iter().collect(),
            outbound: None,
        })
    }

    fn tcp_from(source: RuleSource, port: u16) -> Rule {
        Rule {
            source,
            protocol: Protocol::Tcp,
            ports: PortRange::single(port),
        }
    }

    #[test]
    fn test_subnet_references_route_table() {
        let spec = ResourceSpec::Subnet(SubnetSpec {
            cidr: "10.0.0.0/24".into(),
            availability_zone: None,
            public: false,
            route_table: Some("private".into()),
        });
        assert_eq!(
            spec.references(),
            vec![(NodeKey::new(ResourceKind::RouteTable, "private"), EdgeKind::Association)]
        );
    }

    #[test]
    fn test_rule_set_depends_on_own_group_and_sources() {
        let node = ResourceNode::new(
            "web",
            rules(vec![
                tcp_from(RuleSource::Group("bastion".into()), 22),
                tcp_from(RuleSource::Cidr("0.0.0.0/0".into()), 443),
            ]),
        );
        let deps: Vec<_> = node.dependencies("env").into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            deps,
            vec![
                NodeKey::new(ResourceKind::SecurityGroup, "bastion"),
                NodeKey::new(ResourceKind::SecurityGroup, "web"),
            ]
        );
    }

    #[test]
    fn test_map_refs_rewrites_group_sources() {
        let mut spec = rules(vec![tcp_from(RuleSource::Group("sg-123".into()), 22)]);
        spec.map_refs(|kind, id| {
            (kind == ResourceKind::SecurityGroup && id == "sg-123").then(|| "bastion".to_string())
        });
        assert_eq!(spec, rules(vec![tcp_from(RuleSource::Group("bastion".into()), 22)]));
    }

    #[test]
    fn test_map_refs_keeps_unknown_ids() {
        let mut spec = ResourceSpec::Endpoint(EndpointSpec {
            service: "s3".into(),
            route_tables: ["rtb-1".to_string(), "rtb-2".to_string()].into_iter().collect(),
        });
        spec.map_refs(|_, id| (id == "rtb-1").then(|| "private".to_string()));
        let ResourceSpec::Endpoint(endpoint) = spec else {
            panic!("kind changed");
        };
        assert!(endpoint.route_tables.contains("private"));
        assert!(endpoint.route_tables.contains("rtb-2"));
    }

    #[test]
    fn test_rule_display() {
        let rule = tcp_from(RuleSource::Cidr("10.0.0.0/8".into()), 443);
        assert_eq!(rule.to_string(), "10.0.0.0/8 tcp 443");
    }
}
