//! Desired-state schema for a vpcforge environment.
//!
//! These types map one-to-one onto `vpcforge.yaml`. Every collection is a
//! mapping keyed by logical name, so duplicate names inside a kind are
//! rejected by the YAML parser itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::graph::{PortRange, Protocol, RouteTarget};

/// The root configuration structure for one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentConfig {
    /// Environment name; the ownership tag value and the network's name.
    pub environment: String,
    /// Provider region.
    #[serde(default)]
    pub region: Option<String>,
    /// Network-level settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Tags applied to every taggable resource.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// DHCP option set.
    #[serde(default)]
    pub dhcp_options: Option<DhcpOptionsConfig>,
    /// Image aliases: alias -> region -> image id.
    #[serde(default)]
    pub amis: BTreeMap<String, BTreeMap<String, String>>,
    /// Route tables by logical name.
    #[serde(default)]
    pub route_tables: BTreeMap<String, RouteTableConfig>,
    /// Subnets by logical name.
    #[serde(default)]
    pub subnets: BTreeMap<String, SubnetConfig>,
    /// Security groups by logical name.
    #[serde(default)]
    pub security_groups: BTreeMap<String, SecurityGroupConfig>,
    /// Key pairs.
    #[serde(default)]
    pub key_pairs: Vec<KeyPairEntry>,
    /// Gateway endpoints by logical name.
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointConfig>,
    /// Instance groups by logical name.
    #[serde(default, alias = "instance_roles")]
    pub instance_groups: BTreeMap<String, InstanceGroupConfig>,
    /// Load balancers by logical name.
    #[serde(default)]
    pub load_balancers: BTreeMap<String, LoadBalancerConfig>,
    /// Execution engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Optional guardrails.
    #[serde(default)]
    pub guardrails: Option<GuardrailsConfig>,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Address block.
    #[serde(default = "default_network_cidr")]
    pub cidr: String,
    /// Instance tenancy.
    #[serde(default = "default_tenancy")]
    pub tenancy: String,
    /// Enable DNS support and hostnames.
    #[serde(default = "default_true")]
    pub enable_dns: bool,
    /// Attach an internet gateway.
    #[serde(default = "default_true")]
    pub internet_gateway: bool,
    /// Existing virtual private gateway to attach.
    #[serde(default)]
    pub vpn_gateway: Option<VpnGatewayConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cidr: default_network_cidr(),
            tenancy: default_tenancy(),
            enable_dns: true,
            internet_gateway: true,
            vpn_gateway: None,
        }
    }
}

/// A virtual private gateway created outside vpcforge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VpnGatewayConfig {
    /// Gateway id (`vgw-...`).
    pub id: String,
}

/// DHCP options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DhcpOptionsConfig {
    /// Search domain.
    #[serde(default)]
    pub domain_name: Option<String>,
    /// Name servers.
    #[serde(default)]
    pub domain_name_servers: Vec<String>,
}

/// Route table configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteTableConfig {
    /// Make this the network's main route table.
    #[serde(default)]
    pub main: bool,
    /// Routes as `[destination, target]` pairs.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Prefixes of gateway identifiers accepted as literal route targets.
///
/// The bare `nat` target routes through a NAT gateway that already exists in
/// the network; vpcforge does not create NAT gateways. Route through a NAT
/// instance group with `instance_group:<name>`.
const GATEWAY_ID_PREFIXES: &[&str] = &["igw-", "vgw-", "nat-", "pcx-", "tgw-", "eigw-", "vpce-"];

/// A `[destination, target]` route entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "(String, String)")]
pub struct RouteConfig {
    /// Destination CIDR.
    pub destination: String,
    /// Parsed target.
    pub target: RouteTarget,
}

impl TryFrom<(String, String)> for RouteConfig {
    type Error = String;

    fn try_from((destination, target): (String, String)) -> Result<Self, Self::Error> {
        let target = match target.as_str() {
            "internet_gateway" | "igw" => RouteTarget::InternetGateway,
            "vpn_gateway" | "vgw" => RouteTarget::VpnGateway,
            "nat" | "nat_gateway" => RouteTarget::NatGateway,
            other => {
                if let Some(group) = other.strip_prefix("instance_group:") {
                    RouteTarget::InstanceGroup(group.to_string())
                } else if GATEWAY_ID_PREFIXES.iter().any(|p| other.starts_with(p)) {
                    RouteTarget::Gateway(other.to_string())
                } else {
                    return Err(format!(
                        "unknown route target '{other}' (expected internet_gateway, vpn_gateway, nat, a gateway id or instance_group:<name>)"
                    ));
                }
            }
        };
        Ok(Self { destination, target })
    }
}

/// Subnet configuration. Exactly one of `cidr` and `size` is expected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubnetConfig {
    /// Fixed address block.
    #[serde(default)]
    pub cidr: Option<String>,
    /// Prefix length to allocate from the network.
    #[serde(default)]
    pub size: Option<u8>,
    /// Zone letter or full zone name.
    #[serde(default)]
    pub availability_zone: Option<String>,
    /// Map public addresses on launch.
    #[serde(default)]
    pub public: bool,
    /// Associated route table.
    #[serde(default)]
    pub route_table: Option<String>,
}

/// Security group configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityGroupConfig {
    /// Description; defaults to the logical name.
    #[serde(default)]
    pub description: Option<String>,
    /// Inbound rules.
    #[serde(default)]
    pub inbound: Vec<RuleConfig>,
    /// Outbound rules; omit to keep the default egress rule.
    #[serde(default)]
    pub outbound: Option<Vec<RuleConfig>>,
}

/// Port value in a rule: a number or a string (`"80"`, `"8000-8080"`, `"all"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PortValue {
    /// Single numeric port.
    Number(u16),
    /// Textual port or range.
    Text(String),
}

/// A `[source, protocol, ports]` rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "(String, String, PortValue)")]
pub struct RuleConfig {
    /// CIDR block or security group logical name.
    pub source: String,
    /// Protocol.
    pub protocol: Protocol,
    /// Ports.
    pub ports: PortRange,
}

impl TryFrom<(String, String, PortValue)> for RuleConfig {
    type Error = String;

    fn try_from((source, protocol, ports): (String, String, PortValue)) -> Result<Self, Self::Error> {
        let protocol = match protocol.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            "icmp" => Protocol::Icmp,
            "all" | "-1" | "any" => Protocol::All,
            other => return Err(format!("unknown protocol '{other}'")),
        };
        let ports = match ports {
            PortValue::Number(port) => PortRange::single(port),
            PortValue::Text(text) => parse_port_range(&text)?,
        };
        // Port ranges carry no meaning without a port-based protocol.
        let ports = if matches!(protocol, Protocol::All | Protocol::Icmp) {
            PortRange::ALL
        } else {
            ports
        };
        Ok(Self {
            source,
            protocol,
            ports,
        })
    }
}

fn parse_port_range(text: &str) -> Result<PortRange, String> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("all") {
        return Ok(PortRange::ALL);
    }
    let parse = |s: &str| s.trim().parse::<u16>().map_err(|_| format!("invalid port '{s}'"));
    match text.split_once('-') {
        Some((from, to)) => {
            let range = PortRange {
                from: parse(from)?,
                to: parse(to)?,
            };
            if range.from > range.to {
                return Err(format!("inverted port range '{text}'"));
            }
            Ok(range)
        }
        None => parse(text).map(PortRange::single),
    }
}

/// A key pair entry: a bare name or a name with a public key to import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum KeyPairEntry {
    /// Generated key pair.
    Name(String),
    /// Imported key pair.
    Import {
        /// Logical name.
        name: String,
        /// Public key material.
        #[serde(default)]
        public_key: Option<String>,
    },
}

impl KeyPairEntry {
    /// Logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Import { name, .. } => name,
        }
    }

    /// Public key to import, if any.
    #[must_use]
    pub fn public_key(&self) -> Option<&str> {
        match self {
            Self::Name(_) => None,
            Self::Import { public_key, .. } => public_key.as_deref(),
        }
    }
}

/// Gateway endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Service name; defaults to the logical name.
    #[serde(default)]
    pub service: Option<String>,
    /// Route tables to attach to.
    #[serde(default)]
    pub route_tables: Vec<String>,
}

/// Instance group configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceGroupConfig {
    /// Image id or alias from `amis`.
    pub ami: String,
    /// Instance type.
    pub instance_type: String,
    /// Number of instances.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Subnets to spread over.
    #[serde(default)]
    pub subnets: Vec<String>,
    /// Security groups.
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Key pair.
    #[serde(default)]
    pub key_pair: Option<String>,
    /// Boot script.
    #[serde(default, alias = "userdata")]
    pub user_data: Option<String>,
    /// Instance profile.
    #[serde(default, alias = "instance_profile_name")]
    pub instance_profile: Option<String>,
    /// Source/destination checking.
    #[serde(default = "default_true")]
    pub source_dest_check: bool,
    /// Associate an elastic address with every member.
    #[serde(default)]
    pub eip: bool,
    /// Protect members against API termination.
    #[serde(default, alias = "lock")]
    pub termination_protection: bool,
    /// Fixed private address for a single-member group.
    #[serde(default)]
    pub private_ip_address: Option<String>,
    /// Extra EBS volumes attached at launch.
    #[serde(default, alias = "block_devices")]
    pub volumes: Vec<VolumeConfig>,
}

/// An EBS volume attached at launch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeConfig {
    /// Device name.
    pub device: String,
    /// Size in GiB.
    #[serde(alias = "size")]
    pub size_gb: u32,
    /// Volume type.
    #[serde(default, alias = "type")]
    pub volume_type: Option<String>,
    /// Delete with the instance.
    #[serde(default = "default_true")]
    pub delete_on_termination: bool,
}

/// Load balancer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadBalancerConfig {
    /// Instance group behind the balancer.
    #[serde(default, alias = "instance_role")]
    pub instance_group: Option<String>,
    /// Internal scheme.
    #[serde(default)]
    pub internal: bool,
    /// Subnets.
    #[serde(default)]
    pub subnets: Vec<String>,
    /// Security groups.
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Listeners.
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    /// Health check overrides.
    #[serde(default, alias = "healthcheck")]
    pub health_check: Option<HealthCheckConfig>,
}

/// A `[load_balancer_port, instance_port, protocol]` listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "(u16, u16, String)")]
pub struct ListenerConfig {
    /// Balancer port.
    pub port: u16,
    /// Instance port.
    pub instance_port: u16,
    /// Protocol, upper-cased.
    pub protocol: String,
}

impl TryFrom<(u16, u16, String)> for ListenerConfig {
    type Error = String;

    fn try_from((port, instance_port, protocol): (u16, u16, String)) -> Result<Self, Self::Error> {
        let protocol = protocol.to_ascii_uppercase();
        if !matches!(protocol.as_str(), "TCP" | "SSL" | "HTTP" | "HTTPS") {
            return Err(format!("unknown listener protocol '{protocol}'"));
        }
        Ok(Self {
            port,
            instance_port,
            protocol,
        })
    }
}

/// Health check overrides; unset fields take the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// Check target.
    #[serde(default)]
    pub target: Option<String>,
    /// Interval in seconds.
    #[serde(default)]
    pub interval: Option<u32>,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u32>,
    /// Healthy threshold.
    #[serde(default)]
    pub healthy_threshold: Option<u32>,
    /// Unhealthy threshold.
    #[serde(default)]
    pub unhealthy_threshold: Option<u32>,
}

/// Execution engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Maximum in-flight provider operations.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Run-level timeout; cancels scheduling when reached.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Retry policy for transient provider errors.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            timeout_secs: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Attempts per operation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on a single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Random fraction added to each delay (0.0 to 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

/// Guardrails checked before execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardrailsConfig {
    /// Maximum total instance count.
    #[serde(default)]
    pub max_instances: Option<u32>,
    /// Maximum delete actions in a pruning apply.
    #[serde(default)]
    pub max_deletes: Option<usize>,
}

fn default_network_cidr() -> String {
    String::from("172.31.0.0/16")
}

fn default_tenancy() -> String {
    String::from("default")
}

const fn default_true() -> bool {
    true
}

const fn default_count() -> u32 {
    1
}

const fn default_max_concurrency() -> usize {
    8
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    1000
}

const fn default_max_delay_ms() -> u64 {
    10_000
}

const fn default_jitter() -> f64 {
    0.25
}

impl EnvironmentConfig {
    /// Creates an empty environment with default network settings.
    #[must_use]
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            region: None,
            network: NetworkConfig::default(),
            tags: BTreeMap::new(),
            dhcp_options: None,
            amis: BTreeMap::new(),
            route_tables: BTreeMap::new(),
            subnets: BTreeMap::new(),
            security_groups: BTreeMap::new(),
            key_pairs: Vec::new(),
            endpoints: BTreeMap::new(),
            instance_groups: BTreeMap::new(),
            load_balancers: BTreeMap::new(),
            engine: EngineConfig::default(),
            guardrails: None,
        }
    }

    /// Total instances across all groups.
    #[must_use]
    pub fn total_instances(&self) -> u32 {
        self.instance_groups.values().map(|g| g.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_parsing() {
        let rule = RuleConfig::try_from((
            "web".to_string(),
            "TCP".to_string(),
            PortValue::Text("8000-8080".into()),
        ))
        .unwrap();
        assert_eq!(rule.protocol, Protocol::Tcp);
        assert_eq!(rule.ports, PortRange { from: 8000, to: 8080 });

        let all = RuleConfig::try_from(("0.0.0.0/0".to_string(), "all".to_string(), PortValue::Number(22))).unwrap();
        assert_eq!(all.ports, PortRange::ALL);

        assert!(RuleConfig::try_from(("x".to_string(), "gre".to_string(), PortValue::Number(1))).is_err());
        assert!(RuleConfig::try_from(("x".to_string(), "tcp".to_string(), PortValue::Text("9-1".into()))).is_err());
    }

    #[test]
    fn test_route_target_parsing() {
        let parse = |t: &str| RouteConfig::try_from(("0.0.0.0/0".to_string(), t.to_string()));
        assert_eq!(parse("internet_gateway").unwrap().target, RouteTarget::InternetGateway);
        assert_eq!(parse("nat").unwrap().target, RouteTarget::NatGateway);
        assert_eq!(
            parse("instance_group:nat-box").unwrap().target,
            RouteTarget::InstanceGroup("nat-box".into())
        );
        assert_eq!(parse("pcx-0abc123").unwrap().target, RouteTarget::Gateway("pcx-0abc123".into()));
        assert!(parse("somewhere").is_err());
    }

    #[test]
    fn test_defaults() {
        let network = NetworkConfig::default();
        assert_eq!(network.cidr, "172.31.0.0/16");
        assert_eq!(network.tenancy, "default");
        let engine = EngineConfig::default();
        assert_eq!(engine.max_concurrency, 8);
        assert_eq!(engine.retry.max_attempts, 5);
    }

    #[test]
    fn test_key_pair_entry_forms() {
        let entries: Vec<KeyPairEntry> =
            serde_yaml::from_str("[default, {name: deploy, public_key: ssh-ed25519 AAAA}]").unwrap();
        assert_eq!(entries[0].name(), "default");
        assert_eq!(entries[0].public_key(), None);
        assert_eq!(entries[1].name(), "deploy");
        assert_eq!(entries[1].public_key(), Some("ssh-ed25519 AAAA"));
    }

    #[test]
    fn test_instance_group_launch_options() {
        let group: InstanceGroupConfig = serde_yaml::from_str(
            "{ami: ami-1, instance_type: t3.small, lock: true, eip: true, private_ip_address: 10.0.0.10, \
             block_devices: [{device: /dev/xvdf, size: 100, type: gp3}]}",
        )
        .unwrap();
        assert!(group.termination_protection);
        assert!(group.eip);
        assert_eq!(group.private_ip_address.as_deref(), Some("10.0.0.10"));
        assert_eq!(group.volumes[0].size_gb, 100);
        assert_eq!(group.volumes[0].volume_type.as_deref(), Some("gp3"));
        assert!(group.volumes[0].delete_on_termination);
    }

    #[test]
    fn test_network_gateways() {
        let network: NetworkConfig =
            serde_yaml::from_str("{cidr: 10.0.0.0/16, vpn_gateway: {id: vgw-0abc}}").unwrap();
        assert!(network.internet_gateway);
        assert_eq!(network.vpn_gateway.map(|v| v.id).as_deref(), Some("vgw-0abc"));
    }
}
