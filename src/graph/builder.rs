//! Graph builder: desired schema to typed nodes and edges.
//!
//! The builder is a pure function of the [`EnvironmentConfig`] value. It
//! resolves every cross-reference to a logical-name edge, fails on dangling
//! references and cycles, and canonicalizes shorthand (rule sources, subnet
//! sizes, image aliases, health check defaults) so that the differ compares
//! like with like.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::{EnvironmentConfig, LoadBalancerConfig, SecurityGroupConfig};
use crate::error::ConfigError;

use super::cidr::{self, Cidr, CidrRequest};
use super::dag::{Dag, ResourceGraph};
use super::kind::{NodeKey, ResourceKind};
use super::node::{
    DhcpOptionsSpec, EndpointSpec, HealthCheck, InstanceGroupSpec, KeyPairSpec, Listener, LoadBalancerSpec,
    NetworkSpec, ResourceNode, ResourceSpec, Route, RouteTableSpec, Rule, RuleSetSpec, RuleSource, SecurityGroupSpec,
    SubnetSpec, Volume,
};

/// Logical name of the DHCP option set node.
pub const DHCP_OPTIONS_NAME: &str = "default";

/// Builds the desired graph for one environment.
#[derive(Debug)]
pub struct GraphBuilder<'a> {
    config: &'a EnvironmentConfig,
    existing_blocks: BTreeMap<String, Cidr>,
    nodes: BTreeMap<NodeKey, ResourceNode>,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder over an environment configuration.
    #[must_use]
    pub const fn new(config: &'a EnvironmentConfig) -> Self {
        Self {
            config,
            existing_blocks: BTreeMap::new(),
            nodes: BTreeMap::new(),
        }
    }

    /// Subnet blocks already in use, by logical name. Sized subnets keep
    /// their block across runs instead of being reallocated.
    #[must_use]
    pub fn with_existing_blocks(mut self, blocks: BTreeMap<String, Cidr>) -> Self {
        self.existing_blocks = blocks;
        self
    }

    /// Produces the validated desired graph.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for invalid blocks, duplicate names,
    /// dangling references or dependency cycles.
    pub fn build(mut self) -> Result<ResourceGraph, ConfigError> {
        let config = self.config;
        let network_cidr: Cidr = config.network.cidr.parse()?;
        let network = config.environment.clone();

        self.push(
            &network,
            ResourceSpec::Network(NetworkSpec {
                cidr: network_cidr.to_string(),
                tenancy: config.network.tenancy.clone(),
                enable_dns: config.network.enable_dns,
                internet_gateway: config.network.internet_gateway,
                vpn_gateway: config.network.vpn_gateway.as_ref().map(|v| v.id.clone()),
            }),
        )?;

        if let Some(dhcp) = &config.dhcp_options {
            self.push(
                DHCP_OPTIONS_NAME,
                ResourceSpec::DhcpOptions(DhcpOptionsSpec {
                    domain_name: dhcp.domain_name.clone(),
                    domain_name_servers: dhcp.domain_name_servers.clone(),
                }),
            )?;
        }

        for (name, rt) in &config.route_tables {
            let spec = ResourceSpec::RouteTable(RouteTableSpec {
                main: rt.main,
                routes: rt
                    .routes
                    .iter()
                    .map(|r| Route {
                        destination: r.destination.clone(),
                        target: r.target.clone(),
                    })
                    .collect(),
            });
            self.push(name, spec)?;
        }

        self.add_subnets(network_cidr)?;

        for (name, sg) in &config.security_groups {
            self.add_security_group(name, sg)?;
        }

        let mut seen_keys = BTreeSet::new();
        for entry in &config.key_pairs {
            if !seen_keys.insert(entry.name()) {
                return Err(ConfigError::DuplicateName {
                    kind: ResourceKind::KeyPair.to_string(),
                    name: entry.name().to_string(),
                });
            }
            self.push(
                entry.name(),
                ResourceSpec::KeyPair(KeyPairSpec {
                    public_key: entry.public_key().map(str::to_string),
                }),
            )?;
        }

        for (name, endpoint) in &config.endpoints {
            self.push(
                name,
                ResourceSpec::Endpoint(EndpointSpec {
                    service: endpoint.service.clone().unwrap_or_else(|| name.clone()),
                    route_tables: endpoint.route_tables.iter().cloned().collect(),
                }),
            )?;
        }

        for (name, group) in &config.instance_groups {
            let spec = ResourceSpec::InstanceGroup(InstanceGroupSpec {
                ami: self.resolve_ami(name, &group.ami)?,
                instance_type: group.instance_type.clone(),
                count: group.count,
                subnets: group.subnets.iter().cloned().collect(),
                security_groups: group.security_groups.iter().cloned().collect(),
                key_pair: group.key_pair.clone(),
                user_data: group.user_data.clone(),
                instance_profile: group.instance_profile.clone(),
                source_dest_check: group.source_dest_check,
                eip: group.eip,
                termination_protection: group.termination_protection,
                private_ip_address: group.private_ip_address.clone(),
                volumes: group
                    .volumes
                    .iter()
                    .map(|v| Volume {
                        device: v.device.clone(),
                        size_gb: v.size_gb,
                        volume_type: v.volume_type.clone(),
                        delete_on_termination: v.delete_on_termination,
                    })
                    .collect(),
            });
            self.push(name, spec)?;
        }

        for (name, lb) in &config.load_balancers {
            self.push(name, ResourceSpec::LoadBalancer(load_balancer_spec(lb)))?;
        }

        self.link(network)
    }

    fn push(&mut self, name: &str, spec: ResourceSpec) -> Result<(), ConfigError> {
        let node = ResourceNode::new(name, spec);
        if self.nodes.contains_key(&node.key) {
            return Err(ConfigError::DuplicateName {
                kind: node.key.kind.to_string(),
                name: name.to_string(),
            });
        }
        self.nodes.insert(node.key.clone(), node);
        Ok(())
    }

    fn add_subnets(&mut self, network: Cidr) -> Result<(), ConfigError> {
        let config = self.config;
        let mut requests = Vec::with_capacity(config.subnets.len());
        for (name, subnet) in &config.subnets {
            let request = match (&subnet.cidr, subnet.size) {
                (Some(block), _) => CidrRequest::Fixed(block.parse()?),
                (None, Some(size)) => CidrRequest::Sized(size),
                (None, None) => {
                    return Err(ConfigError::validation(
                        "subnet needs either 'cidr' or 'size'",
                        format!("subnets.{name}"),
                    ));
                }
            };
            requests.push((name.clone(), request));
        }

        for (name, block) in cidr::allocate(network, &requests, &self.existing_blocks)? {
            let Some(subnet) = config.subnets.get(&name) else {
                continue;
            };
            debug!(subnet = %name, cidr = %block, "Allocated subnet block");
            self.push(
                &name,
                ResourceSpec::Subnet(SubnetSpec {
                    cidr: block.to_string(),
                    availability_zone: subnet.availability_zone.clone(),
                    public: subnet.public,
                    route_table: subnet.route_table.clone(),
                }),
            )?;
        }
        Ok(())
    }

    fn add_security_group(&mut self, name: &str, sg: &SecurityGroupConfig) -> Result<(), ConfigError> {
        self.push(
            name,
            ResourceSpec::SecurityGroup(SecurityGroupSpec {
                description: sg.description.clone().unwrap_or_else(|| name.to_string()),
            }),
        )?;

        let canonical = |rules: &[crate::config::RuleConfig]| -> BTreeSet<Rule> {
            rules
                .iter()
                .map(|r| Rule {
                    source: rule_source(&r.source),
                    protocol: r.protocol,
                    ports: r.ports,
                })
                .collect()
        };

        self.push(
            name,
            ResourceSpec::SecurityGroupRules(RuleSetSpec {
                inbound: canonical(&sg.inbound),
                outbound: sg
                    .outbound
                    .as_deref()
                    .filter(|rules| !rules.is_empty())
                    .map(canonical),
            }),
        )
    }

    fn resolve_ami(&self, group: &str, ami: &str) -> Result<String, ConfigError> {
        let Some(by_region) = self.config.amis.get(ami) else {
            return Ok(ami.to_string());
        };
        let field = format!("instance_groups.{group}.ami");
        let region = self.config.region.as_deref().ok_or_else(|| {
            ConfigError::validation(format!("image alias '{ami}' needs a region to resolve"), field.clone())
        })?;
        by_region
            .get(region)
            .cloned()
            .ok_or_else(|| ConfigError::validation(format!("image alias '{ami}' has no entry for {region}"), field))
    }

    /// Adds nodes and edges to the DAG, checking references and cycles.
    fn link(self, network: String) -> Result<ResourceGraph, ConfigError> {
        let mut dag = Dag::new();
        for key in self.nodes.keys() {
            dag.add_node(key.clone());
        }

        for node in self.nodes.values() {
            for (dep, kind) in node.dependencies(&network) {
                if !self.nodes.contains_key(&dep) {
                    return Err(ConfigError::DanglingReference {
                        from: node.key.to_string(),
                        kind: dep.kind.to_string(),
                        name: dep.name,
                    });
                }
                dag.add_edge(&node.key, dep, kind);
            }
        }

        let order = dag.topological_order()?;
        debug!(nodes = order.len(), "Built desired graph");
        Ok(ResourceGraph::from_parts(network, self.nodes, dag, order))
    }
}

/// A rule source is a CIDR block when it contains a slash, otherwise a
/// security group name.
fn rule_source(source: &str) -> RuleSource {
    if source.contains('/') {
        RuleSource::Cidr(source.to_string())
    } else {
        RuleSource::Group(source.to_string())
    }
}

fn load_balancer_spec(lb: &LoadBalancerConfig) -> LoadBalancerSpec {
    let overrides = lb.health_check.clone().unwrap_or_default();
    let default_target = lb
        .listeners
        .first()
        .map_or_else(|| String::from("TCP:80"), |l| format!("TCP:{}", l.instance_port));

    LoadBalancerSpec {
        instance_group: lb.instance_group.clone(),
        internal: lb.internal,
        subnets: lb.subnets.iter().cloned().collect(),
        security_groups: lb.security_groups.iter().cloned().collect(),
        listeners: lb
            .listeners
            .iter()
            .map(|l| Listener {
                port: l.port,
                instance_port: l.instance_port,
                protocol: l.protocol.clone(),
            })
            .collect(),
        health_check: HealthCheck {
            target: overrides.target.unwrap_or(default_target),
            interval: overrides.interval.unwrap_or(15),
            timeout: overrides.timeout.unwrap_or(5),
            healthy_threshold: overrides.healthy_threshold.unwrap_or(4),
            unhealthy_threshold: overrides.unhealthy_threshold.unwrap_or(4),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::EdgeKind;

    fn build(yaml: &str) -> Result<ResourceGraph, ConfigError> {
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        GraphBuilder::new(&config).build()
    }

    const SCENARIO: &str = r"
environment: staging
network:
  cidr: 10.0.0.0/16
route_tables:
  private:
    routes:
      - [0.0.0.0/0, nat]
subnets:
  private-1: { size: 24, route_table: private }
  private-2: { size: 24, route_table: private }
";

    #[test]
    fn test_scenario_graph_order() {
        let graph = build(SCENARIO).unwrap();
        let order: Vec<String> = graph.ordered().map(|n| n.key.to_string()).collect();
        assert_eq!(
            order,
            vec![
                "network(staging)",
                "route-table(private)",
                "subnet(private-1)",
                "subnet(private-2)",
            ]
        );
    }

    #[test]
    fn test_subnet_edges_are_typed() {
        let graph = build(SCENARIO).unwrap();
        let edges = graph.dag().edges();
        assert!(edges.iter().any(|e| e.from.name == "private-1"
            && e.to.kind == ResourceKind::RouteTable
            && e.kind == EdgeKind::Association));
        assert!(edges.iter().any(|e| e.from.name == "private-1"
            && e.to.kind == ResourceKind::Network
            && e.kind == EdgeKind::Placement));
    }

    #[test]
    fn test_dangling_reference() {
        let yaml = r"
environment: staging
subnets:
  web: { size: 24, route_table: missing }
";
        let err = build(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::DanglingReference { ref name, .. } if name == "missing"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        // nat routes through the group that lives in the subnet using the table.
        let yaml = r"
environment: staging
route_tables:
  private:
    routes: [[0.0.0.0/0, 'instance_group:nat']]
subnets:
  private-1: { size: 24, route_table: private }
instance_groups:
  nat: { ami: ami-1, instance_type: t3.nano, subnets: [private-1] }
";
        let err = build(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::DependencyCycle { .. }));
    }

    #[test]
    fn test_mutual_security_groups_are_not_a_cycle() {
        let yaml = r"
environment: staging
security_groups:
  web:
    inbound: [[db, tcp, 8080]]
  db:
    inbound: [[web, tcp, 5432], [10.0.0.0/8, tcp, 22]]
";
        let graph = build(yaml).unwrap();
        let rules = graph
            .get(&NodeKey::new(ResourceKind::SecurityGroupRules, "db"))
            .unwrap();
        let ResourceSpec::SecurityGroupRules(rules) = &rules.spec else {
            panic!("wrong kind");
        };
        assert!(rules.inbound.iter().any(|r| r.source == RuleSource::Group("web".into())));
        assert!(rules.inbound.iter().any(|r| r.source == RuleSource::Cidr("10.0.0.0/8".into())));
        assert!(rules.outbound.is_none());
    }

    #[test]
    fn test_ami_alias_and_health_check_defaults() {
        let yaml = r"
environment: staging
region: us-east-1
amis:
  ubuntu: { us-east-1: ami-0abc }
subnets:
  public-1: { size: 24 }
instance_groups:
  web: { ami: ubuntu, instance_type: t3.small, count: 2, subnets: [public-1] }
load_balancers:
  web:
    instance_group: web
    subnets: [public-1]
    listeners: [[80, 8080, http]]
";
        let graph = build(yaml).unwrap();
        let group = graph.get(&NodeKey::new(ResourceKind::InstanceGroup, "web")).unwrap();
        let ResourceSpec::InstanceGroup(group) = &group.spec else {
            panic!("wrong kind");
        };
        assert_eq!(group.ami, "ami-0abc");

        let lb = graph.get(&NodeKey::new(ResourceKind::LoadBalancer, "web")).unwrap();
        let ResourceSpec::LoadBalancer(lb) = &lb.spec else {
            panic!("wrong kind");
        };
        assert_eq!(lb.health_check.target, "TCP:8080");
        assert_eq!(lb.health_check.interval, 15);
        assert_eq!(lb.health_check.unhealthy_threshold, 4);
    }

    #[test]
    fn test_duplicate_key_pair() {
        let yaml = r"
environment: staging
key_pairs: [default, default]
";
        assert!(matches!(build(yaml).unwrap_err(), ConfigError::DuplicateName { .. }));
    }
}
