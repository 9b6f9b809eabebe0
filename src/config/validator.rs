//! Static validation of environment descriptions.
//!
//! Collects every problem with a field path before anything touches the
//! graph builder or the control plane. Structural checks that need the
//! whole graph (dangling references, cycles) live in the builder.

use crate::error::{ConfigError, Result, VpcForgeError};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::debug;

use crate::graph::{Cidr, PortRange, Protocol, RouteTarget};
use crate::naming::is_reserved_tag;

use super::spec::{EnvironmentConfig, RuleConfig};

/// Smallest subnet prefix length accepted.
const MIN_SUBNET_PREFIX: u8 = 16;

/// Largest subnet prefix length accepted.
const MAX_SUBNET_PREFIX: u8 = 28;

/// Validator for environment configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an environment configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found. Use
    /// [`Self::check`] to get the full list.
    pub fn validate(&self, config: &EnvironmentConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!(warnings = result.warnings.len(), "Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(VpcForgeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all errors and warnings.
    #[must_use]
    pub fn check(&self, config: &EnvironmentConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_environment(config, &mut result);
        let network = Self::validate_network(config, &mut result);
        Self::validate_route_tables(config, &mut result);
        Self::validate_subnets(config, network, &mut result);
        Self::validate_security_groups(config, &mut result);
        Self::validate_key_pairs(config, &mut result);
        Self::validate_endpoints(config, &mut result);
        Self::validate_instance_groups(config, &mut result);
        Self::validate_load_balancers(config, &mut result);
        Self::validate_engine(config, &mut result);
        Self::validate_guardrails(config, &mut result);

        result
    }

    fn validate_environment(config: &EnvironmentConfig, result: &mut ValidationResult) {
        if config.environment.is_empty() {
            result.error("environment", "Environment name cannot be empty");
        } else if !is_valid_name(&config.environment) {
            result.error(
                "environment",
                format!(
                    "Environment name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    config.environment
                ),
            );
        }

        for key in config.tags.keys() {
            if is_reserved_tag(key) {
                result.error(format!("tags.{key}"), format!("Tag key '{key}' is reserved"));
            }
        }
    }

    fn validate_network(config: &EnvironmentConfig, result: &mut ValidationResult) -> Option<Cidr> {
        if !matches!(config.network.tenancy.as_str(), "default" | "dedicated") {
            result.error(
                "network.tenancy",
                format!("Tenancy must be 'default' or 'dedicated', got '{}'", config.network.tenancy),
            );
        }

        if let Some(vgw) = &config.network.vpn_gateway
            && !vgw.id.starts_with("vgw-")
        {
            result.error(
                "network.vpn_gateway.id",
                format!("'{}' is not a virtual private gateway id", vgw.id),
            );
        }

        match config.network.cidr.parse::<Cidr>() {
            Ok(cidr) => Some(cidr),
            Err(e) => {
                result.error("network.cidr", e.to_string());
                None
            }
        }
    }

    fn validate_route_tables(config: &EnvironmentConfig, result: &mut ValidationResult) {
        let mut mains = Vec::new();
        for (name, rt) in &config.route_tables {
            let prefix = format!("route_tables.{name}");
            check_name(name, &prefix, result);
            if rt.main {
                mains.push(name.as_str());
            }

            let mut destinations = HashSet::new();
            for (i, route) in rt.routes.iter().enumerate() {
                if let Err(e) = route.destination.parse::<Cidr>() {
                    result.error(format!("{prefix}.routes[{i}]"), e.to_string());
                }
                if !destinations.insert(route.destination.as_str()) {
                    result.error(
                        format!("{prefix}.routes[{i}]"),
                        format!("Duplicate route destination: {}", route.destination),
                    );
                }
                match route.target {
                    RouteTarget::InternetGateway if !config.network.internet_gateway => result.error(
                        format!("{prefix}.routes[{i}]"),
                        "Route to the internet gateway, but network.internet_gateway is off",
                    ),
                    RouteTarget::VpnGateway if config.network.vpn_gateway.is_none() => result.error(
                        format!("{prefix}.routes[{i}]"),
                        "Route to the VPN gateway, but network.vpn_gateway is not set",
                    ),
                    RouteTarget::NatGateway => result.warnings.push(format!(
                        "{prefix}.routes[{i}]: 'nat' routes through an existing NAT gateway, which vpcforge \
                         does not create; use instance_group:<name> for a NAT instance group"
                    )),
                    _ => {}
                }
            }
        }

        if mains.len() > 1 {
            result.error(
                "route_tables",
                format!("Only one main route table allowed, found: {}", mains.join(", ")),
            );
        }
    }

    fn validate_subnets(config: &EnvironmentConfig, network: Option<Cidr>, result: &mut ValidationResult) {
        for (name, subnet) in &config.subnets {
            let prefix = format!("subnets.{name}");
            check_name(name, &prefix, result);

            match (&subnet.cidr, subnet.size) {
                (Some(_), Some(_)) => {
                    result.error(&prefix, "Specify either 'cidr' or 'size', not both");
                }
                (None, None) => {
                    result.error(&prefix, "Subnet needs either 'cidr' or 'size'");
                }
                (Some(block), None) => match block.parse::<Cidr>() {
                    Ok(cidr) => {
                        if network.is_some_and(|n| !n.contains(cidr)) {
                            result.error(
                                format!("{prefix}.cidr"),
                                format!("{cidr} lies outside the network {}", config.network.cidr),
                            );
                        }
                    }
                    Err(e) => result.error(format!("{prefix}.cidr"), e.to_string()),
                },
                (None, Some(size)) => {
                    if !(MIN_SUBNET_PREFIX..=MAX_SUBNET_PREFIX).contains(&size) {
                        result.error(
                            format!("{prefix}.size"),
                            format!("Subnet size must be between {MIN_SUBNET_PREFIX} and {MAX_SUBNET_PREFIX}, got {size}"),
                        );
                    } else if network.is_some_and(|n| size < n.prefix()) {
                        result.error(
                            format!("{prefix}.size"),
                            format!("/{size} does not fit in the network {}", config.network.cidr),
                        );
                    }
                }
            }
        }
    }

    fn validate_security_groups(config: &EnvironmentConfig, result: &mut ValidationResult) {
        for (name, sg) in &config.security_groups {
            let prefix = format!("security_groups.{name}");
            check_name(name, &prefix, result);

            for (i, rule) in sg.inbound.iter().enumerate() {
                let field = format!("{prefix}.inbound[{i}]");
                check_rule(rule, &field, result);
                if rule.source == "0.0.0.0/0" && covers_ssh(rule) {
                    result
                        .warnings
                        .push(format!("{field}: SSH is open to the world (0.0.0.0/0)"));
                }
            }
            for (i, rule) in sg.outbound.iter().flatten().enumerate() {
                check_rule(rule, &format!("{prefix}.outbound[{i}]"), result);
            }
        }
    }

    fn validate_key_pairs(config: &EnvironmentConfig, result: &mut ValidationResult) {
        let mut seen = HashSet::new();
        for (i, entry) in config.key_pairs.iter().enumerate() {
            let field = format!("key_pairs[{i}]");
            if !seen.insert(entry.name()) {
                result.error(&field, format!("Duplicate key pair name: {}", entry.name()));
            }
            if entry.name().is_empty() {
                result.error(&field, "Key pair name cannot be empty");
            } else {
                check_name(entry.name(), &field, result);
            }
        }
    }

    fn validate_endpoints(config: &EnvironmentConfig, result: &mut ValidationResult) {
        for name in config.endpoints.keys() {
            check_name(name, &format!("endpoints.{name}"), result);
        }
    }

    fn validate_instance_groups(config: &EnvironmentConfig, result: &mut ValidationResult) {
        for (name, group) in &config.instance_groups {
            let prefix = format!("instance_groups.{name}");
            check_name(name, &prefix, result);

            if group.instance_type.is_empty() {
                result.error(format!("{prefix}.instance_type"), "Instance type cannot be empty");
            }
            if group.ami.is_empty() {
                result.error(format!("{prefix}.ami"), "Image cannot be empty");
            } else if config.amis.contains_key(&group.ami) && config.region.is_none() {
                result.error(
                    format!("{prefix}.ami"),
                    format!("Image alias '{}' needs a region to resolve", group.ami),
                );
            }
            if group.count > 0 && group.subnets.is_empty() {
                result.error(format!("{prefix}.subnets"), "Instance group needs at least one subnet");
            }
            if let Some(address) = &group.private_ip_address {
                if address.parse::<Ipv4Addr>().is_err() {
                    result.error(
                        format!("{prefix}.private_ip_address"),
                        format!("'{address}' is not an IPv4 address"),
                    );
                }
                if group.count > 1 {
                    result.error(
                        format!("{prefix}.private_ip_address"),
                        format!("A fixed private address needs count 1, got {}", group.count),
                    );
                }
            }

            let mut devices = HashSet::new();
            for (i, volume) in group.volumes.iter().enumerate() {
                let field = format!("{prefix}.volumes[{i}]");
                if volume.device.is_empty() {
                    result.error(&field, "Volume device cannot be empty");
                } else if !devices.insert(volume.device.as_str()) {
                    result.error(&field, format!("Duplicate volume device: {}", volume.device));
                }
                if volume.size_gb == 0 {
                    result.error(&field, "Volume size must be at least 1 GiB");
                }
            }
        }
    }

    fn validate_load_balancers(config: &EnvironmentConfig, result: &mut ValidationResult) {
        for (name, lb) in &config.load_balancers {
            let prefix = format!("load_balancers.{name}");
            check_name(name, &prefix, result);

            if lb.listeners.is_empty() {
                result
                    .warnings
                    .push(format!("{prefix}.listeners: Load balancer has no listeners"));
            }
            if lb.subnets.is_empty() {
                result.error(format!("{prefix}.subnets"), "Load balancer needs at least one subnet");
            }
            for (i, listener) in lb.listeners.iter().enumerate() {
                if listener.port == 0 || listener.instance_port == 0 {
                    result.error(format!("{prefix}.listeners[{i}]"), "Listener ports must be non-zero");
                }
            }
        }
    }

    fn validate_engine(config: &EnvironmentConfig, result: &mut ValidationResult) {
        let engine = &config.engine;
        if engine.max_concurrency == 0 {
            result.error("engine.max_concurrency", "Concurrency limit must be at least 1");
        }
        if engine.retry.max_attempts == 0 {
            result.error("engine.retry.max_attempts", "At least one attempt is required");
        }
        if !(0.0..=1.0).contains(&engine.retry.jitter) {
            result.error("engine.retry.jitter", "Jitter must be between 0.0 and 1.0");
        }
        if engine.retry.base_delay_ms > engine.retry.max_delay_ms {
            result.error("engine.retry.base_delay_ms", "Base delay exceeds the maximum delay");
        }
    }

    fn validate_guardrails(config: &EnvironmentConfig, result: &mut ValidationResult) {
        if let Some(guardrails) = &config.guardrails
            && let Some(max_instances) = guardrails.max_instances
        {
            let total = config.total_instances();
            if total > max_instances {
                result.error(
                    "guardrails.max_instances",
                    format!("Configuration requires {total} instances but max_instances is {max_instances}"),
                );
            }
        }
    }
}

fn check_name(name: &str, field: &str, result: &mut ValidationResult) {
    if !is_valid_name(name) {
        result.error(
            field,
            format!("Name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."),
        );
    }
}

fn check_rule(rule: &RuleConfig, field: &str, result: &mut ValidationResult) {
    if rule.source.contains('/') {
        if let Err(e) = rule.source.parse::<Cidr>() {
            result.error(field, e.to_string());
        }
    } else if !is_valid_name(&rule.source) {
        result.error(field, format!("Rule source '{}' is neither a CIDR nor a group name", rule.source));
    }
    if matches!(rule.protocol, Protocol::Tcp | Protocol::Udp) && rule.ports.from == 0 && !rule.ports.is_all() {
        result.error(field, "Port 0 is not a valid port");
    }
}

fn covers_ssh(rule: &RuleConfig) -> bool {
    let ports: PortRange = rule.ports;
    matches!(rule.protocol, Protocol::Tcp | Protocol::All) && ports.from <= 22 && ports.to >= 22
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
pub(crate) fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    // First character must be a letter
    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    if chars.any(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn check(yaml: &str) -> ValidationResult {
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        ConfigValidator::new().check(&config)
    }

    fn fields(result: &ValidationResult) -> Vec<&str> {
        result.errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("private-1"));
        assert!(is_valid_name("staging"));
        assert!(is_valid_name("s3"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Private")); // uppercase
        assert!(!is_valid_name("1-private")); // starts with number
        assert!(!is_valid_name("private_1")); // underscore
        assert!(!is_valid_name("private-")); // ends with hyphen
        assert!(!is_valid_name("private--1")); // consecutive hyphens
    }

    #[test]
    fn test_valid_config_passes() {
        let result = check(
            r"
environment: staging
network: { cidr: 10.0.0.0/16 }
route_tables:
  private: { routes: [[0.0.0.0/0, nat]] }
subnets:
  private-1: { size: 24, route_table: private }
  private-2: { cidr: 10.0.128.0/20, route_table: private }
",
        );
        assert!(result.is_valid(), "{:?}", result.errors);
        assert_eq!(result.warning_count(), 1);
        assert!(result.warnings[0].contains("existing NAT gateway"));
    }

    #[test]
    fn test_subnet_errors_have_field_paths() {
        let result = check(
            r"
environment: staging
network: { cidr: 10.0.0.0/16 }
subnets:
  outside: { cidr: 192.168.0.0/24 }
  tiny: { size: 30 }
  both: { cidr: 10.0.1.0/24, size: 24 }
  neither: {}
",
        );
        let fields = fields(&result);
        assert!(fields.contains(&"subnets.outside.cidr"));
        assert!(fields.contains(&"subnets.tiny.size"));
        assert!(fields.contains(&"subnets.both"));
        assert!(fields.contains(&"subnets.neither"));
    }

    #[test]
    fn test_reserved_tags_rejected() {
        let result = check(
            r"
environment: staging
tags: { Name: custom, 'vpcforge:environment': other, team: infra }
",
        );
        assert_eq!(result.error_count(), 2);
    }

    #[test]
    fn test_world_open_ssh_warns() {
        let result = check(
            r"
environment: staging
security_groups:
  bastion: { inbound: [[0.0.0.0/0, tcp, 22]] }
load_balancers:
  web: { subnets: [public-1] }
",
        );
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 2);
    }

    #[test]
    fn test_guardrail_instance_cap() {
        let result = check(
            r"
environment: staging
subnets:
  a: { size: 24 }
instance_groups:
  web: { ami: ami-1, instance_type: t3.small, count: 6, subnets: [a] }
guardrails: { max_instances: 4 }
",
        );
        assert_eq!(fields(&result), vec!["guardrails.max_instances"]);
    }

    #[test]
    fn test_validate_returns_first_error() {
        let config = ConfigParser::new()
            .parse_yaml("environment: Bad_Name\n", None)
            .unwrap();
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_gateway_routes_need_gateways() {
        let result = check(
            r"
environment: staging
network: { cidr: 10.0.0.0/16, internet_gateway: false }
route_tables:
  public: { routes: [[0.0.0.0/0, internet_gateway], [192.168.0.0/16, vpn_gateway]] }
",
        );
        assert_eq!(
            fields(&result),
            vec!["route_tables.public.routes[0]", "route_tables.public.routes[1]"]
        );

        let attached = check(
            r"
environment: staging
network: { vpn_gateway: { id: vgw-0abc } }
route_tables:
  private: { routes: [[192.168.0.0/16, vpn_gateway]] }
",
        );
        assert!(attached.is_valid(), "{:?}", attached.errors);
    }

    #[test]
    fn test_instance_launch_options() {
        let result = check(
            r"
environment: staging
subnets:
  a: { size: 24 }
instance_groups:
  db:
    ami: ami-1
    instance_type: t3.small
    count: 2
    subnets: [a]
    private_ip_address: 10.0.0.300
    volumes: [{ device: /dev/xvdf, size_gb: 0 }, { device: /dev/xvdf, size_gb: 10 }]
",
        );
        let fields = fields(&result);
        assert_eq!(
            fields,
            vec![
                "instance_groups.db.private_ip_address",
                "instance_groups.db.private_ip_address",
                "instance_groups.db.volumes[0]",
                "instance_groups.db.volumes[1]",
            ]
        );
    }

    #[test]
    fn test_key_pair_names_checked() {
        let result = check("environment: staging\nkey_pairs: [ok, Not--Ok]\n");
        assert_eq!(fields(&result), vec!["key_pairs[1]"]);
    }
}
