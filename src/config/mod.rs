//! Configuration module for vpcforge.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `vpcforge.yaml`
//! - Validation of configuration values
//! - Computing graph fingerprints for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    DhcpOptionsConfig, EndpointConfig, EngineConfig, EnvironmentConfig, GuardrailsConfig, HealthCheckConfig,
    InstanceGroupConfig, KeyPairEntry, ListenerConfig, LoadBalancerConfig, NetworkConfig, PortValue, RetryConfig,
    RouteConfig, RouteTableConfig, RuleConfig, SecurityGroupConfig, SubnetConfig, VolumeConfig, VpnGatewayConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
