//! Resource dependency graph.
//!
//! This module turns the desired schema into typed resource nodes and
//! dependency edges, and provides the DAG operations (ordering, reverse
//! ordering, downstream closure) used by planning and execution.

mod builder;
mod cidr;
mod dag;
mod kind;
mod node;

pub use builder::{DHCP_OPTIONS_NAME, GraphBuilder};
pub use cidr::{Cidr, CidrRequest, allocate};
pub use dag::{Dag, LiveGraph, ResourceGraph};
pub use kind::{Edge, EdgeKind, NodeKey, ResourceKind};
pub use node::{
    DhcpOptionsSpec, EndpointSpec, HealthCheck, InstanceGroupSpec, KeyPairSpec, Listener, LiveResource,
    LoadBalancerSpec, NetworkSpec, PortRange, Protocol, ResourceNode, ResourceSpec, Route, RouteTableSpec,
    RouteTarget, Rule, RuleSetSpec, RuleSource, SecurityGroupSpec, SubnetSpec, Volume,
};
