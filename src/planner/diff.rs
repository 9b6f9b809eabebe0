//! Diff engine for comparing the desired graph with the live graph.
//!
//! Nodes are matched by (kind, logical name); ownership was already applied
//! by discovery. Each kind has a fixed allow-list of mutable attributes.
//! Every other compared attribute is identity-defining, and a difference
//! there is a configuration error rather than a silent replacement.
//! Collections are sets, so declaration order never shows up as a change.

use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

use crate::config::ConfigHasher;
use crate::error::ConfigError;
use crate::graph::{LiveGraph, NodeKey, ResourceGraph, ResourceSpec};

/// Engine for computing diffs between desired and live graphs.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Node hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Resource address.
    pub key: NodeKey,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Attribute-level differences.
    pub details: Vec<DiffDetail>,
    /// Remote id of the live resource, if any.
    pub remote_id: Option<String>,
    /// Fingerprint of the desired node, if any.
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Mutable attributes differ.
    Update,
    /// Resource is live but no longer declared.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffDetail {
    /// Attribute that differs.
    pub field: String,
    /// Live value.
    pub old_value: Option<String>,
    /// Desired value.
    pub new_value: Option<String>,
    /// Whether the attribute can change in place.
    pub mutable: bool,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Per-resource diffs: desired nodes in dependency order, then live-only
    /// resources in key order.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of live resources no longer declared.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff used for planning.
    ///
    /// Live resources that are no longer declared are reported only when
    /// `include_orphans` is set (prune mode).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ImmutableAttribute`] for the first
    /// identity-defining attribute that differs.
    pub fn compute_diff(
        &self,
        desired: &ResourceGraph,
        live: &LiveGraph,
        include_orphans: bool,
    ) -> Result<DiffResult, ConfigError> {
        let result = self.drift(desired, live, include_orphans);

        for diff in &result.diffs {
            if let Some(detail) = diff.details.iter().find(|d| !d.mutable) {
                return Err(ConfigError::ImmutableAttribute {
                    resource: diff.key.to_string(),
                    field: detail.field.clone(),
                    live: detail.old_value.clone().unwrap_or_default(),
                    desired: detail.new_value.clone().unwrap_or_default(),
                });
            }
        }

        Ok(result)
    }

    /// Computes every difference without judging it.
    ///
    /// Used for drift reports; immutable differences are included and
    /// flagged instead of failing.
    #[must_use]
    pub fn drift(&self, desired: &ResourceGraph, live: &LiveGraph, include_orphans: bool) -> DiffResult {
        let mut diffs = Vec::new();

        for node in desired.ordered() {
            let new_hash = Some(self.hasher.hash_node(node));
            let diff = match live.get(&node.key) {
                None => {
                    debug!(resource = %node.key, "Resource needs to be created");
                    ResourceDiff {
                        key: node.key.clone(),
                        diff_type: DiffType::Create,
                        details: Vec::new(),
                        remote_id: None,
                        new_hash,
                    }
                }
                Some(existing) => {
                    let details = compare(&existing.spec, &node.spec);
                    let diff_type = if details.is_empty() {
                        DiffType::NoChange
                    } else {
                        debug!(resource = %node.key, changes = details.len(), "Resource differs");
                        DiffType::Update
                    };
                    ResourceDiff {
                        key: node.key.clone(),
                        diff_type,
                        details,
                        remote_id: Some(existing.remote_id.clone()),
                        new_hash,
                    }
                }
            };
            diffs.push(diff);
        }

        if include_orphans {
            for resource in live.iter() {
                if desired.get(&resource.key).is_none() {
                    debug!(resource = %resource.key, "Found resource no longer declared");
                    diffs.push(ResourceDiff {
                        key: resource.key.clone(),
                        diff_type: DiffType::Delete,
                        details: Vec::new(),
                        remote_id: Some(resource.remote_id.clone()),
                        new_hash: None,
                    });
                }
            }
        }

        // Compute summary
        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        DiffResult {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        }
    }
}

impl DiffResult {
    /// Returns true if nothing needs to change.
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        self.creates == 0 && self.updates == 0 && self.deletes == 0
    }
}

/// Collects attribute differences of one kind.
struct Comparison {
    details: Vec<DiffDetail>,
}

impl Comparison {
    fn field<T: Serialize + PartialEq>(&mut self, name: &str, live: &T, desired: &T, mutable: bool) {
        if live != desired {
            self.details.push(DiffDetail {
                field: name.to_string(),
                old_value: Some(render(live)),
                new_value: Some(render(desired)),
                mutable,
            });
        }
    }

    /// Reports added and removed set members.
    fn set<T: Ord + std::fmt::Display>(&mut self, name: &str, live: &BTreeSet<T>, desired: &BTreeSet<T>) {
        if live == desired {
            return;
        }
        let removed: Vec<String> = live.difference(desired).map(ToString::to_string).collect();
        let added: Vec<String> = desired.difference(live).map(ToString::to_string).collect();
        self.details.push(DiffDetail {
            field: name.to_string(),
            old_value: (!removed.is_empty()).then(|| format!("-[{}]", removed.join(", "))),
            new_value: (!added.is_empty()).then(|| format!("+[{}]", added.join(", "))),
            mutable: true,
        });
    }
}

fn render<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("<unrenderable>"))
}

/// A bare zone letter matches any zone ending in it; an unset zone matches
/// whatever the provider picked.
fn zone_matches(live: Option<&str>, desired: Option<&str>) -> bool {
    match (live, desired) {
        (_, None) => true,
        (Some(live), Some(desired)) if desired.len() == 1 => live.ends_with(desired),
        (live, desired) => live == desired,
    }
}

/// Compares the live and desired attributes of one resource.
#[must_use]
pub fn compare(live: &ResourceSpec, desired: &ResourceSpec) -> Vec<DiffDetail> {
    let mut c = Comparison { details: Vec::new() };

    match (live, desired) {
        (ResourceSpec::Network(l), ResourceSpec::Network(d)) => {
            c.field("cidr", &l.cidr, &d.cidr, false);
            c.field("tenancy", &l.tenancy, &d.tenancy, false);
            c.field("enable_dns", &l.enable_dns, &d.enable_dns, true);
            c.field("internet_gateway", &l.internet_gateway, &d.internet_gateway, true);
            c.field("vpn_gateway", &l.vpn_gateway, &d.vpn_gateway, true);
        }
        (ResourceSpec::DhcpOptions(l), ResourceSpec::DhcpOptions(d)) => {
            c.field("domain_name", &l.domain_name, &d.domain_name, false);
            c.field("domain_name_servers", &l.domain_name_servers, &d.domain_name_servers, false);
        }
        (ResourceSpec::RouteTable(l), ResourceSpec::RouteTable(d)) => {
            c.field("main", &l.main, &d.main, false);
            c.set("routes", &l.routes, &d.routes);
        }
        (ResourceSpec::Subnet(l), ResourceSpec::Subnet(d)) => {
            c.field("cidr", &l.cidr, &d.cidr, false);
            if !zone_matches(l.availability_zone.as_deref(), d.availability_zone.as_deref()) {
                c.field("availability_zone", &l.availability_zone, &d.availability_zone, false);
            }
            c.field("public", &l.public, &d.public, true);
            c.field("route_table", &l.route_table, &d.route_table, true);
        }
        (ResourceSpec::SecurityGroup(l), ResourceSpec::SecurityGroup(d)) => {
            c.field("description", &l.description, &d.description, false);
        }
        (ResourceSpec::SecurityGroupRules(l), ResourceSpec::SecurityGroupRules(d)) => {
            c.set("inbound", &l.inbound, &d.inbound);
            // Unmanaged egress is never compared.
            if let Some(desired_outbound) = &d.outbound {
                let live_outbound = l.outbound.clone().unwrap_or_default();
                c.set("outbound", &live_outbound, desired_outbound);
            }
        }
        (ResourceSpec::KeyPair(_), ResourceSpec::KeyPair(_)) => {}
        (ResourceSpec::Endpoint(l), ResourceSpec::Endpoint(d)) => {
            c.field("service", &l.service, &d.service, false);
            c.set("route_tables", &l.route_tables, &d.route_tables);
        }
        (ResourceSpec::InstanceGroup(l), ResourceSpec::InstanceGroup(d)) => {
            c.field("ami", &l.ami, &d.ami, false);
            c.field("instance_type", &l.instance_type, &d.instance_type, false);
            c.field("subnets", &l.subnets, &d.subnets, false);
            c.field("key_pair", &l.key_pair, &d.key_pair, false);
            c.field("count", &l.count, &d.count, true);
            c.set("security_groups", &l.security_groups, &d.security_groups);
            c.field("source_dest_check", &l.source_dest_check, &d.source_dest_check, true);
            c.field("eip", &l.eip, &d.eip, true);
            c.field("termination_protection", &l.termination_protection, &d.termination_protection, true);
            // User data, profile, fixed address and volumes only apply at launch.
        }
        (ResourceSpec::LoadBalancer(l), ResourceSpec::LoadBalancer(d)) => {
            c.field("internal", &l.internal, &d.internal, false);
            c.field("instance_group", &l.instance_group, &d.instance_group, true);
            c.set("subnets", &l.subnets, &d.subnets);
            c.set("security_groups", &l.security_groups, &d.security_groups);
            c.set("listeners", &l.listeners, &d.listeners);
            c.field("health_check", &l.health_check, &d.health_check, true);
        }
        (l, d) => c.field("kind", &l.kind(), &d.kind(), false),
    }

    c.details
}
