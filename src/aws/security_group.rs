//! Security group and rule set providers.
//!
//! A group and its rules are separate nodes so that groups referencing
//! each other can both exist before either rule set is applied. The rule
//! set of a group is addressed by the group id.

use async_trait::async_trait;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::types::{IpPermission, IpRange, Ipv6Range, ResourceType, SecurityGroup, UserIdGroupPair};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::graph::{PortRange, Protocol, ResourceKind, ResourceSpec, Rule, RuleSetSpec, RuleSource, SecurityGroupSpec};
use crate::naming::OwnerTag;
use crate::provider::{CreateRequest, CreatedResource, DeleteRequest, RemoteResource, ResourceProvider, UpdateRequest};

use super::error::{from_sdk, reference_not_visible};
use super::tags::{EC2_TAG_LIMIT, owner_filter, tag_map, tag_spec};
use super::{FollowUp, ensure_absent, identity_filters, missing, no_network, wrong_spec};

/// Manages security groups (without their rules).
#[derive(Debug, Clone)]
pub struct SecurityGroupProvider {
    client: Client,
}

impl SecurityGroupProvider {
    pub const fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn owned_groups(client: &Client, owner: &OwnerTag) -> ProviderResult<Vec<SecurityGroup>> {
    let output = client
        .describe_security_groups()
        .filters(owner_filter(owner))
        .send()
        .await
        .map_err(|e| from_sdk("DescribeSecurityGroups", &e))?;
    Ok(output.security_groups().to_vec())
}

#[async_trait]
impl ResourceProvider for SecurityGroupProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::SecurityGroup
    }

    fn tag_limit(&self) -> Option<usize> {
        Some(EC2_TAG_LIMIT)
    }

    async fn list(&self, owner: &OwnerTag) -> ProviderResult<Vec<RemoteResource>> {
        Ok(owned_groups(&self.client, owner)
            .await?
            .iter()
            .filter_map(|group| {
                Some(RemoteResource {
                    remote_id: group.group_id()?.to_string(),
                    tags: tag_map(group.tags()),
                    spec: ResourceSpec::SecurityGroup(SecurityGroupSpec {
                        description: group.description().unwrap_or_default().to_string(),
                    }),
                })
            })
            .collect())
    }

    async fn create(&self, request: &CreateRequest) -> ProviderResult<CreatedResource> {
        let ResourceSpec::SecurityGroup(spec) = &request.spec else {
            return Err(wrong_spec(self.kind()));
        };
        let vpc_id = request.refs.network().ok_or_else(no_network)?;

        let existing = self
            .client
            .describe_security_groups()
            .set_filters(Some(identity_filters(&request.tags)))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeSecurityGroups", &e))?;
        ensure_absent(
            &request.name,
            existing.security_groups().first().and_then(|g| g.group_id()),
        )?;

        let output = self
            .client
            .create_security_group()
            .group_name(&request.name)
            .description(&spec.description)
            .vpc_id(vpc_id)
            .tag_specifications(tag_spec(ResourceType::SecurityGroup, &request.tags))
            .send()
            .await
            .map_err(|e| reference_not_visible(from_sdk("CreateSecurityGroup", &e)))?;
        let group_id = output
            .group_id()
            .ok_or_else(|| missing("CreateSecurityGroup", "group id"))?
            .to_string();
        info!(security_group = %request.key.name, %group_id, "Created security group");

        Ok(CreatedResource {
            remote_id: group_id,
            tags: request.tags.to_map(),
        })
    }

    async fn update(&self, request: &UpdateRequest) -> ProviderResult<()> {
        Err(ProviderError::invalid(format!(
            "security group {} cannot change {:?} in place",
            request.remote_id, request.changed
        )))
    }

    async fn delete(&self, request: &DeleteRequest) -> ProviderResult<()> {
        self.client
            .delete_security_group()
            .group_id(&request.remote_id)
            .send()
            .await
            .map_err(|e| from_sdk("DeleteSecurityGroup", &e))?;
        info!(group_id = %request.remote_id, "Deleted security group");
        Ok(())
    }
}

/// Manages the inbound and outbound rules of a security group.
#[derive(Debug, Clone)]
pub struct RuleSetProvider {
    client: Client,
    follow_up: FollowUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

impl RuleSetProvider {
    pub const fn new(client: Client, follow_up: FollowUp) -> Self {
        Self { client, follow_up }
    }

    async fn authorize(&self, group_id: &str, direction: Direction, rule: &Rule) -> ProviderResult<()> {
        let permission = to_permission(rule);
        let result = match direction {
            Direction::Inbound => self
                .client
                .authorize_security_group_ingress()
                .group_id(group_id)
                .ip_permissions(permission)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| from_sdk("AuthorizeSecurityGroupIngress", &e)),
            Direction::Outbound => self
                .client
                .authorize_security_group_egress()
                .group_id(group_id)
                .ip_permissions(permission)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| from_sdk("AuthorizeSecurityGroupEgress", &e)),
        };
        match result {
            Ok(()) | Err(ProviderError::AlreadyExists { .. }) => {
                debug!(%group_id, ?direction, %rule, "Rule authorized");
                Ok(())
            }
            Err(e) => Err(reference_not_visible(e)),
        }
    }

    async fn revoke(&self, group_id: &str, direction: Direction, rule: &Rule) -> ProviderResult<()> {
        let permission = to_permission(rule);
        let result = match direction {
            Direction::Inbound => self
                .client
                .revoke_security_group_ingress()
                .group_id(group_id)
                .ip_permissions(permission)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| from_sdk("RevokeSecurityGroupIngress", &e)),
            Direction::Outbound => self
                .client
                .revoke_security_group_egress()
                .group_id(group_id)
                .ip_permissions(permission)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| from_sdk("RevokeSecurityGroupEgress", &e)),
        };
        match result {
            Ok(()) => {
                debug!(%group_id, ?direction, %rule, "Rule revoked");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Brings one direction of a group from `current` to `desired`.
    async fn converge(
        &self,
        group_id: &str,
        direction: Direction,
        current: &BTreeSet<Rule>,
        desired: &BTreeSet<Rule>,
    ) -> ProviderResult<()> {
        for rule in current.difference(desired) {
            self.revoke(group_id, direction, rule).await?;
        }
        for rule in desired.difference(current) {
            self.authorize(group_id, direction, rule).await?;
        }
        Ok(())
    }
}

/// The egress rule EC2 adds to every new group.
fn default_egress() -> BTreeSet<Rule> {
    BTreeSet::from([Rule {
        source: RuleSource::Cidr(String::from("0.0.0.0/0")),
        protocol: Protocol::All,
        ports: PortRange::ALL,
    }])
}

fn protocol_name(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
        Protocol::Icmp => "icmp",
        Protocol::All => "-1",
    }
}

fn parse_protocol(name: &str) -> Option<Protocol> {
    match name {
        "tcp" | "6" => Some(Protocol::Tcp),
        "udp" | "17" => Some(Protocol::Udp),
        "icmp" | "1" => Some(Protocol::Icmp),
        "-1" | "all" => Some(Protocol::All),
        _ => None,
    }
}

/// Converts one rule into the single-peer permission EC2 expects.
fn to_permission(rule: &Rule) -> IpPermission {
    let mut builder = IpPermission::builder().ip_protocol(protocol_name(rule.protocol));
    builder = match rule.protocol {
        Protocol::All => builder,
        Protocol::Icmp => builder.from_port(-1).to_port(-1),
        Protocol::Tcp | Protocol::Udp => builder
            .from_port(i32::from(rule.ports.from))
            .to_port(i32::from(rule.ports.to)),
    };
    match &rule.source {
        RuleSource::Cidr(cidr) if cidr.contains(':') => {
            builder.ipv6_ranges(Ipv6Range::builder().cidr_ipv6(cidr).build())
        }
        RuleSource::Cidr(cidr) => builder.ip_ranges(IpRange::builder().cidr_ip(cidr).build()),
        RuleSource::Group(group_id) => {
            builder.user_id_group_pairs(UserIdGroupPair::builder().group_id(group_id).build())
        }
    }
    .build()
}

/// Expands EC2 permissions into one rule per peer.
///
/// Permissions with an unsupported protocol are skipped; the caller logs
/// how many were dropped.
fn from_permissions(permissions: &[IpPermission]) -> (BTreeSet<Rule>, usize) {
    let mut rules = BTreeSet::new();
    let mut skipped = 0;
    for permission in permissions {
        let Some(protocol) = permission.ip_protocol().and_then(parse_protocol) else {
            skipped += 1;
            continue;
        };
        let ports = match protocol {
            Protocol::All | Protocol::Icmp => PortRange::ALL,
            Protocol::Tcp | Protocol::Udp => {
                let port = |p: Option<i32>| p.and_then(|p| u16::try_from(p).ok());
                match (port(permission.from_port()), port(permission.to_port())) {
                    (Some(from), Some(to)) => PortRange { from, to },
                    _ => PortRange::ALL,
                }
            }
        };

        let peers = permission
            .ip_ranges()
            .iter()
            .filter_map(|r| r.cidr_ip().map(|c| RuleSource::Cidr(c.to_string())))
            .chain(
                permission
                    .ipv6_ranges()
                    .iter()
                    .filter_map(|r| r.cidr_ipv6().map(|c| RuleSource::Cidr(c.to_string()))),
            )
            .chain(
                permission
                    .user_id_group_pairs()
                    .iter()
                    .filter_map(|p| p.group_id().map(|g| RuleSource::Group(g.to_string()))),
            );
        for source in peers {
            rules.insert(Rule { source, protocol, ports });
        }
    }
    (rules, skipped)
}

#[async_trait]
impl ResourceProvider for RuleSetProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::SecurityGroupRules
    }

    fn tag_limit(&self) -> Option<usize> {
        Some(EC2_TAG_LIMIT)
    }

    async fn list(&self, owner: &OwnerTag) -> ProviderResult<Vec<RemoteResource>> {
        Ok(owned_groups(&self.client, owner)
            .await?
            .iter()
            .filter_map(|group| {
                let group_id = group.group_id()?;
                let (inbound, skipped_in) = from_permissions(group.ip_permissions());
                let (outbound, skipped_out) = from_permissions(group.ip_permissions_egress());
                if skipped_in + skipped_out > 0 {
                    warn!(%group_id, skipped = skipped_in + skipped_out, "Ignoring rules with unsupported protocols");
                }
                Some(RemoteResource {
                    remote_id: group_id.to_string(),
                    tags: tag_map(group.tags()),
                    spec: ResourceSpec::SecurityGroupRules(RuleSetSpec {
                        inbound,
                        outbound: Some(outbound),
                    }),
                })
            })
            .collect())
    }

    /// Applies the rules to a group created earlier in the run. There is
    /// no control-plane object to create, so adoption never happens here.
    async fn create(&self, request: &CreateRequest) -> ProviderResult<CreatedResource> {
        let ResourceSpec::SecurityGroupRules(spec) = request.refs.to_remote(&request.spec) else {
            return Err(wrong_spec(self.kind()));
        };
        let group_id = request
            .refs
            .get(ResourceKind::SecurityGroup, &request.key.name)
            .ok_or_else(|| ProviderError::NotYetVisible {
                message: format!("security group {} not resolved", request.key.name),
            })?
            .to_string();

        for rule in &spec.inbound {
            self.follow_up
                .settle("AuthorizeSecurityGroupIngress", || {
                    self.authorize(&group_id, Direction::Inbound, rule)
                })
                .await?;
        }
        if let Some(outbound) = &spec.outbound {
            let default_egress = default_egress();
            self.follow_up
                .settle("RevokeSecurityGroupEgress", || {
                    self.converge(&group_id, Direction::Outbound, &default_egress, outbound)
                })
                .await?;
        }
        info!(security_group = %request.key.name, %group_id, "Applied rule set");

        Ok(CreatedResource {
            remote_id: group_id,
            tags: request.tags.to_map(),
        })
    }

    async fn update(&self, request: &UpdateRequest) -> ProviderResult<()> {
        let (ResourceSpec::SecurityGroupRules(current), ResourceSpec::SecurityGroupRules(desired)) = (
            request.refs.to_remote(&request.current),
            request.refs.to_remote(&request.desired),
        ) else {
            return Err(wrong_spec(self.kind()));
        };
        let group_id = request.remote_id.as_str();

        self.converge(group_id, Direction::Inbound, &current.inbound, &desired.inbound)
            .await?;
        if let Some(outbound) = &desired.outbound {
            let live = current.outbound.unwrap_or_default();
            self.converge(group_id, Direction::Outbound, &live, outbound).await?;
        }
        Ok(())
    }

    async fn delete(&self, request: &DeleteRequest) -> ProviderResult<()> {
        let ResourceSpec::SecurityGroupRules(current) = request.refs.to_remote(&request.current) else {
            return Err(wrong_spec(self.kind()));
        };
        let group_id = request.remote_id.as_str();

        // Group references keep the referenced group from being deleted.
        for rule in &current.inbound {
            self.revoke(group_id, Direction::Inbound, rule).await?;
        }
        for rule in current.outbound.iter().flatten() {
            if matches!(rule.source, RuleSource::Group(_)) {
                self.revoke(group_id, Direction::Outbound, rule).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(source: RuleSource, protocol: Protocol, ports: PortRange) -> Rule {
        Rule { source, protocol, ports }
    }

    #[test]
    fn test_tcp_rule_to_permission() {
        let permission = to_permission(&rule(
            RuleSource::Cidr("10.0.0.0/8".into()),
            Protocol::Tcp,
            PortRange { from: 8000, to: 8080 },
        ));
        assert_eq!(permission.ip_protocol(), Some("tcp"));
        assert_eq!(permission.from_port(), Some(8000));
        assert_eq!(permission.to_port(), Some(8080));
        assert_eq!(permission.ip_ranges()[0].cidr_ip(), Some("10.0.0.0/8"));
    }

    #[test]
    fn test_all_and_icmp_ports() {
        let all = to_permission(&rule(RuleSource::Group("sg-1".into()), Protocol::All, PortRange::ALL));
        assert_eq!(all.ip_protocol(), Some("-1"));
        assert_eq!(all.from_port(), None);
        assert_eq!(all.user_id_group_pairs()[0].group_id(), Some("sg-1"));

        let icmp = to_permission(&rule(RuleSource::Cidr("::/0".into()), Protocol::Icmp, PortRange::ALL));
        assert_eq!(icmp.from_port(), Some(-1));
        assert_eq!(icmp.ipv6_ranges()[0].cidr_ipv6(), Some("::/0"));
    }

    #[test]
    fn test_permissions_expand_per_peer() {
        let permission = IpPermission::builder()
            .ip_protocol("tcp")
            .from_port(22)
            .to_port(22)
            .ip_ranges(IpRange::builder().cidr_ip("10.0.0.0/8").build())
            .ip_ranges(IpRange::builder().cidr_ip("192.168.0.0/16").build())
            .user_id_group_pairs(UserIdGroupPair::builder().group_id("sg-2").build())
            .build();
        let unsupported = IpPermission::builder().ip_protocol("50").build();

        let (rules, skipped) = from_permissions(&[permission, unsupported]);
        assert_eq!(rules.len(), 3);
        assert_eq!(skipped, 1);
        assert!(rules.contains(&rule(RuleSource::Group("sg-2".into()), Protocol::Tcp, PortRange::single(22))));
    }

    #[test]
    fn test_default_egress_matches_listing() {
        let permission = IpPermission::builder()
            .ip_protocol("-1")
            .ip_ranges(IpRange::builder().cidr_ip("0.0.0.0/0").build())
            .build();
        let (rules, _) = from_permissions(&[permission]);
        assert_eq!(rules, default_egress());
    }
}
