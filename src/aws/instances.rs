//! Instance group provider.
//!
//! An instance group has no control-plane object: it is the set of live
//! instances carrying the group's identity tags, addressed as
//! `{environment}/{name}`. Instances are spread round-robin over the
//! group's subnets in logical-name order. The subnet list is recorded in a
//! tag so that a group smaller than its subnet list still reports the
//! declared subnets.
//!
//! Elastic addresses of a group carry the group's identity tags, so they
//! are found again after an interrupted run and released with the group.

use async_trait::async_trait;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::types::{
    Address, AttributeBooleanValue, BlockDeviceMapping, DomainType, EbsBlockDevice, IamInstanceProfileSpecification,
    Instance, InstanceAttributeName, InstanceType, ResourceType, Tag, VolumeType,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ProviderError, ProviderResult};
use crate::graph::{InstanceGroupSpec, ResourceKind, ResourceSpec, Volume};
use crate::naming::{LOGICAL_NAME_TAG, OWNER_TAG, OwnerTag, TagSet};
use crate::provider::{
    CreateRequest, CreatedResource, DeleteRequest, RemoteResource, ResolvedRefs, ResourceProvider, UpdateRequest,
};

use super::error::{from_sdk, reference_not_visible};
use super::tags::{EC2_TAG_LIMIT, copy_tags, filter, instance_group_id, owner_filter, split_group_id, tag_map};
use super::{FollowUp, ensure_absent, missing, wrong_spec};

/// Tag recording the group's subnet ids in placement order.
const SUBNETS_TAG: &str = "vpcforge:subnets";

/// States of instances that still count as group members.
const MEMBER_STATES: [&str; 4] = ["pending", "running", "stopping", "stopped"];

/// Polls while waiting for terminated instances to go away.
const TERMINATE_POLLS: u32 = 60;

/// Interval between termination polls.
const TERMINATE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Manages instance groups.
#[derive(Debug, Clone)]
pub struct InstanceGroupProvider {
    client: Client,
    follow_up: FollowUp,
}

/// Everything needed to launch members of one group.
struct Launch<'a> {
    spec: &'a InstanceGroupSpec,
    subnets: Vec<String>,
    security_groups: Vec<String>,
    key_name: Option<String>,
    tags: Vec<Tag>,
}

impl InstanceGroupProvider {
    pub const fn new(client: Client, follow_up: FollowUp) -> Self {
        Self { client, follow_up }
    }

    /// Live members of a group, oldest first.
    async fn members(&self, environment: &str, name: &str) -> ProviderResult<Vec<Instance>> {
        let mut pages = self
            .client
            .describe_instances()
            .filters(filter(&format!("tag:{OWNER_TAG}"), [environment]))
            .filters(filter(&format!("tag:{LOGICAL_NAME_TAG}"), [name]))
            .filters(filter("instance-state-name", MEMBER_STATES))
            .into_paginator()
            .send();

        let mut members = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| from_sdk("DescribeInstances", &e))?;
            members.extend(page.reservations().iter().flat_map(|r| r.instances()).cloned());
        }
        members.sort_by_key(|i| (i.launch_time().map(|t| t.secs()), i.instance_id().map(str::to_string)));
        Ok(members)
    }

    async fn group_members(&self, group_id: &str) -> ProviderResult<Vec<Instance>> {
        let (environment, name) = split_group(group_id)?;
        self.members(environment, name).await
    }

    async fn group_addresses(&self, group_id: &str) -> ProviderResult<Vec<Address>> {
        let (environment, name) = split_group(group_id)?;
        self.addresses(environment, Some(name)).await
    }

    /// Launches members `start..start + count` of a group.
    async fn launch(&self, launch: &Launch<'_>, start: usize, count: usize) -> ProviderResult<Vec<String>> {
        let mut launched = Vec::new();
        for (subnet_id, n) in spread(&launch.subnets, start, count) {
            let mut call = self
                .client
                .run_instances()
                .image_id(&launch.spec.ami)
                .instance_type(InstanceType::from(launch.spec.instance_type.as_str()))
                .min_count(n)
                .max_count(n)
                .subnet_id(&subnet_id)
                .set_security_group_ids(Some(launch.security_groups.clone()))
                .set_key_name(launch.key_name.clone())
                .set_private_ip_address(launch.spec.private_ip_address.clone())
                .disable_api_termination(launch.spec.termination_protection)
                .set_block_device_mappings(Some(block_devices(&launch.spec.volumes)))
                .client_token(Uuid::new_v4().to_string())
                .tag_specifications(copy_tags(ResourceType::Instance, &launch.tags))
                .tag_specifications(copy_tags(ResourceType::Volume, &launch.tags));
            if let Some(user_data) = &launch.spec.user_data {
                call = call.user_data(BASE64.encode(user_data));
            }
            if let Some(profile) = &launch.spec.instance_profile {
                call = call.iam_instance_profile(IamInstanceProfileSpecification::builder().name(profile).build());
            }

            let output = call
                .send()
                .await
                .map_err(|e| reference_not_visible(from_sdk("RunInstances", &e)))?;
            let ids: Vec<String> = output
                .instances()
                .iter()
                .filter_map(|i| i.instance_id().map(str::to_string))
                .collect();
            debug!(%subnet_id, count = ids.len(), "Launched instances");
            launched.extend(ids);
        }

        if !launch.spec.source_dest_check {
            for id in &launched {
                self.follow_up
                    .settle("ModifyInstanceAttribute", || self.set_source_dest_check(id, false))
                    .await?;
            }
        }
        if launch.spec.eip {
            self.attach_addresses(&launched, &launch.tags).await?;
        }
        Ok(launched)
    }

    async fn set_termination_protection(&self, instance_id: &str, enabled: bool) -> ProviderResult<()> {
        self.client
            .modify_instance_attribute()
            .instance_id(instance_id)
            .disable_api_termination(AttributeBooleanValue::builder().value(enabled).build())
            .send()
            .await
            .map_err(|e| reference_not_visible(from_sdk("ModifyInstanceAttribute", &e)))?;
        Ok(())
    }

    async fn termination_protected(&self, instance_id: &str) -> ProviderResult<bool> {
        let output = self
            .client
            .describe_instance_attribute()
            .instance_id(instance_id)
            .attribute(InstanceAttributeName::DisableApiTermination)
            .send()
            .await
            .map_err(|e| from_sdk("DescribeInstanceAttribute", &e))?;
        Ok(output
            .disable_api_termination()
            .and_then(AttributeBooleanValue::value)
            .unwrap_or(false))
    }

    /// Lifts termination protection so members can be terminated.
    async fn unprotect(&self, ids: &[String]) -> ProviderResult<()> {
        for id in ids {
            match self.set_termination_protection(id, false).await {
                Ok(()) | Err(ProviderError::NotFound { .. } | ProviderError::NotYetVisible { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Elastic addresses carrying the identity tags of one group, or of
    /// every group of an environment when `name` is `None`.
    async fn addresses(&self, environment: &str, name: Option<&str>) -> ProviderResult<Vec<Address>> {
        let mut call = self
            .client
            .describe_addresses()
            .filters(filter(&format!("tag:{OWNER_TAG}"), [environment]));
        if let Some(name) = name {
            call = call.filters(filter(&format!("tag:{LOGICAL_NAME_TAG}"), [name]));
        }
        let output = call.send().await.map_err(|e| from_sdk("DescribeAddresses", &e))?;
        Ok(output.addresses().to_vec())
    }

    /// Gives every instance in `ids` an elastic address. Unassociated
    /// addresses of the group are reused before new ones are allocated.
    async fn attach_addresses(&self, ids: &[String], tags: &[Tag]) -> ProviderResult<()> {
        let identity = tag_map(tags);
        let (Some(environment), Some(name)) = (identity.get(OWNER_TAG), identity.get(LOGICAL_NAME_TAG)) else {
            return Err(ProviderError::invalid("instance group tags lack identity"));
        };
        let owned = self.addresses(environment, Some(name)).await?;
        let covered: BTreeSet<&str> = owned.iter().filter_map(Address::instance_id).collect();
        let mut spare: Vec<String> = owned
            .iter()
            .filter(|a| a.association_id().is_none())
            .filter_map(|a| a.allocation_id().map(str::to_string))
            .collect();

        for id in ids.iter().filter(|id| !covered.contains(id.as_str())) {
            let allocation_id = match spare.pop() {
                Some(allocation_id) => allocation_id,
                None => {
                    let output = self
                        .client
                        .allocate_address()
                        .domain(DomainType::Vpc)
                        .tag_specifications(copy_tags(ResourceType::ElasticIp, tags))
                        .send()
                        .await
                        .map_err(|e| from_sdk("AllocateAddress", &e))?;
                    output
                        .allocation_id()
                        .ok_or_else(|| missing("AllocateAddress", "allocation id"))?
                        .to_string()
                }
            };
            // Association fails until the instance is running.
            self.follow_up
                .settle("AssociateAddress", || async {
                    self.client
                        .associate_address()
                        .allocation_id(&allocation_id)
                        .instance_id(id)
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(|e| reference_not_visible(from_sdk("AssociateAddress", &e)))
                })
                .await?;
            debug!(instance = %id, %allocation_id, "Associated elastic address");
        }
        Ok(())
    }

    /// Releases the given addresses, disassociating them first.
    async fn release_addresses(&self, addresses: &[Address]) -> ProviderResult<()> {
        for address in addresses {
            if let Some(association_id) = address.association_id() {
                match self
                    .client
                    .disassociate_address()
                    .association_id(association_id)
                    .send()
                    .await
                    .map_err(|e| from_sdk("DisassociateAddress", &e))
                {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            if let Some(allocation_id) = address.allocation_id() {
                self.client
                    .release_address()
                    .allocation_id(allocation_id)
                    .send()
                    .await
                    .map_err(|e| from_sdk("ReleaseAddress", &e))?;
                debug!(%allocation_id, "Released elastic address");
            }
        }
        Ok(())
    }

    async fn set_source_dest_check(&self, instance_id: &str, enabled: bool) -> ProviderResult<()> {
        self.client
            .modify_instance_attribute()
            .instance_id(instance_id)
            .source_dest_check(AttributeBooleanValue::builder().value(enabled).build())
            .send()
            .await
            .map_err(|e| reference_not_visible(from_sdk("ModifyInstanceAttribute", &e)))?;
        Ok(())
    }

    async fn terminate(&self, ids: Vec<String>) -> ProviderResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .terminate_instances()
            .set_instance_ids(Some(ids))
            .send()
            .await
            .map_err(|e| from_sdk("TerminateInstances", &e))?;
        Ok(())
    }

    /// Waits until every instance in `ids` has terminated; dependent
    /// subnets and security groups cannot be deleted before that.
    async fn wait_terminated(&self, ids: &[String]) -> ProviderResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        for _ in 0..TERMINATE_POLLS {
            let output = self
                .client
                .describe_instances()
                .set_instance_ids(Some(ids.to_vec()))
                .send()
                .await
                .map_err(|e| from_sdk("DescribeInstances", &e))?;
            let mut instances = output.reservations().iter().flat_map(|r| r.instances());
            if instances.all(is_terminated) {
                return Ok(());
            }
            tokio::time::sleep(TERMINATE_POLL_INTERVAL).await;
        }
        Err(ProviderError::ConcurrentModification {
            message: format!("{} instances are still shutting down", ids.len()),
        })
    }
}

fn split_group(group_id: &str) -> ProviderResult<(&str, &str)> {
    split_group_id(group_id).ok_or_else(|| ProviderError::invalid(format!("malformed instance group id {group_id}")))
}

fn is_terminated(instance: &Instance) -> bool {
    instance
        .state()
        .and_then(|s| s.name())
        .is_some_and(|name| name.as_str() == "terminated")
}

/// Assigns members `start..start + count` to subnets round-robin and
/// returns the launch count per subnet, in first-use order.
fn spread(subnets: &[String], start: usize, count: usize) -> Vec<(String, i32)> {
    let mut counts: Vec<(String, i32)> = Vec::new();
    if subnets.is_empty() {
        return counts;
    }
    for index in start..start + count {
        let subnet = &subnets[index % subnets.len()];
        match counts.iter_mut().find(|(s, _)| s == subnet) {
            Some((_, n)) => *n += 1,
            None => counts.push((subnet.clone(), 1)),
        }
    }
    counts
}

fn block_devices(volumes: &[Volume]) -> Vec<BlockDeviceMapping> {
    volumes
        .iter()
        .map(|volume| {
            let ebs = EbsBlockDevice::builder()
                .volume_size(i32::try_from(volume.size_gb).unwrap_or(i32::MAX))
                .set_volume_type(volume.volume_type.as_deref().map(VolumeType::from))
                .delete_on_termination(volume.delete_on_termination)
                .build();
            BlockDeviceMapping::builder().device_name(&volume.device).ebs(ebs).build()
        })
        .collect()
}

fn tag(key: &str, value: &str) -> Tag {
    Tag::builder().key(key).value(value).build()
}

/// Launch tags: the node's tags plus the subnet placement record.
fn launch_tags(tags: &TagSet, subnets: &[String]) -> Vec<Tag> {
    tags.entries()
        .iter()
        .map(|(key, value)| tag(key, value))
        .chain([tag(SUBNETS_TAG, &subnets.join(","))])
        .collect()
}

/// Tags of a live member to copy onto new members and addresses, with
/// the placement record replaced.
fn member_tags(member: Option<&Instance>, subnets: &[String]) -> Vec<Tag> {
    member
        .map(|i| tag_map(i.tags()))
        .unwrap_or_default()
        .into_iter()
        .filter(|(k, _)| !k.starts_with("aws:") && k != SUBNETS_TAG)
        .map(|(k, v)| tag(&k, &v))
        .chain([tag(SUBNETS_TAG, &subnets.join(","))])
        .collect()
}

/// Remote ids of the group's references, subnets in logical-name order.
fn resolve(refs: &ResolvedRefs, spec: &InstanceGroupSpec) -> ProviderResult<(Vec<String>, Vec<String>, Option<String>)> {
    let lookup = |kind: ResourceKind, name: &str| {
        refs.get(kind, name)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::NotYetVisible {
                message: format!("{kind} {name} not resolved"),
            })
    };
    let subnets = spec
        .subnets
        .iter()
        .map(|name| lookup(ResourceKind::Subnet, name))
        .collect::<ProviderResult<Vec<_>>>()?;
    let security_groups = spec
        .security_groups
        .iter()
        .map(|name| lookup(ResourceKind::SecurityGroup, name))
        .collect::<ProviderResult<Vec<_>>>()?;
    let key_name = spec
        .key_pair
        .as_deref()
        .map(|name| lookup(ResourceKind::KeyPair, name))
        .transpose()?;
    Ok((subnets, security_groups, key_name))
}

/// Builds the reported spec of a group from its members.
///
/// `addressed` holds the instances that have one of the environment's
/// elastic addresses; the group reports `eip` when all members do.
fn describe_group(
    members: &[&Instance],
    addressed: &BTreeSet<String>,
    termination_protection: bool,
) -> Option<InstanceGroupSpec> {
    let first = members.first()?;
    let tags = tag_map(first.tags());
    let subnets = match tags.get(SUBNETS_TAG) {
        Some(recorded) => recorded.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect(),
        None => members.iter().filter_map(|i| i.subnet_id().map(str::to_string)).collect(),
    };
    Some(InstanceGroupSpec {
        ami: first.image_id().unwrap_or_default().to_string(),
        instance_type: first.instance_type().map(|t| t.as_str().to_string()).unwrap_or_default(),
        count: u32::try_from(members.len()).unwrap_or(u32::MAX),
        subnets,
        security_groups: first
            .security_groups()
            .iter()
            .filter_map(|g| g.group_id().map(str::to_string))
            .collect(),
        key_pair: first.key_name().map(str::to_string),
        user_data: None,
        instance_profile: first
            .iam_instance_profile()
            .and_then(|p| p.arn())
            .and_then(|arn| arn.rsplit('/').next())
            .map(str::to_string),
        source_dest_check: first.source_dest_check().unwrap_or(true),
        eip: members
            .iter()
            .all(|i| i.instance_id().is_some_and(|id| addressed.contains(id))),
        termination_protection,
        private_ip_address: match members {
            [only] => only.private_ip_address().map(str::to_string),
            _ => None,
        },
        volumes: Vec::new(),
    })
}

#[async_trait]
impl ResourceProvider for InstanceGroupProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::InstanceGroup
    }

    /// One slot is kept for the subnet placement tag.
    fn tag_limit(&self) -> Option<usize> {
        Some(EC2_TAG_LIMIT - 1)
    }

    async fn list(&self, owner: &OwnerTag) -> ProviderResult<Vec<RemoteResource>> {
        let mut pages = self
            .client
            .describe_instances()
            .filters(owner_filter(owner))
            .filters(filter("instance-state-name", MEMBER_STATES))
            .into_paginator()
            .send();

        let mut instances = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| from_sdk("DescribeInstances", &e))?;
            instances.extend(page.reservations().iter().flat_map(|r| r.instances()).cloned());
        }
        instances.sort_by_key(|i| (i.launch_time().map(|t| t.secs()), i.instance_id().map(str::to_string)));

        let mut groups: BTreeMap<String, Vec<&Instance>> = BTreeMap::new();
        for instance in &instances {
            if let Some(id) = instance_group_id(&tag_map(instance.tags())) {
                groups.entry(id).or_default().push(instance);
            }
        }

        let addressed: BTreeSet<String> = self
            .addresses(&owner.value, None)
            .await?
            .iter()
            .filter_map(|a| a.instance_id().map(str::to_string))
            .collect();

        let mut listed = Vec::new();
        for (group_id, members) in groups {
            let protected = match members.first().and_then(|i| i.instance_id()) {
                Some(id) => self.termination_protected(id).await?,
                None => false,
            };
            let Some(spec) = describe_group(&members, &addressed, protected) else {
                continue;
            };
            listed.push(RemoteResource {
                remote_id: group_id,
                tags: members.first().map(|i| tag_map(i.tags())).unwrap_or_default(),
                spec: ResourceSpec::InstanceGroup(spec),
            });
        }
        Ok(listed)
    }

    async fn create(&self, request: &CreateRequest) -> ProviderResult<CreatedResource> {
        let ResourceSpec::InstanceGroup(spec) = &request.spec else {
            return Err(wrong_spec(self.kind()));
        };
        let tags = request.tags.to_map();
        let group_id = instance_group_id(&tags)
            .ok_or_else(|| ProviderError::invalid(format!("{} lacks identity tags", request.key)))?;

        let existing = self.group_members(&group_id).await?;
        ensure_absent(&request.name, existing.first().and_then(|i| i.instance_id()))?;

        let (subnets, security_groups, key_name) = resolve(&request.refs, spec)?;
        let launch = Launch {
            spec,
            tags: launch_tags(&request.tags, &subnets),
            subnets,
            security_groups,
            key_name,
        };
        let count = usize::try_from(spec.count).unwrap_or(usize::MAX);
        let launched = self.launch(&launch, 0, count).await?;
        info!(instance_group = %request.key.name, count = launched.len(), "Launched instance group");

        Ok(CreatedResource {
            remote_id: group_id,
            tags,
        })
    }

    async fn update(&self, request: &UpdateRequest) -> ProviderResult<()> {
        let (ResourceSpec::InstanceGroup(current), ResourceSpec::InstanceGroup(spec)) =
            (&request.current, &request.desired)
        else {
            return Err(wrong_spec(self.kind()));
        };
        let members = self.group_members(&request.remote_id).await?;
        let (subnets, security_groups, key_name) = resolve(&request.refs, spec)?;
        let ids: Vec<String> = members.iter().filter_map(|i| i.instance_id().map(str::to_string)).collect();

        for field in &request.changed {
            match field.as_str() {
                "count" => {
                    let desired = usize::try_from(spec.count).unwrap_or(usize::MAX);
                    if desired > ids.len() {
                        let launch = Launch {
                            spec,
                            subnets: subnets.clone(),
                            security_groups: security_groups.clone(),
                            key_name: key_name.clone(),
                            tags: member_tags(members.first(), &subnets),
                        };
                        self.launch(&launch, ids.len(), desired - ids.len()).await?;
                    } else {
                        // Newest members go first.
                        let excess = ids[desired..].to_vec();
                        info!(group = %request.remote_id, count = excess.len(), "Scaling in");
                        if current.termination_protection || spec.termination_protection {
                            self.unprotect(&excess).await?;
                        }
                        let addresses = self.group_addresses(&request.remote_id).await?;
                        let released: Vec<Address> = addresses
                            .into_iter()
                            .filter(|a| a.instance_id().is_some_and(|id| excess.iter().any(|e| e == id)))
                            .collect();
                        self.release_addresses(&released).await?;
                        self.terminate(excess).await?;
                    }
                }
                "security_groups" => {
                    for id in &ids {
                        self.client
                            .modify_instance_attribute()
                            .instance_id(id)
                            .set_groups(Some(security_groups.clone()))
                            .send()
                            .await
                            .map_err(|e| reference_not_visible(from_sdk("ModifyInstanceAttribute", &e)))?;
                    }
                }
                "source_dest_check" => {
                    for id in &ids {
                        self.set_source_dest_check(id, spec.source_dest_check).await?;
                    }
                }
                "termination_protection" => {
                    for id in &ids {
                        self.set_termination_protection(id, spec.termination_protection).await?;
                    }
                }
                "eip" if spec.eip => {
                    self.attach_addresses(&ids, &member_tags(members.first(), &subnets))
                        .await?;
                }
                "eip" => {
                    let addresses = self.group_addresses(&request.remote_id).await?;
                    self.release_addresses(&addresses).await?;
                }
                other => {
                    return Err(ProviderError::invalid(format!(
                        "instance group attribute {other} cannot change in place"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, request: &DeleteRequest) -> ProviderResult<()> {
        let members = self.group_members(&request.remote_id).await?;
        let ids: Vec<String> = members.iter().filter_map(|i| i.instance_id().map(str::to_string)).collect();
        if let ResourceSpec::InstanceGroup(current) = &request.current
            && current.termination_protection
        {
            self.unprotect(&ids).await?;
        }
        self.terminate(ids.clone()).await?;
        self.wait_terminated(&ids).await?;
        let addresses = self.group_addresses(&request.remote_id).await?;
        self.release_addresses(&addresses).await?;
        let count = ids.len();
        info!(group = %request.remote_id, count, "Terminated instance group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ec2::types::{GroupIdentifier, IamInstanceProfile};
    use std::collections::BTreeSet;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_spread_round_robin() {
        let subnets = ids(&["subnet-a", "subnet-b"]);
        assert_eq!(
            spread(&subnets, 0, 3),
            vec![("subnet-a".to_string(), 2), ("subnet-b".to_string(), 1)]
        );
        // Scaling 3 -> 4 continues where the first launch stopped.
        assert_eq!(spread(&subnets, 3, 1), vec![("subnet-b".to_string(), 1)]);
        assert!(spread(&[], 0, 2).is_empty());
    }

    #[test]
    fn test_describe_group_uses_recorded_subnets() {
        let tags = [
            (OWNER_TAG, "staging"),
            (LOGICAL_NAME_TAG, "nat"),
            (SUBNETS_TAG, "subnet-a,subnet-b"),
        ];
        let mut builder = Instance::builder()
            .instance_id("i-1")
            .image_id("ami-1")
            .instance_type(InstanceType::T3Micro)
            .subnet_id("subnet-a")
            .source_dest_check(false)
            .security_groups(GroupIdentifier::builder().group_id("sg-1").build())
            .iam_instance_profile(
                IamInstanceProfile::builder()
                    .arn("arn:aws:iam::123:instance-profile/nat-role")
                    .build(),
            );
        for (key, value) in tags {
            builder = builder.tags(Tag::builder().key(key).value(value).build());
        }
        let instance = builder.build();

        let addressed = BTreeSet::from(["i-1".to_string()]);
        let spec = describe_group(&[&instance], &addressed, true).unwrap();
        assert_eq!(spec.count, 1);
        assert_eq!(spec.instance_type, "t3.micro");
        assert_eq!(spec.subnets, BTreeSet::from(["subnet-a".to_string(), "subnet-b".to_string()]));
        assert_eq!(spec.instance_profile.as_deref(), Some("nat-role"));
        assert!(!spec.source_dest_check);
        assert!(spec.eip);
        assert!(spec.termination_protection);
        assert!(describe_group(&[], &addressed, false).is_none());
    }

    #[test]
    fn test_launch_tags_append_placement() {
        let naming = crate::naming::Naming::new("staging", &BTreeMap::new());
        let key = crate::graph::NodeKey::new(ResourceKind::InstanceGroup, "web");
        let tags = launch_tags(&naming.tags_for(&key), &ids(&["subnet-a", "subnet-b"]));
        let last = tags.last().unwrap();
        assert_eq!(last.key(), Some(SUBNETS_TAG));
        assert_eq!(last.value(), Some("subnet-a,subnet-b"));
    }

    #[test]
    fn test_member_tags_replace_placement() {
        let instance = Instance::builder()
            .tags(tag(OWNER_TAG, "staging"))
            .tags(tag("aws:cloudformation:stack-name", "x"))
            .tags(tag(SUBNETS_TAG, "subnet-old"))
            .build();
        let tags = tag_map(&member_tags(Some(&instance), &ids(&["subnet-a"])));
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[OWNER_TAG], "staging");
        assert_eq!(tags[SUBNETS_TAG], "subnet-a");
    }

    #[test]
    fn test_block_devices() {
        let volumes = [Volume {
            device: String::from("/dev/xvdf"),
            size_gb: 100,
            volume_type: Some(String::from("gp3")),
            delete_on_termination: false,
        }];
        let mappings = block_devices(&volumes);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].device_name(), Some("/dev/xvdf"));
        let ebs = mappings[0].ebs().unwrap();
        assert_eq!(ebs.volume_size(), Some(100));
        assert_eq!(ebs.volume_type(), Some(&VolumeType::Gp3));
        assert_eq!(ebs.delete_on_termination(), Some(false));
    }

    #[test]
    fn test_only_single_member_reports_address() {
        let member = |id: &str, ip: &str| Instance::builder().instance_id(id).private_ip_address(ip).build();
        let a = member("i-1", "10.0.0.10");
        let b = member("i-2", "10.0.0.11");
        let none = BTreeSet::new();
        let single = describe_group(&[&a], &none, false).unwrap();
        assert_eq!(single.private_ip_address.as_deref(), Some("10.0.0.10"));
        assert!(!single.eip);
        assert_eq!(describe_group(&[&a, &b], &none, false).unwrap().private_ip_address, None);
    }
}
