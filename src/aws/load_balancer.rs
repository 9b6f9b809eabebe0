//! Classic load balancer provider.
//!
//! Balancers are addressed by name, which is limited to 32 characters.
//! The registered instance group is recorded in a tag, and its running
//! members are registered on every create and update.

use async_trait::async_trait;
use aws_sdk_ec2::Client as Ec2Client;
use aws_sdk_elasticloadbalancing::Client;
use aws_sdk_elasticloadbalancing::types::{
    HealthCheck as ElbHealthCheck, Instance as ElbInstance, Listener as ElbListener, LoadBalancerDescription, Tag,
    TagKeyOnly,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::error::{ProviderError, ProviderResult};
use crate::graph::{HealthCheck, Listener, LoadBalancerSpec, ResourceKind, ResourceSpec};
use crate::naming::{LOGICAL_NAME_TAG, Naming, OWNER_TAG, OwnerTag};
use crate::provider::{
    CreateRequest, CreatedResource, DeleteRequest, RemoteResource, ResolvedRefs, ResourceProvider, UpdateRequest,
};

use super::error::{from_sdk, reference_not_visible};
use super::tags::{filter, split_group_id};
use super::{FollowUp, wrong_spec};

/// Classic load balancers accept at most 10 tags.
const ELB_TAG_LIMIT: usize = 10;

/// Classic load balancer names are at most 32 characters.
const ELB_NAME_LIMIT: usize = 32;

/// Names per DescribeTags call.
const DESCRIBE_TAGS_BATCH: usize = 20;

/// Tag recording the registered instance group id.
const INSTANCE_GROUP_TAG: &str = "vpcforge:instance-group";

/// Manages classic load balancers.
#[derive(Debug, Clone)]
pub struct LoadBalancerProvider {
    client: Client,
    ec2: Ec2Client,
    follow_up: FollowUp,
}

impl LoadBalancerProvider {
    pub const fn new(client: Client, ec2: Ec2Client, follow_up: FollowUp) -> Self {
        Self { client, ec2, follow_up }
    }

    /// Tags of the named balancers.
    async fn tags_of(&self, names: &[String]) -> ProviderResult<BTreeMap<String, BTreeMap<String, String>>> {
        let mut tags = BTreeMap::new();
        for batch in names.chunks(DESCRIBE_TAGS_BATCH) {
            let output = self
                .client
                .describe_tags()
                .set_load_balancer_names(Some(batch.to_vec()))
                .send()
                .await
                .map_err(|e| from_sdk("DescribeTags", &e))?;
            for description in output.tag_descriptions() {
                let Some(name) = description.load_balancer_name() else {
                    continue;
                };
                let map = description
                    .tags()
                    .iter()
                    .map(|t| (t.key().to_string(), t.value().unwrap_or_default().to_string()))
                    .collect();
                tags.insert(name.to_string(), map);
            }
        }
        Ok(tags)
    }

    async fn describe(&self, name: &str) -> ProviderResult<Option<LoadBalancerDescription>> {
        match self
            .client
            .describe_load_balancers()
            .load_balancer_names(name)
            .send()
            .await
            .map_err(|e| from_sdk("DescribeLoadBalancers", &e))
        {
            Ok(output) => Ok(output.load_balancer_descriptions().first().cloned()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Running members of an instance group.
    async fn group_instances(&self, group_id: &str) -> ProviderResult<BTreeSet<String>> {
        let (environment, name) = split_group_id(group_id)
            .ok_or_else(|| ProviderError::invalid(format!("malformed instance group id {group_id}")))?;
        let output = self
            .ec2
            .describe_instances()
            .filters(filter(&format!("tag:{OWNER_TAG}"), [environment]))
            .filters(filter(&format!("tag:{LOGICAL_NAME_TAG}"), [name]))
            .filters(filter("instance-state-name", ["pending", "running"]))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeInstances", &e))?;
        Ok(output
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .filter_map(|i| i.instance_id().map(str::to_string))
            .collect())
    }

    /// Registers exactly the members of `group_id` (or nothing).
    async fn sync_instances(&self, name: &str, group_id: Option<&str>) -> ProviderResult<()> {
        let registered: BTreeSet<String> = self
            .describe(name)
            .await?
            .map(|d| d.instances().iter().filter_map(|i| i.instance_id().map(str::to_string)).collect())
            .unwrap_or_default();
        let desired = match group_id {
            Some(group_id) => self.group_instances(group_id).await?,
            None => BTreeSet::new(),
        };

        let register: Vec<ElbInstance> = desired.difference(&registered).map(|id| elb_instance(id)).collect();
        let deregister: Vec<ElbInstance> = registered.difference(&desired).map(|id| elb_instance(id)).collect();
        if !register.is_empty() {
            self.client
                .register_instances_with_load_balancer()
                .load_balancer_name(name)
                .set_instances(Some(register))
                .send()
                .await
                .map_err(|e| reference_not_visible(from_sdk("RegisterInstancesWithLoadBalancer", &e)))?;
        }
        if !deregister.is_empty() {
            self.client
                .deregister_instances_from_load_balancer()
                .load_balancer_name(name)
                .set_instances(Some(deregister))
                .send()
                .await
                .map_err(|e| from_sdk("DeregisterInstancesFromLoadBalancer", &e))?;
        }
        debug!(load_balancer = %name, members = desired.len(), "Instance registration in sync");
        Ok(())
    }

    async fn configure_health_check(&self, name: &str, check: &HealthCheck) -> ProviderResult<()> {
        self.client
            .configure_health_check()
            .load_balancer_name(name)
            .health_check(to_health_check(check)?)
            .send()
            .await
            .map_err(|e| reference_not_visible(from_sdk("ConfigureHealthCheck", &e)))?;
        Ok(())
    }
}

fn elb_instance(id: &str) -> ElbInstance {
    ElbInstance::builder().instance_id(id).build()
}

fn build_error(error: impl std::fmt::Display) -> ProviderError {
    ProviderError::invalid(error.to_string())
}

fn to_listener(listener: &Listener) -> ProviderResult<ElbListener> {
    ElbListener::builder()
        .protocol(&listener.protocol)
        .load_balancer_port(i32::from(listener.port))
        .instance_protocol(&listener.protocol)
        .instance_port(i32::from(listener.instance_port))
        .build()
        .map_err(build_error)
}

fn to_health_check(check: &HealthCheck) -> ProviderResult<ElbHealthCheck> {
    let seconds = |v: u32| i32::try_from(v).map_err(build_error);
    ElbHealthCheck::builder()
        .target(&check.target)
        .interval(seconds(check.interval)?)
        .timeout(seconds(check.timeout)?)
        .healthy_threshold(seconds(check.healthy_threshold)?)
        .unhealthy_threshold(seconds(check.unhealthy_threshold)?)
        .build()
        .map_err(build_error)
}

/// Builds the reported spec of a balancer.
fn describe_spec(description: &LoadBalancerDescription, tags: &BTreeMap<String, String>) -> LoadBalancerSpec {
    let port = |p: i32| u16::try_from(p).unwrap_or_default();
    let count = |v: i32| u32::try_from(v).unwrap_or_default();
    let listeners = description
        .listener_descriptions()
        .iter()
        .filter_map(|d| d.listener())
        .map(|l| Listener {
            port: port(l.load_balancer_port()),
            instance_port: port(l.instance_port()),
            protocol: l.protocol().to_ascii_uppercase(),
        })
        .collect();
    let health_check = description.health_check().map_or_else(
        || HealthCheck {
            target: String::new(),
            interval: 0,
            timeout: 0,
            healthy_threshold: 0,
            unhealthy_threshold: 0,
        },
        |h| HealthCheck {
            target: h.target().to_string(),
            interval: count(h.interval()),
            timeout: count(h.timeout()),
            healthy_threshold: count(h.healthy_threshold()),
            unhealthy_threshold: count(h.unhealthy_threshold()),
        },
    );

    LoadBalancerSpec {
        instance_group: tags.get(INSTANCE_GROUP_TAG).cloned(),
        internal: description.scheme() == Some("internal"),
        subnets: description.subnets().iter().cloned().collect(),
        security_groups: description.security_groups().iter().cloned().collect(),
        listeners,
        health_check,
    }
}

fn remote_spec(refs: &ResolvedRefs, spec: &ResourceSpec) -> ProviderResult<LoadBalancerSpec> {
    match refs.to_remote(spec) {
        ResourceSpec::LoadBalancer(spec) => Ok(spec),
        _ => Err(wrong_spec(ResourceKind::LoadBalancer)),
    }
}

#[async_trait]
impl ResourceProvider for LoadBalancerProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::LoadBalancer
    }

    /// One slot is kept for the instance group tag.
    fn tag_limit(&self) -> Option<usize> {
        Some(ELB_TAG_LIMIT - 1)
    }

    async fn list(&self, owner: &OwnerTag) -> ProviderResult<Vec<RemoteResource>> {
        let mut pages = self.client.describe_load_balancers().into_paginator().send();
        let mut descriptions = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| from_sdk("DescribeLoadBalancers", &e))?;
            descriptions.extend(page.load_balancer_descriptions().iter().cloned());
        }

        let names: Vec<String> = descriptions
            .iter()
            .filter_map(|d| d.load_balancer_name().map(str::to_string))
            .collect();
        let mut tags = self.tags_of(&names).await?;

        Ok(descriptions
            .iter()
            .filter_map(|description| {
                let name = description.load_balancer_name()?;
                let tags = tags.remove(name)?;
                if !owner.matches(&tags) {
                    return None;
                }
                Some(RemoteResource {
                    remote_id: name.to_string(),
                    spec: ResourceSpec::LoadBalancer(describe_spec(description, &tags)),
                    tags,
                })
            })
            .collect())
    }

    async fn create(&self, request: &CreateRequest) -> ProviderResult<CreatedResource> {
        let spec = remote_spec(&request.refs, &request.spec)?;
        let environment = request
            .tags
            .get(OWNER_TAG)
            .ok_or_else(|| ProviderError::invalid(format!("{} lacks an ownership tag", request.key)))?;
        let name = Naming::new(environment, &BTreeMap::new()).short_name(&request.key, ELB_NAME_LIMIT);

        if self.describe(&name).await?.is_some() {
            let owned = self
                .tags_of(std::slice::from_ref(&name))
                .await?
                .get(&name)
                .is_some_and(|tags| tags.get(OWNER_TAG).map(String::as_str) == Some(environment));
            return Err(if owned {
                ProviderError::AlreadyExists {
                    message: format!("load balancer {name} already exists"),
                }
            } else {
                ProviderError::invalid(format!("load balancer name {name} is taken by another owner"))
            });
        }

        let mut tags: Vec<Tag> = request
            .tags
            .entries()
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build().map_err(build_error))
            .collect::<ProviderResult<_>>()?;
        if let Some(group) = &spec.instance_group {
            tags.push(Tag::builder().key(INSTANCE_GROUP_TAG).value(group).build().map_err(build_error)?);
        }
        let listeners = spec.listeners.iter().map(to_listener).collect::<ProviderResult<Vec<_>>>()?;

        self.client
            .create_load_balancer()
            .load_balancer_name(&name)
            .set_listeners(Some(listeners))
            .set_subnets(Some(spec.subnets.iter().cloned().collect()))
            .set_security_groups(Some(spec.security_groups.iter().cloned().collect()))
            .set_scheme(spec.internal.then(|| String::from("internal")))
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|e| reference_not_visible(from_sdk("CreateLoadBalancer", &e)))?;
        info!(load_balancer = %name, "Created load balancer");

        self.follow_up
            .settle("ConfigureHealthCheck", || self.configure_health_check(&name, &spec.health_check))
            .await?;
        self.follow_up
            .settle("RegisterInstancesWithLoadBalancer", || {
                self.sync_instances(&name, spec.instance_group.as_deref())
            })
            .await?;

        let mut created_tags = request.tags.to_map();
        if let Some(group) = &spec.instance_group {
            created_tags.insert(INSTANCE_GROUP_TAG.to_string(), group.clone());
        }
        Ok(CreatedResource {
            remote_id: name,
            tags: created_tags,
        })
    }

    async fn update(&self, request: &UpdateRequest) -> ProviderResult<()> {
        let current = remote_spec(&request.refs, &request.current)?;
        let desired = remote_spec(&request.refs, &request.desired)?;
        let name = request.remote_id.as_str();

        for field in &request.changed {
            match field.as_str() {
                "instance_group" => match &desired.instance_group {
                    Some(group) => {
                        self.client
                            .add_tags()
                            .load_balancer_names(name)
                            .tags(Tag::builder().key(INSTANCE_GROUP_TAG).value(group).build().map_err(build_error)?)
                            .send()
                            .await
                            .map_err(|e| from_sdk("AddTags", &e))?;
                    }
                    None => {
                        self.client
                            .remove_tags()
                            .load_balancer_names(name)
                            .tags(TagKeyOnly::builder().key(INSTANCE_GROUP_TAG).build())
                            .send()
                            .await
                            .map_err(|e| from_sdk("RemoveTags", &e))?;
                    }
                },
                "subnets" => {
                    let attach: Vec<String> = desired.subnets.difference(&current.subnets).cloned().collect();
                    let detach: Vec<String> = current.subnets.difference(&desired.subnets).cloned().collect();
                    if !attach.is_empty() {
                        self.client
                            .attach_load_balancer_to_subnets()
                            .load_balancer_name(name)
                            .set_subnets(Some(attach))
                            .send()
                            .await
                            .map_err(|e| reference_not_visible(from_sdk("AttachLoadBalancerToSubnets", &e)))?;
                    }
                    if !detach.is_empty() {
                        self.client
                            .detach_load_balancer_from_subnets()
                            .load_balancer_name(name)
                            .set_subnets(Some(detach))
                            .send()
                            .await
                            .map_err(|e| from_sdk("DetachLoadBalancerFromSubnets", &e))?;
                    }
                }
                "security_groups" => {
                    self.client
                        .apply_security_groups_to_load_balancer()
                        .load_balancer_name(name)
                        .set_security_groups(Some(desired.security_groups.iter().cloned().collect()))
                        .send()
                        .await
                        .map_err(|e| reference_not_visible(from_sdk("ApplySecurityGroupsToLoadBalancer", &e)))?;
                }
                "listeners" => {
                    let removed: Vec<i32> = current
                        .listeners
                        .difference(&desired.listeners)
                        .map(|l| i32::from(l.port))
                        .collect();
                    let added = desired
                        .listeners
                        .difference(&current.listeners)
                        .map(to_listener)
                        .collect::<ProviderResult<Vec<_>>>()?;
                    if !removed.is_empty() {
                        self.client
                            .delete_load_balancer_listeners()
                            .load_balancer_name(name)
                            .set_load_balancer_ports(Some(removed))
                            .send()
                            .await
                            .map_err(|e| from_sdk("DeleteLoadBalancerListeners", &e))?;
                    }
                    if !added.is_empty() {
                        self.client
                            .create_load_balancer_listeners()
                            .load_balancer_name(name)
                            .set_listeners(Some(added))
                            .send()
                            .await
                            .map_err(|e| from_sdk("CreateLoadBalancerListeners", &e))?;
                    }
                }
                "health_check" => self.configure_health_check(name, &desired.health_check).await?,
                other => {
                    return Err(ProviderError::invalid(format!(
                        "load balancer attribute {other} cannot change in place"
                    )));
                }
            }
        }

        self.sync_instances(name, desired.instance_group.as_deref()).await
    }

    async fn delete(&self, request: &DeleteRequest) -> ProviderResult<()> {
        self.client
            .delete_load_balancer()
            .load_balancer_name(&request.remote_id)
            .send()
            .await
            .map_err(|e| from_sdk("DeleteLoadBalancer", &e))?;
        info!(load_balancer = %request.remote_id, "Deleted load balancer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_elasticloadbalancing::types::ListenerDescription;

    #[test]
    fn test_describe_spec() {
        let description = LoadBalancerDescription::builder()
            .load_balancer_name("staging--web")
            .scheme("internal")
            .subnets("subnet-b")
            .subnets("subnet-a")
            .security_groups("sg-1")
            .listener_descriptions(
                ListenerDescription::builder()
                    .listener(
                        ElbListener::builder()
                            .protocol("http")
                            .load_balancer_port(80)
                            .instance_port(8080)
                            .build()
                            .unwrap(),
                    )
                    .build(),
            )
            .health_check(
                ElbHealthCheck::builder()
                    .target("HTTP:8080/health")
                    .interval(30)
                    .timeout(5)
                    .healthy_threshold(3)
                    .unhealthy_threshold(5)
                    .build()
                    .unwrap(),
            )
            .build();
        let tags = BTreeMap::from([(INSTANCE_GROUP_TAG.to_string(), "staging/web".to_string())]);

        let spec = describe_spec(&description, &tags);
        assert!(spec.internal);
        assert_eq!(spec.instance_group.as_deref(), Some("staging/web"));
        assert_eq!(spec.subnets.iter().next().map(String::as_str), Some("subnet-a"));
        assert_eq!(
            spec.listeners.into_iter().collect::<Vec<_>>(),
            vec![Listener {
                port: 80,
                instance_port: 8080,
                protocol: "HTTP".into(),
            }]
        );
        assert_eq!(spec.health_check.target, "HTTP:8080/health");
        assert_eq!(spec.health_check.unhealthy_threshold, 5);
    }

    #[test]
    fn test_listener_and_health_check_conversion() {
        let listener = to_listener(&Listener {
            port: 443,
            instance_port: 8443,
            protocol: "TCP".into(),
        })
        .unwrap();
        assert_eq!(listener.load_balancer_port(), 443);
        assert_eq!(listener.instance_protocol(), Some("TCP"));

        let check = to_health_check(&HealthCheck {
            target: "TCP:8443".into(),
            interval: 10,
            timeout: 5,
            healthy_threshold: 2,
            unhealthy_threshold: 2,
        })
        .unwrap();
        assert_eq!(check.interval(), 10);
    }

    #[test]
    fn test_names_fit_limit() {
        let naming = Naming::new("staging-with-a-long-environment-name", &BTreeMap::new());
        let key = crate::graph::NodeKey::new(ResourceKind::LoadBalancer, "public-web");
        let name = naming.short_name(&key, ELB_NAME_LIMIT);
        assert!(name.len() <= ELB_NAME_LIMIT);
        assert_eq!(name, naming.short_name(&key, ELB_NAME_LIMIT));
    }
}
