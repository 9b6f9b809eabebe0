//! Network (VPC plus its gateways) and DHCP option set providers.

use async_trait::async_trait;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::types::{
    AttachmentStatus, AttributeBooleanValue, NewDhcpConfiguration, ResourceType, Tag, Tenancy, VpcAttributeName,
};
use tracing::{debug, info};

use crate::error::{ProviderError, ProviderResult};
use crate::graph::{DhcpOptionsSpec, NetworkSpec, ResourceKind, ResourceSpec};
use crate::naming::OwnerTag;
use crate::provider::{CreateRequest, CreatedResource, DeleteRequest, RemoteResource, ResourceProvider, UpdateRequest};

use super::error::{from_sdk, reference_not_visible};
use super::tags::{EC2_TAG_LIMIT, copy_tags, filter, identity_filters_of, owner_filter, sdk_tags, tag_map, tag_spec};
use super::{FollowUp, ensure_absent, identity_filters, missing, no_network, wrong_spec};

/// Network attributes that can change without replacing the VPC.
const MUTABLE_FIELDS: [&str; 3] = ["enable_dns", "internet_gateway", "vpn_gateway"];

/// Manages the VPC, its internet gateway and its virtual private gateway
/// attachment as one node.
#[derive(Debug, Clone)]
pub struct NetworkProvider {
    client: Client,
    follow_up: FollowUp,
}

impl NetworkProvider {
    pub const fn new(client: Client, follow_up: FollowUp) -> Self {
        Self { client, follow_up }
    }

    async fn dns_enabled(&self, vpc_id: &str) -> ProviderResult<bool> {
        let mut enabled = true;
        for attribute in [VpcAttributeName::EnableDnsSupport, VpcAttributeName::EnableDnsHostnames] {
            let output = self
                .client
                .describe_vpc_attribute()
                .vpc_id(vpc_id)
                .attribute(attribute.clone())
                .send()
                .await
                .map_err(|e| from_sdk("DescribeVpcAttribute", &e))?;
            let value = match attribute {
                VpcAttributeName::EnableDnsSupport => output.enable_dns_support().and_then(AttributeBooleanValue::value),
                _ => output.enable_dns_hostnames().and_then(AttributeBooleanValue::value),
            };
            enabled &= value.unwrap_or(false);
        }
        Ok(enabled)
    }

    /// DNS support must be on before hostnames can be, and hostnames off
    /// before support can be turned off.
    async fn set_dns(&self, vpc_id: &str, enabled: bool) -> ProviderResult<()> {
        let value = || AttributeBooleanValue::builder().value(enabled).build();
        let support = self.client.modify_vpc_attribute().vpc_id(vpc_id).enable_dns_support(value());
        let hostnames = self.client.modify_vpc_attribute().vpc_id(vpc_id).enable_dns_hostnames(value());
        let (first, second) = if enabled { (support, hostnames) } else { (hostnames, support) };
        first.send().await.map_err(|e| from_sdk("ModifyVpcAttribute", &e))?;
        second.send().await.map_err(|e| from_sdk("ModifyVpcAttribute", &e))?;
        Ok(())
    }

    async fn attached_gateways(&self, vpc_id: &str) -> ProviderResult<Vec<String>> {
        let output = self
            .client
            .describe_internet_gateways()
            .filters(filter("attachment.vpc-id", [vpc_id]))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeInternetGateways", &e))?;
        Ok(output
            .internet_gateways()
            .iter()
            .filter_map(|g| g.internet_gateway_id().map(str::to_string))
            .collect())
    }

    /// The virtual private gateway attached to a VPC, if any.
    async fn attached_vpn_gateway(&self, vpc_id: &str) -> ProviderResult<Option<String>> {
        let output = self
            .client
            .describe_vpn_gateways()
            .filters(filter("attachment.vpc-id", [vpc_id]))
            .filters(filter("attachment.state", ["attaching", "attached"]))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeVpnGateways", &e))?;
        Ok(output
            .vpn_gateways()
            .iter()
            .find_map(|g| g.vpn_gateway_id().map(str::to_string)))
    }

    async fn vpc_tags(&self, vpc_id: &str) -> ProviderResult<Vec<Tag>> {
        let output = self
            .client
            .describe_vpcs()
            .vpc_ids(vpc_id)
            .send()
            .await
            .map_err(|e| from_sdk("DescribeVpcs", &e))?;
        output
            .vpcs()
            .first()
            .map(|vpc| vpc.tags().to_vec())
            .ok_or_else(|| ProviderError::not_found(format!("VPC {vpc_id}")))
    }

    /// Attaches an internet gateway unless one already is.
    ///
    /// A detached gateway carrying the VPC's identity tags was left by an
    /// earlier attempt and is attached instead of making another.
    async fn ensure_internet_gateway(&self, vpc_id: &str, tags: &[Tag]) -> ProviderResult<()> {
        if !self.attached_gateways(vpc_id).await?.is_empty() {
            return Ok(());
        }

        let identity = identity_filters_of(tags);
        let mut leftover = None;
        if !identity.is_empty() {
            let output = self
                .client
                .describe_internet_gateways()
                .set_filters(Some(identity))
                .send()
                .await
                .map_err(|e| from_sdk("DescribeInternetGateways", &e))?;
            leftover = output
                .internet_gateways()
                .iter()
                .filter(|g| {
                    g.attachments()
                        .iter()
                        .all(|a| a.state() == Some(&AttachmentStatus::Detached))
                })
                .find_map(|g| g.internet_gateway_id().map(str::to_string));
        }

        let gateway_id = match leftover {
            Some(id) => {
                debug!(%vpc_id, gateway_id = %id, "Reusing detached internet gateway");
                id
            }
            None => {
                let output = self
                    .client
                    .create_internet_gateway()
                    .tag_specifications(copy_tags(ResourceType::InternetGateway, tags))
                    .send()
                    .await
                    .map_err(|e| from_sdk("CreateInternetGateway", &e))?;
                output
                    .internet_gateway()
                    .and_then(|g| g.internet_gateway_id())
                    .ok_or_else(|| missing("CreateInternetGateway", "gateway id"))?
                    .to_string()
            }
        };

        self.follow_up
            .settle("AttachInternetGateway", || async {
                self.client
                    .attach_internet_gateway()
                    .internet_gateway_id(&gateway_id)
                    .vpc_id(vpc_id)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| reference_not_visible(from_sdk("AttachInternetGateway", &e)))
            })
            .await?;
        info!(%vpc_id, %gateway_id, "Attached internet gateway");
        Ok(())
    }

    async fn remove_internet_gateways(&self, vpc_id: &str) -> ProviderResult<()> {
        for gateway_id in self.attached_gateways(vpc_id).await? {
            self.client
                .detach_internet_gateway()
                .internet_gateway_id(&gateway_id)
                .vpc_id(vpc_id)
                .send()
                .await
                .map_err(|e| from_sdk("DetachInternetGateway", &e))?;
            self.client
                .delete_internet_gateway()
                .internet_gateway_id(&gateway_id)
                .send()
                .await
                .map_err(|e| from_sdk("DeleteInternetGateway", &e))?;
            debug!(%vpc_id, %gateway_id, "Deleted internet gateway");
        }
        Ok(())
    }

    /// Attaches `desired` and detaches any other virtual private gateway.
    /// The gateways themselves are never created or deleted here.
    async fn converge_vpn_gateway(&self, vpc_id: &str, desired: Option<&str>) -> ProviderResult<()> {
        let attached = self.attached_vpn_gateway(vpc_id).await?;
        if attached.as_deref() == desired {
            return Ok(());
        }

        if let Some(old) = &attached {
            let detached = self
                .client
                .detach_vpn_gateway()
                .vpn_gateway_id(old)
                .vpc_id(vpc_id)
                .send()
                .await
                .map_err(|e| from_sdk("DetachVpnGateway", &e));
            match detached {
                Ok(_) => debug!(%vpc_id, vpn_gateway = %old, "Detached VPN gateway"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(new) = desired {
            self.follow_up
                .settle("AttachVpnGateway", || async {
                    self.client
                        .attach_vpn_gateway()
                        .vpn_gateway_id(new)
                        .vpc_id(vpc_id)
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(|e| reference_not_visible(from_sdk("AttachVpnGateway", &e)))
                })
                .await?;
            info!(%vpc_id, vpn_gateway = %new, "Attached VPN gateway");
        }
        Ok(())
    }

    /// Applies everything beyond the VPC itself. Each step checks the
    /// current state first, so a create that stopped halfway is finished
    /// by running it again.
    async fn finish(&self, vpc_id: &str, spec: &NetworkSpec, tags: &[Tag]) -> ProviderResult<()> {
        self.follow_up
            .settle("ModifyVpcAttribute", || self.set_dns(vpc_id, spec.enable_dns))
            .await?;
        if spec.internet_gateway {
            self.ensure_internet_gateway(vpc_id, tags).await?;
        }
        self.converge_vpn_gateway(vpc_id, spec.vpn_gateway.as_deref()).await
    }
}

#[async_trait]
impl ResourceProvider for NetworkProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    fn tag_limit(&self) -> Option<usize> {
        Some(EC2_TAG_LIMIT)
    }

    async fn list(&self, owner: &OwnerTag) -> ProviderResult<Vec<RemoteResource>> {
        let output = self
            .client
            .describe_vpcs()
            .filters(owner_filter(owner))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeVpcs", &e))?;

        let mut listed = Vec::new();
        for vpc in output.vpcs() {
            let Some(id) = vpc.vpc_id() else {
                continue;
            };
            listed.push(RemoteResource {
                remote_id: id.to_string(),
                tags: tag_map(vpc.tags()),
                spec: ResourceSpec::Network(NetworkSpec {
                    cidr: vpc.cidr_block().unwrap_or_default().to_string(),
                    tenancy: vpc.instance_tenancy().map_or("default", Tenancy::as_str).to_string(),
                    enable_dns: self.dns_enabled(id).await?,
                    internet_gateway: !self.attached_gateways(id).await?.is_empty(),
                    vpn_gateway: self.attached_vpn_gateway(id).await?,
                }),
            });
        }
        Ok(listed)
    }

    async fn create(&self, request: &CreateRequest) -> ProviderResult<CreatedResource> {
        let ResourceSpec::Network(spec) = &request.spec else {
            return Err(wrong_spec(self.kind()));
        };

        let existing = self
            .client
            .describe_vpcs()
            .set_filters(Some(identity_filters(&request.tags)))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeVpcs", &e))?;
        ensure_absent(&request.name, existing.vpcs().first().and_then(|v| v.vpc_id()))?;

        let output = self
            .client
            .create_vpc()
            .cidr_block(&spec.cidr)
            .instance_tenancy(Tenancy::from(spec.tenancy.as_str()))
            .tag_specifications(tag_spec(ResourceType::Vpc, &request.tags))
            .send()
            .await
            .map_err(|e| from_sdk("CreateVpc", &e))?;
        let vpc_id = output
            .vpc()
            .and_then(|v| v.vpc_id())
            .ok_or_else(|| missing("CreateVpc", "vpc id"))?
            .to_string();
        info!(network = %request.key.name, %vpc_id, "Created VPC");

        self.finish(&vpc_id, spec, &sdk_tags(&request.tags)).await?;

        Ok(CreatedResource {
            remote_id: vpc_id,
            tags: request.tags.to_map(),
        })
    }

    async fn update(&self, request: &UpdateRequest) -> ProviderResult<()> {
        let ResourceSpec::Network(spec) = &request.desired else {
            return Err(wrong_spec(self.kind()));
        };
        if let Some(field) = request.changed.iter().find(|f| !MUTABLE_FIELDS.contains(&f.as_str())) {
            return Err(ProviderError::invalid(format!(
                "network attribute {field} cannot change in place"
            )));
        }

        let vpc_id = request.remote_id.as_str();
        for field in &request.changed {
            match field.as_str() {
                "enable_dns" => self.set_dns(vpc_id, spec.enable_dns).await?,
                "internet_gateway" if spec.internet_gateway => {
                    let tags = self.vpc_tags(vpc_id).await?;
                    self.ensure_internet_gateway(vpc_id, &tags).await?;
                }
                "internet_gateway" => self.remove_internet_gateways(vpc_id).await?,
                _ => self.converge_vpn_gateway(vpc_id, spec.vpn_gateway.as_deref()).await?,
            }
        }
        Ok(())
    }

    async fn delete(&self, request: &DeleteRequest) -> ProviderResult<()> {
        let vpc_id = request.remote_id.as_str();
        self.converge_vpn_gateway(vpc_id, None).await?;
        self.remove_internet_gateways(vpc_id).await?;

        self.client
            .delete_vpc()
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(|e| from_sdk("DeleteVpc", &e))?;
        info!(%vpc_id, "Deleted VPC");
        Ok(())
    }
}

/// Manages a DHCP option set and its association with the network.
#[derive(Debug, Clone)]
pub struct DhcpOptionsProvider {
    client: Client,
    follow_up: FollowUp,
}

impl DhcpOptionsProvider {
    pub const fn new(client: Client, follow_up: FollowUp) -> Self {
        Self { client, follow_up }
    }
}

fn dhcp_configurations(spec: &DhcpOptionsSpec) -> Vec<NewDhcpConfiguration> {
    let mut configurations = Vec::new();
    if let Some(domain) = &spec.domain_name {
        configurations.push(NewDhcpConfiguration::builder().key("domain-name").values(domain).build());
    }
    if !spec.domain_name_servers.is_empty() {
        configurations.push(
            NewDhcpConfiguration::builder()
                .key("domain-name-servers")
                .set_values(Some(spec.domain_name_servers.clone()))
                .build(),
        );
    }
    configurations
}

#[async_trait]
impl ResourceProvider for DhcpOptionsProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::DhcpOptions
    }

    fn tag_limit(&self) -> Option<usize> {
        Some(EC2_TAG_LIMIT)
    }

    async fn list(&self, owner: &OwnerTag) -> ProviderResult<Vec<RemoteResource>> {
        let output = self
            .client
            .describe_dhcp_options()
            .filters(owner_filter(owner))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeDhcpOptions", &e))?;

        Ok(output
            .dhcp_options()
            .iter()
            .filter_map(|options| {
                let mut spec = DhcpOptionsSpec {
                    domain_name: None,
                    domain_name_servers: Vec::new(),
                };
                for configuration in options.dhcp_configurations() {
                    let values = configuration
                        .values()
                        .iter()
                        .filter_map(|v| v.value().map(str::to_string));
                    match configuration.key() {
                        Some("domain-name") => spec.domain_name = values.into_iter().next(),
                        Some("domain-name-servers") => spec.domain_name_servers = values.collect(),
                        _ => {}
                    }
                }
                Some(RemoteResource {
                    remote_id: options.dhcp_options_id()?.to_string(),
                    tags: tag_map(options.tags()),
                    spec: ResourceSpec::DhcpOptions(spec),
                })
            })
            .collect())
    }

    async fn create(&self, request: &CreateRequest) -> ProviderResult<CreatedResource> {
        let ResourceSpec::DhcpOptions(spec) = &request.spec else {
            return Err(wrong_spec(self.kind()));
        };
        let vpc_id = request.refs.network().ok_or_else(no_network)?;

        let existing = self
            .client
            .describe_dhcp_options()
            .set_filters(Some(identity_filters(&request.tags)))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeDhcpOptions", &e))?;
        ensure_absent(
            &request.name,
            existing.dhcp_options().first().and_then(|o| o.dhcp_options_id()),
        )?;

        let output = self
            .client
            .create_dhcp_options()
            .set_dhcp_configurations(Some(dhcp_configurations(spec)))
            .tag_specifications(tag_spec(ResourceType::DhcpOptions, &request.tags))
            .send()
            .await
            .map_err(|e| from_sdk("CreateDhcpOptions", &e))?;
        let options_id = output
            .dhcp_options()
            .and_then(|o| o.dhcp_options_id())
            .ok_or_else(|| missing("CreateDhcpOptions", "options id"))?
            .to_string();

        self.follow_up
            .settle("AssociateDhcpOptions", || async {
                self.client
                    .associate_dhcp_options()
                    .dhcp_options_id(&options_id)
                    .vpc_id(vpc_id)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| reference_not_visible(from_sdk("AssociateDhcpOptions", &e)))
            })
            .await?;
        info!(%options_id, %vpc_id, "Created and associated DHCP options");

        Ok(CreatedResource {
            remote_id: options_id,
            tags: request.tags.to_map(),
        })
    }

    async fn update(&self, request: &UpdateRequest) -> ProviderResult<()> {
        Err(ProviderError::invalid(format!(
            "DHCP option set {} is immutable; changed {:?}",
            request.remote_id, request.changed
        )))
    }

    async fn delete(&self, request: &DeleteRequest) -> ProviderResult<()> {
        if let Some(vpc_id) = request.refs.network() {
            let reset = self
                .client
                .associate_dhcp_options()
                .dhcp_options_id("default")
                .vpc_id(vpc_id)
                .send()
                .await
                .map_err(|e| from_sdk("AssociateDhcpOptions", &e));
            match reset {
                Ok(_) => debug!(%vpc_id, "Restored default DHCP options"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.client
            .delete_dhcp_options()
            .dhcp_options_id(&request.remote_id)
            .send()
            .await
            .map_err(|e| from_sdk("DeleteDhcpOptions", &e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dhcp_configurations_skip_empty() {
        let spec = DhcpOptionsSpec {
            domain_name: Some("staging.internal".into()),
            domain_name_servers: Vec::new(),
        };
        let configurations = dhcp_configurations(&spec);
        assert_eq!(configurations.len(), 1);
        assert_eq!(configurations[0].key(), Some("domain-name"));
        assert_eq!(configurations[0].values(), ["staging.internal".to_string()]);
    }
}
