//! Subnet provider.

use async_trait::async_trait;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::types::{AttributeBooleanValue, ResourceType, RouteTable};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{ProviderError, ProviderResult};
use crate::graph::{ResourceKind, ResourceSpec, SubnetSpec};
use crate::naming::OwnerTag;
use crate::provider::{CreateRequest, CreatedResource, DeleteRequest, RemoteResource, ResourceProvider, UpdateRequest};

use super::error::{from_sdk, reference_not_visible};
use super::tags::{EC2_TAG_LIMIT, filter, owner_filter, tag_map, tag_spec};
use super::{FollowUp, ensure_absent, identity_filters, missing, no_network, wrong_spec};

/// Manages subnets and their route table association.
#[derive(Debug, Clone)]
pub struct SubnetProvider {
    client: Client,
    region: String,
    follow_up: FollowUp,
}

/// Explicit route table association of a subnet.
struct Association {
    association_id: String,
    route_table_id: String,
}

impl SubnetProvider {
    pub const fn new(client: Client, region: String, follow_up: FollowUp) -> Self {
        Self {
            client,
            region,
            follow_up,
        }
    }

    /// Explicit associations keyed by subnet id.
    async fn associations(&self, subnet_ids: &[String]) -> ProviderResult<BTreeMap<String, Association>> {
        if subnet_ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let output = self
            .client
            .describe_route_tables()
            .filters(filter("association.subnet-id", subnet_ids.iter().cloned()))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeRouteTables", &e))?;

        Ok(output
            .route_tables()
            .iter()
            .flat_map(RouteTable::associations)
            .filter(|a| a.main() != Some(true))
            .filter_map(|a| {
                Some((
                    a.subnet_id()?.to_string(),
                    Association {
                        association_id: a.route_table_association_id()?.to_string(),
                        route_table_id: a.route_table_id()?.to_string(),
                    },
                ))
            })
            .collect())
    }

    async fn set_public(&self, subnet_id: &str, public: bool) -> ProviderResult<()> {
        self.client
            .modify_subnet_attribute()
            .subnet_id(subnet_id)
            .map_public_ip_on_launch(AttributeBooleanValue::builder().value(public).build())
            .send()
            .await
            .map_err(|e| reference_not_visible(from_sdk("ModifySubnetAttribute", &e)))?;
        Ok(())
    }

    async fn associate(&self, subnet_id: &str, route_table_id: &str) -> ProviderResult<()> {
        self.client
            .associate_route_table()
            .subnet_id(subnet_id)
            .route_table_id(route_table_id)
            .send()
            .await
            .map_err(|e| reference_not_visible(from_sdk("AssociateRouteTable", &e)))?;
        debug!(%subnet_id, %route_table_id, "Associated route table");
        Ok(())
    }

    /// Moves the subnet to `desired`, or back to the main table when `None`.
    async fn reassociate(&self, subnet_id: &str, desired: Option<&str>) -> ProviderResult<()> {
        let current = self.associations(&[subnet_id.to_string()]).await?.remove(subnet_id);
        match (current, desired) {
            (Some(current), Some(desired)) if current.route_table_id == desired => Ok(()),
            (Some(current), Some(desired)) => {
                self.client
                    .replace_route_table_association()
                    .association_id(&current.association_id)
                    .route_table_id(desired)
                    .send()
                    .await
                    .map_err(|e| reference_not_visible(from_sdk("ReplaceRouteTableAssociation", &e)))?;
                Ok(())
            }
            (None, Some(desired)) => self.associate(subnet_id, desired).await,
            (Some(current), None) => {
                self.client
                    .disassociate_route_table()
                    .association_id(&current.association_id)
                    .send()
                    .await
                    .map_err(|e| from_sdk("DisassociateRouteTable", &e))?;
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }
}

/// Full zone name for a zone letter (`a` becomes `eu-west-1a`). Full names
/// pass through.
fn resolve_zone(region: &str, zone: Option<&str>) -> Option<String> {
    let zone = zone?;
    if zone.len() == 1 && zone.chars().all(|c| c.is_ascii_lowercase()) {
        Some(format!("{region}{zone}"))
    } else {
        Some(zone.to_string())
    }
}

#[async_trait]
impl ResourceProvider for SubnetProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Subnet
    }

    fn tag_limit(&self) -> Option<usize> {
        Some(EC2_TAG_LIMIT)
    }

    async fn list(&self, owner: &OwnerTag) -> ProviderResult<Vec<RemoteResource>> {
        let output = self
            .client
            .describe_subnets()
            .filters(owner_filter(owner))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeSubnets", &e))?;
        let subnets = output.subnets();
        let ids: Vec<String> = subnets.iter().filter_map(|s| s.subnet_id().map(str::to_string)).collect();
        let associations = self.associations(&ids).await?;

        Ok(subnets
            .iter()
            .filter_map(|subnet| {
                let id = subnet.subnet_id()?;
                Some(RemoteResource {
                    remote_id: id.to_string(),
                    tags: tag_map(subnet.tags()),
                    spec: ResourceSpec::Subnet(SubnetSpec {
                        cidr: subnet.cidr_block().unwrap_or_default().to_string(),
                        availability_zone: subnet.availability_zone().map(str::to_string),
                        public: subnet.map_public_ip_on_launch().unwrap_or(false),
                        route_table: associations.get(id).map(|a| a.route_table_id.clone()),
                    }),
                })
            })
            .collect())
    }

    async fn create(&self, request: &CreateRequest) -> ProviderResult<CreatedResource> {
        let ResourceSpec::Subnet(spec) = request.refs.to_remote(&request.spec) else {
            return Err(wrong_spec(self.kind()));
        };
        let vpc_id = request.refs.network().ok_or_else(no_network)?;

        let existing = self
            .client
            .describe_subnets()
            .set_filters(Some(identity_filters(&request.tags)))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeSubnets", &e))?;
        ensure_absent(&request.name, existing.subnets().first().and_then(|s| s.subnet_id()))?;

        let output = self
            .client
            .create_subnet()
            .vpc_id(vpc_id)
            .cidr_block(&spec.cidr)
            .set_availability_zone(resolve_zone(&self.region, spec.availability_zone.as_deref()))
            .tag_specifications(tag_spec(ResourceType::Subnet, &request.tags))
            .send()
            .await
            .map_err(|e| reference_not_visible(from_sdk("CreateSubnet", &e)))?;
        let subnet_id = output
            .subnet()
            .and_then(|s| s.subnet_id())
            .ok_or_else(|| missing("CreateSubnet", "subnet id"))?
            .to_string();
        info!(subnet = %request.key.name, %subnet_id, cidr = %spec.cidr, "Created subnet");

        if spec.public {
            self.follow_up
                .settle("ModifySubnetAttribute", || self.set_public(&subnet_id, true))
                .await?;
        }
        if let Some(route_table_id) = &spec.route_table {
            self.follow_up
                .settle("AssociateRouteTable", || self.associate(&subnet_id, route_table_id))
                .await?;
        }

        Ok(CreatedResource {
            remote_id: subnet_id,
            tags: request.tags.to_map(),
        })
    }

    async fn update(&self, request: &UpdateRequest) -> ProviderResult<()> {
        let ResourceSpec::Subnet(desired) = request.refs.to_remote(&request.desired) else {
            return Err(wrong_spec(self.kind()));
        };
        let subnet_id = request.remote_id.as_str();

        for field in &request.changed {
            match field.as_str() {
                "public" => self.set_public(subnet_id, desired.public).await?,
                "route_table" => self.reassociate(subnet_id, desired.route_table.as_deref()).await?,
                other => {
                    return Err(ProviderError::invalid(format!(
                        "subnet attribute {other} cannot change in place"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, request: &DeleteRequest) -> ProviderResult<()> {
        self.client
            .delete_subnet()
            .subnet_id(&request.remote_id)
            .send()
            .await
            .map_err(|e| from_sdk("DeleteSubnet", &e))?;
        info!(subnet_id = %request.remote_id, "Deleted subnet");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_letter_expands_to_region() {
        assert_eq!(resolve_zone("eu-west-1", Some("b")), Some("eu-west-1b".to_string()));
        assert_eq!(resolve_zone("eu-west-1", Some("eu-west-1c")), Some("eu-west-1c".to_string()));
        assert_eq!(resolve_zone("eu-west-1", None), None);
    }
}
