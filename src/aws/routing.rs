//! Route table and gateway endpoint providers.

use async_trait::async_trait;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::types::{ResourceType, RouteOrigin, RouteTable, VpcEndpoint};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::graph::{EndpointSpec, ResourceKind, ResourceSpec, Route, RouteTableSpec, RouteTarget};
use crate::naming::{LOGICAL_NAME_TAG, OWNER_TAG, OwnerTag};
use crate::provider::{CreateRequest, CreatedResource, DeleteRequest, RemoteResource, ResourceProvider, UpdateRequest};

use super::error::{from_sdk, reference_not_visible};
use super::tags::{EC2_TAG_LIMIT, filter, instance_group_id, owner_filter, split_group_id, tag_map, tag_spec};
use super::{FollowUp, ensure_absent, identity_filters, missing, no_network, wrong_spec};

/// Manages route tables, their routes and the main-table association.
#[derive(Debug, Clone)]
pub struct RouteTableProvider {
    client: Client,
    follow_up: FollowUp,
}

impl RouteTableProvider {
    pub const fn new(client: Client, follow_up: FollowUp) -> Self {
        Self { client, follow_up }
    }

    /// Resolves a route target to the gateway or instance id EC2 expects.
    async fn target_id(&self, vpc_id: &str, target: &RouteTarget) -> ProviderResult<TargetId> {
        match target {
            RouteTarget::InternetGateway => {
                let output = self
                    .client
                    .describe_internet_gateways()
                    .filters(filter("attachment.vpc-id", [vpc_id]))
                    .send()
                    .await
                    .map_err(|e| from_sdk("DescribeInternetGateways", &e))?;
                first_id(output.internet_gateways().iter().filter_map(|g| g.internet_gateway_id()))
                    .map(TargetId::Gateway)
                    .ok_or_else(|| not_visible(format!("no internet gateway attached to {vpc_id}")))
            }
            RouteTarget::VpnGateway => {
                let output = self
                    .client
                    .describe_vpn_gateways()
                    .filters(filter("attachment.vpc-id", [vpc_id]))
                    .filters(filter("attachment.state", ["attached"]))
                    .send()
                    .await
                    .map_err(|e| from_sdk("DescribeVpnGateways", &e))?;
                // The network node attaches the gateway; it may still be
                // completing the attachment.
                first_id(output.vpn_gateways().iter().filter_map(|g| g.vpn_gateway_id()))
                    .map(TargetId::Gateway)
                    .ok_or_else(|| not_visible(format!("no VPN gateway attached to {vpc_id}")))
            }
            RouteTarget::NatGateway => {
                let output = self
                    .client
                    .describe_nat_gateways()
                    .filter(filter("vpc-id", [vpc_id]))
                    .filter(filter("state", ["available"]))
                    .send()
                    .await
                    .map_err(|e| from_sdk("DescribeNatGateways", &e))?;
                first_id(output.nat_gateways().iter().filter_map(|g| g.nat_gateway_id()))
                    .map(TargetId::Nat)
                    .ok_or_else(|| {
                        ProviderError::invalid(format!(
                            "no available NAT gateway in {vpc_id}; `nat` routes need a NAT gateway created outside this environment"
                        ))
                    })
            }
            RouteTarget::Gateway(id) => Ok(TargetId::Gateway(id.clone())),
            RouteTarget::InstanceGroup(group_id) => {
                let (environment, name) = split_group_id(group_id)
                    .ok_or_else(|| not_visible(format!("instance group {group_id} not resolved")))?;
                let output = self
                    .client
                    .describe_instances()
                    .filters(filter(&format!("tag:{OWNER_TAG}"), [environment]))
                    .filters(filter(&format!("tag:{LOGICAL_NAME_TAG}"), [name]))
                    .filters(filter("instance-state-name", ["pending", "running"]))
                    .send()
                    .await
                    .map_err(|e| from_sdk("DescribeInstances", &e))?;
                let instances = output.reservations().iter().flat_map(|r| r.instances());
                first_id(instances.filter_map(|i| i.instance_id()))
                    .map(TargetId::Instance)
                    .ok_or_else(|| not_visible(format!("instance group {group_id} has no running instance")))
            }
        }
    }

    /// Maps the instance ids used as route targets to instance group ids.
    async fn instance_groups(&self, tables: &[RouteTable]) -> ProviderResult<Vec<(String, String)>> {
        let ids: BTreeSet<&str> = tables
            .iter()
            .flat_map(RouteTable::routes)
            .filter_map(|r| r.instance_id())
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let output = self
            .client
            .describe_instances()
            .set_instance_ids(Some(ids.into_iter().map(str::to_string).collect()))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeInstances", &e))?;
        Ok(output
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .filter_map(|i| Some((i.instance_id()?.to_string(), instance_group_id(&tag_map(i.tags()))?)))
            .collect())
    }

    async fn add_route(&self, table_id: &str, vpc_id: &str, route: &Route) -> ProviderResult<()> {
        let target = self.target_id(vpc_id, &route.target).await?;
        let request = self
            .client
            .create_route()
            .route_table_id(table_id)
            .destination_cidr_block(&route.destination);
        let request = match &target {
            TargetId::Gateway(id) => request.gateway_id(id),
            TargetId::Nat(id) => request.nat_gateway_id(id),
            TargetId::Instance(id) => request.instance_id(id),
        };
        match request.send().await.map_err(|e| from_sdk("CreateRoute", &e)) {
            Ok(_) | Err(ProviderError::AlreadyExists { .. }) => {
                debug!(%table_id, destination = %route.destination, "Route in place");
            }
            Err(e) => return Err(reference_not_visible(e)),
        }

        // Routes learned over the VPN follow the static route into the table.
        if route.target == RouteTarget::VpnGateway
            && let TargetId::Gateway(gateway_id) = &target
        {
            self.set_propagation(table_id, gateway_id, true).await?;
        }
        Ok(())
    }

    async fn set_propagation(&self, table_id: &str, gateway_id: &str, enabled: bool) -> ProviderResult<()> {
        if enabled {
            self.client
                .enable_vgw_route_propagation()
                .route_table_id(table_id)
                .gateway_id(gateway_id)
                .send()
                .await
                .map_err(|e| reference_not_visible(from_sdk("EnableVgwRoutePropagation", &e)))?;
        } else {
            let disabled = self
                .client
                .disable_vgw_route_propagation()
                .route_table_id(table_id)
                .gateway_id(gateway_id)
                .send()
                .await
                .map_err(|e| from_sdk("DisableVgwRoutePropagation", &e));
            match disabled {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        debug!(%table_id, %gateway_id, enabled, "Set VPN route propagation");
        Ok(())
    }

    /// Turns propagation off once a table no longer routes to the VPN
    /// gateway. Nothing to do if the gateway is already detached.
    async fn stop_propagation(&self, table_id: &str, vpc_id: &str) -> ProviderResult<()> {
        match self.target_id(vpc_id, &RouteTarget::VpnGateway).await {
            Ok(TargetId::Gateway(gateway_id)) => self.set_propagation(table_id, &gateway_id, false).await,
            Ok(_) | Err(ProviderError::NotYetVisible { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_route(&self, table_id: &str, route: &Route) -> ProviderResult<()> {
        match self
            .client
            .delete_route()
            .route_table_id(table_id)
            .destination_cidr_block(&route.destination)
            .send()
            .await
            .map_err(|e| from_sdk("DeleteRoute", &e))
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn tables_in(&self, vpc_id: &str) -> ProviderResult<Vec<RouteTable>> {
        let output = self
            .client
            .describe_route_tables()
            .filters(filter("vpc-id", [vpc_id]))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeRouteTables", &e))?;
        Ok(output.route_tables().to_vec())
    }

    /// Makes `table_id` the main route table of the network.
    async fn make_main(&self, vpc_id: &str, table_id: &str) -> ProviderResult<()> {
        let tables = self.tables_in(vpc_id).await?;
        let association = tables
            .iter()
            .flat_map(RouteTable::associations)
            .find(|a| a.main() == Some(true))
            .and_then(|a| a.route_table_association_id())
            .ok_or_else(|| missing("DescribeRouteTables", "main association"))?;
        self.client
            .replace_route_table_association()
            .association_id(association)
            .route_table_id(table_id)
            .send()
            .await
            .map_err(|e| reference_not_visible(from_sdk("ReplaceRouteTableAssociation", &e)))?;
        info!(%vpc_id, %table_id, "Replaced main route table");
        Ok(())
    }
}

enum TargetId {
    Gateway(String),
    Nat(String),
    Instance(String),
}

fn first_id<'a>(ids: impl Iterator<Item = &'a str>) -> Option<String> {
    ids.min().map(str::to_string)
}

fn not_visible(message: String) -> ProviderError {
    ProviderError::NotYetVisible { message }
}

fn routes_to_vpn(spec: &RouteTableSpec) -> bool {
    spec.routes.iter().any(|r| r.target == RouteTarget::VpnGateway)
}

/// Reads the managed routes of a table.
///
/// The local route and routes installed by endpoints or propagation are
/// owned by EC2, not by the table's declaration, and are skipped.
fn managed_routes(table: &RouteTable, groups: &[(String, String)]) -> BTreeSet<Route> {
    table
        .routes()
        .iter()
        .filter(|r| r.origin() != Some(&RouteOrigin::CreateRouteTable))
        .filter(|r| r.origin() != Some(&RouteOrigin::EnableVgwRoutePropagation))
        .filter_map(|r| {
            let destination = r.destination_cidr_block()?.to_string();
            let target = if r.nat_gateway_id().is_some() {
                RouteTarget::NatGateway
            } else if let Some(instance) = r.instance_id() {
                groups
                    .iter()
                    .find(|(id, _)| id == instance)
                    .map_or_else(
                        || RouteTarget::Gateway(instance.to_string()),
                        |(_, group)| RouteTarget::InstanceGroup(group.clone()),
                    )
            } else {
                let gateway = r.gateway_id()?;
                if gateway.starts_with("igw-") {
                    RouteTarget::InternetGateway
                } else if gateway.starts_with("vgw-") {
                    RouteTarget::VpnGateway
                } else if gateway == "local" {
                    return None;
                } else {
                    RouteTarget::Gateway(gateway.to_string())
                }
            };
            Some(Route { destination, target })
        })
        .collect()
}

#[async_trait]
impl ResourceProvider for RouteTableProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::RouteTable
    }

    fn tag_limit(&self) -> Option<usize> {
        Some(EC2_TAG_LIMIT)
    }

    async fn list(&self, owner: &OwnerTag) -> ProviderResult<Vec<RemoteResource>> {
        let output = self
            .client
            .describe_route_tables()
            .filters(owner_filter(owner))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeRouteTables", &e))?;
        let tables = output.route_tables();
        let groups = self.instance_groups(tables).await?;

        Ok(tables
            .iter()
            .filter_map(|table| {
                Some(RemoteResource {
                    remote_id: table.route_table_id()?.to_string(),
                    tags: tag_map(table.tags()),
                    spec: ResourceSpec::RouteTable(RouteTableSpec {
                        main: table.associations().iter().any(|a| a.main() == Some(true)),
                        routes: managed_routes(table, &groups),
                    }),
                })
            })
            .collect())
    }

    async fn create(&self, request: &CreateRequest) -> ProviderResult<CreatedResource> {
        let ResourceSpec::RouteTable(spec) = request.refs.to_remote(&request.spec) else {
            return Err(wrong_spec(self.kind()));
        };
        let vpc_id = request.refs.network().ok_or_else(no_network)?;

        let existing = self
            .client
            .describe_route_tables()
            .set_filters(Some(identity_filters(&request.tags)))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeRouteTables", &e))?;
        ensure_absent(
            &request.name,
            existing.route_tables().first().and_then(|t| t.route_table_id()),
        )?;

        let output = self
            .client
            .create_route_table()
            .vpc_id(vpc_id)
            .tag_specifications(tag_spec(ResourceType::RouteTable, &request.tags))
            .send()
            .await
            .map_err(|e| reference_not_visible(from_sdk("CreateRouteTable", &e)))?;
        let table_id = output
            .route_table()
            .and_then(|t| t.route_table_id())
            .ok_or_else(|| missing("CreateRouteTable", "route table id"))?
            .to_string();
        info!(route_table = %request.key.name, %table_id, "Created route table");

        for route in &spec.routes {
            self.follow_up
                .settle("CreateRoute", || self.add_route(&table_id, vpc_id, route))
                .await?;
        }
        if spec.main {
            self.follow_up
                .settle("ReplaceRouteTableAssociation", || self.make_main(vpc_id, &table_id))
                .await?;
        }

        Ok(CreatedResource {
            remote_id: table_id,
            tags: request.tags.to_map(),
        })
    }

    async fn update(&self, request: &UpdateRequest) -> ProviderResult<()> {
        let (ResourceSpec::RouteTable(current), ResourceSpec::RouteTable(desired)) = (
            request.refs.to_remote(&request.current),
            request.refs.to_remote(&request.desired),
        ) else {
            return Err(wrong_spec(self.kind()));
        };
        let vpc_id = request.refs.network().ok_or_else(no_network)?;
        let table_id = request.remote_id.as_str();

        for route in current.routes.difference(&desired.routes) {
            // A replaced target keeps its destination; CreateRoute below
            // would otherwise collide with the stale entry.
            self.remove_route(table_id, route).await?;
        }
        for route in desired.routes.difference(&current.routes) {
            self.add_route(table_id, vpc_id, route).await?;
        }
        if routes_to_vpn(&current) && !routes_to_vpn(&desired) {
            self.stop_propagation(table_id, vpc_id).await?;
        }
        debug!(%table_id, "Routes updated");
        Ok(())
    }

    async fn delete(&self, request: &DeleteRequest) -> ProviderResult<()> {
        let table_id = request.remote_id.as_str();
        let described = self
            .client
            .describe_route_tables()
            .route_table_ids(table_id)
            .send()
            .await
            .map_err(|e| from_sdk("DescribeRouteTables", &e));
        let table = match described {
            Ok(output) => output.route_tables().first().cloned(),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        if let Some(table) = table {
            for association in table.associations() {
                let Some(association_id) = association.route_table_association_id() else {
                    continue;
                };
                if association.main() == Some(true) {
                    // The main table cannot be deleted; hand the role back
                    // to a table this environment does not own.
                    let vpc_id = table.vpc_id().unwrap_or_default();
                    let fallback = self
                        .tables_in(vpc_id)
                        .await?
                        .into_iter()
                        .find(|t| !tag_map(t.tags()).contains_key(OWNER_TAG))
                        .and_then(|t| t.route_table_id().map(str::to_string))
                        .ok_or_else(|| ProviderError::DependencyViolation {
                            message: format!("{table_id} is the main route table of {vpc_id}"),
                        })?;
                    self.client
                        .replace_route_table_association()
                        .association_id(association_id)
                        .route_table_id(&fallback)
                        .send()
                        .await
                        .map_err(|e| from_sdk("ReplaceRouteTableAssociation", &e))?;
                    warn!(%table_id, %fallback, "Main route table role returned to unmanaged table");
                } else {
                    self.client
                        .disassociate_route_table()
                        .association_id(association_id)
                        .send()
                        .await
                        .map_err(|e| from_sdk("DisassociateRouteTable", &e))?;
                }
            }
        }

        self.client
            .delete_route_table()
            .route_table_id(table_id)
            .send()
            .await
            .map_err(|e| from_sdk("DeleteRouteTable", &e))?;
        info!(%table_id, "Deleted route table");
        Ok(())
    }
}

/// Manages gateway endpoints (e.g. `s3`) attached to route tables.
#[derive(Debug, Clone)]
pub struct EndpointProvider {
    client: Client,
    region: String,
}

impl EndpointProvider {
    pub const fn new(client: Client, region: String) -> Self {
        Self { client, region }
    }
}

/// Full service name for a short one (`s3` becomes
/// `com.amazonaws.{region}.s3`). Full names pass through.
fn service_name(region: &str, service: &str) -> String {
    if service.contains('.') {
        service.to_string()
    } else {
        format!("com.amazonaws.{region}.{service}")
    }
}

/// Short service name for a full one in this region.
fn short_service(region: &str, service: &str) -> String {
    service
        .strip_prefix(&format!("com.amazonaws.{region}."))
        .unwrap_or(service)
        .to_string()
}

fn is_live(endpoint: &VpcEndpoint) -> bool {
    !matches!(
        endpoint.state().map(|s| s.as_str().to_ascii_lowercase()).as_deref(),
        Some("deleted" | "deleting" | "failed" | "rejected")
    )
}

#[async_trait]
impl ResourceProvider for EndpointProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Endpoint
    }

    fn tag_limit(&self) -> Option<usize> {
        Some(EC2_TAG_LIMIT)
    }

    async fn list(&self, owner: &OwnerTag) -> ProviderResult<Vec<RemoteResource>> {
        let output = self
            .client
            .describe_vpc_endpoints()
            .filters(owner_filter(owner))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeVpcEndpoints", &e))?;

        Ok(output
            .vpc_endpoints()
            .iter()
            .filter(|e| is_live(e))
            .filter_map(|endpoint| {
                Some(RemoteResource {
                    remote_id: endpoint.vpc_endpoint_id()?.to_string(),
                    tags: tag_map(endpoint.tags()),
                    spec: ResourceSpec::Endpoint(EndpointSpec {
                        service: short_service(&self.region, endpoint.service_name().unwrap_or_default()),
                        route_tables: endpoint.route_table_ids().iter().cloned().collect(),
                    }),
                })
            })
            .collect())
    }

    async fn create(&self, request: &CreateRequest) -> ProviderResult<CreatedResource> {
        let ResourceSpec::Endpoint(spec) = request.refs.to_remote(&request.spec) else {
            return Err(wrong_spec(self.kind()));
        };
        let vpc_id = request.refs.network().ok_or_else(no_network)?;

        let existing = self
            .client
            .describe_vpc_endpoints()
            .set_filters(Some(identity_filters(&request.tags)))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeVpcEndpoints", &e))?;
        ensure_absent(
            &request.name,
            existing
                .vpc_endpoints()
                .iter()
                .find(|e| is_live(e))
                .and_then(|e| e.vpc_endpoint_id()),
        )?;

        let output = self
            .client
            .create_vpc_endpoint()
            .vpc_id(vpc_id)
            .service_name(service_name(&self.region, &spec.service))
            .set_route_table_ids(Some(spec.route_tables.into_iter().collect()))
            .tag_specifications(tag_spec(ResourceType::VpcEndpoint, &request.tags))
            .send()
            .await
            .map_err(|e| reference_not_visible(from_sdk("CreateVpcEndpoint", &e)))?;
        let endpoint_id = output
            .vpc_endpoint()
            .and_then(|e| e.vpc_endpoint_id())
            .ok_or_else(|| missing("CreateVpcEndpoint", "endpoint id"))?
            .to_string();
        info!(endpoint = %request.key.name, %endpoint_id, "Created gateway endpoint");

        Ok(CreatedResource {
            remote_id: endpoint_id,
            tags: request.tags.to_map(),
        })
    }

    async fn update(&self, request: &UpdateRequest) -> ProviderResult<()> {
        let (ResourceSpec::Endpoint(current), ResourceSpec::Endpoint(desired)) = (
            request.refs.to_remote(&request.current),
            request.refs.to_remote(&request.desired),
        ) else {
            return Err(wrong_spec(self.kind()));
        };
        let added: Vec<String> = desired.route_tables.difference(&current.route_tables).cloned().collect();
        let removed: Vec<String> = current.route_tables.difference(&desired.route_tables).cloned().collect();

        self.client
            .modify_vpc_endpoint()
            .vpc_endpoint_id(&request.remote_id)
            .set_add_route_table_ids((!added.is_empty()).then_some(added))
            .set_remove_route_table_ids((!removed.is_empty()).then_some(removed))
            .send()
            .await
            .map_err(|e| reference_not_visible(from_sdk("ModifyVpcEndpoint", &e)))?;
        Ok(())
    }

    async fn delete(&self, request: &DeleteRequest) -> ProviderResult<()> {
        let output = self
            .client
            .delete_vpc_endpoints()
            .vpc_endpoint_ids(&request.remote_id)
            .send()
            .await
            .map_err(|e| from_sdk("DeleteVpcEndpoints", &e))?;
        if let Some(failure) = output.unsuccessful().first().and_then(|u| u.error()) {
            return Err(super::classify(failure.code(), failure.message()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ec2::types::{Route as Ec2Route, RouteTableAssociation};

    #[test]
    fn test_service_names() {
        assert_eq!(service_name("eu-west-1", "s3"), "com.amazonaws.eu-west-1.s3");
        assert_eq!(service_name("eu-west-1", "com.amazonaws.eu-west-1.s3"), "com.amazonaws.eu-west-1.s3");
        assert_eq!(short_service("eu-west-1", "com.amazonaws.eu-west-1.dynamodb"), "dynamodb");
        assert_eq!(short_service("eu-west-1", "com.amazonaws.us-east-1.s3"), "com.amazonaws.us-east-1.s3");
    }

    #[test]
    fn test_routes_to_vpn() {
        let route = |target| Route {
            destination: String::from("10.10.0.0/16"),
            target,
        };
        let mut spec = RouteTableSpec {
            main: false,
            routes: BTreeSet::from([route(RouteTarget::InternetGateway)]),
        };
        assert!(!routes_to_vpn(&spec));
        spec.routes.insert(route(RouteTarget::VpnGateway));
        assert!(routes_to_vpn(&spec));
    }

    #[test]
    fn test_managed_routes_skip_local_and_map_targets() {
        let table = RouteTable::builder()
            .route_table_id("rtb-1")
            .routes(
                Ec2Route::builder()
                    .destination_cidr_block("10.0.0.0/16")
                    .gateway_id("local")
                    .origin(RouteOrigin::CreateRouteTable)
                    .build(),
            )
            .routes(
                Ec2Route::builder()
                    .destination_cidr_block("0.0.0.0/0")
                    .gateway_id("igw-1")
                    .origin(RouteOrigin::CreateRoute)
                    .build(),
            )
            .routes(
                Ec2Route::builder()
                    .destination_cidr_block("192.168.0.0/16")
                    .instance_id("i-1")
                    .origin(RouteOrigin::CreateRoute)
                    .build(),
            )
            .routes(
                Ec2Route::builder()
                    .destination_cidr_block("172.16.0.0/12")
                    .gateway_id("pcx-9")
                    .origin(RouteOrigin::CreateRoute)
                    .build(),
            )
            .associations(RouteTableAssociation::builder().main(false).build())
            .build();
        let groups = vec![("i-1".to_string(), "staging/nat".to_string())];

        let routes = managed_routes(&table, &groups);
        assert_eq!(routes.len(), 3);
        assert!(routes.contains(&Route {
            destination: "0.0.0.0/0".into(),
            target: RouteTarget::InternetGateway,
        }));
        assert!(routes.contains(&Route {
            destination: "192.168.0.0/16".into(),
            target: RouteTarget::InstanceGroup("staging/nat".into()),
        }));
        assert!(routes.contains(&Route {
            destination: "172.16.0.0/12".into(),
            target: RouteTarget::Gateway("pcx-9".into()),
        }));
    }
}
