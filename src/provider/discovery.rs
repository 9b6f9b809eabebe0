//! Live discovery: the as-is graph, rebuilt from tags on every run.
//!
//! Each kind is listed concurrently with the ownership filter. Resources
//! are addressed by the logical name in their name tag, and the remote ids
//! inside their reported attributes are mapped back to logical names so the
//! live graph has the same shape as the desired one.

use std::collections::{BTreeMap, HashMap};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::graph::{LiveGraph, LiveResource, NodeKey, ResourceKind};
use crate::naming::Naming;
use crate::planner::RetryPolicy;

use super::registry::ProviderRegistry;
use super::traits::RemoteResource;

/// What discovery found.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Owned resources, addressed by logical name.
    pub live: LiveGraph,
    /// Kinds whose listing failed after retries, with the last error.
    pub unavailable: BTreeMap<ResourceKind, ProviderError>,
    /// Owned resources without a name tag, by kind.
    pub untracked: BTreeMap<ResourceKind, Vec<String>>,
}

impl DiscoveryReport {
    /// Returns true if every kind was listed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }
}

/// Lists owned resources of every registered kind.
#[derive(Debug)]
pub struct LiveDiscovery<'a> {
    registry: &'a ProviderRegistry,
    naming: &'a Naming,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<'a> LiveDiscovery<'a> {
    /// Creates a discovery pass.
    #[must_use]
    pub fn new(registry: &'a ProviderRegistry, naming: &'a Naming, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            registry,
            naming,
            retry,
            cancel,
        }
    }

    /// Builds the live graph.
    ///
    /// A kind whose listing keeps failing is recorded in
    /// [`DiscoveryReport::unavailable`] instead of failing the whole pass;
    /// the caller decides how to escalate.
    pub async fn discover(&self) -> DiscoveryReport {
        let owner = self.naming.owner_tag();
        let mut tasks = JoinSet::new();

        for kind in self.registry.kinds() {
            let Ok(provider) = self.registry.get(kind) else {
                continue;
            };
            let owner = owner.clone();
            let retry = self.retry.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let label = kind.to_string();
                let result = retry
                    .run(&cancel, &label, |_| {
                        let provider = provider.clone();
                        let owner = owner.clone();
                        async move { provider.list(&owner).await }
                    })
                    .await;
                (kind, result)
            });
        }

        let mut listed: BTreeMap<ResourceKind, Vec<RemoteResource>> = BTreeMap::new();
        let mut report = DiscoveryReport {
            live: LiveGraph::new(self.naming.environment()),
            ..DiscoveryReport::default()
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, Ok((resources, _)))) => {
                    debug!(%kind, count = resources.len(), "Listed owned resources");
                    listed.insert(kind, resources);
                }
                Ok((kind, Err(e))) => {
                    warn!(%kind, attempts = e.attempts(), error = %e.error(), "Listing failed");
                    report.unavailable.insert(kind, e.into_error());
                }
                Err(e) => {
                    warn!(error = %e, "Listing task panicked");
                }
            }
        }

        self.assemble(listed, &mut report);
        info!(
            resources = report.live.len(),
            unavailable = report.unavailable.len(),
            "Discovery complete"
        );
        report
    }

    /// Keys every listed resource and rewrites ids into logical names.
    fn assemble(&self, listed: BTreeMap<ResourceKind, Vec<RemoteResource>>, report: &mut DiscoveryReport) {
        let mut keyed: Vec<(NodeKey, RemoteResource)> = Vec::new();
        let mut by_id: HashMap<(ResourceKind, String), String> = HashMap::new();

        for (kind, resources) in listed {
            for resource in resources {
                match self.naming.identify(kind, &resource.tags) {
                    Some(key) => {
                        by_id.insert((kind, resource.remote_id.clone()), key.name.clone());
                        keyed.push((key, resource));
                    }
                    None => {
                        debug!(%kind, id = %resource.remote_id, "Owned resource without a name tag");
                        report.untracked.entry(kind).or_default().push(resource.remote_id);
                    }
                }
            }
        }

        for (key, resource) in keyed {
            if let Some(existing) = report.live.get(&key) {
                warn!(
                    resource = %key,
                    kept = %existing.remote_id,
                    ignored = %resource.remote_id,
                    "Two live resources claim the same identity"
                );
                report
                    .untracked
                    .entry(key.kind)
                    .or_default()
                    .push(resource.remote_id);
                continue;
            }
            let mut spec = resource.spec;
            spec.map_refs(|kind, id| by_id.get(&(kind, id.to_string())).cloned());
            report.live.insert(LiveResource {
                key,
                remote_id: resource.remote_id,
                tags: resource.tags,
                spec,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NetworkSpec, ResourceSpec, SubnetSpec};
    use crate::naming::{LOGICAL_NAME_TAG, OWNER_TAG};
    use crate::provider::memory::InMemoryCloud;
    use crate::provider::traits::{MockResourceProvider, ResourceProvider};
    use std::sync::Arc;

    fn tags(env: &str, name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (OWNER_TAG.to_string(), env.to_string()),
            (LOGICAL_NAME_TAG.to_string(), name.to_string()),
        ])
    }

    fn network() -> ResourceSpec {
        ResourceSpec::Network(NetworkSpec {
            cidr: "10.0.0.0/16".into(),
            tenancy: "default".into(),
            enable_dns: true,
            internet_gateway: true,
            vpn_gateway: None,
        })
    }

    #[tokio::test]
    async fn test_discovery_maps_ids_to_names() {
        let cloud = InMemoryCloud::new();
        cloud.seed(tags("staging", "staging"), network());
        let rtb = cloud.seed(
            tags("staging", "private"),
            ResourceSpec::RouteTable(crate::graph::RouteTableSpec {
                main: false,
                routes: Default::default(),
            }),
        );
        cloud.seed(
            tags("staging", "private-1"),
            ResourceSpec::Subnet(SubnetSpec {
                cidr: "10.0.0.0/24".into(),
                availability_zone: None,
                public: false,
                route_table: Some(rtb),
            }),
        );
        // Another environment and an untagged-name resource.
        cloud.seed(tags("production", "production"), network());
        cloud.seed(
            BTreeMap::from([(OWNER_TAG.to_string(), "staging".to_string())]),
            network(),
        );

        let registry = cloud.registry();
        let naming = Naming::new("staging", &BTreeMap::new());
        let report = LiveDiscovery::new(&registry, &naming, RetryPolicy::immediate(1), CancellationToken::new())
            .discover()
            .await;

        assert!(report.is_complete());
        assert_eq!(report.live.len(), 3);
        assert_eq!(report.untracked[&ResourceKind::Network].len(), 1);

        let subnet = report
            .live
            .get(&NodeKey::new(ResourceKind::Subnet, "private-1"))
            .unwrap();
        let ResourceSpec::Subnet(spec) = &subnet.spec else {
            panic!("wrong kind");
        };
        assert_eq!(spec.route_table.as_deref(), Some("private"));
    }

    #[tokio::test]
    async fn test_failed_kind_is_reported_not_fatal() {
        let cloud = InMemoryCloud::new();
        cloud.seed(tags("staging", "staging"), network());
        cloud.fail_listing(ResourceKind::Subnet, ProviderError::rate_limited("throttled"));

        let registry = cloud.registry();
        let naming = Naming::new("staging", &BTreeMap::new());
        let report = LiveDiscovery::new(&registry, &naming, RetryPolicy::immediate(3), CancellationToken::new())
            .discover()
            .await;

        assert!(!report.is_complete());
        assert!(report.unavailable.contains_key(&ResourceKind::Subnet));
        assert_eq!(report.live.len(), 1);
        let subnet_lists = cloud
            .calls()
            .iter()
            .filter(|c| c.kind == ResourceKind::Subnet)
            .count();
        assert_eq!(subnet_lists, 3);
    }

    #[tokio::test]
    async fn test_listing_uses_owner_filter() {
        let mut mock = MockResourceProvider::new();
        mock.expect_kind().return_const(ResourceKind::KeyPair);
        mock.expect_list()
            .withf(|owner| owner.key == OWNER_TAG && owner.value == "staging")
            .times(1)
            .returning(|_| Ok(Vec::new()));
        let provider: Arc<dyn ResourceProvider> = Arc::new(mock);

        let registry = ProviderRegistry::new().with(provider);
        let naming = Naming::new("staging", &BTreeMap::new());
        let report = LiveDiscovery::new(&registry, &naming, RetryPolicy::immediate(1), CancellationToken::new())
            .discover()
            .await;
        assert!(report.live.is_empty());
    }
}
