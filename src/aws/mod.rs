//! Amazon EC2 and classic ELB implementation of the provider interface.
//!
//! Every EC2 resource is tagged at creation through a tag specification, so
//! a resource is never visible without its ownership tag. Instance groups
//! have no control-plane object: they are the set of instances carrying the
//! group's identity tags. Load balancers are addressed by name.
//!
//! EC2 does not reject duplicate names for most kinds, so every create
//! first looks for a resource with the same identity tags and answers
//! `AlreadyExists` when one is found. The engine then adopts it instead of
//! creating a duplicate.

mod context;
mod error;
mod instances;
mod key_pair;
mod load_balancer;
mod network;
mod routing;
mod security_group;
mod subnet;
mod tags;

pub use context::AwsContext;
pub use error::{classify, from_sdk};

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::graph::ResourceKind;
use crate::naming::{LOGICAL_NAME_TAG, OWNER_TAG, TagSet};
use crate::planner::{RetryError, RetryPolicy};
use crate::provider::ProviderRegistry;

/// Builds a registry with a provider for every kind.
///
/// `follow_up` paces the calls that finish a resource after it was
/// created, such as attaching a gateway or associating a route table.
#[must_use]
pub fn registry(context: &AwsContext, follow_up: &FollowUp) -> ProviderRegistry {
    let ec2 = context.ec2_client();
    let elb = context.elb_client();
    let region = context.region().to_string();

    ProviderRegistry::new()
        .with(Arc::new(network::NetworkProvider::new(ec2.clone(), follow_up.clone())))
        .with(Arc::new(network::DhcpOptionsProvider::new(ec2.clone(), follow_up.clone())))
        .with(Arc::new(routing::RouteTableProvider::new(ec2.clone(), follow_up.clone())))
        .with(Arc::new(subnet::SubnetProvider::new(ec2.clone(), region.clone(), follow_up.clone())))
        .with(Arc::new(security_group::SecurityGroupProvider::new(ec2.clone())))
        .with(Arc::new(security_group::RuleSetProvider::new(ec2.clone(), follow_up.clone())))
        .with(Arc::new(key_pair::KeyPairProvider::new(ec2.clone())))
        .with(Arc::new(routing::EndpointProvider::new(ec2.clone(), region)))
        .with(Arc::new(instances::InstanceGroupProvider::new(ec2.clone(), follow_up.clone())))
        .with(Arc::new(load_balancer::LoadBalancerProvider::new(elb, ec2, follow_up.clone())))
}

/// Retries follow-up calls on a resource that was just created, with the
/// run's backoff settings and cancellation token.
#[derive(Debug, Clone)]
pub struct FollowUp {
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl FollowUp {
    /// Creates follow-up settings from the engine's retry policy.
    #[must_use]
    pub const fn new(retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { retry, cancel }
    }

    /// Runs a follow-up call, waiting out eventual consistency.
    ///
    /// A resource that was just created may not be visible to the next
    /// call yet, so `NotFound` is retried like any transient error.
    async fn settle<T, F, Fut>(&self, operation: &str, mut call: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        self.retry
            .run(&self.cancel, operation, |attempt| {
                let pending = call();
                async move {
                    pending.await.map_err(|e| match e {
                        ProviderError::NotFound { message } => {
                            debug!(operation, attempt, %message, "Waiting for a new resource to settle");
                            ProviderError::NotYetVisible { message }
                        }
                        other => other,
                    })
                }
            })
            .await
            .map(|(value, _)| value)
            .map_err(RetryError::into_error)
    }
}

/// A response lacked a field the call depends on.
fn missing(operation: &str, field: &str) -> ProviderError {
    ProviderError::Other {
        code: String::from("MissingField"),
        message: format!("{operation} returned no {field}"),
    }
}

/// A request carried a spec of another kind.
fn wrong_spec(kind: ResourceKind) -> ProviderError {
    ProviderError::invalid(format!("request for {kind} carries a different spec"))
}

/// A request lacks the network id every placed resource needs.
fn no_network() -> ProviderError {
    ProviderError::NotYetVisible {
        message: String::from("network id not resolved"),
    }
}

/// Filters matching the identity tags of a create request.
fn identity_filters(tags: &TagSet) -> Vec<aws_sdk_ec2::types::Filter> {
    [OWNER_TAG, LOGICAL_NAME_TAG]
        .into_iter()
        .filter_map(|key| tags.get(key).map(|value| tags::filter(&format!("tag:{key}"), [value])))
        .collect()
}

/// Fails with `AlreadyExists` if a create would duplicate `existing`.
fn ensure_absent(name: &str, existing: Option<&str>) -> ProviderResult<()> {
    match existing {
        Some(id) => Err(ProviderError::AlreadyExists {
            message: format!("{name} already exists as {id}"),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKey;
    use crate::naming::Naming;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_identity_filters() {
        let naming = Naming::new("staging", &BTreeMap::new());
        let tags = naming.tags_for(&NodeKey::new(ResourceKind::Subnet, "private-1"));
        let filters = identity_filters(&tags);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].name(), Some("tag:vpcforge:environment"));
        assert_eq!(filters[1].values(), ["private-1".to_string()]);
    }

    #[test]
    fn test_ensure_absent() {
        assert!(ensure_absent("x", None).is_ok());
        assert!(matches!(
            ensure_absent("x", Some("vpc-1")),
            Err(ProviderError::AlreadyExists { .. })
        ));
    }

    fn follow_up(max_attempts: u32) -> FollowUp {
        FollowUp::new(RetryPolicy::immediate(max_attempts), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_settle_retries_not_found() {
        let calls = AtomicU32::new(0);
        let result = follow_up(6)
            .settle("AttachInternetGateway", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::not_found("igw-1"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn test_settle_stops_on_permanent() {
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> = follow_up(6)
            .settle("ModifyVpcAttribute", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::invalid("bad")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settle_honours_attempt_cap() {
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> = follow_up(3)
            .settle("AssociateRouteTable", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::not_found("rtb-1")) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::NotYetVisible { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_settle_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: std::time::Duration::from_secs(60),
            max_delay: std::time::Duration::from_secs(60),
            jitter: 0.0,
        };
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> = FollowUp::new(policy, cancel)
            .settle("CreateRoute", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::rate_limited("slow down")) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
