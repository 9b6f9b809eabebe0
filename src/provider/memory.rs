//! In-memory control plane.
//!
//! Behaves like a small, strict cloud: it assigns identifiers, stores
//! references as remote ids, refuses to delete resources that something
//! still points at, and can be told to fail or to hide fresh resources from
//! listings for a while. It backs `--provider memory` and the test suite.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::graph::{ResourceKind, ResourceSpec};
use crate::naming::{LOGICAL_NAME_TAG, OWNER_TAG, OwnerTag};

use super::registry::ProviderRegistry;
use super::traits::{
    CreateRequest, CreatedResource, DeleteRequest, ProviderOp, RemoteResource, ResourceProvider, UpdateRequest,
};

/// A scripted provider failure.
#[derive(Debug, Clone)]
pub struct Fault {
    /// Kind the fault applies to.
    pub kind: ResourceKind,
    /// Logical name it applies to; `None` matches every resource.
    pub name: Option<String>,
    /// Operation it applies to.
    pub op: ProviderOp,
    /// Error returned.
    pub error: ProviderError,
    /// Remaining firings; `None` fires forever.
    pub remaining: Option<u32>,
}

/// One entry of the call log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Position in the log.
    pub seq: u64,
    /// Kind called.
    pub kind: ResourceKind,
    /// Operation called.
    pub op: ProviderOp,
    /// Logical name, for per-resource calls.
    pub name: Option<String>,
    /// Whether the call succeeded.
    pub ok: bool,
}

#[derive(Debug, Clone)]
struct Record {
    kind: ResourceKind,
    tags: BTreeMap<String, String>,
    spec: ResourceSpec,
    /// Ids of the containers this record lives in (network, owning group).
    placement: Vec<String>,
    /// Listings of this kind that will still miss the record.
    hidden_lists: u32,
}

/// A create that stores the resource but breaks before finishing it.
#[derive(Debug, Clone)]
struct Interruption {
    kind: ResourceKind,
    name: String,
    partial: ResourceSpec,
    error: ProviderError,
}

#[derive(Debug, Default)]
struct CloudState {
    records: BTreeMap<String, Record>,
    counter: u64,
    faults: Vec<Fault>,
    interruptions: Vec<Interruption>,
    calls: Vec<CallRecord>,
    hide_new_for: u32,
    tag_limits: BTreeMap<ResourceKind, usize>,
    latency: Duration,
}

impl CloudState {
    fn take_fault(&mut self, kind: ResourceKind, name: Option<&str>, op: ProviderOp) -> Option<ProviderError> {
        let position = self.faults.iter().position(|f| {
            f.kind == kind && f.op == op && f.name.as_deref().is_none_or(|n| Some(n) == name)
        })?;
        let fault = &mut self.faults[position];
        let error = fault.error.clone();
        let exhausted = match fault.remaining.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            self.faults.remove(position);
        }
        Some(error)
    }

    fn log(&mut self, kind: ResourceKind, op: ProviderOp, name: Option<&str>, ok: bool) {
        let seq = self.calls.len() as u64;
        self.calls.push(CallRecord {
            seq,
            kind,
            op,
            name: name.map(str::to_string),
            ok,
        });
    }

    fn next_id(&mut self, kind: ResourceKind) -> String {
        self.counter += 1;
        format!("{}-{:08x}", id_prefix(kind), self.counter)
    }

    fn exists(&self, kind: ResourceKind, id: &str) -> bool {
        self.records.get(id).is_some_and(|r| r.kind == kind)
    }

    /// First unresolved reference of a remote-form spec.
    fn missing_reference(&self, spec: &ResourceSpec) -> Option<String> {
        spec.references()
            .into_iter()
            .find(|(key, _)| !self.exists(key.kind, &key.name))
            .map(|(key, _)| key.to_string())
    }

    fn dependents_of(&self, id: &str) -> Vec<String> {
        self.records
            .iter()
            .filter(|(other, _)| other.as_str() != id)
            .filter(|(_, r)| {
                r.placement.iter().any(|p| p == id) || r.spec.references().iter().any(|(k, _)| k.name == id)
            })
            .map(|(other, _)| other.clone())
            .collect()
    }
}

fn id_prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Network => "vpc",
        ResourceKind::DhcpOptions => "dopt",
        ResourceKind::RouteTable => "rtb",
        ResourceKind::Subnet => "subnet",
        ResourceKind::SecurityGroup => "sg",
        ResourceKind::SecurityGroupRules => "sgr",
        ResourceKind::KeyPair => "key",
        ResourceKind::Endpoint => "vpce",
        ResourceKind::InstanceGroup => "ig",
        ResourceKind::LoadBalancer => "elb",
    }
}

/// Shared handle to an in-memory control plane.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCloud {
    state: Arc<Mutex<CloudState>>,
}

impl InMemoryCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Provider for one kind, backed by this cloud.
    #[must_use]
    pub fn provider(&self, kind: ResourceKind) -> Arc<dyn ResourceProvider> {
        Arc::new(MemoryProvider {
            kind,
            cloud: self.clone(),
        })
    }

    /// Registry with a provider for every kind.
    #[must_use]
    pub fn registry(&self) -> ProviderRegistry {
        ResourceKind::ALL
            .iter()
            .fold(ProviderRegistry::new(), |registry, kind| registry.with(self.provider(*kind)))
    }

    /// Adds a scripted failure.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Fails the next matching call once.
    pub fn fail_once(&self, kind: ResourceKind, name: &str, op: ProviderOp, error: ProviderError) {
        self.inject(Fault {
            kind,
            name: Some(name.to_string()),
            op,
            error,
            remaining: Some(1),
        });
    }

    /// Fails every matching call.
    pub fn fail_always(&self, kind: ResourceKind, name: &str, op: ProviderOp, error: ProviderError) {
        self.inject(Fault {
            kind,
            name: Some(name.to_string()),
            op,
            error,
            remaining: None,
        });
    }

    /// Fails every listing of a kind.
    pub fn fail_listing(&self, kind: ResourceKind, error: ProviderError) {
        self.inject(Fault {
            kind,
            name: None,
            op: ProviderOp::List,
            error,
            remaining: None,
        });
    }

    /// Makes the next create of a resource store `partial` instead of the
    /// requested attributes and then fail with `error`, as when a follow-up
    /// call breaks after the resource itself was made.
    pub fn interrupt_create(&self, kind: ResourceKind, name: &str, partial: ResourceSpec, error: ProviderError) {
        self.lock().interruptions.push(Interruption {
            kind,
            name: name.to_string(),
            partial,
            error,
        });
    }

    /// Removes all scripted failures.
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.faults.clear();
        state.interruptions.clear();
    }

    /// Hides resources created from now on from the next `lists` listings
    /// of their kind.
    pub fn hide_new_resources(&self, lists: u32) {
        self.lock().hide_new_for = lists;
    }

    /// Caps the number of tags a kind accepts.
    pub fn set_tag_limit(&self, kind: ResourceKind, limit: usize) {
        self.lock().tag_limits.insert(kind, limit);
    }

    /// Delays every call, to make concurrent scheduling observable.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Stores a resource directly, bypassing the provider interface.
    ///
    /// Used to seed resources owned by other environments or left behind
    /// by earlier tooling.
    pub fn seed(&self, tags: BTreeMap<String, String>, spec: ResourceSpec) -> String {
        let mut state = self.lock();
        let kind = spec.kind();
        let id = state.next_id(kind);
        state.records.insert(
            id.clone(),
            Record {
                kind,
                tags,
                spec,
                placement: Vec::new(),
                hidden_lists: 0,
            },
        );
        id
    }

    /// The call log, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    /// Mutating calls (create, update, delete) in the log.
    #[must_use]
    pub fn mutations(&self) -> Vec<CallRecord> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op != ProviderOp::List)
            .cloned()
            .collect()
    }

    /// Every stored resource of a kind, regardless of owner.
    #[must_use]
    pub fn resources(&self, kind: ResourceKind) -> Vec<RemoteResource> {
        self.lock()
            .records
            .iter()
            .filter(|(_, r)| r.kind == kind)
            .map(|(id, r)| RemoteResource {
                remote_id: id.clone(),
                tags: r.tags.clone(),
                spec: r.spec.clone(),
            })
            .collect()
    }

    /// Total number of stored resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }
}

/// Provider for one kind of an [`InMemoryCloud`].
#[derive(Debug)]
struct MemoryProvider {
    kind: ResourceKind,
    cloud: InMemoryCloud,
}

impl MemoryProvider {
    async fn pause(&self) {
        let latency = self.cloud.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn finish<T>(&self, state: &mut CloudState, op: ProviderOp, name: &str, result: ProviderResult<T>) -> ProviderResult<T> {
        state.log(self.kind, op, Some(name), result.is_ok());
        if let Err(e) = &result {
            debug!(kind = %self.kind, resource = name, %op, error = %e, "Memory provider call failed");
        }
        result
    }
}

#[async_trait]
impl ResourceProvider for MemoryProvider {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn tag_limit(&self) -> Option<usize> {
        self.cloud.lock().tag_limits.get(&self.kind).copied()
    }

    async fn list(&self, owner: &OwnerTag) -> ProviderResult<Vec<RemoteResource>> {
        self.pause().await;
        let mut state = self.cloud.lock();
        if let Some(error) = state.take_fault(self.kind, None, ProviderOp::List) {
            state.log(self.kind, ProviderOp::List, None, false);
            return Err(error);
        }

        let mut listed = Vec::new();
        for (id, record) in &mut state.records {
            if record.kind != self.kind || !owner.matches(&record.tags) {
                continue;
            }
            if record.hidden_lists > 0 {
                record.hidden_lists -= 1;
                continue;
            }
            listed.push(RemoteResource {
                remote_id: id.clone(),
                tags: record.tags.clone(),
                spec: record.spec.clone(),
            });
        }
        state.log(self.kind, ProviderOp::List, None, true);
        Ok(listed)
    }

    async fn create(&self, request: &CreateRequest) -> ProviderResult<CreatedResource> {
        self.pause().await;
        let name = request.key.name.as_str();
        let mut state = self.cloud.lock();
        if let Some(error) = state.take_fault(self.kind, Some(name), ProviderOp::Create) {
            return self.finish(&mut state, ProviderOp::Create, name, Err(error));
        }

        let result = (|| {
            if let Some(limit) = state.tag_limits.get(&self.kind)
                && request.tags.len() > *limit
            {
                return Err(ProviderError::invalid(format!(
                    "{} tags exceed the limit of {limit}",
                    request.tags.len()
                )));
            }

            let tags = request.tags.to_map();
            let duplicate = state.records.values().any(|r| {
                r.kind == self.kind
                    && r.tags.get(OWNER_TAG) == tags.get(OWNER_TAG)
                    && r.tags.get(LOGICAL_NAME_TAG) == tags.get(LOGICAL_NAME_TAG)
            });
            if duplicate {
                return Err(ProviderError::AlreadyExists {
                    message: format!("{} already exists", request.name),
                });
            }

            let spec = request.refs.to_remote(&request.spec);
            if let ResourceSpec::Network(network) = &spec
                && network.cidr.parse::<crate::graph::Cidr>().is_err()
            {
                return Err(ProviderError::invalid(format!("invalid CIDR {}", network.cidr)));
            }
            if let Some(missing) = state.missing_reference(&spec) {
                return Err(ProviderError::NotYetVisible {
                    message: format!("referenced {missing} does not exist"),
                });
            }

            let placement = match self.kind {
                ResourceKind::Network => Vec::new(),
                ResourceKind::SecurityGroupRules => {
                    let group = request
                        .refs
                        .get(ResourceKind::SecurityGroup, name)
                        .ok_or_else(|| ProviderError::invalid("rule set without a security group id"))?;
                    vec![group.to_string()]
                }
                _ => {
                    let network = request
                        .refs
                        .network()
                        .ok_or_else(|| ProviderError::invalid("missing network id"))?;
                    if !state.exists(ResourceKind::Network, network) {
                        return Err(ProviderError::NotYetVisible {
                            message: format!("network {network} does not exist"),
                        });
                    }
                    vec![network.to_string()]
                }
            };

            let id = state.next_id(self.kind);
            let hidden_lists = state.hide_new_for;
            let interrupted = state
                .interruptions
                .iter()
                .position(|i| i.kind == self.kind && i.name == name)
                .map(|position| state.interruptions.remove(position));
            let spec = match &interrupted {
                Some(interruption) => request.refs.to_remote(&interruption.partial),
                None => spec,
            };
            state.records.insert(
                id.clone(),
                Record {
                    kind: self.kind,
                    tags: tags.clone(),
                    spec,
                    placement,
                    hidden_lists,
                },
            );
            match interrupted {
                Some(interruption) => Err(interruption.error),
                None => Ok(CreatedResource { remote_id: id, tags }),
            }
        })();

        self.finish(&mut state, ProviderOp::Create, name, result)
    }

    async fn update(&self, request: &UpdateRequest) -> ProviderResult<()> {
        self.pause().await;
        let name = request.key.name.as_str();
        let mut state = self.cloud.lock();
        if let Some(error) = state.take_fault(self.kind, Some(name), ProviderOp::Update) {
            return self.finish(&mut state, ProviderOp::Update, name, Err(error));
        }

        let spec = request.refs.to_remote(&request.desired);
        let result = if !state.exists(self.kind, &request.remote_id) {
            Err(ProviderError::not_found(format!("{} {}", self.kind, request.remote_id)))
        } else if let Some(missing) = state.missing_reference(&spec) {
            Err(ProviderError::NotYetVisible {
                message: format!("referenced {missing} does not exist"),
            })
        } else {
            if let Some(record) = state.records.get_mut(&request.remote_id) {
                record.spec = spec;
            }
            Ok(())
        };

        self.finish(&mut state, ProviderOp::Update, name, result)
    }

    async fn delete(&self, request: &DeleteRequest) -> ProviderResult<()> {
        self.pause().await;
        let name = request.key.name.as_str();
        let mut state = self.cloud.lock();
        if let Some(error) = state.take_fault(self.kind, Some(name), ProviderOp::Delete) {
            return self.finish(&mut state, ProviderOp::Delete, name, Err(error));
        }

        let result = if state.exists(self.kind, &request.remote_id) {
            let dependents = state.dependents_of(&request.remote_id);
            if dependents.is_empty() {
                state.records.remove(&request.remote_id);
                Ok(())
            } else {
                warn!(
                    resource = %request.key,
                    dependents = ?dependents,
                    "Refusing to delete a resource that is still referenced"
                );
                Err(ProviderError::DependencyViolation {
                    message: format!("{} is used by {}", request.remote_id, dependents.join(", ")),
                })
            }
        } else {
            Err(ProviderError::not_found(format!("{} {}", self.kind, request.remote_id)))
        };

        self.finish(&mut state, ProviderOp::Delete, name, result)
    }
}
