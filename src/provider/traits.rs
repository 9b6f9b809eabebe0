//! Per-kind capability interface consumed by discovery and execution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ProviderResult;
use crate::graph::{NodeKey, ResourceKind, ResourceSpec};
use crate::naming::{OwnerTag, TagSet};

/// A resource as reported by a provider listing.
///
/// References inside `spec` are remote identifiers; discovery maps them
/// back to logical names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResource {
    /// Identifier assigned by the control plane.
    pub remote_id: String,
    /// Tags carried by the resource.
    pub tags: BTreeMap<String, String>,
    /// Reported attributes.
    pub spec: ResourceSpec,
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedResource {
    /// Identifier assigned by the control plane.
    pub remote_id: String,
    /// Tags the resource carries after creation.
    pub tags: BTreeMap<String, String>,
}

/// Remote identifiers of the nodes a request refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRefs {
    ids: BTreeMap<NodeKey, String>,
}

impl ResolvedRefs {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the remote id of a node.
    pub fn insert(&mut self, key: NodeKey, remote_id: impl Into<String>) {
        self.ids.insert(key, remote_id.into());
    }

    /// Remote id of a node.
    #[must_use]
    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<&str> {
        self.ids
            .iter()
            .find(|(k, _)| k.kind == kind && k.name == name)
            .map(|(_, id)| id.as_str())
    }

    /// Remote id of the network, if resolved.
    #[must_use]
    pub fn network(&self) -> Option<&str> {
        self.ids
            .iter()
            .find(|(k, _)| k.kind == ResourceKind::Network)
            .map(|(_, id)| id.as_str())
    }

    /// Returns `spec` with logical references replaced by remote ids.
    #[must_use]
    pub fn to_remote(&self, spec: &ResourceSpec) -> ResourceSpec {
        let mut remote = spec.clone();
        remote.map_refs(|kind, name| self.get(kind, name).map(str::to_string));
        remote
    }

    /// Returns `spec` with remote ids of resolved nodes replaced by their
    /// logical names. Unknown ids are kept.
    #[must_use]
    pub fn to_logical(&self, spec: &ResourceSpec) -> ResourceSpec {
        let mut logical = spec.clone();
        logical.map_refs(|kind, id| {
            self.ids
                .iter()
                .find(|(k, v)| k.kind == kind && v.as_str() == id)
                .map(|(k, _)| k.name.clone())
        });
        logical
    }

    /// Number of resolved references.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if nothing was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Everything a provider needs to create one resource.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Kind and logical name.
    pub key: NodeKey,
    /// Human-readable provider name.
    pub name: String,
    /// Desired attributes, references as logical names.
    pub spec: ResourceSpec,
    /// Tags to apply, already cut to the provider's limit.
    pub tags: TagSet,
    /// Remote ids of every dependency.
    pub refs: ResolvedRefs,
}

/// Everything a provider needs to update one resource in place.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    /// Kind and logical name.
    pub key: NodeKey,
    /// Remote identifier.
    pub remote_id: String,
    /// Attributes as currently reported.
    pub current: ResourceSpec,
    /// Attributes wanted.
    pub desired: ResourceSpec,
    /// Names of the attributes that differ.
    pub changed: Vec<String>,
    /// Remote ids of every node referenced by either spec.
    pub refs: ResolvedRefs,
}

/// Everything a provider needs to delete one resource.
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    /// Kind and logical name.
    pub key: NodeKey,
    /// Remote identifier.
    pub remote_id: String,
    /// Attributes as last reported.
    pub current: ResourceSpec,
    /// Remote ids of every node referenced by the resource.
    pub refs: ResolvedRefs,
}

/// Provider operations, as recorded in logs and fault rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderOp {
    /// Listing owned resources.
    List,
    /// Creating a resource.
    Create,
    /// Updating a resource in place.
    Update,
    /// Deleting a resource.
    Delete,
}

impl fmt::Display for ProviderOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Capability interface for one resource kind.
///
/// Every call returns a classified [`crate::error::ProviderError`]; the
/// engine retries transient ones and fails the node on permanent ones.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// The kind this provider manages.
    fn kind(&self) -> ResourceKind;

    /// Maximum number of tags a resource of this kind may carry.
    fn tag_limit(&self) -> Option<usize>;

    /// Lists every resource carrying the ownership tag.
    async fn list(&self, owner: &OwnerTag) -> ProviderResult<Vec<RemoteResource>>;

    /// Creates a resource and applies its tags.
    async fn create(&self, request: &CreateRequest) -> ProviderResult<CreatedResource>;

    /// Changes the listed attributes of an existing resource.
    async fn update(&self, request: &UpdateRequest) -> ProviderResult<()>;

    /// Deletes a resource.
    async fn delete(&self, request: &DeleteRequest) -> ProviderResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InstanceGroupSpec, SubnetSpec};

    #[test]
    fn test_to_remote_substitutes_known_refs() {
        let mut refs = ResolvedRefs::new();
        refs.insert(NodeKey::new(ResourceKind::Subnet, "private-1"), "subnet-0001");
        refs.insert(NodeKey::new(ResourceKind::SecurityGroup, "web"), "sg-0002");

        let spec = ResourceSpec::InstanceGroup(InstanceGroupSpec {
            ami: "ami-1".into(),
            instance_type: "t3.small".into(),
            count: 1,
            subnets: ["private-1".to_string()].into_iter().collect(),
            security_groups: ["web".to_string(), "external".to_string()].into_iter().collect(),
            key_pair: None,
            user_data: None,
            instance_profile: None,
            source_dest_check: true,
            eip: false,
            termination_protection: false,
            private_ip_address: None,
            volumes: Vec::new(),
        });

        let ResourceSpec::InstanceGroup(remote) = refs.to_remote(&spec) else {
            panic!("kind changed");
        };
        assert!(remote.subnets.contains("subnet-0001"));
        assert!(remote.security_groups.contains("sg-0002"));
        assert!(remote.security_groups.contains("external"));

        let back = refs.to_logical(&ResourceSpec::InstanceGroup(remote));
        assert_eq!(back, spec);
    }

    #[test]
    fn test_network_lookup() {
        let mut refs = ResolvedRefs::new();
        assert_eq!(refs.network(), None);
        refs.insert(NodeKey::new(ResourceKind::Network, "staging"), "vpc-1");
        assert_eq!(refs.network(), Some("vpc-1"));

        let spec = ResourceSpec::Subnet(SubnetSpec {
            cidr: "10.0.0.0/24".into(),
            availability_zone: None,
            public: false,
            route_table: None,
        });
        assert_eq!(refs.to_remote(&spec), spec);
    }
}
