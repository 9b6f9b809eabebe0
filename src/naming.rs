//! Deterministic naming and ownership tagging.
//!
//! Identity of a live resource is the pair (ownership tag, name tag): the
//! ownership tag carries the environment name and the name tag carries the
//! logical name. The human-readable `Name` tag is derived from both but is
//! never used for lookup.
//!
//! Some kinds (key pairs, load balancers) are addressed by a name that must
//! be unique in the whole account. Those names join the environment and the
//! logical name with `--`, which valid names never contain, so two
//! environments can never produce the same provider name.
//!
//! ## Tag limit policy
//!
//! Tags are kept in priority order: ownership, name, `Name`, kind, then user
//! tags sorted by key. When a provider caps the number of tags, the list is
//! cut from the end, so only user tags with the highest-sorting keys are
//! dropped. Each drop is logged as a warning.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::warn;

use crate::graph::{NodeKey, ResourceKind};

/// Tag key carrying the environment name.
pub const OWNER_TAG: &str = "vpcforge:environment";

/// Tag key carrying the logical name.
pub const LOGICAL_NAME_TAG: &str = "vpcforge:name";

/// Tag key carrying the resource kind (informational).
pub const KIND_TAG: &str = "vpcforge:kind";

/// Conventional display-name tag.
pub const NAME_TAG: &str = "Name";

/// Prefix reserved for engine-managed tags.
pub const RESERVED_PREFIX: &str = "vpcforge:";

/// Joins the environment and the logical name in provider names.
pub const NAME_SEPARATOR: &str = "--";

/// Number of engine-managed tags that are never dropped.
pub const IDENTITY_TAG_COUNT: usize = 2;

/// The ownership filter passed to provider listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerTag {
    /// Tag key.
    pub key: String,
    /// Tag value (the environment name).
    pub value: String,
}

impl OwnerTag {
    /// Returns true if the tag map carries this ownership tag.
    #[must_use]
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        tags.get(&self.key) == Some(&self.value)
    }
}

/// Ordered tag list, highest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSet {
    entries: Vec<(String, String)>,
}

impl TagSet {
    /// Tags in priority order.
    #[must_use]
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a tag value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Cuts the set down to `limit` tags, returning the dropped keys.
    ///
    /// Identity tags survive any limit.
    pub fn truncate(&mut self, limit: usize) -> Vec<String> {
        let keep = limit.max(IDENTITY_TAG_COUNT);
        if self.entries.len() <= keep {
            return Vec::new();
        }
        self.entries.split_off(keep).into_iter().map(|(k, _)| k).collect()
    }

    /// Converts to a map.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries.iter().cloned().collect()
    }
}

/// Naming scheme for one environment.
#[derive(Debug, Clone)]
pub struct Naming {
    environment: String,
    user_tags: BTreeMap<String, String>,
}

impl Naming {
    /// Creates the naming scheme for an environment.
    ///
    /// Reserved keys in `user_tags` are ignored; the validator reports them.
    #[must_use]
    pub fn new(environment: impl Into<String>, user_tags: &BTreeMap<String, String>) -> Self {
        let user_tags = user_tags
            .iter()
            .filter(|(k, _)| !is_reserved_tag(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            environment: environment.into(),
            user_tags,
        }
    }

    /// The environment name.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The ownership filter for this environment.
    #[must_use]
    pub fn owner_tag(&self) -> OwnerTag {
        OwnerTag {
            key: OWNER_TAG.to_string(),
            value: self.environment.clone(),
        }
    }

    /// Human-readable provider name for a node.
    ///
    /// The network is named after the environment; a rule set shares its
    /// group's name; everything else is `{environment}--{logical name}`.
    #[must_use]
    pub fn resource_name(&self, key: &NodeKey) -> String {
        match key.kind {
            ResourceKind::Network => self.environment.clone(),
            _ => format!("{}{NAME_SEPARATOR}{}", self.environment, key.name),
        }
    }

    /// Resource name cut to `max_len` characters.
    ///
    /// Over-long names keep a prefix and gain a short hash of the full
    /// name, so the result stays deterministic and distinct.
    #[must_use]
    pub fn short_name(&self, key: &NodeKey, max_len: usize) -> String {
        let full = self.resource_name(key);
        if full.len() <= max_len {
            return full;
        }
        let digest = hex::encode(Sha256::digest(full.as_bytes()));
        let suffix = &digest[..8];
        let keep = max_len.saturating_sub(suffix.len() + 1);
        let prefix: String = full.chars().take(keep).collect();
        format!("{}-{suffix}", prefix.trim_end_matches('-'))
    }

    /// Full tag set for a node, highest priority first.
    #[must_use]
    pub fn tags_for(&self, key: &NodeKey) -> TagSet {
        let mut entries = vec![
            (OWNER_TAG.to_string(), self.environment.clone()),
            (LOGICAL_NAME_TAG.to_string(), key.name.clone()),
            (NAME_TAG.to_string(), self.resource_name(key)),
            (KIND_TAG.to_string(), key.kind.to_string()),
        ];
        entries.extend(self.user_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        TagSet { entries }
    }

    /// Tag set for a node, cut to a provider limit.
    #[must_use]
    pub fn tags_within(&self, key: &NodeKey, limit: Option<usize>) -> TagSet {
        let mut tags = self.tags_for(key);
        if let Some(limit) = limit {
            let dropped = tags.truncate(limit);
            if !dropped.is_empty() {
                warn!(
                    resource = %key,
                    limit,
                    dropped = ?dropped,
                    "Tag limit reached, dropping lowest-priority tags"
                );
            }
        }
        tags
    }

    /// Recovers the node key of an owned resource from its tags.
    ///
    /// Returns `None` for resources of another environment or without a
    /// name tag.
    #[must_use]
    pub fn identify(&self, kind: ResourceKind, tags: &BTreeMap<String, String>) -> Option<NodeKey> {
        if !self.owner_tag().matches(tags) {
            return None;
        }
        tags.get(LOGICAL_NAME_TAG).map(|name| NodeKey::new(kind, name.clone()))
    }
}

/// Returns true if a user tag key collides with engine-managed tags.
#[must_use]
pub fn is_reserved_tag(key: &str) -> bool {
    key == NAME_TAG || key.starts_with(RESERVED_PREFIX) || key.starts_with("aws:")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naming(env: &str) -> Naming {
        let tags = BTreeMap::from([
            ("team".to_string(), "infra".to_string()),
            ("cost-center".to_string(), "42".to_string()),
            ("Name".to_string(), "ignored".to_string()),
        ]);
        Naming::new(env, &tags)
    }

    #[test]
    fn test_resource_names() {
        let naming = naming("staging");
        assert_eq!(naming.resource_name(&NodeKey::new(ResourceKind::Network, "staging")), "staging");
        assert_eq!(
            naming.resource_name(&NodeKey::new(ResourceKind::Subnet, "private-1")),
            "staging--private-1"
        );
    }

    #[test]
    fn test_tags_priority_order() {
        let tags = naming("staging").tags_for(&NodeKey::new(ResourceKind::Subnet, "web"));
        let keys: Vec<_> = tags.entries().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec![OWNER_TAG, LOGICAL_NAME_TAG, NAME_TAG, KIND_TAG, "cost-center", "team"]);
        assert_eq!(tags.get(NAME_TAG), Some("staging--web"));
    }

    #[test]
    fn test_truncation_keeps_identity_tags() {
        let naming = naming("staging");
        let key = NodeKey::new(ResourceKind::LoadBalancer, "web");

        let tags = naming.tags_within(&key, Some(5));
        assert_eq!(tags.len(), 5);
        assert_eq!(tags.get("cost-center"), Some("42"));
        assert_eq!(tags.get("team"), None);

        let tags = naming.tags_within(&key, Some(1));
        assert_eq!(tags.len(), IDENTITY_TAG_COUNT);
        assert_eq!(tags.get(OWNER_TAG), Some("staging"));
        assert_eq!(tags.get(LOGICAL_NAME_TAG), Some("web"));
    }

    #[test]
    fn test_identify_requires_exact_owner() {
        let a = naming("a-b");
        let b = naming("a");
        let tags = a.tags_for(&NodeKey::new(ResourceKind::Subnet, "c")).to_map();
        let other = b.tags_for(&NodeKey::new(ResourceKind::Subnet, "b-c")).to_map();

        assert_eq!(a.identify(ResourceKind::Subnet, &tags), Some(NodeKey::new(ResourceKind::Subnet, "c")));
        assert_eq!(b.identify(ResourceKind::Subnet, &tags), None);
        assert_eq!(a.identify(ResourceKind::Subnet, &other), None);
    }

    #[test]
    fn test_short_name_is_deterministic() {
        let naming = naming("a-very-long-environment-name");
        let key = NodeKey::new(ResourceKind::LoadBalancer, "public-web-frontend");
        let short = naming.short_name(&key, 32);
        assert!(short.len() <= 32);
        assert_eq!(short, naming.short_name(&key, 32));
        assert_ne!(
            short,
            naming.short_name(&NodeKey::new(ResourceKind::LoadBalancer, "public-web-frontend-2"), 32)
        );
    }

    #[test]
    fn test_account_unique_names_never_collide() {
        let a = naming("a-b");
        let b = naming("a");
        for kind in [ResourceKind::KeyPair, ResourceKind::LoadBalancer] {
            let first = NodeKey::new(kind, "c");
            let second = NodeKey::new(kind, "b-c");
            assert_eq!(a.resource_name(&first), "a-b--c");
            assert_eq!(b.resource_name(&second), "a--b-c");
            assert_ne!(a.resource_name(&first), b.resource_name(&second));
            assert_ne!(a.short_name(&first, 32), b.short_name(&second, 32));
        }

        // Truncated names still differ through the hash of the full name.
        let long_a = naming("production-eu-west");
        let long_b = naming("production-eu");
        let key_a = NodeKey::new(ResourceKind::LoadBalancer, "public-web-frontend");
        let key_b = NodeKey::new(ResourceKind::LoadBalancer, "west-public-web-frontend");
        assert_ne!(long_a.short_name(&key_a, 32), long_b.short_name(&key_b, 32));
    }
}
