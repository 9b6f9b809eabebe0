//! EC2 tag helpers.

use aws_sdk_ec2::types::{Filter, ResourceType, Tag, TagSpecification};
use std::collections::BTreeMap;

use crate::naming::{LOGICAL_NAME_TAG, OWNER_TAG, OwnerTag, TagSet};

/// EC2 accepts at most 50 tags per resource.
pub const EC2_TAG_LIMIT: usize = 50;

/// Filter matching resources that carry the ownership tag.
pub fn owner_filter(owner: &OwnerTag) -> Filter {
    Filter::builder()
        .name(format!("tag:{}", owner.key))
        .values(&owner.value)
        .build()
}

/// Filter on an arbitrary attribute.
pub fn filter(name: &str, values: impl IntoIterator<Item = impl Into<String>>) -> Filter {
    Filter::builder()
        .name(name)
        .set_values(Some(values.into_iter().map(Into::into).collect()))
        .build()
}

/// Tag specification applying `tags` at creation time.
pub fn tag_spec(resource_type: ResourceType, tags: &TagSet) -> TagSpecification {
    copy_tags(resource_type, &sdk_tags(tags))
}

/// Tag specification copying the tags of another resource, for resources
/// that belong to a node but are made after it.
pub fn copy_tags(resource_type: ResourceType, tags: &[Tag]) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource_type)
        .set_tags(Some(tags.to_vec()))
        .build()
}

/// Converts a tag set to SDK tags.
pub fn sdk_tags(tags: &TagSet) -> Vec<Tag> {
    tags.entries()
        .iter()
        .map(|(key, value)| Tag::builder().key(key).value(value).build())
        .collect()
}

/// Filters matching the identity tags among `tags`; empty unless both the
/// owner and logical name tags are present.
pub fn identity_filters_of(tags: &[Tag]) -> Vec<Filter> {
    let map = tag_map(tags);
    let filters: Vec<Filter> = [OWNER_TAG, LOGICAL_NAME_TAG]
        .into_iter()
        .filter_map(|key| map.get(key).map(|value| filter(&format!("tag:{key}"), [value.as_str()])))
        .collect();
    if filters.len() == 2 { filters } else { Vec::new() }
}

/// Converts SDK tags to a map.
pub fn tag_map(tags: &[Tag]) -> BTreeMap<String, String> {
    tags.iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
        .collect()
}

/// Identifier of an instance group, derived from the identity tags its
/// instances carry. Instance groups have no control-plane object of their
/// own.
pub fn instance_group_id(tags: &BTreeMap<String, String>) -> Option<String> {
    Some(format!("{}/{}", tags.get(OWNER_TAG)?, tags.get(LOGICAL_NAME_TAG)?))
}

/// Splits an instance group identifier into (environment, logical name).
pub fn split_group_id(id: &str) -> Option<(&str, &str)> {
    id.split_once('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_map_skips_keyless() {
        let tags = [
            Tag::builder().key("a").value("1").build(),
            Tag::builder().value("orphan").build(),
            Tag::builder().key("b").build(),
        ];
        let map = tag_map(&tags);
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"], "1");
        assert_eq!(map["b"], "");
    }

    #[test]
    fn test_identity_filters_need_both_tags() {
        let owner = Tag::builder().key(OWNER_TAG).value("staging").build();
        let name = Tag::builder().key(LOGICAL_NAME_TAG).value("staging").build();
        let extra = Tag::builder().key("team").value("infra").build();

        let filters = identity_filters_of(&[owner.clone(), extra, name]);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].name(), Some("tag:vpcforge:environment"));
        assert!(identity_filters_of(&[owner]).is_empty());
    }

    #[test]
    fn test_copy_tags_keeps_every_tag() {
        let tags = [
            Tag::builder().key("a").value("1").build(),
            Tag::builder().key("b").value("2").build(),
        ];
        let spec = copy_tags(ResourceType::InternetGateway, &tags);
        assert_eq!(spec.resource_type(), Some(&ResourceType::InternetGateway));
        assert_eq!(spec.tags().len(), 2);
    }

    #[test]
    fn test_group_id_round_trip() {
        let tags = BTreeMap::from([
            (OWNER_TAG.to_string(), "staging".to_string()),
            (LOGICAL_NAME_TAG.to_string(), "web".to_string()),
        ]);
        let id = instance_group_id(&tags).unwrap();
        assert_eq!(id, "staging/web");
        assert_eq!(split_group_id(&id), Some(("staging", "web")));
        assert_eq!(instance_group_id(&BTreeMap::new()), None);
    }
}
