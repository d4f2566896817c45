//! Relationship Payloads
//!
//! Wire-facing shapes of a relationship, modelled on JSON:API:
//!
//! ```json
//! { "data": { "type": "tag", "id": "1" }, "links": { "related": "/tags/1" }, "meta": {} }
//! ```
//!
//! `data` distinguishes three cases that matter to the graph: absent (the
//! payload only carries links or meta), `null` / `[]` (the relationship is
//! known to be empty) and present.
//!
//! [`RelationshipSnapshot`] is the graph's own view of a relationship, with
//! identifiers already resolved to [`ResourceKey`]s.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::identity::ResourceKey;

/// A JSON:API resource identifier object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(
        default,
        deserialize_with = "deserialize_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
}

impl ResourceIdentifier {
    /// Identifier with a server id.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: Some(id.into()),
            lid: None,
        }
    }
}

/// Ids are strings on the wire, but numeric ids are common enough in
/// fixtures that they are accepted and stringified.
fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id)),
        Some(Value::Number(id)) => Ok(Some(id.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string or numeric id, found {other}"
        ))),
    }
}

/// Wraps a present field in `Some` so an explicit `null` can be told apart
/// from an absent key.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// A single link, either a bare URL or a link object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Link {
    Href(String),
    Object {
        href: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
}

impl Link {
    /// The link target.
    pub fn href(&self) -> &str {
        match self {
            Link::Href(href) => href,
            Link::Object { href, .. } => href,
        }
    }
}

/// Relationship links.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Links {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<Link>,
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<Link>,
}

/// Resource linkage of a relationship payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Linkage {
    Many(Vec<ResourceIdentifier>),
    One(Option<ResourceIdentifier>),
}

impl Linkage {
    /// True for `null` and `[]`.
    pub fn is_empty(&self) -> bool {
        match self {
            Linkage::Many(items) => items.is_empty(),
            Linkage::One(item) => item.is_none(),
        }
    }
}

/// A relationship object as received from the remote API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDocument {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub data: Option<Linkage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl RelationshipDocument {
    /// Document holding a single resource (or `null`).
    pub fn one(identifier: Option<ResourceIdentifier>) -> Self {
        Self {
            data: Some(Linkage::One(identifier)),
            ..Self::default()
        }
    }

    /// Document holding a list of resources.
    pub fn many(identifiers: Vec<ResourceIdentifier>) -> Self {
        Self {
            data: Some(Linkage::Many(identifiers)),
            ..Self::default()
        }
    }
}

/// A resource object: identity, attributes and relationship payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    #[serde(flatten)]
    pub identifier: ResourceIdentifier,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub relationships: IndexMap<String, RelationshipDocument>,
}

/// Primary data of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Many(Vec<ResourceObject>),
    One(Option<ResourceObject>),
}

impl PrimaryData {
    pub fn resources(&self) -> &[ResourceObject] {
        match self {
            PrimaryData::Many(resources) => resources,
            PrimaryData::One(resource) => resource.as_slice(),
        }
    }
}

/// A top-level document as received from the remote API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub data: Option<PrimaryData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<ResourceObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
}

impl Document {
    /// Every resource in the document, primary data first.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceObject> {
        self.data
            .iter()
            .flat_map(PrimaryData::resources)
            .chain(self.included.iter())
    }
}

/// Resolved relationship data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipData {
    Resource(Option<ResourceKey>),
    Collection(Vec<ResourceKey>),
}

/// The graph's view of one relationship: `{ data, links, meta }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationshipSnapshot {
    /// `None` when nothing is known about the membership yet.
    pub data: Option<RelationshipData>,
    pub links: Option<Links>,
    pub meta: Option<Value>,
}

impl RelationshipSnapshot {
    /// The related resource of a belongsTo snapshot.
    pub fn resource(&self) -> Option<&ResourceKey> {
        match &self.data {
            Some(RelationshipData::Resource(key)) => key.as_ref(),
            _ => None,
        }
    }

    /// The members of a hasMany snapshot, empty when unknown.
    pub fn collection(&self) -> &[ResourceKey] {
        match &self.data {
            Some(RelationshipData::Collection(keys)) => keys,
            _ => &[],
        }
    }

    /// Convert back to a wire document.
    pub fn to_document(&self) -> RelationshipDocument {
        let data = self.data.as_ref().map(|data| match data {
            RelationshipData::Resource(key) => {
                Linkage::One(key.as_ref().map(ResourceKey::to_identifier))
            }
            RelationshipData::Collection(keys) => {
                Linkage::Many(keys.iter().map(ResourceKey::to_identifier).collect())
            }
        });
        RelationshipDocument {
            data,
            links: self.links.clone(),
            meta: self.meta.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_null_and_present_data_are_distinct() {
        let absent: RelationshipDocument =
            serde_json::from_value(json!({ "links": { "related": "/tags" } })).unwrap();
        assert_eq!(absent.data, None);
        assert_eq!(absent.links.unwrap().related.unwrap().href(), "/tags");

        let null: RelationshipDocument = serde_json::from_value(json!({ "data": null })).unwrap();
        assert_eq!(null.data, Some(Linkage::One(None)));
        assert!(null.data.unwrap().is_empty());

        let many: RelationshipDocument = serde_json::from_value(json!({
            "data": [{ "type": "tag", "id": "1" }, { "type": "tag", "id": 2 }]
        }))
        .unwrap();
        assert_eq!(
            many.data,
            Some(Linkage::Many(vec![
                ResourceIdentifier::new("tag", "1"),
                ResourceIdentifier::new("tag", "2"),
            ]))
        );
    }

    #[test]
    fn link_objects_expose_href() {
        let links: Links = serde_json::from_value(json!({
            "related": { "href": "/people/1/tags", "meta": { "count": 3 } },
            "self": "/people/1/relationships/tags"
        }))
        .unwrap();
        assert_eq!(links.related.unwrap().href(), "/people/1/tags");
        assert_eq!(links.self_link.unwrap().href(), "/people/1/relationships/tags");
    }

    #[test]
    fn documents_list_primary_data_before_included() {
        let doc: Document = serde_json::from_value(json!({
            "data": {
                "type": "person",
                "id": "1",
                "attributes": { "name": "Ada" },
                "relationships": { "tags": { "data": [{ "type": "tag", "id": "1" }] } }
            },
            "included": [{ "type": "tag", "id": "1" }]
        }))
        .unwrap();
        let types: Vec<&str> = doc.resources().map(|r| r.identifier.resource_type.as_str()).collect();
        assert_eq!(types, vec!["person", "tag"]);

        let person = &doc.resources().next().unwrap();
        assert_eq!(person.attributes["name"], "Ada");
        assert_eq!(
            person.relationships["tags"].data,
            Some(Linkage::Many(vec![ResourceIdentifier::new("tag", "1")]))
        );

        let empty: Document = serde_json::from_value(json!({ "data": null })).unwrap();
        assert_eq!(empty.data, Some(PrimaryData::One(None)));
        assert_eq!(empty.resources().count(), 0);
    }

    #[test]
    fn null_data_serializes_as_null() {
        let doc = RelationshipDocument::one(None);
        assert_eq!(serde_json::to_value(&doc).unwrap(), json!({ "data": null }));
    }
}
