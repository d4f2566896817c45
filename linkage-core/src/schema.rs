//! Relationship Schema
//!
//! The graph does not own model declarations. It asks a [`SchemaService`]
//! for the relationship fields of a resource type and normalizes them into
//! edge definitions. [`StaticSchema`] is an in-memory implementation that
//! can be built in code or loaded from JSON:
//!
//! ```json
//! {
//!   "person": {
//!     "tag": { "kind": "belongsTo", "type": "tag", "options": { "async": false, "inverse": "people" } }
//!   },
//!   "tag": {
//!     "people": { "kind": "hasMany", "type": "person", "options": { "async": false, "inverse": "tag" } }
//!   }
//! }
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Kind of a declared relationship field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationshipKind {
    BelongsTo,
    HasMany,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::BelongsTo => "belongsTo",
            RelationshipKind::HasMany => "hasMany",
        }
    }
}

/// The `inverse` option of a relationship.
///
/// An absent option lets the schema infer the inverse, `null` declares
/// that there is none, and a string names it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum InverseSpec {
    #[default]
    Implied,
    None,
    Named(String),
}

impl InverseSpec {
    pub fn is_implied(&self) -> bool {
        matches!(self, InverseSpec::Implied)
    }

    /// The declared inverse name, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            InverseSpec::Named(name) => Some(name),
            _ => None,
        }
    }
}

impl From<Option<String>> for InverseSpec {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(name) => InverseSpec::Named(name),
            None => InverseSpec::None,
        }
    }
}

impl From<InverseSpec> for Option<String> {
    fn from(value: InverseSpec) -> Self {
        match value {
            InverseSpec::Named(name) => Some(name),
            InverseSpec::Implied | InverseSpec::None => None,
        }
    }
}

/// Options of a relationship field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldOptions {
    /// Must be declared. `None` is rejected when the field is resolved.
    #[serde(rename = "async", default, skip_serializing_if = "Option::is_none")]
    pub is_async: Option<bool>,
    #[serde(default, skip_serializing_if = "InverseSpec::is_implied")]
    pub inverse: InverseSpec,
    #[serde(default)]
    pub polymorphic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_on_remote_update: Option<bool>,
    #[serde(default)]
    pub links_mode: bool,
}

/// A relationship field declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub kind: RelationshipKind,
    /// Public field name. Filled from the map key when omitted in JSON.
    #[serde(default)]
    pub name: String,
    /// The related resource type.
    #[serde(rename = "type")]
    pub related_type: String,
    /// Storage key, when it differs from `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
    #[serde(default)]
    pub options: FieldOptions,
}

impl FieldSchema {
    fn new(kind: RelationshipKind, name: &str, related_type: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            related_type: related_type.to_string(),
            source_key: None,
            options: FieldOptions::default(),
        }
    }

    /// Declare a belongsTo field. `async` still has to be set.
    pub fn belongs_to(name: &str, related_type: &str) -> Self {
        Self::new(RelationshipKind::BelongsTo, name, related_type)
    }

    /// Declare a hasMany field. `async` still has to be set.
    pub fn has_many(name: &str, related_type: &str) -> Self {
        Self::new(RelationshipKind::HasMany, name, related_type)
    }

    pub fn is_async(mut self, is_async: bool) -> Self {
        self.options.is_async = Some(is_async);
        self
    }

    pub fn inverse(mut self, inverse: &str) -> Self {
        self.options.inverse = InverseSpec::Named(inverse.to_string());
        self
    }

    pub fn no_inverse(mut self) -> Self {
        self.options.inverse = InverseSpec::None;
        self
    }

    pub fn polymorphic(mut self) -> Self {
        self.options.polymorphic = true;
        self
    }

    pub fn reset_on_remote_update(mut self, reset: bool) -> Self {
        self.options.reset_on_remote_update = Some(reset);
        self
    }

    pub fn links_mode(mut self) -> Self {
        self.options.links_mode = true;
        self
    }

    pub fn source_key(mut self, key: &str) -> Self {
        self.source_key = Some(key.to_string());
        self
    }

    /// Storage key of the field.
    pub fn key(&self) -> &str {
        self.source_key.as_deref().unwrap_or(&self.name)
    }
}

/// Relationship fields of one type, keyed by field name.
pub type FieldMap = IndexMap<String, FieldSchema>;

/// Source of relationship declarations.
pub trait SchemaService: Send + Sync {
    /// All relationship fields of a type, or `None` for unknown types.
    fn fields(&self, resource_type: &str) -> Option<&FieldMap>;

    /// Whether the type is known.
    fn has_type(&self, resource_type: &str) -> bool {
        self.fields(resource_type).is_some()
    }

    /// Look up a field by name or storage key.
    fn field(&self, resource_type: &str, key: &str) -> Option<&FieldSchema> {
        let fields = self.fields(resource_type)?;
        fields
            .get(key)
            .or_else(|| fields.values().find(|field| field.key() == key))
    }

    /// Resolve the storage key of the inverse of `resource_type.key`.
    ///
    /// An explicit inverse is returned as declared. Otherwise the related
    /// type is scanned for the relationships that point back at
    /// `resource_type` and either leave their own inverse implied or name
    /// this field. One candidate is the inverse, none means there is no
    /// inverse and more than one is a configuration error.
    fn inverse_for(&self, resource_type: &str, key: &str) -> Result<Option<String>> {
        let field = self
            .field(resource_type, key)
            .ok_or_else(|| GraphError::UnknownRelationship {
                resource_type: resource_type.to_string(),
                field: key.to_string(),
            })?;

        match &field.options.inverse {
            InverseSpec::None => Ok(None),
            InverseSpec::Named(name) => Ok(Some(
                self.field(&field.related_type, name)
                    .map(|inverse| inverse.key().to_string())
                    .unwrap_or_else(|| name.clone()),
            )),
            InverseSpec::Implied => {
                let Some(related) = self.fields(&field.related_type) else {
                    return Ok(None);
                };
                let candidates: Vec<&FieldSchema> = related
                    .values()
                    .filter(|candidate| candidate.related_type == resource_type)
                    .filter(|candidate| match &candidate.options.inverse {
                        InverseSpec::Implied => true,
                        InverseSpec::Named(name) => name == &field.name || name == field.key(),
                        InverseSpec::None => false,
                    })
                    .collect();

                match candidates.as_slice() {
                    [] => Ok(None),
                    [inverse] => Ok(Some(inverse.key().to_string())),
                    many => Err(GraphError::AmbiguousInverse {
                        resource_type: resource_type.to_string(),
                        field: key.to_string(),
                        related_type: field.related_type.clone(),
                        candidates: many.iter().map(|c| c.name.clone()).collect(),
                    }),
                }
            }
        }
    }
}

/// In-memory schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticSchema {
    types: IndexMap<String, FieldMap>,
}

impl StaticSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type with its relationship fields.
    pub fn with_type<I>(mut self, resource_type: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = FieldSchema>,
    {
        self.register(resource_type, fields);
        self
    }

    /// Register (or extend) a type.
    pub fn register<I>(&mut self, resource_type: &str, fields: I)
    where
        I: IntoIterator<Item = FieldSchema>,
    {
        let entry = self.types.entry(resource_type.to_string()).or_default();
        for field in fields {
            entry.insert(field.name.clone(), field);
        }
    }

    /// Load a schema from JSON, filling omitted field names from their keys.
    pub fn from_json(input: &str) -> std::result::Result<Self, serde_json::Error> {
        let mut schema: StaticSchema = serde_json::from_str(input)?;
        for fields in schema.types.values_mut() {
            for (name, field) in fields.iter_mut() {
                if field.name.is_empty() {
                    field.name = name.clone();
                }
            }
        }
        Ok(schema)
    }

    /// Registered type names.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

impl SchemaService for StaticSchema {
    fn fields(&self, resource_type: &str) -> Option<&FieldMap> {
        self.types.get(resource_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people_and_tags() -> StaticSchema {
        StaticSchema::new()
            .with_type("person", [FieldSchema::belongs_to("tag", "tag").is_async(false)])
            .with_type("tag", [FieldSchema::has_many("people", "person").is_async(false)])
    }

    #[test]
    fn implied_inverse_is_found() {
        let schema = people_and_tags();
        assert_eq!(schema.inverse_for("person", "tag"), Ok(Some("people".into())));
        assert_eq!(schema.inverse_for("tag", "people"), Ok(Some("tag".into())));
    }

    #[test]
    fn explicit_null_inverse() {
        let schema = StaticSchema::new()
            .with_type("post", [FieldSchema::has_many("tags", "tag").is_async(false).no_inverse()])
            .with_type("tag", [FieldSchema::belongs_to("post", "post").is_async(false)]);
        assert_eq!(schema.inverse_for("post", "tags"), Ok(None));
    }

    #[test]
    fn ambiguous_inverse_is_an_error() {
        let schema = StaticSchema::new()
            .with_type(
                "person",
                [
                    FieldSchema::belongs_to("best_friend", "person").is_async(false),
                    FieldSchema::belongs_to("mentor", "person").is_async(false),
                ],
            );
        assert!(matches!(
            schema.inverse_for("person", "best_friend"),
            Err(GraphError::AmbiguousInverse { .. })
        ));
    }

    #[test]
    fn self_reference_resolves_reflexively() {
        let schema = StaticSchema::new().with_type(
            "person",
            [FieldSchema::belongs_to("best_friend", "person").is_async(false)],
        );
        assert_eq!(
            schema.inverse_for("person", "best_friend"),
            Ok(Some("best_friend".into()))
        );
    }

    #[test]
    fn loads_from_json() {
        let schema = StaticSchema::from_json(
            r#"{
                "person": { "tag": { "kind": "belongsTo", "type": "tag", "options": { "async": false, "inverse": "people" } } },
                "tag": { "people": { "kind": "hasMany", "type": "person", "options": { "async": true, "inverse": null } } }
            }"#,
        )
        .unwrap();

        let tag = schema.field("person", "tag").unwrap();
        assert_eq!(tag.name, "tag");
        assert_eq!(tag.options.inverse, InverseSpec::Named("people".into()));
        let people = schema.field("tag", "people").unwrap();
        assert_eq!(people.options.inverse, InverseSpec::None);
        assert_eq!(people.options.is_async, Some(true));
    }

    #[test]
    fn fields_resolve_by_source_key() {
        let schema = StaticSchema::new().with_type(
            "post",
            [FieldSchema::belongs_to("author", "person").is_async(false).source_key("writer")],
        );
        assert_eq!(schema.field("post", "writer").unwrap().name, "author");
        assert_eq!(schema.field("post", "author").unwrap().key(), "writer");
    }
}
