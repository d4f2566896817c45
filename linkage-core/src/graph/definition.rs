//! Edge Definitions
//!
//! An [`EdgeDefinition`] pairs the two sides of one physical relationship:
//! the field that was resolved first (LHS) and its inverse (RHS). Each side
//! is described by an [`UpgradedMeta`], the normalized form of a schema
//! field with the attributes of the opposite side mirrored into its
//! `inverse_*` fields.
//!
//! # Resolution
//!
//! [`DefinitionCache::resolve`] maps `(type, field)` to a definition:
//!
//! 1. A two-level cache `[type][field]` is consulted first. A cached `None`
//!    records that the field is known not to be a relationship.
//! 2. The schema field is normalized with [`upgrade_meta`].
//! 3. The inverse is resolved through the schema. If the inverse field has
//!    already been resolved (which only happens for polymorphic
//!    relationships) its definition is reused and this type is appended to
//!    the model names of its side.
//! 4. A polymorphic field whose named inverse lives on an abstract type
//!    gets a provisional inverse, replaced once a concrete side is seen.
//! 5. A field without an inverse gets an implicit one, used only for
//!    back-reference bookkeeping.
//!
//! # Design Decisions
//!
//! 1. Definitions are shared through `Arc` and the sides live behind a lock
//!    so that edges created against a provisional inverse observe the
//!    concrete side once it is discovered.
//!
//! 2. Implicit keys embed a per-process seed so they can never collide with
//!    a declared field name.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexSet;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{GraphError, Result};
use crate::schema::{FieldSchema, InverseSpec, RelationshipKind, SchemaService};

/// Prefix of synthesized implicit relationship keys.
pub const IMPLICIT_PREFIX: &str = "implicit-";

fn implicit_seed() -> &'static str {
    static SEED: OnceLock<String> = OnceLock::new();
    SEED.get_or_init(|| {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        millis.to_string()
    })
}

/// Build the implicit inverse key of `resource_type.field`.
pub fn implicit_key(resource_type: &str, field: &str) -> String {
    format!("{IMPLICIT_PREFIX}{resource_type}:{field}{}", implicit_seed())
}

/// Whether a key names an implicit relationship.
pub fn is_implicit_key(key: &str) -> bool {
    key.starts_with(IMPLICIT_PREFIX)
}

/// Kind of one side of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    BelongsTo,
    HasMany,
    Implicit,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::BelongsTo => "belongsTo",
            EdgeKind::HasMany => "hasMany",
            EdgeKind::Implicit => "implicit",
        }
    }
}

impl From<RelationshipKind> for EdgeKind {
    fn from(kind: RelationshipKind) -> Self {
        match kind {
            RelationshipKind::BelongsTo => EdgeKind::BelongsTo,
            RelationshipKind::HasMany => EdgeKind::HasMany,
        }
    }
}

/// Normalized description of one side of a relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradedMeta {
    pub kind: EdgeKind,
    /// Storage key. Edges are indexed by this.
    pub key: String,
    /// Public field name.
    pub name: String,
    /// Type declaring this field.
    pub owner_type: String,
    /// Type of the related resources.
    pub related_type: String,
    pub is_async: bool,
    pub is_implicit: bool,
    pub is_collection: bool,
    pub is_polymorphic: bool,
    pub reset_on_remote_update: bool,
    pub is_links_mode: bool,

    pub inverse_kind: EdgeKind,
    pub inverse_key: String,
    pub inverse_name: String,
    pub inverse_type: String,
    pub inverse_is_async: bool,
    pub inverse_is_implicit: bool,
    pub inverse_is_collection: bool,
    pub inverse_is_polymorphic: bool,
    pub inverse_is_links_mode: bool,
}

impl UpgradedMeta {
    fn blank(kind: EdgeKind, key: String, owner_type: &str, related_type: &str) -> Self {
        Self {
            kind,
            name: key.clone(),
            key,
            owner_type: owner_type.to_string(),
            related_type: related_type.to_string(),
            is_async: false,
            is_implicit: kind == EdgeKind::Implicit,
            is_collection: kind != EdgeKind::BelongsTo,
            is_polymorphic: false,
            reset_on_remote_update: true,
            is_links_mode: false,
            inverse_kind: EdgeKind::Implicit,
            inverse_key: String::new(),
            inverse_name: String::new(),
            inverse_type: String::new(),
            inverse_is_async: false,
            inverse_is_implicit: false,
            inverse_is_collection: false,
            inverse_is_polymorphic: false,
            inverse_is_links_mode: false,
        }
    }
}

/// Normalize a schema field declared on `owner_type`.
pub fn upgrade_meta(field: &FieldSchema, owner_type: &str) -> Result<UpgradedMeta> {
    let is_async = field
        .options
        .is_async
        .ok_or_else(|| GraphError::MissingAsync {
            resource_type: owner_type.to_string(),
            field: field.name.clone(),
        })?;

    let mut meta = UpgradedMeta::blank(
        field.kind.into(),
        field.key().to_string(),
        owner_type,
        &field.related_type,
    );
    meta.name = field.name.clone();
    meta.is_async = is_async;
    meta.is_polymorphic = field.options.polymorphic;
    meta.is_links_mode = field.options.links_mode;
    meta.reset_on_remote_update = if field.options.links_mode {
        false
    } else {
        field.options.reset_on_remote_update.unwrap_or(true)
    };
    Ok(meta)
}

/// Mirror `inverse` into the `inverse_*` attributes of `meta` and make
/// `reset_on_remote_update` agree across both sides.
pub fn sync_meta(meta: &mut UpgradedMeta, inverse: &mut UpgradedMeta) {
    meta.inverse_kind = inverse.kind;
    meta.inverse_key = inverse.key.clone();
    meta.inverse_name = inverse.name.clone();
    meta.inverse_type = inverse.owner_type.clone();
    meta.inverse_is_async = inverse.is_async;
    meta.inverse_is_implicit = inverse.is_implicit;
    meta.inverse_is_collection = inverse.is_collection;
    meta.inverse_is_polymorphic = inverse.is_polymorphic;
    meta.inverse_is_links_mode = inverse.is_links_mode;

    let reset = meta.reset_on_remote_update && inverse.reset_on_remote_update;
    meta.reset_on_remote_update = reset;
    inverse.reset_on_remote_update = reset;
}

fn sync_both(lhs: &mut UpgradedMeta, rhs: &mut UpgradedMeta) {
    sync_meta(lhs, rhs);
    sync_meta(rhs, lhs);
}

/// One side of an [`EdgeDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Lhs,
    Rhs,
}

#[derive(Debug)]
struct Sides {
    lhs: Arc<UpgradedMeta>,
    rhs: Arc<UpgradedMeta>,
    lhs_model_names: IndexSet<String>,
    rhs_model_names: IndexSet<String>,
    rhs_is_initialized: bool,
}

/// Cached pairing of both sides of one relationship.
#[derive(Debug)]
pub struct EdgeDefinition {
    lhs_base_type: String,
    rhs_base_type: String,
    has_inverse: bool,
    is_self_referential: bool,
    is_reflexive: bool,
    sides: RwLock<Sides>,
}

impl EdgeDefinition {
    fn new(mut lhs: UpgradedMeta, mut rhs: UpgradedMeta, has_inverse: bool, rhs_is_initialized: bool) -> Self {
        sync_both(&mut lhs, &mut rhs);
        let lhs_base_type = lhs.owner_type.clone();
        let rhs_base_type = rhs.owner_type.clone();
        let is_self_referential = lhs_base_type == rhs_base_type;
        let is_reflexive = is_self_referential && lhs.key == rhs.key;

        Self {
            is_self_referential,
            is_reflexive,
            has_inverse,
            sides: RwLock::new(Sides {
                lhs: Arc::new(lhs),
                rhs: Arc::new(rhs),
                lhs_model_names: IndexSet::from([lhs_base_type.clone()]),
                rhs_model_names: IndexSet::from([rhs_base_type.clone()]),
                rhs_is_initialized,
            }),
            lhs_base_type,
            rhs_base_type,
        }
    }

    pub fn lhs(&self) -> Arc<UpgradedMeta> {
        Arc::clone(&self.sides.read().lhs)
    }

    pub fn rhs(&self) -> Arc<UpgradedMeta> {
        Arc::clone(&self.sides.read().rhs)
    }

    /// The meta of one side.
    pub fn meta(&self, side: Side) -> Arc<UpgradedMeta> {
        match side {
            Side::Lhs => self.lhs(),
            Side::Rhs => self.rhs(),
        }
    }

    pub fn lhs_base_type(&self) -> &str {
        &self.lhs_base_type
    }

    pub fn rhs_base_type(&self) -> &str {
        &self.rhs_base_type
    }

    /// Concrete types known to use the LHS field.
    pub fn lhs_model_names(&self) -> Vec<String> {
        self.sides.read().lhs_model_names.iter().cloned().collect()
    }

    /// Concrete types known to use the RHS field.
    pub fn rhs_model_names(&self) -> Vec<String> {
        self.sides.read().rhs_model_names.iter().cloned().collect()
    }

    /// False for implicit inverses.
    pub fn has_inverse(&self) -> bool {
        self.has_inverse
    }

    pub fn is_self_referential(&self) -> bool {
        self.is_self_referential
    }

    /// Self-referential with the same field on both sides.
    pub fn is_reflexive(&self) -> bool {
        self.is_reflexive
    }

    /// False while the RHS is a provisional polymorphic placeholder.
    pub fn rhs_is_initialized(&self) -> bool {
        self.sides.read().rhs_is_initialized
    }

    /// Whether `resource_type.key` is the LHS of this definition.
    pub fn is_lhs(&self, resource_type: &str, key: &str) -> bool {
        let sides = self.sides.read();
        names_field(&sides.lhs, key)
            && (self.is_self_referential
                || resource_type == self.lhs_base_type
                || sides.lhs_model_names.contains(resource_type))
    }

    /// Whether `resource_type.key` is the RHS of this definition.
    pub fn is_rhs(&self, resource_type: &str, key: &str) -> bool {
        let sides = self.sides.read();
        names_field(&sides.rhs, key)
            && (self.is_self_referential
                || resource_type == self.rhs_base_type
                || sides.rhs_model_names.contains(resource_type))
    }

    /// The side `resource_type.key` is on, LHS winning for reflexive
    /// definitions.
    pub fn side_of(&self, resource_type: &str, key: &str) -> Option<Side> {
        if self.is_lhs(resource_type, key) {
            Some(Side::Lhs)
        } else if self.is_rhs(resource_type, key) {
            Some(Side::Rhs)
        } else {
            None
        }
    }

    fn add_model_name(&self, side: Side, resource_type: &str) {
        let mut sides = self.sides.write();
        match side {
            Side::Lhs => sides.lhs_model_names.insert(resource_type.to_string()),
            Side::Rhs => sides.rhs_model_names.insert(resource_type.to_string()),
        };
    }

    /// Replace the provisional RHS with the first concrete side.
    fn initialize_rhs(&self, concrete: UpgradedMeta) {
        let mut sides = self.sides.write();
        let mut lhs = (*sides.lhs).clone();
        let mut rhs = concrete;
        sync_both(&mut lhs, &mut rhs);
        sides.rhs_model_names.insert(rhs.owner_type.clone());
        sides.lhs = Arc::new(lhs);
        sides.rhs = Arc::new(rhs);
        sides.rhs_is_initialized = true;
    }

    /// The side whose field is `key` on `resource_type`, ignoring model
    /// names. Used when a new concrete type joins an existing definition.
    fn side_named(&self, resource_type: &str, key: &str) -> Option<Side> {
        let sides = self.sides.read();
        if names_field(&sides.lhs, key) && sides.lhs.owner_type == resource_type {
            Some(Side::Lhs)
        } else if names_field(&sides.rhs, key) && sides.rhs.owner_type == resource_type {
            Some(Side::Rhs)
        } else if names_field(&sides.lhs, key) {
            Some(Side::Lhs)
        } else if names_field(&sides.rhs, key) {
            Some(Side::Rhs)
        } else {
            None
        }
    }
}

fn names_field(meta: &UpgradedMeta, key: &str) -> bool {
    meta.key == key || meta.name == key
}

/// Two-level `[type][field]` cache of resolved definitions.
#[derive(Debug, Default)]
pub struct DefinitionCache {
    cache: HashMap<String, HashMap<String, Option<Arc<EdgeDefinition>>>>,
    polymorphic_lookup: HashMap<String, IndexSet<String>>,
}

impl DefinitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, resource_type: &str, field: &str) -> Option<&Option<Arc<EdgeDefinition>>> {
        self.cache.get(resource_type).and_then(|fields| fields.get(field))
    }

    fn insert(&mut self, resource_type: &str, field: &str, definition: Option<Arc<EdgeDefinition>>) {
        self.cache
            .entry(resource_type.to_string())
            .or_default()
            .insert(field.to_string(), definition);
    }

    fn insert_meta(&mut self, meta: &UpgradedMeta, definition: &Arc<EdgeDefinition>) {
        self.insert(&meta.owner_type, &meta.key, Some(Arc::clone(definition)));
        if meta.name != meta.key {
            self.insert(&meta.owner_type, &meta.name, Some(Arc::clone(definition)));
        }
    }

    /// Record that `a` and `b` are related through polymorphism.
    pub fn register_polymorphic_type(&mut self, a: &str, b: &str) {
        if a == b {
            return;
        }
        self.polymorphic_lookup
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.polymorphic_lookup
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }

    /// Drop every cached definition.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.polymorphic_lookup.clear();
    }

    /// Resolve the definition of `resource_type.field`.
    ///
    /// Returns `Ok(None)` when the field is not a relationship.
    pub fn resolve(
        &mut self,
        schema: &dyn SchemaService,
        resource_type: &str,
        field: &str,
    ) -> Result<Option<Arc<EdgeDefinition>>> {
        if let Some(cached) = self.cached(resource_type, field) {
            return Ok(cached.clone());
        }

        let Some(field_schema) = schema.field(resource_type, field) else {
            return Ok(self.resolve_polymorphic(resource_type, field));
        };

        let lhs = upgrade_meta(field_schema, resource_type)?;
        let inverse_type = lhs.related_type.clone();
        let inverse_key = schema.inverse_for(resource_type, field)?;

        let definition = match inverse_key {
            None => {
                let implicit = UpgradedMeta::blank(
                    EdgeKind::Implicit,
                    implicit_key(resource_type, &lhs.key),
                    &inverse_type,
                    resource_type,
                );
                Arc::new(EdgeDefinition::new(lhs, implicit, false, true))
            }
            Some(inverse_key) => {
                if let Some(Some(existing)) = self.cached(&inverse_type, &inverse_key).cloned() {
                    return Ok(Some(self.join(existing, lhs, resource_type, field)?));
                }

                match schema.field(&inverse_type, &inverse_key) {
                    Some(inverse_field) => {
                        if inverse_field.options.inverse == InverseSpec::None {
                            return Err(GraphError::InverseDeclaredNull {
                                resource_type: resource_type.to_string(),
                                field: field.to_string(),
                                inverse_type,
                                inverse_key,
                            });
                        }
                        let rhs = upgrade_meta(inverse_field, &inverse_type)?;
                        Arc::new(EdgeDefinition::new(lhs, rhs, true, true))
                    }
                    None if lhs.is_polymorphic && !schema.has_type(&inverse_type) => {
                        trace!(
                            resource_type,
                            field,
                            abstract_type = %inverse_type,
                            "using a provisional polymorphic inverse"
                        );
                        let mut placeholder = UpgradedMeta::blank(
                            EdgeKind::BelongsTo,
                            inverse_key,
                            &inverse_type,
                            resource_type,
                        );
                        placeholder.is_async = lhs.is_async;
                        Arc::new(EdgeDefinition::new(lhs, placeholder, true, false))
                    }
                    None => {
                        return Err(GraphError::MissingInverse {
                            resource_type: resource_type.to_string(),
                            field: field.to_string(),
                            inverse_type,
                            inverse_key,
                        })
                    }
                }
            }
        };

        let (lhs, rhs) = (definition.lhs(), definition.rhs());
        self.insert_meta(&lhs, &definition);
        self.insert_meta(&rhs, &definition);
        if field != lhs.key && field != lhs.name {
            self.insert(resource_type, field, Some(Arc::clone(&definition)));
        }
        debug!(
            resource_type,
            field = %lhs.key,
            inverse_type = %rhs.owner_type,
            inverse_key = %rhs.key,
            implicit = rhs.is_implicit,
            "resolved relationship definition"
        );
        Ok(Some(definition))
    }

    /// Attach `resource_type.field` to a definition created from its
    /// inverse. Only polymorphic relationships reach this point.
    fn join(
        &mut self,
        existing: Arc<EdgeDefinition>,
        meta: UpgradedMeta,
        resource_type: &str,
        field: &str,
    ) -> Result<Arc<EdgeDefinition>> {
        let side = existing
            .side_named(resource_type, &meta.key)
            .ok_or_else(|| GraphError::Misconfigured {
                resource_type: resource_type.to_string(),
                field: field.to_string(),
                lhs_key: existing.lhs().key.clone(),
                rhs_key: existing.rhs().key.clone(),
            })?;

        if side == Side::Rhs && !existing.rhs_is_initialized() {
            trace!(resource_type, field, "replacing provisional polymorphic inverse");
            existing.initialize_rhs(meta.clone());
        }
        existing.add_model_name(side, resource_type);
        self.insert(resource_type, &meta.key, Some(Arc::clone(&existing)));
        if meta.name != meta.key {
            self.insert(resource_type, &meta.name, Some(Arc::clone(&existing)));
        }
        Ok(existing)
    }

    /// Fallback for fields a concrete type inherits through a polymorphic
    /// base, such as implicit keys.
    fn resolve_polymorphic(&mut self, resource_type: &str, field: &str) -> Option<Arc<EdgeDefinition>> {
        let found = self.polymorphic_lookup.get(resource_type).and_then(|bases| {
            bases
                .iter()
                .find_map(|base| self.cached(base, field).cloned().flatten())
        });

        match found {
            Some(definition) => {
                if let Some(side) = definition.side_named("", field) {
                    definition.add_model_name(side, resource_type);
                }
                self.insert(resource_type, field, Some(Arc::clone(&definition)));
                Some(definition)
            }
            None => {
                // implicit keys may become resolvable once a polymorphic
                // type is registered
                if !is_implicit_key(field) {
                    self.insert(resource_type, field, None);
                }
                None
            }
        }
    }
}
