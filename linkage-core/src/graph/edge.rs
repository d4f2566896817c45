//! Graph Edges
//!
//! One edge holds the state of one relationship field of one resource.
//! The three kinds are a sum type; every call site matches on the kind
//! because the behavior of a single reference, an ordered collection and
//! an untyped back-reference bag has little in common.

use std::sync::Arc;

use indexmap::IndexSet;
use serde_json::Value;

use super::definition::{EdgeDefinition, EdgeKind, Side, UpgradedMeta};
use crate::identity::ResourceKey;
use crate::payload::Links;

/// Load and freshness flags of a relationship.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationshipState {
    /// Membership data has been received or set locally.
    pub has_received_data: bool,
    /// The relationship is known to be empty.
    pub is_empty: bool,
    /// A link changed without new membership data.
    pub is_stale: bool,
    pub has_failed_load_attempt: bool,
    /// A related async resource was unloaded.
    pub has_dematerialized_inverse: bool,
}

impl RelationshipState {
    fn new() -> Self {
        Self {
            is_empty: true,
            ..Self::default()
        }
    }
}

/// A belongsTo edge.
#[derive(Debug)]
pub struct ResourceEdge {
    pub identifier: ResourceKey,
    pub definition: Arc<EdgeDefinition>,
    pub side: Side,
    pub state: RelationshipState,
    pub local_state: Option<ResourceKey>,
    pub remote_state: Option<ResourceKey>,
    pub links: Option<Links>,
    pub meta: Option<Value>,
    pub transaction_ref: u64,
    pub accessed: bool,
}

/// A hasMany edge.
#[derive(Debug)]
pub struct CollectionEdge {
    pub identifier: ResourceKey,
    pub definition: Arc<EdgeDefinition>,
    pub side: Side,
    pub state: RelationshipState,
    /// Canonical order.
    pub remote_state: Vec<ResourceKey>,
    /// Membership mirror of `remote_state`.
    pub remote_members: IndexSet<ResourceKey>,
    pub additions: Option<IndexSet<ResourceKey>>,
    pub removals: Option<IndexSet<ResourceKey>>,
    /// Memoized local view, `None` until first computed.
    pub local_state: Option<Vec<ResourceKey>>,
    /// The memoized local view must be recomputed.
    pub is_dirty: bool,
    pub links: Option<Links>,
    pub meta: Option<Value>,
    pub transaction_ref: u64,
    pub accessed: bool,
}

/// Back-references for a relationship declared without an inverse.
#[derive(Debug)]
pub struct ImplicitEdge {
    pub identifier: ResourceKey,
    pub definition: Arc<EdgeDefinition>,
    pub side: Side,
    pub local_members: IndexSet<ResourceKey>,
    pub remote_members: IndexSet<ResourceKey>,
}

/// Compute the local view of a collection: remote order with pending
/// removals excised and pending additions appended.
///
/// A clean memo is returned as is, since local inserts and sorts may have
/// placed members at specific positions.
pub fn compute_local_state(edge: &CollectionEdge) -> Vec<ResourceKey> {
    if !edge.is_dirty {
        if let Some(local) = &edge.local_state {
            return local.clone();
        }
    }

    let mut state: Vec<ResourceKey> = edge
        .remote_state
        .iter()
        .filter(|key| !edge.removals.as_ref().is_some_and(|removals| removals.contains(*key)))
        .cloned()
        .collect();
    if let Some(additions) = &edge.additions {
        state.extend(
            additions
                .iter()
                .filter(|key| !edge.remote_members.contains(*key))
                .cloned(),
        );
    }
    state
}

impl CollectionEdge {
    /// The local view, recomputing the memo when needed.
    pub fn local_state(&mut self) -> &Vec<ResourceKey> {
        if self.is_dirty || self.local_state.is_none() {
            let computed = compute_local_state(self);
            self.is_dirty = false;
            self.local_state = Some(computed);
        }
        self.local_state.get_or_insert_with(Vec::new)
    }

    /// Whether a key is visible in the local view.
    pub fn has_local(&self, key: &ResourceKey) -> bool {
        let added = self.additions.as_ref().is_some_and(|a| a.contains(key));
        let removed = self.removals.as_ref().is_some_and(|r| r.contains(key));
        (self.remote_members.contains(key) || added) && !removed
    }

    pub fn has_additions(&self) -> bool {
        self.additions.as_ref().is_some_and(|a| !a.is_empty())
    }

    pub fn has_removals(&self) -> bool {
        self.removals.as_ref().is_some_and(|r| !r.is_empty())
    }

    /// Drop empty delta sets.
    pub fn compact(&mut self) {
        if !self.has_additions() {
            self.additions = None;
        }
        if !self.has_removals() {
            self.removals = None;
        }
    }

    /// Whether the local view orders the remote members differently
    /// from the remote state.
    pub fn is_reordered(&self) -> bool {
        if self.is_dirty {
            return false;
        }
        let Some(local) = &self.local_state else {
            return false;
        };
        let removals = self.removals.as_ref();
        let remote = self
            .remote_state
            .iter()
            .filter(|key| !removals.is_some_and(|r| r.contains(*key)));
        let local = local.iter().filter(|key| self.remote_members.contains(*key));
        !remote.eq(local)
    }

    /// Whether the local view differs from the remote state.
    pub fn is_modified(&self) -> bool {
        self.has_additions() || self.has_removals() || self.is_reordered()
    }
}

/// One relationship edge.
#[derive(Debug)]
pub enum GraphEdge {
    Resource(ResourceEdge),
    Collection(CollectionEdge),
    Implicit(ImplicitEdge),
}

impl GraphEdge {
    /// Create an empty edge for `identifier` on `side` of `definition`.
    pub fn new(identifier: ResourceKey, definition: Arc<EdgeDefinition>, side: Side) -> Self {
        match definition.meta(side).kind {
            EdgeKind::BelongsTo => GraphEdge::Resource(ResourceEdge {
                identifier,
                definition,
                side,
                state: RelationshipState::new(),
                local_state: None,
                remote_state: None,
                links: None,
                meta: None,
                transaction_ref: 0,
                accessed: false,
            }),
            EdgeKind::HasMany => GraphEdge::Collection(CollectionEdge {
                identifier,
                definition,
                side,
                state: RelationshipState::new(),
                remote_state: Vec::new(),
                remote_members: IndexSet::new(),
                additions: None,
                removals: None,
                local_state: None,
                is_dirty: true,
                links: None,
                meta: None,
                transaction_ref: 0,
                accessed: false,
            }),
            EdgeKind::Implicit => GraphEdge::Implicit(ImplicitEdge {
                identifier,
                definition,
                side,
                local_members: IndexSet::new(),
                remote_members: IndexSet::new(),
            }),
        }
    }

    pub fn identifier(&self) -> &ResourceKey {
        match self {
            GraphEdge::Resource(edge) => &edge.identifier,
            GraphEdge::Collection(edge) => &edge.identifier,
            GraphEdge::Implicit(edge) => &edge.identifier,
        }
    }

    pub fn set_identifier(&mut self, identifier: ResourceKey) {
        match self {
            GraphEdge::Resource(edge) => edge.identifier = identifier,
            GraphEdge::Collection(edge) => edge.identifier = identifier,
            GraphEdge::Implicit(edge) => edge.identifier = identifier,
        }
    }

    pub fn definition(&self) -> &Arc<EdgeDefinition> {
        match self {
            GraphEdge::Resource(edge) => &edge.definition,
            GraphEdge::Collection(edge) => &edge.definition,
            GraphEdge::Implicit(edge) => &edge.definition,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            GraphEdge::Resource(edge) => edge.side,
            GraphEdge::Collection(edge) => edge.side,
            GraphEdge::Implicit(edge) => edge.side,
        }
    }

    /// The meta of this edge's side.
    pub fn meta(&self) -> Arc<UpgradedMeta> {
        self.definition().meta(self.side())
    }

    pub fn kind(&self) -> EdgeKind {
        match self {
            GraphEdge::Resource(_) => EdgeKind::BelongsTo,
            GraphEdge::Collection(_) => EdgeKind::HasMany,
            GraphEdge::Implicit(_) => EdgeKind::Implicit,
        }
    }

    pub fn is_implicit(&self) -> bool {
        matches!(self, GraphEdge::Implicit(_))
    }

    pub fn as_resource(&self) -> Option<&ResourceEdge> {
        match self {
            GraphEdge::Resource(edge) => Some(edge),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionEdge> {
        match self {
            GraphEdge::Collection(edge) => Some(edge),
            _ => None,
        }
    }

    pub fn as_implicit(&self) -> Option<&ImplicitEdge> {
        match self {
            GraphEdge::Implicit(edge) => Some(edge),
            _ => None,
        }
    }

    /// Whether the local state differs from the remote state.
    pub fn is_modified(&self) -> bool {
        match self {
            GraphEdge::Resource(edge) => edge.local_state != edge.remote_state,
            GraphEdge::Collection(edge) => edge.is_modified(),
            GraphEdge::Implicit(_) => false,
        }
    }

    /// Every resource this edge points at, remote first.
    pub fn related(&self) -> Vec<ResourceKey> {
        match self {
            GraphEdge::Resource(edge) => {
                let mut related = Vec::with_capacity(2);
                if let Some(remote) = &edge.remote_state {
                    related.push(remote.clone());
                }
                if let Some(local) = &edge.local_state {
                    if edge.remote_state.as_ref() != Some(local) {
                        related.push(local.clone());
                    }
                }
                related
            }
            GraphEdge::Collection(edge) => {
                let mut related = edge.remote_state.clone();
                if let Some(additions) = &edge.additions {
                    related.extend(additions.iter().cloned());
                }
                related
            }
            GraphEdge::Implicit(edge) => {
                let mut related: Vec<ResourceKey> = edge.local_members.iter().cloned().collect();
                related.extend(
                    edge.remote_members
                        .iter()
                        .filter(|key| !edge.local_members.contains(*key))
                        .cloned(),
                );
                related
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::definition::DefinitionCache;
    use crate::identity::KeyCache;
    use crate::schema::{FieldSchema, StaticSchema};

    fn collection(keys: &KeyCache) -> CollectionEdge {
        let schema = StaticSchema::new()
            .with_type("post", [FieldSchema::has_many("tags", "tag").is_async(false)])
            .with_type("tag", [FieldSchema::belongs_to("post", "post").is_async(false)]);
        let definition = DefinitionCache::new()
            .resolve(&schema, "post", "tags")
            .unwrap()
            .unwrap();
        match GraphEdge::new(keys.get_or_create("post", "1"), definition, Side::Lhs) {
            GraphEdge::Collection(edge) => edge,
            other => panic!("expected a collection edge, got {:?}", other.kind()),
        }
    }

    #[test]
    fn local_state_excises_removals_and_appends_additions() {
        let keys = KeyCache::new();
        let mut edge = collection(&keys);
        let (a, b, c, d) = (
            keys.get_or_create("tag", "a"),
            keys.get_or_create("tag", "b"),
            keys.get_or_create("tag", "c"),
            keys.get_or_create("tag", "d"),
        );
        edge.remote_state = vec![a.clone(), b.clone(), c.clone()];
        edge.remote_members = edge.remote_state.iter().cloned().collect();
        edge.removals = Some(IndexSet::from([b.clone()]));
        edge.additions = Some(IndexSet::from([d.clone()]));

        assert_eq!(edge.local_state(), &vec![a, c, d]);
        assert!(!edge.is_dirty);
    }

    #[test]
    fn reorder_is_detected_only_on_a_clean_memo() {
        let keys = KeyCache::new();
        let mut edge = collection(&keys);
        let (a, b) = (keys.get_or_create("tag", "a"), keys.get_or_create("tag", "b"));
        edge.remote_state = vec![a.clone(), b.clone()];
        edge.remote_members = edge.remote_state.iter().cloned().collect();
        edge.local_state = Some(vec![b.clone(), a.clone()]);

        assert!(!edge.is_reordered());
        edge.is_dirty = false;
        assert!(edge.is_reordered());
        assert!(edge.is_modified());

        edge.local_state = Some(vec![a, b]);
        assert!(!edge.is_modified());
    }
}
