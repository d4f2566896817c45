//! Graph Registry
//!
//! The [`Graph`] owns every edge of every resource, indexed by
//! `(ResourceKey, storage key)`. Edges are created on first access and
//! live until the resource is removed or unloaded.
//!
//! Mutations enter through [`Graph::update`] (applied immediately) or
//! [`Graph::push`] (queued until the next [`Graph::flush`]). Changes are
//! never delivered while the graph is mid-operation: touched relationships
//! are collected and handed back by `flush`, so the owner can notify
//! observers after it has released the graph.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::definition::{DefinitionCache, EdgeDefinition, UpgradedMeta};
use super::edge::{compute_local_state, CollectionEdge, GraphEdge, ResourceEdge};
use super::operation::{RelationshipChange, RelationshipOperation, RemoteRelationshipOperation};
use super::scheduler::UpdateScheduler;
use crate::config::GraphConfig;
use crate::error::{GraphError, Result};
use crate::identity::{KeyCache, ResourceKey};
use crate::payload::{RelationshipData, RelationshipSnapshot};
use crate::schema::SchemaService;

/// Field names returned by [`Graph::rollback`].
pub type ChangedFields = SmallVec<[String; 4]>;

/// How one relationship differs from its canonical state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipDiff {
    Resource {
        local: Option<ResourceKey>,
        remote: Option<ResourceKey>,
    },
    Collection {
        additions: Vec<ResourceKey>,
        removals: Vec<ResourceKey>,
        local_state: Vec<ResourceKey>,
        remote_state: Vec<ResourceKey>,
        reordered: bool,
    },
}

/// Registry of all relationship edges.
pub struct Graph {
    pub(super) config: GraphConfig,
    pub(super) schema: Arc<dyn SchemaService>,
    pub(super) keys: Arc<KeyCache>,
    pub(super) definitions: DefinitionCache,
    pub(super) edges: HashMap<ResourceKey, IndexMap<String, GraphEdge>>,
    pub(super) scheduler: UpdateScheduler,
    pub(super) transaction: Option<u64>,
    transaction_counter: u64,
    pub(super) removing: Option<ResourceKey>,
    pub(super) silenced: bool,
    is_destroyed: bool,
}

impl Graph {
    /// Create an empty graph.
    pub fn new(schema: Arc<dyn SchemaService>, keys: Arc<KeyCache>, config: GraphConfig) -> Self {
        Self {
            config,
            schema,
            keys,
            definitions: DefinitionCache::new(),
            edges: HashMap::new(),
            scheduler: UpdateScheduler::new(),
            transaction: None,
            transaction_counter: 0,
            removing: None,
            silenced: false,
            is_destroyed: false,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn keys(&self) -> &Arc<KeyCache> {
        &self.keys
    }

    pub fn schema(&self) -> &Arc<dyn SchemaService> {
        &self.schema
    }

    pub fn is_destroyed(&self) -> bool {
        self.is_destroyed
    }

    pub(super) fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed {
            return Err(GraphError::Destroyed);
        }
        Ok(())
    }

    pub(super) fn current_transaction(&self) -> u64 {
        self.transaction.unwrap_or(0)
    }

    /// Resolve the definition of `resource_type.field`.
    pub fn definition(&mut self, resource_type: &str, field: &str) -> Result<Arc<EdgeDefinition>> {
        self.ensure_live()?;
        self.definitions
            .resolve(self.schema.as_ref(), resource_type, field)?
            .ok_or_else(|| GraphError::UnknownRelationship {
                resource_type: resource_type.to_string(),
                field: field.to_string(),
            })
    }

    /// Record that two types are related through polymorphism.
    pub fn register_polymorphic_type(&mut self, a: &str, b: &str) {
        self.definitions.register_polymorphic_type(a, b);
    }

    /// Make sure the edge exists and return its storage key.
    pub(super) fn edge_key(&mut self, record: &ResourceKey, field: &str) -> Result<String> {
        self.ensure_live()?;
        if self
            .edges
            .get(record)
            .is_some_and(|edges| edges.contains_key(field))
        {
            return Ok(field.to_string());
        }

        let resource_type = record.resource_type();
        let definition = self
            .definitions
            .resolve(self.schema.as_ref(), resource_type, field)?
            .ok_or_else(|| GraphError::UnknownRelationship {
                resource_type: resource_type.to_string(),
                field: field.to_string(),
            })?;
        let side = definition
            .side_of(resource_type, field)
            .ok_or_else(|| GraphError::Misconfigured {
                resource_type: resource_type.to_string(),
                field: field.to_string(),
                lhs_key: definition.lhs().key.clone(),
                rhs_key: definition.rhs().key.clone(),
            })?;

        let key = definition.meta(side).key.clone();
        let edges = self.edges.entry(record.clone()).or_default();
        if !edges.contains_key(&key) {
            trace!(record = %record, field = %key, "creating relationship edge");
            edges.insert(key.clone(), GraphEdge::new(record.clone(), definition, side));
        }
        Ok(key)
    }

    /// The edge of `record.field`, created on first access.
    pub fn get(&mut self, record: &ResourceKey, field: &str) -> Result<&GraphEdge> {
        self.edge_mut(record, field).map(|edge| &*edge)
    }

    pub(super) fn edge_mut(&mut self, record: &ResourceKey, field: &str) -> Result<&mut GraphEdge> {
        let key = self.edge_key(record, field)?;
        self.edges
            .get_mut(record)
            .and_then(|edges| edges.get_mut(&key))
            .ok_or_else(|| GraphError::UnknownRelationship {
                resource_type: record.resource_type().to_string(),
                field: key,
            })
    }

    pub(super) fn collection_mut(
        &mut self,
        op: &'static str,
        record: &ResourceKey,
        field: &str,
    ) -> Result<&mut CollectionEdge> {
        match self.edge_mut(record, field)? {
            GraphEdge::Collection(edge) => Ok(edge),
            other => Err(wrong_kind(op, other)),
        }
    }

    pub(super) fn resource_mut(
        &mut self,
        op: &'static str,
        record: &ResourceKey,
        field: &str,
    ) -> Result<&mut ResourceEdge> {
        match self.edge_mut(record, field)? {
            GraphEdge::Resource(edge) => Ok(edge),
            other => Err(wrong_kind(op, other)),
        }
    }

    /// An existing edge, without creating it.
    pub fn peek(&self, record: &ResourceKey, key: &str) -> Option<&GraphEdge> {
        self.edges.get(record).and_then(|edges| edges.get(key))
    }

    pub(super) fn peek_mut(&mut self, record: &ResourceKey, key: &str) -> Option<&mut GraphEdge> {
        self.edges.get_mut(record).and_then(|edges| edges.get_mut(key))
    }

    /// Whether `record.key` has an edge.
    pub fn has(&self, record: &ResourceKey, key: &str) -> bool {
        self.peek(record, key).is_some()
    }

    /// Storage keys of the edges of a record.
    pub fn edge_keys(&self, record: &ResourceKey) -> Vec<String> {
        self.edges
            .get(record)
            .map(|edges| edges.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The meta of `record.field`.
    pub fn meta(&mut self, record: &ResourceKey, field: &str) -> Result<Arc<UpgradedMeta>> {
        Ok(self.get(record, field)?.meta())
    }

    /// Stamp the current transaction on an edge.
    pub(super) fn stamp(&mut self, record: &ResourceKey, key: &str) {
        let transaction = self.current_transaction();
        match self.peek_mut(record, key) {
            Some(GraphEdge::Resource(edge)) => edge.transaction_ref = transaction,
            Some(GraphEdge::Collection(edge)) => edge.transaction_ref = transaction,
            _ => {}
        }
    }

    /// Record that the observable state of `record.key` changed.
    ///
    /// Only edges that have been read are reported, and nothing is
    /// reported for the record being removed.
    pub(super) fn notify_change(&mut self, record: &ResourceKey, key: &str) {
        if self.silenced || self.removing.as_ref() == Some(record) {
            return;
        }
        let accessed = match self.peek(record, key) {
            Some(GraphEdge::Resource(edge)) => edge.accessed,
            Some(GraphEdge::Collection(edge)) => edge.accessed,
            _ => false,
        };
        if accessed {
            self.scheduler.touch(record, key);
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The local view of a relationship. Marks the edge as accessed.
    pub fn get_data(&mut self, record: &ResourceKey, field: &str) -> Result<RelationshipSnapshot> {
        match self.edge_mut(record, field)? {
            GraphEdge::Resource(edge) => {
                edge.accessed = true;
                let data = (edge.local_state.is_some() || edge.state.has_received_data)
                    .then(|| RelationshipData::Resource(edge.local_state.clone()));
                Ok(RelationshipSnapshot {
                    data,
                    links: edge.links.clone(),
                    meta: edge.meta.clone(),
                })
            }
            GraphEdge::Collection(edge) => {
                edge.accessed = true;
                let data = edge
                    .state
                    .has_received_data
                    .then(|| RelationshipData::Collection(edge.local_state().clone()));
                Ok(RelationshipSnapshot {
                    data,
                    links: edge.links.clone(),
                    meta: edge.meta.clone(),
                })
            }
            other => Err(wrong_kind("getData", other)),
        }
    }

    /// The canonical view of a relationship.
    pub fn get_remote_data(&mut self, record: &ResourceKey, field: &str) -> Result<RelationshipSnapshot> {
        match self.edge_mut(record, field)? {
            GraphEdge::Resource(edge) => {
                let data = (edge.remote_state.is_some() || edge.state.has_received_data)
                    .then(|| RelationshipData::Resource(edge.remote_state.clone()));
                Ok(RelationshipSnapshot {
                    data,
                    links: edge.links.clone(),
                    meta: edge.meta.clone(),
                })
            }
            GraphEdge::Collection(edge) => {
                let data = edge
                    .state
                    .has_received_data
                    .then(|| RelationshipData::Collection(edge.remote_state.clone()));
                Ok(RelationshipSnapshot {
                    data,
                    links: edge.links.clone(),
                    meta: edge.meta.clone(),
                })
            }
            other => Err(wrong_kind("getRemoteData", other)),
        }
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    /// Queue a remote operation until the next flush.
    ///
    /// Merges are applied immediately since later operations may already
    /// refer to the surviving identity.
    pub fn push(&mut self, op: RemoteRelationshipOperation) -> Result<()> {
        self.ensure_live()?;
        match &op {
            RemoteRelationshipOperation::DeleteRecord { .. } => self.scheduler.push_deletion(op),
            RemoteRelationshipOperation::UpdateRelationship { record, field, .. } => {
                let key = self.edge_key(record, field)?;
                let kind = self.get(record, &key)?.kind();
                let resource_type = record.resource_type().to_string();
                self.scheduler.push_update(kind, &resource_type, &key, op);
            }
            RemoteRelationshipOperation::MergeIdentifiers { .. } => self.update(op, true)?,
        }
        Ok(())
    }

    /// Whether remote operations are waiting for a flush.
    pub fn has_pending(&self) -> bool {
        self.scheduler.will_sync_remote()
    }

    /// Apply every queued remote operation in one transaction: deletions,
    /// then hasMany updates, then belongsTo updates.
    pub fn flush_remote_queue(&mut self) -> Result<()> {
        if !self.scheduler.will_sync_remote() {
            return Ok(());
        }
        self.transaction_counter += 1;
        let transaction = self.transaction_counter;
        self.transaction = Some(transaction);

        let ops = self.scheduler.take_remote();
        debug!(transaction, operations = ops.len(), "flushing remote relationship updates");
        let result = ops.into_iter().try_for_each(|op| self.update(op, true));

        self.transaction = None;
        result
    }

    /// Drain the relationships touched since the last flush.
    pub fn flush_local_queue(&mut self) -> Vec<RelationshipChange> {
        let changes = self.scheduler.take_changes();
        if !changes.is_empty() {
            trace!(changes = changes.len(), "flushing relationship notifications");
        }
        changes
    }

    /// Flush the remote queue and drain the touched relationships.
    pub fn flush(&mut self) -> Result<Vec<RelationshipChange>> {
        self.flush_remote_queue()?;
        Ok(self.flush_local_queue())
    }

    // ------------------------------------------------------------------
    // Dirty state
    // ------------------------------------------------------------------

    /// Revert every modified relationship of `record` to its canonical
    /// state, returning the fields that changed.
    pub fn rollback(&mut self, record: &ResourceKey) -> Result<ChangedFields> {
        self.ensure_live()?;
        let mut changed = ChangedFields::new();
        for key in self.edge_keys(record) {
            let Some(edge) = self.peek(record, &key) else {
                continue;
            };
            if !edge.is_modified() {
                continue;
            }
            match edge {
                GraphEdge::Resource(edge) => {
                    let remote = edge.remote_state.clone();
                    self.replace_resource(record, &key, remote, false)?;
                }
                GraphEdge::Collection(edge) => {
                    let remote = edge.remote_state.clone();
                    self.replace_records_local(record, &key, remote)?;
                    // a pure reorder does not register as a change
                    self.notify_change(record, &key);
                }
                GraphEdge::Implicit(_) => continue,
            }
            changed.push(key);
        }
        Ok(changed)
    }

    /// Per-field differences between local and canonical state.
    pub fn changed_relationships(&self, record: &ResourceKey) -> IndexMap<String, RelationshipDiff> {
        let Some(edges) = self.edges.get(record) else {
            return IndexMap::new();
        };
        edges
            .iter()
            .filter(|(_, edge)| edge.is_modified())
            .filter_map(|(key, edge)| {
                let diff = match edge {
                    GraphEdge::Resource(edge) => RelationshipDiff::Resource {
                        local: edge.local_state.clone(),
                        remote: edge.remote_state.clone(),
                    },
                    GraphEdge::Collection(edge) => RelationshipDiff::Collection {
                        additions: edge.additions.iter().flatten().cloned().collect(),
                        removals: edge.removals.iter().flatten().cloned().collect(),
                        local_state: compute_local_state(edge),
                        remote_state: edge.remote_state.clone(),
                        reordered: edge.is_reordered(),
                    },
                    GraphEdge::Implicit(_) => return None,
                };
                Some((key.clone(), diff))
            })
            .collect()
    }

    /// Whether any relationship of `record` has local changes.
    pub fn has_changed(&self, record: &ResourceKey) -> bool {
        self.edges
            .get(record)
            .is_some_and(|edges| edges.values().any(GraphEdge::is_modified))
    }

    /// A record must stay materialized while a declared relationship
    /// points at it through an async inverse, unless it was never saved.
    pub fn is_releasable(&self, record: &ResourceKey) -> bool {
        let Some(edges) = self.edges.get(record) else {
            return true;
        };
        !edges
            .values()
            .filter(|edge| !edge.is_implicit())
            .any(|edge| edge.meta().inverse_is_async && !record.is_new())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Dematerialize a record: its inverses are told it went away and its
    /// sync edges are cleared, but the edge map is kept for
    /// rematerialization.
    pub fn unload(&mut self, record: &ResourceKey, silence: bool) -> Result<()> {
        self.ensure_live()?;
        let silenced = silence || self.silenced;
        let previous = std::mem::replace(&mut self.silenced, silenced);
        let result = self.unload_edges(record);
        self.silenced = previous;
        result
    }

    fn unload_edges(&mut self, record: &ResourceKey) -> Result<()> {
        for key in self.edge_keys(record) {
            let is_implicit = self.peek(record, &key).is_some_and(GraphEdge::is_implicit);
            if is_implicit {
                let releasable = self.is_releasable(record);
                let edge = self.edges.get_mut(record).and_then(|edges| edges.shift_remove(&key));
                if let (Some(edge), true) = (edge, releasable) {
                    self.remove_completely_from_inverse(&edge);
                }
            } else {
                self.destroy_relationship(record, &key);
            }
        }
        Ok(())
    }

    /// Delete a record from the graph entirely.
    pub fn remove(&mut self, record: &ResourceKey) -> Result<()> {
        self.ensure_live()?;
        if let Some(removing) = &self.removing {
            if removing != record {
                return Err(GraphError::ReentrantRemoval {
                    removing: removing.to_string(),
                    requested: record.to_string(),
                });
            }
        }
        self.removing = Some(record.clone());
        let result = self.unload(record, false);
        self.edges.remove(record);
        self.scheduler.forget(record);
        self.removing = None;
        debug!(record = %record, "removed record from relationship graph");
        result
    }

    /// Tear down the whole registry.
    pub fn destroy(&mut self) {
        self.edges.clear();
        self.definitions.clear();
        self.scheduler.clear();
        self.is_destroyed = true;
    }

    /// Apply one operation. Remote-only operations require `is_remote`.
    pub fn update(&mut self, op: impl Into<RelationshipOperation>, is_remote: bool) -> Result<()> {
        self.ensure_live()?;
        let op = op.into();
        trace!(op = op.name(), is_remote, "applying relationship operation");
        self.apply(op, is_remote)
    }
}

pub(super) fn wrong_kind(op: &'static str, edge: &GraphEdge) -> GraphError {
    GraphError::WrongKind {
        op,
        resource_type: edge.identifier().resource_type().to_string(),
        field: edge.meta().key.clone(),
        kind: edge.kind().as_str(),
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("config", &self.config)
            .field("records", &self.edges.len())
            .field("pending", &self.scheduler.pending_count())
            .field("touched", &self.scheduler.touched_count())
            .field("is_destroyed", &self.is_destroyed)
            .finish()
    }
}

// ---- Tests ----
