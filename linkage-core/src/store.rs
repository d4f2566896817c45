//! Record Store
//!
//! The [`Store`] owns the relationship graph, the materialized records and
//! the reactive arrays handed out to the application. It is the boundary
//! at which changes are coalesced:
//!
//! 1. Every public mutation runs inside a [`Store::batch`].
//! 2. Remote payloads are queued on the graph while the batch runs.
//! 3. When the outermost batch ends the graph is flushed and every touched
//!    relationship and record type is dispatched, once, to the arrays and
//!    listeners observing it.
//!
//! The graph lock is never held while arrays or listeners are notified,
//! so observers may read the store from their callbacks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::config::GraphConfig;
use crate::error::{GraphError, Result};
use crate::graph::{
    ChangedFields, Graph, LocalRelationshipOperation, RelationshipChange, RelationshipDiff,
    RemoteRelationshipOperation,
};
use crate::identity::{IdAssignment, KeyCache, ResourceKey};
use crate::payload::{Document, RelationshipDocument, ResourceObject};
use crate::reactive::{ArrayManager, ArraySnapshot, ArraySource, LiveArray, ManyArray, QueryArray, SubscriberId};
use crate::schema::SchemaService;

/// A materialized resource.
pub struct Record {
    key: ResourceKey,
    attributes: RwLock<Map<String, Value>>,
    is_deleted: AtomicBool,
}

impl Record {
    fn new(key: ResourceKey, attributes: Map<String, Value>) -> Self {
        Self {
            key,
            attributes: RwLock::new(attributes),
            is_deleted: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.attributes.read().get(name).cloned()
    }

    pub fn attributes(&self) -> Map<String, Value> {
        self.attributes.read().clone()
    }

    pub fn set_attribute(&self, name: &str, value: Value) {
        self.attributes.write().insert(name.to_string(), value);
    }

    pub fn is_new(&self) -> bool {
        self.key.is_new()
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted.load(Ordering::Acquire)
    }

    fn merge_attributes(&self, attributes: &Map<String, Value>) {
        let mut current = self.attributes.write();
        for (name, value) in attributes {
            current.insert(name.clone(), value.clone());
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("key", &self.key)
            .field("is_deleted", &self.is_deleted())
            .finish()
    }
}

/// A change delivered to store listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// The local state of a relationship changed.
    Relationship { record: ResourceKey, field: String },
    /// Records of a type were added, deleted or unloaded.
    Records { resource_type: String },
}

type Listener = Arc<dyn Fn(&StoreChange) + Send + Sync>;

#[derive(Default)]
struct BatchState {
    depth: usize,
    record_types: IndexSet<String>,
}

/// Owning record store.
pub struct Store {
    config: GraphConfig,
    schema: Arc<dyn SchemaService>,
    keys: Arc<KeyCache>,
    graph: Mutex<Graph>,
    records: RwLock<HashMap<ResourceKey, Arc<Record>>>,
    many_arrays: Mutex<HashMap<(ResourceKey, String), Arc<ManyArray<StoreManager>>>>,
    live_arrays: Mutex<HashMap<String, Arc<LiveArray<StoreManager>>>>,
    query_arrays: Mutex<Vec<Arc<QueryArray<StoreManager>>>>,
    query_results: Mutex<HashMap<String, ArraySnapshot>>,
    listeners: RwLock<Vec<(SubscriberId, Listener)>>,
    batch: Mutex<BatchState>,
    manager: Arc<StoreManager>,
    next_id: AtomicU64,
}

impl Store {
    pub fn new(schema: Arc<dyn SchemaService>, config: GraphConfig) -> Arc<Self> {
        let keys = Arc::new(KeyCache::new());
        Arc::new_cyclic(|store| Self {
            graph: Mutex::new(Graph::new(Arc::clone(&schema), Arc::clone(&keys), config.clone())),
            config,
            schema,
            keys,
            records: RwLock::new(HashMap::new()),
            many_arrays: Mutex::new(HashMap::new()),
            live_arrays: Mutex::new(HashMap::new()),
            query_arrays: Mutex::new(Vec::new()),
            query_results: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            batch: Mutex::new(BatchState::default()),
            manager: Arc::new(StoreManager {
                store: store.clone(),
            }),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn keys(&self) -> &Arc<KeyCache> {
        &self.keys
    }

    /// Run `f` against the graph. Changes made this way are only
    /// dispatched by the next store mutation.
    pub fn with_graph<T>(&self, f: impl FnOnce(&mut Graph) -> T) -> T {
        f(&mut self.graph.lock())
    }

    // ------------------------------------------------------------------
    // Batching and dispatch
    // ------------------------------------------------------------------

    /// Run `f` as one unit. Notifications are delivered when the
    /// outermost batch ends.
    pub fn batch<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.batch.lock().depth += 1;
        let result = f(self);
        let outermost = {
            let mut batch = self.batch.lock();
            batch.depth -= 1;
            batch.depth == 0
        };
        if !outermost {
            return result;
        }
        let flushed = self.flush();
        let value = result?;
        flushed?;
        Ok(value)
    }

    fn flush(&self) -> Result<()> {
        let (flushed, changes) = {
            let mut graph = self.graph.lock();
            let flushed = graph.flush_remote_queue();
            (flushed, graph.flush_local_queue())
        };
        let record_types = std::mem::take(&mut self.batch.lock().record_types);
        self.dispatch(changes, record_types);
        flushed
    }

    fn touch_type(&self, resource_type: &str) {
        self.batch.lock().record_types.insert(resource_type.to_string());
    }

    fn dispatch(&self, changes: Vec<RelationshipChange>, record_types: IndexSet<String>) {
        if changes.is_empty() && record_types.is_empty() {
            return;
        }
        trace!(
            relationships = changes.len(),
            record_types = record_types.len(),
            "dispatching store changes"
        );

        let many: Vec<_> = {
            let arrays = self.many_arrays.lock();
            changes
                .iter()
                .filter_map(|change| arrays.get(&(change.record.clone(), change.field.clone())).cloned())
                .collect()
        };
        let live: Vec<_> = {
            let arrays = self.live_arrays.lock();
            record_types.iter().filter_map(|t| arrays.get(t).cloned()).collect()
        };
        let queries: Vec<_> = self
            .query_arrays
            .lock()
            .iter()
            .filter(|array| match array.source() {
                ArraySource::Query { resource_type, .. } => record_types.contains(resource_type),
                _ => false,
            })
            .cloned()
            .collect();

        for array in many {
            array.notify();
        }
        for array in live {
            array.notify();
        }
        for array in queries {
            array.notify();
        }

        let listeners: Vec<Listener> = self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        if listeners.is_empty() {
            return;
        }
        let events = changes
            .into_iter()
            .map(|change| StoreChange::Relationship {
                record: change.record,
                field: change.field,
            })
            .chain(
                record_types
                    .into_iter()
                    .map(|resource_type| StoreChange::Records { resource_type }),
            );
        for event in events {
            for listener in &listeners {
                listener(&event);
            }
        }
    }

    /// Observe every dispatched change.
    pub fn subscribe<F>(&self, listener: F) -> SubscriberId
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        let id = SubscriberId::new();
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.listeners.write().retain(|(listener, _)| *listener != id);
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Ingest a document and return the keys of its primary data.
    pub fn push(&self, document: Value) -> Result<Vec<ResourceKey>> {
        let document: Document = serde_json::from_value(document).map_err(|error| GraphError::InvalidPayload {
            resource_type: "document".into(),
            field: String::new(),
            reason: error.to_string(),
        })?;
        self.push_document(&document)
    }

    /// Ingest an already parsed document.
    pub fn push_document(&self, document: &Document) -> Result<Vec<ResourceKey>> {
        self.batch(|store| {
            let primary = document.data.as_ref().map_or(0, |data| data.resources().len());
            let mut keys = Vec::with_capacity(primary);
            for (index, resource) in document.resources().enumerate() {
                let key = store.ingest(resource)?;
                if let (Some(key), true) = (key, index < primary) {
                    keys.push(key);
                }
            }
            debug!(
                primary,
                included = document.included.len(),
                "ingested document"
            );
            Ok(keys)
        })
    }

    fn ingest(&self, resource: &ResourceObject) -> Result<Option<ResourceKey>> {
        let resource_type = &resource.identifier.resource_type;
        if !self.schema.has_type(resource_type) {
            self.config.violation(GraphError::UnknownType(resource_type.clone()))?;
            return Ok(None);
        }
        let Some(key) = self.keys.upgrade(&resource.identifier) else {
            self.config.violation(GraphError::InvalidPayload {
                resource_type: resource_type.clone(),
                field: String::new(),
                reason: "resource has neither an id nor a known lid".into(),
            })?;
            return Ok(None);
        };

        let existing = self.records.read().get(&key).cloned();
        match existing {
            Some(record) => record.merge_attributes(&resource.attributes),
            None => {
                self.records
                    .write()
                    .insert(key.clone(), Arc::new(Record::new(key.clone(), resource.attributes.clone())));
                self.touch_type(resource_type);
            }
        }

        let mut graph = self.graph.lock();
        for (field, value) in &resource.relationships {
            graph.push(RemoteRelationshipOperation::UpdateRelationship {
                record: key.clone(),
                field: field.clone(),
                value: value.clone(),
            })?;
        }
        Ok(Some(key))
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// The record for `key`, if it is loaded.
    pub fn peek_record(&self, key: &ResourceKey) -> Option<Arc<Record>> {
        self.records.read().get(key).cloned()
    }

    /// The record for `(type, id)`, if it is loaded.
    pub fn peek_record_by_id(&self, resource_type: &str, id: &str) -> Option<Arc<Record>> {
        let key = self.keys.peek(resource_type, id)?;
        self.peek_record(&key)
    }

    /// Create a client-side record.
    pub fn create_record(&self, resource_type: &str, attributes: Value) -> Result<ResourceKey> {
        if !self.schema.has_type(resource_type) {
            return Err(GraphError::UnknownType(resource_type.to_string()));
        }
        let attributes = match attributes {
            Value::Object(attributes) => attributes,
            Value::Null => Map::new(),
            other => {
                return Err(GraphError::InvalidPayload {
                    resource_type: resource_type.to_string(),
                    field: String::new(),
                    reason: format!("attributes must be an object, found {other}"),
                })
            }
        };
        self.batch(|store| {
            let key = store.keys.create_local(resource_type);
            store
                .records
                .write()
                .insert(key.clone(), Arc::new(Record::new(key.clone(), attributes)));
            store.touch_type(resource_type);
            debug!(record = %key, "created record");
            Ok(key)
        })
    }

    /// Delete a record. It is detached from every relationship pointing
    /// at it, but local additions elsewhere are kept.
    pub fn delete_record(&self, key: &ResourceKey) -> Result<()> {
        self.batch(|store| {
            if let Some(record) = store.peek_record(key) {
                record.is_deleted.store(true, Ordering::Release);
            }
            store
                .graph
                .lock()
                .push(RemoteRelationshipOperation::DeleteRecord { record: key.clone() })?;
            store.touch_type(key.resource_type());
            Ok(())
        })
    }

    /// Drop a record from memory. Its relationships are dematerialized and
    /// removed entirely once nothing can still reach it.
    pub fn unload_record(&self, key: &ResourceKey) -> Result<()> {
        self.batch(|store| {
            let released = {
                let mut graph = store.graph.lock();
                graph.flush_remote_queue()?;
                graph.unload(key, false)?;
                let releasable = graph.is_releasable(key);
                if releasable {
                    graph.remove(key)?;
                }
                releasable
            };
            store.records.write().remove(key);
            if released {
                store.keys.forget(key);
                let owned: Vec<_> = {
                    let mut arrays = store.many_arrays.lock();
                    let fields: Vec<_> = arrays.keys().filter(|(owner, _)| owner == key).cloned().collect();
                    fields.iter().filter_map(|field| arrays.remove(field)).collect()
                };
                for array in owned {
                    array.destroy(false);
                }
            }
            store.touch_type(key.resource_type());
            debug!(record = %key, released, "unloaded record");
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    /// The related record of a belongsTo. `None` when the relationship is
    /// empty or the related record is not loaded.
    pub fn belongs_to(&self, record: &ResourceKey, field: &str) -> Result<Option<Arc<Record>>> {
        let related = self.graph.lock().get_data(record, field)?.resource().cloned();
        Ok(related.and_then(|key| self.peek_record(&key)))
    }

    /// The related key of a belongsTo, whether or not it is loaded.
    pub fn belongs_to_key(&self, record: &ResourceKey, field: &str) -> Result<Option<ResourceKey>> {
        Ok(self.graph.lock().get_data(record, field)?.resource().cloned())
    }

    /// Set a belongsTo locally.
    pub fn set_belongs_to(&self, record: &ResourceKey, field: &str, value: Option<&ResourceKey>) -> Result<()> {
        self.batch(|store| {
            store.graph.lock().update(
                LocalRelationshipOperation::ReplaceRelatedRecord {
                    record: record.clone(),
                    field: field.to_string(),
                    value: value.cloned(),
                    prior: None,
                    index: None,
                },
                false,
            )
        })
    }

    /// The array of a hasMany. The same array is returned for every call.
    pub fn has_many(&self, record: &ResourceKey, field: &str) -> Result<Arc<ManyArray<StoreManager>>> {
        let meta = self.graph.lock().meta(record, field)?;
        if !meta.is_collection || meta.is_implicit {
            return Err(GraphError::WrongKind {
                op: "hasMany",
                resource_type: record.resource_type().to_string(),
                field: field.to_string(),
                kind: meta.kind.as_str(),
            });
        }
        let array = self
            .many_arrays
            .lock()
            .entry((record.clone(), meta.key.clone()))
            .or_insert_with(|| {
                Arc::new(ManyArray::new(
                    record.clone(),
                    meta.key.clone(),
                    Arc::clone(&self.manager),
                    self.config.clone(),
                ))
            })
            .clone();
        Ok(array)
    }

    /// Revert local relationship edits of `record`.
    pub fn rollback_relationships(&self, record: &ResourceKey) -> Result<ChangedFields> {
        self.batch(|store| store.graph.lock().rollback(record))
    }

    pub fn changed_relationships(&self, record: &ResourceKey) -> indexmap::IndexMap<String, RelationshipDiff> {
        self.graph.lock().changed_relationships(record)
    }

    pub fn has_changed_relationships(&self, record: &ResourceKey) -> bool {
        self.graph.lock().has_changed(record)
    }

    // ------------------------------------------------------------------
    // Arrays
    // ------------------------------------------------------------------

    /// Every loaded record of a type.
    pub fn peek_all(&self, resource_type: &str) -> Arc<LiveArray<StoreManager>> {
        self.live_arrays
            .lock()
            .entry(resource_type.to_string())
            .or_insert_with(|| {
                Arc::new(LiveArray::new(
                    resource_type,
                    Arc::clone(&self.manager),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Ingest the response to `query` and expose its primary data.
    pub fn query(&self, resource_type: &str, query: Value, response: Value) -> Result<Arc<QueryArray<StoreManager>>> {
        let array = Arc::new(QueryArray::new(
            resource_type,
            query,
            Arc::clone(&self.manager),
            self.config.clone(),
        ));
        self.update_query(&array, response)?;
        self.query_arrays.lock().push(Arc::clone(&array));
        Ok(array)
    }

    /// Replace the result of a query with a new response.
    pub fn update_query(&self, array: &QueryArray<StoreManager>, response: Value) -> Result<()> {
        let document: Document = serde_json::from_value(response).map_err(|error| GraphError::InvalidPayload {
            resource_type: array.source().to_string(),
            field: String::new(),
            reason: error.to_string(),
        })?;
        let keys = self.push_document(&document)?;
        let snapshot = ArraySnapshot {
            keys,
            meta: document.meta.clone(),
            links: document.links.clone(),
        };
        self.query_results.lock().insert(array.source().to_string(), snapshot);
        array.notify();
        Ok(())
    }

    /// Release a query array.
    pub fn release_query(&self, array: &Arc<QueryArray<StoreManager>>) {
        self.query_arrays.lock().retain(|other| !Arc::ptr_eq(other, array));
        self.query_results.lock().remove(&array.source().to_string());
        array.destroy(false);
    }

    fn snapshot(&self, source: &ArraySource) -> Result<ArraySnapshot> {
        match source {
            ArraySource::Live { resource_type } => {
                let records = self.records.read();
                let keys = self
                    .keys
                    .keys_of(resource_type)
                    .into_iter()
                    .filter(|key| records.get(key).is_some_and(|record| !record.is_deleted()))
                    .collect();
                Ok(ArraySnapshot::new(keys))
            }
            ArraySource::Query { .. } => {
                let mut snapshot = self
                    .query_results
                    .lock()
                    .get(&source.to_string())
                    .cloned()
                    .unwrap_or_default();
                let records = self.records.read();
                snapshot
                    .keys
                    .retain(|key| records.get(key).is_some_and(|record| !record.is_deleted()));
                Ok(snapshot)
            }
            ArraySource::Many { owner, field } => {
                let data = self.graph.lock().get_data(owner, field)?;
                Ok(ArraySnapshot {
                    keys: data.collection().to_vec(),
                    meta: data.meta,
                    links: data.links,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Saving
    // ------------------------------------------------------------------

    /// Persist records: new records receive an id and local relationship
    /// edits become canonical.
    pub fn save_records(&self, keys: &[ResourceKey]) -> Result<Vec<ResourceKey>> {
        self.batch(|store| keys.iter().map(|key| store.commit_record(key, None)).collect())
    }

    /// Commit a record as the server acknowledged it, optionally with the
    /// id it assigned. Returns the surviving key, which differs from `key`
    /// when the id already belonged to another identity.
    pub fn commit_record(&self, key: &ResourceKey, id: Option<&str>) -> Result<ResourceKey> {
        self.batch(|store| {
            let target = match key.is_new() {
                true => store.assign_id(key, id)?,
                false => key.clone(),
            };
            if store.peek_record(&target).is_some_and(|record| record.is_deleted()) {
                return Ok(target);
            }

            let mut graph = store.graph.lock();
            for (field, diff) in graph.changed_relationships(&target) {
                let value = match diff {
                    RelationshipDiff::Resource { local, .. } => {
                        RelationshipDocument::one(local.as_ref().map(ResourceKey::to_identifier))
                    }
                    RelationshipDiff::Collection { local_state, .. } => {
                        RelationshipDocument::many(local_state.iter().map(ResourceKey::to_identifier).collect())
                    }
                };
                graph.push(RemoteRelationshipOperation::UpdateRelationship {
                    record: target.clone(),
                    field,
                    value,
                })?;
            }
            Ok(target)
        })
    }

    fn assign_id(&self, key: &ResourceKey, id: Option<&str>) -> Result<ResourceKey> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.generate_id(key.resource_type()),
        };
        match self.keys.assign_id(key, &id) {
            IdAssignment::Assigned => {
                debug!(record = %key, "assigned id");
                Ok(key.clone())
            }
            IdAssignment::Conflict { existing } => {
                debug!(record = %key, existing = %existing, "merging identities");
                self.graph.lock().push(RemoteRelationshipOperation::MergeIdentifiers {
                    record: key.clone(),
                    value: existing.clone(),
                })?;
                let duplicate = self.records.write().remove(key);
                match (duplicate, self.peek_record(&existing)) {
                    (Some(duplicate), Some(record)) => record.merge_attributes(&duplicate.attributes()),
                    (Some(duplicate), None) => {
                        let attributes = duplicate.attributes();
                        self.records
                            .write()
                            .insert(existing.clone(), Arc::new(Record::new(existing.clone(), attributes)));
                    }
                    _ => {}
                }
                self.keys.forget(key);
                self.touch_type(key.resource_type());
                Ok(existing)
            }
        }
    }

    fn generate_id(&self, resource_type: &str) -> String {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
            if self.keys.peek(resource_type, &id).is_none() {
                return id;
            }
        }
    }

    /// Tear the store down. Every array is destroyed.
    pub fn destroy(&self) {
        self.graph.lock().destroy();
        self.records.write().clear();
        let many: Vec<_> = self.many_arrays.lock().drain().map(|(_, array)| array).collect();
        let live: Vec<_> = self.live_arrays.lock().drain().map(|(_, array)| array).collect();
        let queries: Vec<_> = self.query_arrays.lock().drain(..).collect();
        for array in many {
            array.destroy(false);
        }
        for array in live {
            array.destroy(false);
        }
        for array in queries {
            array.destroy(false);
        }
        self.listeners.write().clear();
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("records", &self.records.read().len())
            .field("config", &self.config)
            .finish()
    }
}

/// The store's side of the [`ArrayManager`] contract.
pub struct StoreManager {
    store: Weak<Store>,
}

impl StoreManager {
    fn store(&self) -> Result<Arc<Store>> {
        self.store.upgrade().ok_or(GraphError::Destroyed)
    }
}

impl fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreManager")
            .field("live", &(self.store.strong_count() > 0))
            .finish()
    }
}

impl ArrayManager for StoreManager {
    type Record = Arc<Record>;

    fn sync_array(&self, source: &ArraySource) -> Result<ArraySnapshot> {
        self.store()?.snapshot(source)
    }

    fn mutate(&self, op: LocalRelationshipOperation) -> Result<()> {
        self.store()?.batch(|store| store.graph.lock().update(op, false))
    }

    fn get_record(&self, key: &ResourceKey) -> Option<Arc<Record>> {
        self.store.upgrade()?.peek_record(key)
    }

    fn is_batching(&self) -> bool {
        self.store.upgrade().is_some_and(|store| store.batch.lock().depth > 0)
    }

    fn reload(&self, source: &ArraySource) -> Result<()> {
        match source {
            // the cache is the source of truth for live arrays
            ArraySource::Live { .. } => self.store().map(|_| ()),
            other => Err(GraphError::Unsupported(format!("reloading {other} requires a transport"))),
        }
    }

    fn create_record(&self, source: &ArraySource, attributes: Value) -> Result<ResourceKey> {
        let store = self.store()?;
        let resource_type = match source {
            ArraySource::Many { owner, field } => store.graph.lock().meta(owner, field)?.related_type.clone(),
            ArraySource::Live { resource_type } | ArraySource::Query { resource_type, .. } => resource_type.clone(),
        };
        store.create_record(&resource_type, attributes)
    }

    fn save_records(&self, keys: &[ResourceKey]) -> Result<()> {
        self.store()?.save_records(keys).map(|_| ())
    }
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSchema, StaticSchema};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn store() -> Arc<Store> {
        let schema = StaticSchema::new()
            .with_type(
                "person",
                [
                    FieldSchema::has_many("tags", "tag").is_async(false).inverse("person"),
                    FieldSchema::belongs_to("company", "company").is_async(true).inverse("employees"),
                ],
            )
            .with_type(
                "tag",
                [FieldSchema::belongs_to("person", "person").is_async(false).inverse("tags")],
            )
            .with_type(
                "company",
                [FieldSchema::has_many("employees", "person").is_async(true).inverse("company")],
            );
        Store::new(Arc::new(schema), GraphConfig::strict())
    }

    fn person_with_tags(store: &Store) -> ResourceKey {
        store
            .push(json!({
                "data": {
                    "type": "person",
                    "id": "1",
                    "attributes": { "name": "Ada" },
                    "relationships": {
                        "tags": { "data": [{ "type": "tag", "id": "1" }, { "type": "tag", "id": "2" }] }
                    }
                },
                "included": [
                    { "type": "tag", "id": "1", "attributes": { "label": "math" } },
                    { "type": "tag", "id": "2", "attributes": { "label": "code" } }
                ]
            }))
            .unwrap()
            .remove(0)
    }

    #[test]
    fn push_materializes_records_and_relationships() {
        let store = store();
        let person = person_with_tags(&store);
        assert_eq!(store.peek_record(&person).unwrap().attribute("name"), Some(json!("Ada")));

        let tags = store.has_many(&person, "tags").unwrap();
        let labels: Vec<_> = tags
            .records()
            .unwrap()
            .iter()
            .map(|record| record.attribute("label").unwrap())
            .collect();
        assert_eq!(labels, vec![json!("math"), json!("code")]);

        let tag = store.keys().peek("tag", "1").unwrap();
        assert_eq!(store.belongs_to(&tag, "person").unwrap().unwrap().key(), &person);
    }

    #[test]
    fn has_many_returns_the_same_array() {
        let store = store();
        let person = person_with_tags(&store);
        let a = store.has_many(&person, "tags").unwrap();
        let b = store.has_many(&person, "tags").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            store.has_many(&person, "company").unwrap_err(),
            GraphError::WrongKind { op: "hasMany", .. }
        ));
    }

    #[test]
    fn array_mutations_update_inverses() {
        let store = store();
        let person = person_with_tags(&store);
        let tags = store.has_many(&person, "tags").unwrap();
        tags.len().unwrap();

        let tag = store.create_record("tag", json!({ "label": "new" })).unwrap();
        tags.push(vec![tag.clone()]).unwrap();
        assert_eq!(tags.len().unwrap(), 3);
        assert_eq!(store.belongs_to_key(&tag, "person").unwrap(), Some(person.clone()));
        assert!(store.has_changed_relationships(&person));

        store.rollback_relationships(&person).unwrap();
        assert_eq!(tags.len().unwrap(), 2);
        assert_eq!(store.belongs_to_key(&tag, "person").unwrap(), None);
    }

    #[test]
    fn batches_dispatch_once() {
        let store = store();
        let person = person_with_tags(&store);
        let tags = store.has_many(&person, "tags").unwrap();
        tags.len().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        tags.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let extra: Vec<_> = (0..3).map(|_| store.create_record("tag", Value::Null).unwrap()).collect();
        store
            .batch(|store| {
                for tag in &extra {
                    store.set_belongs_to(tag, "person", Some(&person))?;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tags.len().unwrap(), 5);
    }

    #[test]
    fn array_edits_notify_once() {
        let store = store();
        let person = person_with_tags(&store);
        let tags = store.has_many(&person, "tags").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        tags.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let extra = store.create_record("tag", Value::Null).unwrap();
        tags.push(vec![extra.clone()]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        store
            .batch(|_| {
                tags.shift()?;
                tags.pop()?;
                Ok(())
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(tags.len().unwrap(), 1);
    }

    #[test]
    fn listeners_see_relationship_and_record_changes() {
        let store = store();
        let person = person_with_tags(&store);
        store.has_many(&person, "tags").unwrap().len().unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let id = store.subscribe(move |change| sink.lock().push(change.clone()));

        let tag = store.create_record("tag", Value::Null).unwrap();
        store.set_belongs_to(&tag, "person", Some(&person)).unwrap();
        store.unsubscribe(id);
        store.create_record("tag", Value::Null).unwrap();

        assert_eq!(
            *events.lock(),
            vec![
                StoreChange::Records {
                    resource_type: "tag".into()
                },
                StoreChange::Relationship {
                    record: person.clone(),
                    field: "tags".into()
                },
            ]
        );
    }

    #[test]
    fn live_arrays_track_loaded_records() {
        let store = store();
        person_with_tags(&store);
        let tags = store.peek_all("tag");
        assert_eq!(tags.len().unwrap(), 2);
        assert_eq!(tags.push(vec![]).unwrap_err(), GraphError::NotEditable("LiveArray"));

        store.create_record("tag", Value::Null).unwrap();
        assert_eq!(tags.len().unwrap(), 3);

        let tag = store.keys().peek("tag", "1").unwrap();
        store.unload_record(&tag).unwrap();
        assert_eq!(tags.len().unwrap(), 2);
        tags.update().unwrap();
    }

    #[test]
    fn deleting_a_record_detaches_it() {
        let store = store();
        let person = person_with_tags(&store);
        let tags = store.has_many(&person, "tags").unwrap();
        assert_eq!(tags.len().unwrap(), 2);

        let tag = store.keys().peek("tag", "1").unwrap();
        store.delete_record(&tag).unwrap();
        assert_eq!(tags.keys().unwrap(), vec![store.keys().peek("tag", "2").unwrap()]);
        assert!(store.peek_record(&tag).unwrap().is_deleted());
        assert_eq!(store.peek_all("tag").len().unwrap(), 1);
    }

    #[test]
    fn query_arrays_hold_primary_data() {
        let store = store();
        let results = store
            .query(
                "tag",
                json!({ "filter": "math" }),
                json!({ "data": [{ "type": "tag", "id": "1" }], "meta": { "total": 1 } }),
            )
            .unwrap();
        assert_eq!(results.len().unwrap(), 1);
        assert_eq!(results.meta(), Some(json!({ "total": 1 })));
        assert_eq!(results.query(), Some(&json!({ "filter": "math" })));

        store
            .update_query(&results, json!({ "data": [{ "type": "tag", "id": "2" }, { "type": "tag", "id": "3" }] }))
            .unwrap();
        assert_eq!(results.len().unwrap(), 2);
        assert!(matches!(results.update().unwrap_err(), GraphError::Unsupported(_)));

        store.release_query(&results);
        assert!(results.is_destroyed());
    }

    #[test]
    fn saving_makes_local_edits_canonical() {
        let store = store();
        let person = person_with_tags(&store);
        let tags = store.has_many(&person, "tags").unwrap();
        let tag = tags.create_record(json!({ "label": "fresh" })).unwrap();
        assert!(tag.is_new());

        tags.save().unwrap();
        assert!(!tag.is_new());
        assert!(!store.has_changed_relationships(&person));
        assert!(!store.has_changed_relationships(&tag));
        assert_eq!(tags.len().unwrap(), 3);
    }

    #[test]
    fn committing_a_taken_id_merges_identities() {
        let store = store();
        let person = person_with_tags(&store);
        let tag = store.create_record("tag", json!({ "label": "dup" })).unwrap();
        store.set_belongs_to(&tag, "person", Some(&person)).unwrap();

        let survivor = store.commit_record(&tag, Some("1")).unwrap();
        assert_eq!(survivor, store.keys().peek("tag", "1").unwrap());
        assert!(store.peek_record(&tag).is_none());
        assert_eq!(store.peek_record(&survivor).unwrap().attribute("label"), Some(json!("dup")));
        assert_eq!(store.has_many(&person, "tags").unwrap().len().unwrap(), 2);
    }

    #[test]
    fn unknown_types_are_rejected() {
        let store = store();
        assert_eq!(
            store.create_record("widget", Value::Null).unwrap_err(),
            GraphError::UnknownType("widget".into())
        );
        assert!(store.push(json!({ "data": 3 })).is_err());
    }

    #[test]
    fn destroy_tears_down_arrays() {
        let store = store();
        let person = person_with_tags(&store);
        let tags = store.has_many(&person, "tags").unwrap();
        store.destroy();
        assert!(tags.is_destroyed());
        assert!(store.with_graph(|graph| graph.is_destroyed()));
    }
}
