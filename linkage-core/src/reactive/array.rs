//! Reactive Resource Array
//!
//! A mutable array view over resource keys. The array caches the keys it
//! last pulled from its [`ArrayManager`] and re-pulls lazily: a change
//! only marks the signal stale, and the next length, index or iteration
//! read synchronizes.
//!
//! Mutations never touch the cache directly. Each one is decomposed into
//! relationship operations that are forwarded to the manager, after which
//! the array marks itself stale so the next read observes the result.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tracing::{trace, warn};

use super::manager::{ArrayManager, ArraySource};
use super::signal::{Signal, SubscriberId};
use crate::config::GraphConfig;
use crate::error::{GraphError, Result};
use crate::graph::LocalRelationshipOperation;
use crate::identity::ResourceKey;
use crate::payload::Links;

#[derive(Debug, Default)]
struct ArrayState {
    keys: Vec<ResourceKey>,
    meta: Option<Value>,
    links: Option<Links>,
    is_updating: bool,
    is_destroying: bool,
    is_destroyed: bool,
}

/// Resets the transaction flag when a mutation ends.
struct Transaction<'a>(&'a AtomicBool);

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Array of resources kept in sync with a manager.
pub struct ReactiveResourceArray<M: ArrayManager> {
    source: ArraySource,
    editable: bool,
    config: GraphConfig,
    manager: Arc<M>,
    signal: Signal,
    state: Mutex<ArrayState>,
    transaction: AtomicBool,
}

impl<M: ArrayManager> ReactiveResourceArray<M> {
    pub fn new(source: ArraySource, editable: bool, manager: Arc<M>, config: GraphConfig) -> Self {
        Self {
            source,
            editable,
            config,
            manager,
            signal: Signal::new(),
            state: Mutex::new(ArrayState::default()),
            transaction: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &ArraySource {
        &self.source
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Whether the next read will re-synchronize.
    pub fn is_stale(&self) -> bool {
        self.signal.is_stale()
    }

    /// The underlying state changed.
    pub fn notify(&self) {
        self.signal.notify();
    }

    pub fn subscribe<F>(&self, notify: F) -> SubscriberId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.signal.subscribe(notify)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.signal.unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn synced(&self) -> Result<MutexGuard<'_, ArrayState>> {
        let mut state = self.state.lock();
        if self.signal.is_stale() && !state.is_destroyed {
            let snapshot = self.manager.sync_array(&self.source)?;
            state.keys = snapshot.keys;
            if snapshot.meta.is_some() {
                state.meta = snapshot.meta;
            }
            if snapshot.links.is_some() {
                state.links = snapshot.links;
            }
            self.signal.mark_clean();
            trace!(source = %self.source, len = state.keys.len(), "synchronized reactive array");
        }
        Ok(state)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.synced()?.keys.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.synced()?.keys.is_empty())
    }

    pub fn get(&self, index: usize) -> Result<Option<ResourceKey>> {
        Ok(self.synced()?.keys.get(index).cloned())
    }

    pub fn contains(&self, key: &ResourceKey) -> Result<bool> {
        Ok(self.synced()?.keys.contains(key))
    }

    /// A copy of the current keys.
    pub fn keys(&self) -> Result<Vec<ResourceKey>> {
        Ok(self.synced()?.keys.clone())
    }

    /// The record at `index`, materialized through the manager.
    pub fn record_at(&self, index: usize) -> Result<Option<M::Record>> {
        let key = self.get(index)?;
        Ok(key.and_then(|key| self.manager.get_record(&key)))
    }

    /// Every record, materialized through the manager. Keys the manager
    /// cannot materialize are skipped.
    pub fn records(&self) -> Result<Vec<M::Record>> {
        let keys = self.keys()?;
        Ok(keys.iter().filter_map(|key| self.manager.get_record(key)).collect())
    }

    // ------------------------------------------------------------------
    // Metadata, settable on any array
    // ------------------------------------------------------------------

    pub fn meta(&self) -> Option<Value> {
        self.state.lock().meta.clone()
    }

    pub fn set_meta(&self, meta: Option<Value>) {
        self.state.lock().meta = meta;
    }

    pub fn links(&self) -> Option<Links> {
        self.state.lock().links.clone()
    }

    pub fn set_links(&self, links: Option<Links>) {
        self.state.lock().links = links;
    }

    pub fn is_updating(&self) -> bool {
        self.state.lock().is_updating
    }

    pub fn set_is_updating(&self, is_updating: bool) {
        self.state.lock().is_updating = is_updating;
    }

    pub fn is_destroying(&self) -> bool {
        self.state.lock().is_destroying
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().is_destroyed
    }

    /// Truncate the array and notify once. Unless `clear` is set the array
    /// is destroyed and rejects further mutation.
    pub fn destroy(&self, clear: bool) {
        {
            let mut state = self.state.lock();
            state.keys.clear();
            state.is_destroying = !clear;
            state.is_destroyed = !clear;
        }
        self.signal.notify();
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    fn begin(&self) -> Result<Transaction<'_>> {
        if !self.editable {
            return Err(GraphError::NotEditable(self.source.kind_name()));
        }
        {
            let state = self.state.lock();
            if state.is_destroyed || state.is_destroying {
                return Err(GraphError::ArrayDestroyed);
            }
        }
        if self.transaction.swap(true, Ordering::AcqRel) {
            return Err(GraphError::ReentrantMutation);
        }
        Ok(Transaction(&self.transaction))
    }

    fn target(&self) -> Result<(ResourceKey, String)> {
        match &self.source {
            ArraySource::Many { owner, field } => Ok((owner.clone(), field.clone())),
            other => Err(GraphError::Unsupported(format!("mutating {other}"))),
        }
    }

    /// Filter out members that would appear twice. Strict mode reports
    /// them; otherwise the unique subset is applied with a warning.
    fn unique_additions(
        &self,
        current: &[ResourceKey],
        leaving: &[ResourceKey],
        values: Vec<ResourceKey>,
    ) -> Result<Vec<ResourceKey>> {
        let mut seen: IndexSet<ResourceKey> = current
            .iter()
            .filter(|key| !leaving.contains(key))
            .cloned()
            .collect();
        let mut unique = Vec::with_capacity(values.len());
        let mut duplicates = Vec::new();
        for value in values {
            if seen.insert(value.clone()) {
                unique.push(value);
            } else {
                duplicates.push(value.to_string());
            }
        }
        if duplicates.is_empty() {
            return Ok(unique);
        }

        if self.config.allow_duplicates {
            warn!(
                source = %self.source,
                ?duplicates,
                "ignoring duplicate records added to a reactive array"
            );
            return Ok(unique);
        }
        let (owner, field) = match &self.source {
            ArraySource::Many { owner, field } => (owner.to_string(), field.clone()),
            other => (other.to_string(), String::new()),
        };
        self.config.violation(GraphError::DuplicateMembers {
            owner,
            field,
            duplicates,
        })?;
        Ok(unique)
    }

    fn forward(&self, op: LocalRelationshipOperation) -> Result<()> {
        trace!(op = op.name(), source = %self.source, "forwarding array mutation");
        let result = self.manager.mutate(op);
        if self.manager.is_batching() {
            self.signal.mark_stale();
        } else {
            // no-op when the manager already reported the change
            self.signal.raise();
        }
        result
    }

    /// Append members, returning the new length.
    pub fn push(&self, values: Vec<ResourceKey>) -> Result<usize> {
        let _transaction = self.begin()?;
        let current = self.keys()?;
        let values = self.unique_additions(&current, &[], values)?;
        if !values.is_empty() {
            let (record, field) = self.target()?;
            self.forward(LocalRelationshipOperation::Add {
                record,
                field,
                value: values,
                index: None,
            })?;
        }
        self.len()
    }

    /// Prepend members, returning the new length.
    pub fn unshift(&self, values: Vec<ResourceKey>) -> Result<usize> {
        let _transaction = self.begin()?;
        let current = self.keys()?;
        let values = self.unique_additions(&current, &[], values)?;
        if !values.is_empty() {
            let (record, field) = self.target()?;
            self.forward(LocalRelationshipOperation::Add {
                record,
                field,
                value: values,
                index: Some(0),
            })?;
        }
        self.len()
    }

    /// Remove and return the last member.
    pub fn pop(&self) -> Result<Option<ResourceKey>> {
        let _transaction = self.begin()?;
        let current = self.keys()?;
        let Some(last) = current.last().cloned() else {
            return Ok(None);
        };
        let (record, field) = self.target()?;
        self.forward(LocalRelationshipOperation::Remove {
            record,
            field,
            value: vec![last.clone()],
            index: Some(current.len() - 1),
        })?;
        Ok(Some(last))
    }

    /// Remove and return the first member.
    pub fn shift(&self) -> Result<Option<ResourceKey>> {
        let _transaction = self.begin()?;
        let current = self.keys()?;
        let Some(first) = current.first().cloned() else {
            return Ok(None);
        };
        let (record, field) = self.target()?;
        self.forward(LocalRelationshipOperation::Remove {
            record,
            field,
            value: vec![first.clone()],
            index: Some(0),
        })?;
        Ok(Some(first))
    }

    /// Remove `delete_count` members at `start` and insert `items` there.
    /// Returns the removed members.
    ///
    /// Replacing the whole array is a single replace operation. Anything
    /// else is a removal followed by an insertion.
    pub fn splice(&self, start: usize, delete_count: usize, items: Vec<ResourceKey>) -> Result<Vec<ResourceKey>> {
        let _transaction = self.begin()?;
        let current = self.keys()?;
        let len = current.len();
        let start = start.min(len);
        let end = start.saturating_add(delete_count).min(len);
        let removed = current[start..end].to_vec();
        let items = self.unique_additions(&current, &removed, items)?;
        let (record, field) = self.target()?;

        if start == 0 && end == len && len > 0 {
            self.forward(LocalRelationshipOperation::ReplaceRelatedRecords {
                record,
                field,
                value: items,
            })?;
            return Ok(removed);
        }

        if !removed.is_empty() {
            self.forward(LocalRelationshipOperation::Remove {
                record: record.clone(),
                field: field.clone(),
                value: removed.clone(),
                index: Some(start),
            })?;
        }
        if !items.is_empty() {
            self.forward(LocalRelationshipOperation::Add {
                record,
                field,
                value: items,
                index: Some(start),
            })?;
        }
        Ok(removed)
    }

    /// Write `value` at `index`. Writing at the length appends.
    pub fn set(&self, index: usize, value: ResourceKey) -> Result<()> {
        let _transaction = self.begin()?;
        let current = self.keys()?;
        let len = current.len();
        if index > len {
            return Err(GraphError::IndexOutOfBounds { index, len });
        }
        let (record, field) = self.target()?;

        if index == len {
            let values = self.unique_additions(&current, &[], vec![value])?;
            if values.is_empty() {
                return Ok(());
            }
            return self.forward(LocalRelationshipOperation::Add {
                record,
                field,
                value: values,
                index: None,
            });
        }

        let prior = current[index].clone();
        if prior == value {
            return Ok(());
        }
        let values = self.unique_additions(&current, std::slice::from_ref(&prior), vec![value])?;
        let Some(value) = values.into_iter().next() else {
            return Ok(());
        };
        self.forward(LocalRelationshipOperation::ReplaceRelatedRecord {
            record,
            field,
            value: Some(value),
            prior: Some(prior),
            index: Some(index),
        })
    }

    /// Reorder members.
    pub fn sort_by<F>(&self, compare: F) -> Result<()>
    where
        F: FnMut(&ResourceKey, &ResourceKey) -> CmpOrdering,
    {
        let _transaction = self.begin()?;
        let mut keys = self.keys()?;
        let before = keys.clone();
        keys.sort_by(compare);
        if keys == before {
            return Ok(());
        }
        let (record, field) = self.target()?;
        self.forward(LocalRelationshipOperation::SortRelatedRecords {
            record,
            field,
            value: keys,
        })
    }

    /// Remove every member.
    pub fn clear(&self) -> Result<()> {
        let _transaction = self.begin()?;
        if self.is_empty()? {
            return Ok(());
        }
        let (record, field) = self.target()?;
        self.forward(LocalRelationshipOperation::ReplaceRelatedRecords {
            record,
            field,
            value: Vec::new(),
        })
    }
}

impl<M: ArrayManager> fmt::Debug for ReactiveResourceArray<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveResourceArray")
            .field("source", &self.source)
            .field("editable", &self.editable)
            .field("stale", &self.signal.is_stale())
            .finish()
    }
}

// ---- Tests ----
