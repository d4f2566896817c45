//! Update Scheduler
//!
//! The scheduler buffers remote operations between flushes and collects
//! the relationships touched by mutations so that each one is reported
//! once per flush.
//!
//! # Algorithm
//!
//! Remote updates are double-buffered:
//!
//! 1. `push` files each operation into one of three buckets: deletions,
//!    hasMany updates and belongsTo updates. Updates are further grouped
//!    by the type and field they target, in arrival order.
//! 2. `take_remote` swaps the buckets out and hands them back in flush
//!    order: every deletion, then every hasMany update, then every
//!    belongsTo update.
//!
//! Applying deletions first keeps a delete from racing a stale write, and
//! applying hasMany before belongsTo means the single-valued side has the
//! last word when a payload carries both sides of a relationship.
//!
//! Notifications are a set keyed by `(record, field)`, so any number of
//! mutations to one edge within a flush yields one change.

use indexmap::{IndexMap, IndexSet};

use super::definition::EdgeKind;
use super::operation::{RelationshipChange, RemoteRelationshipOperation};
use crate::identity::ResourceKey;

type Bucket = IndexMap<(String, String), Vec<RemoteRelationshipOperation>>;

/// Pending remote operations and touched relationships.
#[derive(Debug, Default)]
pub struct UpdateScheduler {
    deletions: Vec<RemoteRelationshipOperation>,
    has_many: Bucket,
    belongs_to: Bucket,
    will_sync_remote: bool,
    touched: IndexSet<(ResourceKey, String)>,
}

impl UpdateScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a deletion.
    pub fn push_deletion(&mut self, op: RemoteRelationshipOperation) {
        self.deletions.push(op);
        self.will_sync_remote = true;
    }

    /// Queue a relationship update for a field of the given kind.
    pub fn push_update(
        &mut self,
        kind: EdgeKind,
        resource_type: &str,
        field: &str,
        op: RemoteRelationshipOperation,
    ) {
        let bucket = match kind {
            EdgeKind::BelongsTo => &mut self.belongs_to,
            EdgeKind::HasMany | EdgeKind::Implicit => &mut self.has_many,
        };
        bucket
            .entry((resource_type.to_string(), field.to_string()))
            .or_default()
            .push(op);
        self.will_sync_remote = true;
    }

    /// Whether a remote flush is pending.
    pub fn will_sync_remote(&self) -> bool {
        self.will_sync_remote
    }

    /// Number of queued remote operations.
    pub fn pending_count(&self) -> usize {
        self.deletions.len()
            + self.has_many.values().map(Vec::len).sum::<usize>()
            + self.belongs_to.values().map(Vec::len).sum::<usize>()
    }

    /// Take every queued remote operation in flush order.
    pub fn take_remote(&mut self) -> Vec<RemoteRelationshipOperation> {
        self.will_sync_remote = false;
        let mut ops = std::mem::take(&mut self.deletions);
        ops.extend(std::mem::take(&mut self.has_many).into_values().flatten());
        ops.extend(std::mem::take(&mut self.belongs_to).into_values().flatten());
        ops
    }

    /// Record a relationship whose observable state changed.
    pub fn touch(&mut self, record: &ResourceKey, field: &str) {
        self.touched.insert((record.clone(), field.to_string()));
    }

    /// Number of relationships awaiting notification.
    pub fn touched_count(&self) -> usize {
        self.touched.len()
    }

    /// Forget pending notifications for a record.
    pub fn forget(&mut self, record: &ResourceKey) {
        self.touched.retain(|(key, _)| key != record);
    }

    /// Drain the touched relationships, one change per edge.
    pub fn take_changes(&mut self) -> Vec<RelationshipChange> {
        std::mem::take(&mut self.touched)
            .into_iter()
            .map(|(record, field)| RelationshipChange { record, field })
            .collect()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.deletions.clear();
        self.has_many.clear();
        self.belongs_to.clear();
        self.touched.clear();
        self.will_sync_remote = false;
    }
}
