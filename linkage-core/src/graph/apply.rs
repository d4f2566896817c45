//! Operation Application
//!
//! One handler per relationship operation. Each handler mutates the edge
//! it targets, then mirrors the change onto the inverse side through the
//! helpers in `inverse.rs`, then records the notification.
//!
//! Local operations move the local view away from the canonical one.
//! Remote operations replace the canonical state and, depending on
//! `reset_on_remote_update`, discard pending local edits.

use indexmap::IndexSet;
use tracing::{debug, warn};

use super::definition::{EdgeKind, UpgradedMeta};
use super::diff::{self, diff_collection};
use super::edge::GraphEdge;
use super::inverse::merge_key;
use super::operation::{LocalRelationshipOperation, RelationshipOperation, RemoteRelationshipOperation};
use super::registry::{wrong_kind, Graph};
use crate::error::{GraphError, Result};
use crate::identity::ResourceKey;
use crate::payload::{Linkage, RelationshipData, RelationshipDocument, ResourceIdentifier};

impl Graph {
    pub(super) fn apply(&mut self, op: RelationshipOperation, is_remote: bool) -> Result<()> {
        match op {
            RelationshipOperation::Remote(op) => {
                let is_merge = matches!(op, RemoteRelationshipOperation::MergeIdentifiers { .. });
                if !is_remote && !is_merge {
                    return Err(GraphError::RemoteOnly(op.name()));
                }
                match op {
                    RemoteRelationshipOperation::UpdateRelationship { record, field, value } => {
                        self.update_relationship(&record, &field, value)
                    }
                    RemoteRelationshipOperation::DeleteRecord { record } => self.delete_record(&record),
                    RemoteRelationshipOperation::MergeIdentifiers { record, value } => {
                        self.merge_identifiers(&record, &value)
                    }
                }
            }
            RelationshipOperation::Local(op) => match op {
                LocalRelationshipOperation::ReplaceRelatedRecord {
                    record,
                    field,
                    value,
                    prior,
                    index,
                } => self.replace_related_record(&record, &field, value, prior, index, is_remote),
                LocalRelationshipOperation::ReplaceRelatedRecords { record, field, value } => {
                    self.replace_related_records(&record, &field, value, is_remote)
                }
                LocalRelationshipOperation::Add {
                    record,
                    field,
                    value,
                    index,
                } => self.add_related(&record, &field, value, index, is_remote),
                LocalRelationshipOperation::Remove { record, field, value, .. } => {
                    self.remove_related(&record, &field, value, is_remote)
                }
                LocalRelationshipOperation::SortRelatedRecords { record, field, value } => {
                    self.sort_related_records(&record, &field, value, is_remote)
                }
            },
        }
    }

    /// Values of a non-polymorphic relationship must have its related
    /// type. Polymorphic values register their concrete type.
    fn check_related(&mut self, meta: &UpgradedMeta, value: &ResourceKey) -> Result<()> {
        let found = value.resource_type();
        if found == meta.related_type {
            return Ok(());
        }
        if meta.is_polymorphic {
            self.definitions.register_polymorphic_type(&meta.related_type, found);
            return Ok(());
        }
        self.config.violation(GraphError::PolymorphicMismatch {
            resource_type: meta.owner_type.clone(),
            field: meta.key.clone(),
            expected: meta.related_type.clone(),
            found: found.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // replaceRelatedRecord
    // ------------------------------------------------------------------

    fn replace_related_record(
        &mut self,
        record: &ResourceKey,
        field: &str,
        value: Option<ResourceKey>,
        prior: Option<ResourceKey>,
        index: Option<usize>,
        is_remote: bool,
    ) -> Result<()> {
        let key = self.edge_key(record, field)?;
        match self.get(record, &key)?.kind() {
            EdgeKind::BelongsTo => self.replace_resource(record, &key, value, is_remote),
            EdgeKind::HasMany => self.replace_collection_member(record, &key, value, prior, index, is_remote),
            EdgeKind::Implicit => Err(wrong_kind("replaceRelatedRecord", self.get(record, &key)?)),
        }
    }

    /// Set a belongsTo.
    pub(super) fn replace_resource(
        &mut self,
        record: &ResourceKey,
        key: &str,
        value: Option<ResourceKey>,
        is_remote: bool,
    ) -> Result<()> {
        let meta = self.meta(record, key)?;
        if let Some(value) = &value {
            self.check_related(&meta, value)?;
        }
        let transaction = self.current_transaction();
        let edge = self.resource_mut("replaceRelatedRecord", record, key)?;
        if is_remote {
            edge.transaction_ref = transaction;
        }
        let existing = if is_remote {
            edge.remote_state.clone()
        } else {
            edge.local_state.clone()
        };

        if value == existing {
            if value.is_none() {
                edge.state.has_received_data = true;
                edge.state.is_empty = true;
            }
            if is_remote {
                self.sync_local_resource(record, key, &meta, existing)?;
            }
            return Ok(());
        }

        if is_remote {
            edge.remote_state = value.clone();
        } else {
            edge.local_state = value.clone();
            edge.state.is_empty = value.is_none();
        }
        edge.state.has_received_data = true;
        edge.state.is_stale = false;
        edge.state.has_failed_load_attempt = false;

        if let Some(existing) = &existing {
            self.remove_from_inverse(existing, &meta.inverse_key, record, is_remote)?;
        }
        if let Some(value) = &value {
            self.add_to_inverse(value, &meta.inverse_key, record, is_remote)?;
        }

        if is_remote {
            self.sync_local_resource(record, key, &meta, existing)
        } else {
            self.notify_change(record, key);
            Ok(())
        }
    }

    /// After a remote belongsTo write, move the local view onto the new
    /// remote value when it had no local edit, or when local edits are
    /// discarded on remote updates. A new local record is kept while the
    /// remote side is empty.
    fn sync_local_resource(
        &mut self,
        record: &ResourceKey,
        key: &str,
        meta: &UpgradedMeta,
        existing: Option<ResourceKey>,
    ) -> Result<()> {
        let edge = self.resource_mut("replaceRelatedRecord", record, key)?;
        let local = edge.local_state.clone();
        let remote = edge.remote_state.clone();
        if local == remote {
            return Ok(());
        }
        if local.as_ref().is_some_and(ResourceKey::is_new) && remote.is_none() {
            return Ok(());
        }
        if local != existing && !meta.reset_on_remote_update {
            return Ok(());
        }

        edge.local_state = remote.clone();
        edge.state.is_empty = remote.is_none();
        if let Some(local) = &local {
            self.remove_from_inverse(local, &meta.inverse_key, record, false)?;
        }
        if let Some(remote) = &remote {
            self.add_to_inverse(remote, &meta.inverse_key, record, false)?;
        }
        self.notify_change(record, key);
        Ok(())
    }

    /// Replace one member of a hasMany, identified by `prior` or by its
    /// position.
    fn replace_collection_member(
        &mut self,
        record: &ResourceKey,
        key: &str,
        value: Option<ResourceKey>,
        prior: Option<ResourceKey>,
        index: Option<usize>,
        is_remote: bool,
    ) -> Result<()> {
        let prior = match (prior, index) {
            (Some(prior), _) => Some(prior),
            (None, Some(index)) => {
                let edge = self.collection_mut("replaceRelatedRecord", record, key)?;
                if is_remote {
                    edge.remote_state.get(index).cloned()
                } else {
                    edge.local_state().get(index).cloned()
                }
            }
            (None, None) => None,
        };
        if prior.is_some() && prior == value {
            return Ok(());
        }

        if let Some(prior) = prior {
            self.remove_related(record, key, vec![prior], is_remote)?;
        }
        if let Some(value) = value {
            self.add_related(record, key, vec![value], index, is_remote)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // replaceRelatedRecords
    // ------------------------------------------------------------------

    fn replace_related_records(
        &mut self,
        record: &ResourceKey,
        field: &str,
        value: Vec<ResourceKey>,
        is_remote: bool,
    ) -> Result<()> {
        let key = self.edge_key(record, field)?;
        self.collection_mut("replaceRelatedRecords", record, &key)?;
        let meta = self.meta(record, &key)?;
        for member in &value {
            self.check_related(&meta, member)?;
        }
        if is_remote {
            self.replace_records_remote(record, &key, &meta, value)
        } else {
            self.replace_records_local(record, &key, value)
        }
    }

    /// Make the local view of a hasMany exactly `value`.
    pub(super) fn replace_records_local(
        &mut self,
        record: &ResourceKey,
        key: &str,
        value: Vec<ResourceKey>,
    ) -> Result<()> {
        let config = self.config.clone();
        let inverse_key = self.meta(record, key)?.inverse_key.clone();
        let edge = self.collection_mut("replaceRelatedRecords", record, key)?;
        let before = edge.local_state().clone();
        let diff = diff_collection(&value, edge, &config)?;

        let old_additions = edge.additions.take().unwrap_or_default();
        let old_removals = edge.removals.take().unwrap_or_default();

        let mut to_add: Vec<ResourceKey> = diff
            .added
            .iter()
            .filter(|key| !old_additions.contains(*key))
            .cloned()
            .collect();
        to_add.extend(
            old_removals
                .iter()
                .filter(|key| !diff.removed.contains(*key))
                .cloned(),
        );
        let mut to_remove: Vec<ResourceKey> = diff
            .removed
            .iter()
            .filter(|key| !old_removals.contains(*key))
            .cloned()
            .collect();
        to_remove.extend(
            old_additions
                .iter()
                .filter(|key| !diff.added.contains(*key))
                .cloned(),
        );

        edge.additions = Some(diff.added);
        edge.removals = Some(diff.removed);
        edge.compact();
        edge.state.has_received_data = true;
        edge.state.is_empty = diff.final_state.is_empty();
        edge.local_state = Some(diff.final_state);
        edge.is_dirty = false;
        let changed = edge.local_state.as_ref() != Some(&before);

        for member in &to_remove {
            self.remove_from_inverse(member, &inverse_key, record, false)?;
        }
        for member in &to_add {
            self.add_to_inverse(member, &inverse_key, record, false)?;
        }
        if changed {
            self.notify_change(record, key);
        }
        Ok(())
    }

    /// Replace the canonical membership of a hasMany.
    fn replace_records_remote(
        &mut self,
        record: &ResourceKey,
        key: &str,
        meta: &UpgradedMeta,
        value: Vec<ResourceKey>,
    ) -> Result<()> {
        let config = self.config.clone();
        let transaction = self.current_transaction();
        let edge = self.collection_mut("replaceRelatedRecords", record, key)?;
        edge.transaction_ref = transaction;
        let before = edge.local_state().clone();
        let diff = diff_collection(&value, edge, &config)?;

        edge.remote_state = diff.final_state.clone();
        edge.remote_members = diff.final_set.clone();
        // confirmed deltas collapse into the canonical state
        if let Some(additions) = edge.additions.as_mut() {
            additions.retain(|key| !diff.final_set.contains(key));
        }
        if let Some(removals) = edge.removals.as_mut() {
            removals.retain(|key| diff.final_set.contains(key));
        }
        edge.compact();
        edge.is_dirty = true;
        edge.state.has_received_data = true;

        for member in &diff.removed {
            self.remove_from_inverse(member, &meta.inverse_key, record, true)?;
        }
        for member in &diff.added {
            self.add_to_inverse(member, &meta.inverse_key, record, true)?;
        }

        if meta.reset_on_remote_update {
            let edge = self.collection_mut("replaceRelatedRecords", record, key)?;
            let reverted: Vec<ResourceKey> = edge.removals.take().into_iter().flatten().collect();
            let dropped: Vec<ResourceKey> = edge
                .additions
                .iter()
                .flatten()
                .filter(|key| !key.is_new())
                .cloned()
                .collect();
            if let Some(additions) = edge.additions.as_mut() {
                additions.retain(ResourceKey::is_new);
            }
            edge.compact();
            edge.is_dirty = true;

            for member in &reverted {
                self.add_to_inverse(member, &meta.inverse_key, record, false)?;
            }
            for member in &dropped {
                self.remove_from_inverse(member, &meta.inverse_key, record, false)?;
            }
        }

        let edge = self.collection_mut("replaceRelatedRecords", record, key)?;
        let after = edge.local_state().clone();
        edge.state.is_empty = after.is_empty();
        if diff.changed || before != after {
            self.notify_change(record, key);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // add / remove / sortRelatedRecords
    // ------------------------------------------------------------------

    fn add_related(
        &mut self,
        record: &ResourceKey,
        field: &str,
        value: Vec<ResourceKey>,
        index: Option<usize>,
        is_remote: bool,
    ) -> Result<()> {
        let key = self.edge_key(record, field)?;
        self.collection_mut("add", record, &key)?;
        let meta = self.meta(record, &key)?;
        let config = self.config.clone();
        let transaction = self.current_transaction();

        for member in &value {
            self.check_related(&meta, member)?;
        }

        let mut changed = false;
        let mut outcome = Ok(());
        for (offset, member) in value.iter().enumerate() {
            let index = index.map(|index| index + offset);
            let edge = self.collection_mut("add", record, &key)?;
            let result = if is_remote {
                edge.transaction_ref = transaction;
                diff::add_remote(edge, member, index)
            } else {
                diff::add_local(edge, member, index)
            };
            outcome = match result {
                Ok(()) => {
                    changed = true;
                    self.add_to_inverse(member, &meta.inverse_key, record, is_remote)
                }
                Err(err) => config.violation(err),
            };
            if outcome.is_err() {
                break;
            }
        }
        // Members applied before a failure stay applied and must be seen.
        if changed {
            self.notify_change(record, &key);
        }
        outcome
    }

    fn remove_related(
        &mut self,
        record: &ResourceKey,
        field: &str,
        value: Vec<ResourceKey>,
        is_remote: bool,
    ) -> Result<()> {
        let key = self.edge_key(record, field)?;
        self.collection_mut("remove", record, &key)?;
        let meta = self.meta(record, &key)?;
        let config = self.config.clone();
        let transaction = self.current_transaction();

        let mut changed = false;
        let mut outcome = Ok(());
        for member in &value {
            let edge = self.collection_mut("remove", record, &key)?;
            let result = if is_remote {
                edge.transaction_ref = transaction;
                diff::remove_remote(edge, member)
            } else {
                diff::remove_local(edge, member)
            };
            outcome = match result {
                Ok(()) => {
                    changed = true;
                    self.remove_from_inverse(member, &meta.inverse_key, record, is_remote)
                }
                Err(err) => config.violation(err),
            };
            if outcome.is_err() {
                break;
            }
        }
        if changed {
            self.notify_change(record, &key);
        }
        outcome
    }

    fn sort_related_records(
        &mut self,
        record: &ResourceKey,
        field: &str,
        value: Vec<ResourceKey>,
        is_remote: bool,
    ) -> Result<()> {
        let key = self.edge_key(record, field)?;
        let config = self.config.clone();
        let edge = self.collection_mut("sortRelatedRecords", record, &key)?;

        let same_members = {
            let sorted: IndexSet<&ResourceKey> = value.iter().collect();
            sorted.len() == value.len()
                && if is_remote {
                    sorted.len() == edge.remote_members.len()
                        && sorted.iter().all(|key| edge.remote_members.contains(*key))
                } else {
                    let local = edge.local_state();
                    sorted.len() == local.len() && local.iter().all(|key| sorted.contains(key))
                }
        };
        if !same_members {
            return config.violation(GraphError::MembershipChanged {
                owner: record.to_string(),
                field: key,
            });
        }

        if is_remote {
            edge.remote_state = value;
            edge.is_dirty = true;
        } else {
            edge.local_state = Some(value);
            edge.is_dirty = false;
        }
        self.notify_change(record, &key);
        Ok(())
    }

    // ------------------------------------------------------------------
    // updateRelationship
    // ------------------------------------------------------------------

    fn update_relationship(
        &mut self,
        record: &ResourceKey,
        field: &str,
        document: RelationshipDocument,
    ) -> Result<()> {
        let key = self.edge_key(record, field)?;
        let edge = self.get(record, &key)?;
        if edge.is_implicit() {
            return Err(wrong_kind("updateRelationship", edge));
        }
        let meta = edge.meta();
        let has_received_data = match edge {
            GraphEdge::Resource(edge) => edge.state.has_received_data,
            GraphEdge::Collection(edge) => edge.state.has_received_data,
            GraphEdge::Implicit(_) => false,
        };

        let data = match document.data {
            Some(linkage) => Some(self.upgrade_linkage(record, &meta, linkage)?),
            // a sync relationship is complete by definition
            None if !meta.is_async && !has_received_data => Some(if meta.is_collection {
                RelationshipData::Collection(Vec::new())
            } else {
                RelationshipData::Resource(None)
            }),
            None => None,
        };
        let has_data = data.is_some();

        let mut has_updated_link = false;
        match self.edge_mut(record, &key)? {
            GraphEdge::Resource(edge) => {
                if let Some(value) = document.meta {
                    edge.meta = Some(value);
                }
                if let Some(links) = document.links {
                    has_updated_link = related_link_changed(edge.links.as_ref(), &links);
                    edge.links = Some(links);
                }
            }
            GraphEdge::Collection(edge) => {
                if let Some(value) = document.meta {
                    edge.meta = Some(value);
                }
                if let Some(links) = document.links {
                    has_updated_link = related_link_changed(edge.links.as_ref(), &links);
                    edge.links = Some(links);
                }
            }
            GraphEdge::Implicit(_) => {}
        }

        match data {
            Some(RelationshipData::Collection(keys)) => self.replace_related_records(record, &key, keys, true)?,
            Some(RelationshipData::Resource(value)) => self.replace_resource(record, &key, value, true)?,
            None => {}
        }

        let transaction = self.transaction;
        let is_stale_transaction =
            |reference: u64| reference == 0 || transaction.map_or(true, |current| reference < current);
        let mut notify = false;
        match self.edge_mut(record, &key)? {
            GraphEdge::Resource(edge) => {
                edge.state.has_failed_load_attempt = false;
                if has_data {
                    edge.state.has_received_data = true;
                    edge.state.is_stale = false;
                    edge.state.has_dematerialized_inverse = false;
                    edge.state.is_empty = edge.local_state.is_none();
                } else if has_updated_link {
                    edge.state.is_stale = true;
                    notify = true;
                }
            }
            GraphEdge::Collection(edge) => {
                edge.state.has_failed_load_attempt = false;
                if has_data {
                    edge.state.has_received_data = true;
                    edge.state.is_stale = false;
                    edge.state.has_dematerialized_inverse = false;
                    edge.state.is_empty = edge.local_state().is_empty();
                } else if has_updated_link {
                    edge.state.is_stale = true;
                    // membership may already have arrived through an inverse
                    // earlier in this transaction
                    notify = !edge.state.has_received_data || is_stale_transaction(edge.transaction_ref);
                }
            }
            GraphEdge::Implicit(_) => {}
        }
        if notify {
            self.notify_change(record, &key);
        }
        Ok(())
    }

    /// Validate payload linkage against the relationship kind and resolve
    /// identifiers to keys.
    fn upgrade_linkage(
        &mut self,
        record: &ResourceKey,
        meta: &UpgradedMeta,
        linkage: Linkage,
    ) -> Result<RelationshipData> {
        if meta.is_collection {
            let identifiers = match linkage {
                Linkage::Many(identifiers) => identifiers,
                Linkage::One(None) => {
                    warn!(
                        resource_type = %record.resource_type(),
                        field = %meta.key,
                        "received null for a hasMany relationship; treating it as empty"
                    );
                    Vec::new()
                }
                Linkage::One(Some(identifier)) => {
                    self.config.violation(invalid_payload(
                        record,
                        meta,
                        "expected an array of identifiers for a hasMany relationship",
                    ))?;
                    vec![identifier]
                }
            };
            let mut keys = Vec::with_capacity(identifiers.len());
            for identifier in &identifiers {
                if let Some(key) = self.upgrade_identifier(record, meta, identifier)? {
                    keys.push(key);
                }
            }
            Ok(RelationshipData::Collection(keys))
        } else {
            let identifier = match linkage {
                Linkage::One(identifier) => identifier,
                Linkage::Many(identifiers) => {
                    self.config.violation(invalid_payload(
                        record,
                        meta,
                        "expected a single identifier or null for a belongsTo relationship",
                    ))?;
                    identifiers.into_iter().next()
                }
            };
            let key = match identifier {
                Some(identifier) => self.upgrade_identifier(record, meta, &identifier)?,
                None => None,
            };
            Ok(RelationshipData::Resource(key))
        }
    }

    fn upgrade_identifier(
        &self,
        record: &ResourceKey,
        meta: &UpgradedMeta,
        identifier: &ResourceIdentifier,
    ) -> Result<Option<ResourceKey>> {
        if !self.schema.has_type(&identifier.resource_type) {
            self.config.violation(invalid_payload(
                record,
                meta,
                &format!("unknown resource type '{}'", identifier.resource_type),
            ))?;
        }
        match self.keys.upgrade(identifier) {
            Some(key) => Ok(Some(key)),
            None => {
                self.config.violation(invalid_payload(
                    record,
                    meta,
                    "identifier has neither an id nor a known lid",
                ))?;
                Ok(None)
            }
        }
    }

    // ------------------------------------------------------------------
    // deleteRecord / mergeIdentifiers
    // ------------------------------------------------------------------

    fn delete_record(&mut self, record: &ResourceKey) -> Result<()> {
        let Some(edges) = self.edges.remove(record) else {
            return Ok(());
        };
        for edge in edges.values() {
            self.remove_completely_from_inverse(edge);
        }
        self.scheduler.forget(record);
        debug!(record = %record, edges = edges.len(), "deleted record from relationship graph");
        Ok(())
    }

    /// Move the edges of `record` onto `value`. Fields `value` already
    /// has are kept and the duplicate edge is detached.
    fn merge_identifiers(&mut self, record: &ResourceKey, value: &ResourceKey) -> Result<()> {
        if record == value {
            return Ok(());
        }
        let Some(moved) = self.edges.remove(record) else {
            return Ok(());
        };
        self.scheduler.forget(record);

        let mut inherited = Vec::new();
        let mut discarded = Vec::new();
        for (key, mut edge) in moved {
            let taken = self.edges.get(value).is_some_and(|edges| edges.contains_key(&key));
            if taken {
                discarded.push(edge);
                continue;
            }
            edge.set_identifier(value.clone());
            merge_key(&mut edge, record, value);
            inherited.push((edge.meta().inverse_key.clone(), edge.related()));
            self.edges.entry(value.clone()).or_default().insert(key, edge);
        }

        for edge in &discarded {
            self.remove_completely_from_inverse(edge);
        }
        for (inverse_key, related) in inherited {
            for key in related {
                let changed = self
                    .peek_mut(&key, &inverse_key)
                    .is_some_and(|edge| merge_key(edge, record, value));
                if changed {
                    self.notify_change(&key, &inverse_key);
                }
            }
        }
        debug!(from = %record, into = %value, "merged relationship edges");
        Ok(())
    }
}

fn related_link_changed(previous: Option<&crate::payload::Links>, next: &crate::payload::Links) -> bool {
    let Some(next) = next.related.as_ref() else {
        return false;
    };
    previous
        .and_then(|links| links.related.as_ref())
        .map_or(true, |previous| previous.href() != next.href())
}

fn invalid_payload(record: &ResourceKey, meta: &UpgradedMeta, reason: &str) -> GraphError {
    GraphError::InvalidPayload {
        resource_type: record.resource_type().to_string(),
        field: meta.key.clone(),
        reason: reason.to_string(),
    }
}
