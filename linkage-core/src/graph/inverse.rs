//! Inverse Maintenance
//!
//! Every write to one side of a relationship is mirrored onto the other
//! side. The helpers here take the record on the *inverse* side, the
//! inverse storage key and the record that should appear in (or vanish
//! from) it. They check presence before touching state, so mirroring a
//! reflexive self-reference is a no-op instead of a second insert.
//!
//! Teardown comes in three strengths:
//!
//! - `remove_completely_from_inverse`: the record was deleted, scrub it
//!   from every inverse, local and remote.
//! - `notify_inverse_of_dematerialization`: the record was unloaded, sync
//!   inverses forget it while async inverses remember it for reloading.
//! - `clear_relationship`: reset one edge to its never-loaded state.

use super::diff;
use super::edge::GraphEdge;
use super::registry::Graph;
use crate::error::Result;
use crate::identity::ResourceKey;

impl Graph {
    /// Make `value` appear in `identifier.key`.
    pub(super) fn add_to_inverse(
        &mut self,
        identifier: &ResourceKey,
        key: &str,
        value: &ResourceKey,
        is_remote: bool,
    ) -> Result<()> {
        let transaction = self.current_transaction();
        let edge = self.edge_mut(identifier, key)?;
        let related_type = edge.meta().related_type.clone();

        let mut changed = false;
        let mut detach = Vec::new();
        match edge {
            GraphEdge::Resource(edge) => {
                let inverse_key = edge.definition.meta(edge.side).inverse_key.clone();
                edge.state.has_received_data = true;
                edge.state.is_empty = false;

                let mut old_remote = None;
                if is_remote {
                    edge.transaction_ref = transaction;
                    if edge.remote_state.as_ref() != Some(value) {
                        old_remote = edge.remote_state.replace(value.clone());
                    }
                }
                if edge.local_state.as_ref() != Some(value) {
                    let old_local = edge.local_state.replace(value.clone());
                    changed = true;
                    if let Some(old_local) = old_local {
                        if old_remote.as_ref() != Some(&old_local) {
                            detach.push((old_local, inverse_key.clone(), false));
                        }
                    }
                }
                if let Some(old_remote) = old_remote {
                    detach.insert(0, (old_remote, inverse_key, true));
                }
            }
            GraphEdge::Collection(edge) => {
                if is_remote {
                    if !edge.remote_members.contains(value) {
                        edge.transaction_ref = transaction;
                        diff::add_remote(edge, value, None)?;
                        changed = true;
                    }
                } else if !edge.has_local(value) {
                    diff::add_local(edge, value, None)?;
                    changed = true;
                }
            }
            GraphEdge::Implicit(edge) => {
                if is_remote {
                    edge.remote_members.insert(value.clone());
                }
                edge.local_members.insert(value.clone());
            }
        }

        if related_type != value.resource_type() {
            self.definitions
                .register_polymorphic_type(&related_type, value.resource_type());
        }
        for (old, inverse_key, is_remote) in detach {
            self.remove_from_inverse(&old, &inverse_key, identifier, is_remote)?;
        }
        if changed {
            self.notify_change(identifier, key);
        }
        Ok(())
    }

    /// Make `value` vanish from `identifier.key`.
    pub(super) fn remove_from_inverse(
        &mut self,
        identifier: &ResourceKey,
        key: &str,
        value: &ResourceKey,
        is_remote: bool,
    ) -> Result<()> {
        let transaction = self.current_transaction();
        let Some(edge) = self.peek_mut(identifier, key) else {
            return Ok(());
        };

        let mut changed = false;
        match edge {
            GraphEdge::Resource(edge) => {
                if is_remote {
                    edge.transaction_ref = transaction;
                    if edge.remote_state.as_ref() == Some(value) {
                        edge.remote_state = None;
                    }
                }
                if edge.local_state.as_ref() == Some(value) {
                    edge.local_state = None;
                    edge.state.is_empty = true;
                    changed = true;
                }
            }
            GraphEdge::Collection(edge) => {
                if is_remote {
                    if edge.remote_members.contains(value) {
                        edge.transaction_ref = transaction;
                        let was_visible = edge.has_local(value);
                        diff::remove_remote(edge, value)?;
                        changed = was_visible;
                    }
                } else if edge.has_local(value) {
                    diff::remove_local(edge, value)?;
                    changed = true;
                }
            }
            GraphEdge::Implicit(edge) => {
                if is_remote {
                    edge.remote_members.shift_remove(value);
                }
                edge.local_members.shift_remove(value);
            }
        }

        if changed {
            self.notify_change(identifier, key);
        }
        Ok(())
    }

    /// Scrub the owner of a detached edge from every record it points at.
    pub(super) fn remove_completely_from_inverse(&mut self, edge: &GraphEdge) {
        let identifier = edge.identifier().clone();
        let inverse_key = edge.meta().inverse_key.clone();
        for related in edge.related() {
            self.remove_identifier_completely(&related, &inverse_key, &identifier);
        }
    }

    /// Drop `value` from both views of `record.key` without recording a
    /// local delta.
    pub(super) fn remove_identifier_completely(
        &mut self,
        record: &ResourceKey,
        key: &str,
        value: &ResourceKey,
    ) {
        let Some(edge) = self.peek_mut(record, key) else {
            return;
        };

        let changed = match edge {
            GraphEdge::Resource(edge) => {
                if edge.remote_state.as_ref() == Some(value) {
                    edge.remote_state = None;
                }
                if edge.local_state.as_ref() == Some(value) {
                    edge.local_state = None;
                    edge.state.is_empty = true;
                    true
                } else {
                    false
                }
            }
            GraphEdge::Collection(edge) => {
                let was_visible = edge.has_local(value);
                edge.remote_members.shift_remove(value);
                edge.remote_state.retain(|key| key != value);
                if let Some(additions) = edge.additions.as_mut() {
                    additions.shift_remove(value);
                }
                if let Some(removals) = edge.removals.as_mut() {
                    removals.shift_remove(value);
                }
                if let Some(local) = edge.local_state.as_mut() {
                    local.retain(|key| key != value);
                }
                edge.compact();
                was_visible
            }
            GraphEdge::Implicit(edge) => {
                edge.remote_members.shift_remove(value);
                edge.local_members.shift_remove(value);
                false
            }
        };

        if changed {
            self.notify_change(record, key);
        }
    }

    /// Tear down one edge of an unloading record.
    ///
    /// Inverses are told about the dematerialization. Sync edges whose
    /// inverse is also sync are cleared, since nothing can refetch them.
    pub(super) fn destroy_relationship(&mut self, record: &ResourceKey, key: &str) {
        let Some(edge) = self.peek(record, key) else {
            return;
        };
        let meta = edge.meta();
        let related = edge.related();

        if !meta.inverse_is_implicit {
            for inverse in &related {
                self.notify_inverse_of_dematerialization(inverse, &meta.inverse_key, record);
            }
        }

        if !meta.inverse_is_implicit && !meta.inverse_is_async {
            if let Some(edge) = self.peek_mut(record, key) {
                clear_relationship(edge);
                match edge {
                    GraphEdge::Resource(edge) => edge.state.is_stale = true,
                    GraphEdge::Collection(edge) => edge.state.is_stale = true,
                    GraphEdge::Implicit(_) => {}
                }
            }
            if !meta.is_async {
                self.notify_change(record, key);
            }
        }
    }

    /// Tell `inverse_identifier.inverse_key` that `identifier` went away.
    pub(super) fn notify_inverse_of_dematerialization(
        &mut self,
        inverse_identifier: &ResourceKey,
        inverse_key: &str,
        identifier: &ResourceKey,
    ) {
        let Some(edge) = self.peek(inverse_identifier, inverse_key) else {
            return;
        };
        let applies = match edge {
            GraphEdge::Resource(edge) => edge
                .local_state
                .as_ref()
                .map_or(true, |local| local == identifier),
            _ => true,
        };
        if applies {
            self.remove_dematerialized_inverse(inverse_identifier, inverse_key, identifier);
        }
    }

    /// Sync edges forget an unloaded related record. Async edges keep it
    /// and remember that it needs reloading, unless it was never saved.
    fn remove_dematerialized_inverse(
        &mut self,
        record: &ResourceKey,
        key: &str,
        inverse_identifier: &ResourceKey,
    ) {
        let Some(edge) = self.peek(record, key) else {
            return;
        };
        let forget = !edge.meta().is_async || inverse_identifier.is_new();
        if forget && matches!(edge, GraphEdge::Collection(_)) {
            self.remove_identifier_completely(record, key, inverse_identifier);
            self.notify_change(record, key);
            return;
        }

        let Some(edge) = self.peek_mut(record, key) else {
            return;
        };
        match edge {
            GraphEdge::Resource(edge) => {
                if forget {
                    if edge.local_state.as_ref() == Some(inverse_identifier) {
                        edge.local_state = None;
                    }
                    if edge.remote_state.as_ref() == Some(inverse_identifier) {
                        edge.remote_state = None;
                        edge.state.has_received_data = true;
                        edge.state.is_empty = true;
                    }
                } else {
                    edge.state.has_dematerialized_inverse = true;
                }
            }
            GraphEdge::Collection(edge) => edge.state.has_dematerialized_inverse = true,
            GraphEdge::Implicit(_) => return,
        }

        self.notify_change(record, key);
    }
}

/// Reset an edge to its never-loaded state.
pub(super) fn clear_relationship(edge: &mut GraphEdge) {
    match edge {
        GraphEdge::Resource(edge) => {
            edge.local_state = None;
            edge.remote_state = None;
            edge.state.has_received_data = false;
            edge.state.is_empty = true;
        }
        GraphEdge::Collection(edge) => {
            edge.remote_state.clear();
            edge.remote_members.clear();
            edge.additions = None;
            edge.removals = None;
            edge.local_state = None;
            edge.is_dirty = true;
            edge.state.has_received_data = false;
            edge.state.is_empty = true;
        }
        GraphEdge::Implicit(edge) => {
            edge.local_members.clear();
            edge.remote_members.clear();
        }
    }
}

/// Replace `old` with `new` everywhere in one edge. Returns whether the
/// observable state changed.
pub(super) fn merge_key(edge: &mut GraphEdge, old: &ResourceKey, new: &ResourceKey) -> bool {
    fn swap(list: &mut Vec<ResourceKey>, old: &ResourceKey, new: &ResourceKey) -> bool {
        let Some(position) = list.iter().position(|key| key == old) else {
            return false;
        };
        if list.contains(new) {
            list.remove(position);
        } else {
            list[position] = new.clone();
        }
        true
    }

    fn swap_set(set: &mut indexmap::IndexSet<ResourceKey>, old: &ResourceKey, new: &ResourceKey) -> bool {
        let Some(position) = set.get_index_of(old) else {
            return false;
        };
        set.shift_remove_index(position);
        if !set.contains(new) {
            let (index, _) = set.insert_full(new.clone());
            set.move_index(index, position);
        }
        true
    }

    match edge {
        GraphEdge::Resource(edge) => {
            let mut changed = false;
            if edge.local_state.as_ref() == Some(old) {
                edge.local_state = Some(new.clone());
                changed = true;
            }
            if edge.remote_state.as_ref() == Some(old) {
                edge.remote_state = Some(new.clone());
            }
            changed
        }
        GraphEdge::Collection(edge) => {
            let was_visible = edge.has_local(old);
            swap(&mut edge.remote_state, old, new);
            swap_set(&mut edge.remote_members, old, new);
            if let Some(additions) = edge.additions.as_mut() {
                swap_set(additions, old, new);
                additions.retain(|key| !edge.remote_members.contains(key));
            }
            if let Some(removals) = edge.removals.as_mut() {
                swap_set(removals, old, new);
            }
            if let Some(local) = edge.local_state.as_mut() {
                swap(local, old, new);
            }
            edge.compact();
            was_visible
        }
        GraphEdge::Implicit(edge) => {
            let local = swap_set(&mut edge.local_members, old, new);
            let remote = swap_set(&mut edge.remote_members, old, new);
            local || remote
        }
    }
}
