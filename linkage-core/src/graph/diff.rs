//! Collection Diffing
//!
//! [`diff_collection`] compares an incoming canonical list against the
//! remote state of a collection edge in a single pass over
//! `max(new_len, prev_len)` positions:
//!
//! - a member of the new list that was not a remote member is an addition
//! - a previous remote member missing from the new list is a removal
//! - equal-length lists that disagree at some index were reordered
//!
//! `changed` reports whether the diff alters what a consumer of the local
//! view can observe. Additions the local view already shows at the same
//! position and removals it had already applied do not count, so a server
//! confirming an optimistic edit produces no notification.
//!
//! The `add_*` / `remove_*` primitives toggle single members and fail on
//! no-op attempts, leaving the edge untouched.

use indexmap::{IndexMap, IndexSet};
use tracing::warn;

use super::edge::{compute_local_state, CollectionEdge};
use crate::config::GraphConfig;
use crate::error::{GraphError, Result};
use crate::identity::ResourceKey;

/// Result of comparing a new canonical list with a collection edge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionDiff {
    pub added: IndexSet<ResourceKey>,
    pub removed: IndexSet<ResourceKey>,
    pub final_state: Vec<ResourceKey>,
    pub final_set: IndexSet<ResourceKey>,
    pub changed: bool,
    pub remote_order_changed: bool,
    /// Repeated entries dropped from the payload, with the indexes at
    /// which they repeated. Only filled when duplicates are tolerated.
    pub duplicates: IndexMap<ResourceKey, Vec<usize>>,
}

/// Diff `new_state` against the remote state of `edge`.
///
/// Duplicate entries are a protocol violation. With
/// `allow_duplicates` the payload is de-duplicated (first occurrence wins)
/// and a warning is logged; otherwise the violation is reported through
/// the configured enforcement mode.
pub fn diff_collection(
    new_state: &[ResourceKey],
    edge: &CollectionEdge,
    config: &GraphConfig,
) -> Result<CollectionDiff> {
    let final_set: IndexSet<ResourceKey> = new_state.iter().cloned().collect();
    let local_state = compute_local_state(edge);
    let reset_on_remote_update = edge.definition.meta(edge.side).reset_on_remote_update;

    if final_set.len() != new_state.len() {
        let owner = edge.identifier.to_string();
        let field = edge.definition.meta(edge.side).key.clone();
        if config.allow_duplicates {
            warn!(
                %owner,
                %field,
                "relationship payload contains duplicate entries; keeping the first occurrence of each"
            );
        } else {
            let duplicates = duplicate_indexes(new_state)
                .keys()
                .map(ToString::to_string)
                .collect();
            config.violation(GraphError::DuplicateMembers {
                owner,
                field,
                duplicates,
            })?;
        }
        return Ok(deprecated_compare(
            new_state,
            &edge.remote_state,
            &edge.remote_members,
            &local_state,
            reset_on_remote_update,
        ));
    }

    Ok(compare(
        new_state.to_vec(),
        final_set,
        &edge.remote_state,
        &edge.remote_members,
        &local_state,
        reset_on_remote_update,
    ))
}

/// Single pass comparison of two duplicate-free lists.
pub fn compare(
    final_state: Vec<ResourceKey>,
    final_set: IndexSet<ResourceKey>,
    prev_state: &[ResourceKey],
    prev_set: &IndexSet<ResourceKey>,
    local_state: &[ResourceKey],
    reset_on_remote_update: bool,
) -> CollectionDiff {
    let final_len = final_state.len();
    let prev_len = prev_state.len();
    let equal_length = final_len == prev_len;
    let local_set: IndexSet<&ResourceKey> = local_state.iter().collect();

    let mut diff = CollectionDiff::default();

    for i in 0..final_len.max(prev_len) {
        let member = final_state.get(i);

        if let Some(member) = member {
            if !prev_set.contains(member) {
                diff.added.insert(member.clone());
                if local_state.get(i) != Some(member) {
                    diff.changed = true;
                }
            }
        }

        if let Some(prev_member) = prev_state.get(i) {
            if equal_length && member != Some(prev_member) {
                diff.remote_order_changed = true;
            }
            if !final_set.contains(prev_member) {
                diff.removed.insert(prev_member.clone());
                if local_set.contains(prev_member) {
                    diff.changed = true;
                }
            }
        }
    }

    if diff.remote_order_changed && reset_on_remote_update && local_state != final_state.as_slice() {
        diff.changed = true;
    }

    diff.final_state = final_state;
    diff.final_set = final_set;
    diff
}

fn duplicate_indexes(state: &[ResourceKey]) -> IndexMap<ResourceKey, Vec<usize>> {
    let mut seen: IndexSet<&ResourceKey> = IndexSet::with_capacity(state.len());
    let mut duplicates: IndexMap<ResourceKey, Vec<usize>> = IndexMap::new();
    for (index, key) in state.iter().enumerate() {
        if !seen.insert(key) {
            duplicates.entry(key.clone()).or_default().push(index);
        }
    }
    duplicates
}

/// Tolerant comparison for payloads with repeated entries.
///
/// Repeats are dropped before comparing, so indexes after the first
/// repeat are measured against the de-duplicated list.
pub fn deprecated_compare(
    new_state: &[ResourceKey],
    prev_state: &[ResourceKey],
    prev_set: &IndexSet<ResourceKey>,
    local_state: &[ResourceKey],
    reset_on_remote_update: bool,
) -> CollectionDiff {
    let duplicates = duplicate_indexes(new_state);
    let final_set: IndexSet<ResourceKey> = new_state.iter().cloned().collect();
    let final_state: Vec<ResourceKey> = final_set.iter().cloned().collect();

    let mut diff = compare(
        final_state,
        final_set,
        prev_state,
        prev_set,
        local_state,
        reset_on_remote_update,
    );
    diff.duplicates = duplicates;
    diff
}

fn already_present(edge: &CollectionEdge, value: &ResourceKey) -> GraphError {
    GraphError::AlreadyPresent {
        owner: edge.identifier.to_string(),
        field: edge.definition.meta(edge.side).key.clone(),
        member: value.to_string(),
    }
}

fn not_present(edge: &CollectionEdge, value: &ResourceKey) -> GraphError {
    GraphError::NotPresent {
        owner: edge.identifier.to_string(),
        field: edge.definition.meta(edge.side).key.clone(),
        member: value.to_string(),
    }
}

/// Add `value` to the local view, at `index` when given.
///
/// Reverts a pending removal or records a pending addition. Fails when
/// the value is already visible locally.
pub fn add_local(edge: &mut CollectionEdge, value: &ResourceKey, index: Option<usize>) -> Result<()> {
    if edge.has_local(value) {
        return Err(already_present(edge, value));
    }

    let mut local = edge.local_state().clone();
    let was_removal = edge
        .removals
        .as_mut()
        .is_some_and(|removals| removals.shift_remove(value));
    if !was_removal {
        edge.additions
            .get_or_insert_with(IndexSet::new)
            .insert(value.clone());
    }
    edge.state.has_received_data = true;
    edge.state.is_empty = false;

    match index {
        Some(index) if index < local.len() => local.insert(index, value.clone()),
        _ => local.push(value.clone()),
    }
    edge.local_state = Some(local);
    edge.is_dirty = false;
    edge.compact();
    Ok(())
}

/// Remove `value` from the local view.
///
/// Drops a pending addition or records a pending removal. Fails when the
/// value is not visible locally.
pub fn remove_local(edge: &mut CollectionEdge, value: &ResourceKey) -> Result<()> {
    if !edge.has_local(value) {
        return Err(not_present(edge, value));
    }

    edge.local_state();
    let was_addition = edge
        .additions
        .as_mut()
        .is_some_and(|additions| additions.shift_remove(value));
    if !was_addition {
        edge.removals
            .get_or_insert_with(IndexSet::new)
            .insert(value.clone());
    }
    if let Some(local) = edge.local_state.as_mut() {
        local.retain(|key| key != value);
        edge.state.is_empty = local.is_empty();
    }
    edge.compact();
    Ok(())
}

/// Add `value` to the remote state, at `index` when given.
///
/// A matching pending addition is collapsed into the remote state. A clean
/// memoized local view is patched when the position is unambiguous and
/// marked dirty otherwise.
pub fn add_remote(edge: &mut CollectionEdge, value: &ResourceKey, index: Option<usize>) -> Result<()> {
    if edge.remote_members.contains(value) {
        return Err(already_present(edge, value));
    }

    edge.remote_members.insert(value.clone());
    match index {
        Some(index) if index < edge.remote_state.len() => edge.remote_state.insert(index, value.clone()),
        _ => edge.remote_state.push(value.clone()),
    }
    edge.state.has_received_data = true;
    edge.state.is_empty = false;

    let was_addition = edge
        .additions
        .as_mut()
        .is_some_and(|additions| additions.shift_remove(value));
    edge.compact();
    if was_addition {
        // already visible locally
        return Ok(());
    }

    if edge.is_dirty {
        return Ok(());
    }
    let has_additions = edge.has_additions();
    let unambiguous = !has_additions && !edge.has_removals();
    let patched = match (edge.local_state.as_mut(), index) {
        (None, _) => true,
        (Some(local), Some(0)) => {
            local.insert(0, value.clone());
            true
        }
        (Some(local), None) if !has_additions => {
            local.push(value.clone());
            true
        }
        (Some(local), Some(index)) if unambiguous && index <= local.len() => {
            local.insert(index, value.clone());
            true
        }
        (Some(_), _) => false,
    };
    if !patched {
        edge.is_dirty = true;
    }
    Ok(())
}

/// Remove `value` from the remote state.
///
/// A matching pending removal is collapsed. Otherwise the value is also
/// dropped from a memoized local view.
pub fn remove_remote(edge: &mut CollectionEdge, value: &ResourceKey) -> Result<()> {
    if !edge.remote_members.shift_remove(value) {
        return Err(not_present(edge, value));
    }
    edge.remote_state.retain(|key| key != value);

    let was_removal = edge
        .removals
        .as_mut()
        .is_some_and(|removals| removals.shift_remove(value));
    if !was_removal {
        if let Some(local) = edge.local_state.as_mut() {
            local.retain(|key| key != value);
        }
    }
    edge.compact();
    edge.state.is_empty = edge.remote_state.is_empty() && !edge.has_additions();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::definition::{DefinitionCache, Side};
    use crate::graph::edge::GraphEdge;
    use crate::identity::KeyCache;
    use crate::schema::{FieldSchema, StaticSchema};

    struct Fixture {
        keys: KeyCache,
        edge: CollectionEdge,
    }

    impl Fixture {
        fn new(reset_on_remote_update: bool) -> Self {
            let schema = StaticSchema::new()
                .with_type(
                    "post",
                    [FieldSchema::has_many("tags", "tag")
                        .is_async(false)
                        .reset_on_remote_update(reset_on_remote_update)],
                )
                .with_type("tag", [FieldSchema::belongs_to("post", "post").is_async(false)]);
            let definition = DefinitionCache::new()
                .resolve(&schema, "post", "tags")
                .unwrap()
                .unwrap();
            let keys = KeyCache::new();
            let edge = match GraphEdge::new(keys.get_or_create("post", "1"), definition, Side::Lhs) {
                GraphEdge::Collection(edge) => edge,
                _ => unreachable!(),
            };
            Self { keys, edge }
        }

        fn tag(&self, id: &str) -> ResourceKey {
            self.keys.get_or_create("tag", id)
        }

        fn tags(&self, ids: &[&str]) -> Vec<ResourceKey> {
            ids.iter().map(|id| self.tag(id)).collect()
        }

        fn with_remote(mut self, ids: &[&str]) -> Self {
            let tags = self.tags(ids);
            self.edge.remote_members = tags.iter().cloned().collect();
            self.edge.remote_state = tags;
            self
        }
    }

    #[test]
    fn identical_state_is_not_a_change() {
        let fixture = Fixture::new(true).with_remote(&["1", "2"]);
        let diff = diff_collection(&fixture.tags(&["1", "2"]), &fixture.edge, &GraphConfig::strict()).unwrap();
        assert!(!diff.changed);
        assert!(!diff.remote_order_changed);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn identical_state_ignores_pending_local_edits() {
        let mut fixture = Fixture::new(true).with_remote(&["1", "2"]);
        let extra = fixture.tag("3");
        add_local(&mut fixture.edge, &extra, None).unwrap();
        let one = fixture.tag("1");
        remove_local(&mut fixture.edge, &one).unwrap();

        let diff = diff_collection(&fixture.tags(&["1", "2"]), &fixture.edge, &GraphConfig::strict()).unwrap();
        assert!(!diff.changed);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn additions_and_removals_are_reported() {
        let fixture = Fixture::new(true).with_remote(&["1", "2"]);
        let diff = diff_collection(&fixture.tags(&["2", "3"]), &fixture.edge, &GraphConfig::strict()).unwrap();
        assert!(diff.changed);
        assert_eq!(diff.added, IndexSet::from([fixture.tag("3")]));
        assert_eq!(diff.removed, IndexSet::from([fixture.tag("1")]));
        assert_eq!(diff.final_state, fixture.tags(&["2", "3"]));
    }

    #[test]
    fn confirmed_local_addition_is_not_a_change() {
        let mut fixture = Fixture::new(true).with_remote(&["1"]);
        let two = fixture.tag("2");
        add_local(&mut fixture.edge, &two, None).unwrap();

        let diff = diff_collection(&fixture.tags(&["1", "2"]), &fixture.edge, &GraphConfig::strict()).unwrap();
        assert_eq!(diff.added, IndexSet::from([two]));
        assert!(!diff.changed);
    }

    #[test]
    fn reorder_is_a_change_only_when_local_disagrees() {
        let fixture = Fixture::new(true).with_remote(&["1", "2"]);
        let diff = diff_collection(&fixture.tags(&["2", "1"]), &fixture.edge, &GraphConfig::strict()).unwrap();
        assert!(diff.remote_order_changed);
        assert!(diff.changed);

        let mut fixture = Fixture::new(true).with_remote(&["1", "2"]);
        fixture.edge.local_state = Some(fixture.tags(&["2", "1"]));
        fixture.edge.is_dirty = false;
        let diff = diff_collection(&fixture.tags(&["2", "1"]), &fixture.edge, &GraphConfig::strict()).unwrap();
        assert!(diff.remote_order_changed);
        assert!(!diff.changed);
    }

    #[test]
    fn reorder_without_reset_is_not_a_change() {
        let fixture = Fixture::new(false).with_remote(&["1", "2"]);
        let diff = diff_collection(&fixture.tags(&["2", "1"]), &fixture.edge, &GraphConfig::strict()).unwrap();
        assert!(diff.remote_order_changed);
        assert!(!diff.changed);
    }

    #[test]
    fn duplicates_are_rejected_in_strict_mode() {
        let fixture = Fixture::new(true);
        let err = diff_collection(&fixture.tags(&["1", "1"]), &fixture.edge, &GraphConfig::strict()).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateMembers { ref duplicates, .. } if duplicates == &vec!["tag:1".to_string()]));
    }

    #[test]
    fn duplicates_keep_first_occurrence_when_tolerated() {
        let fixture = Fixture::new(true).with_remote(&["1"]);
        let config = GraphConfig {
            strict: true,
            allow_duplicates: true,
        };
        let diff = diff_collection(&fixture.tags(&["2", "1", "2", "3", "1"]), &fixture.edge, &config).unwrap();
        assert_eq!(diff.final_state, fixture.tags(&["2", "1", "3"]));
        assert_eq!(diff.duplicates.get(&fixture.tag("2")), Some(&vec![2]));
        assert_eq!(diff.duplicates.get(&fixture.tag("1")), Some(&vec![4]));
        assert_eq!(diff.added, IndexSet::from([fixture.tag("2"), fixture.tag("3")]));
    }

    #[test]
    fn local_primitives_reject_no_ops() {
        let mut fixture = Fixture::new(true).with_remote(&["1"]);
        let one = fixture.tag("1");
        let two = fixture.tag("2");

        assert!(matches!(add_local(&mut fixture.edge, &one, None), Err(GraphError::AlreadyPresent { .. })));
        add_local(&mut fixture.edge, &two, None).unwrap();
        assert!(matches!(add_local(&mut fixture.edge, &two, None), Err(GraphError::AlreadyPresent { .. })));
        let expected = fixture.tags(&["1", "2"]);
        assert_eq!(fixture.edge.local_state(), &expected);

        remove_local(&mut fixture.edge, &one).unwrap();
        assert!(matches!(remove_local(&mut fixture.edge, &one), Err(GraphError::NotPresent { .. })));
        let expected = fixture.tags(&["2"]);
        assert_eq!(fixture.edge.local_state(), &expected);
    }

    #[test]
    fn local_add_reverts_pending_removal() {
        let mut fixture = Fixture::new(true).with_remote(&["1", "2"]);
        let one = fixture.tag("1");
        remove_local(&mut fixture.edge, &one).unwrap();
        add_local(&mut fixture.edge, &one, Some(0)).unwrap();

        assert!(fixture.edge.removals.is_none());
        assert!(fixture.edge.additions.is_none());
        let expected = fixture.tags(&["1", "2"]);
        assert_eq!(fixture.edge.local_state(), &expected);
    }

    #[test]
    fn remote_add_collapses_pending_addition() {
        let mut fixture = Fixture::new(true).with_remote(&["1"]);
        let two = fixture.tag("2");
        add_local(&mut fixture.edge, &two, None).unwrap();
        add_remote(&mut fixture.edge, &two, None).unwrap();

        assert!(fixture.edge.additions.is_none());
        assert_eq!(fixture.edge.remote_state, fixture.tags(&["1", "2"]));
        let expected = fixture.tags(&["1", "2"]);
        assert_eq!(fixture.edge.local_state(), &expected);
        assert!(add_remote(&mut fixture.edge, &two, None).is_err());
    }

    #[test]
    fn remote_add_patches_clean_memo() {
        let mut fixture = Fixture::new(true).with_remote(&["1", "2"]);
        fixture.edge.local_state();
        let zero = fixture.tag("0");
        add_remote(&mut fixture.edge, &zero, Some(0)).unwrap();
        assert!(!fixture.edge.is_dirty);
        assert_eq!(fixture.edge.local_state.clone().unwrap(), fixture.tags(&["0", "1", "2"]));
    }

    #[test]
    fn remote_remove_collapses_pending_removal() {
        let mut fixture = Fixture::new(true).with_remote(&["1", "2"]);
        let one = fixture.tag("1");
        remove_local(&mut fixture.edge, &one).unwrap();
        remove_remote(&mut fixture.edge, &one).unwrap();

        assert!(fixture.edge.removals.is_none());
        let expected = fixture.tags(&["2"]);
        assert_eq!(fixture.edge.local_state(), &expected);
        assert!(remove_remote(&mut fixture.edge, &one).is_err());
    }
}
