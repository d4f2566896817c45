//! Integration Tests for the Relationship Layer
//!
//! These tests drive the store, graph and reactive arrays together through
//! the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use linkage_core::graph::{diff_collection, LocalRelationshipOperation, RemoteRelationshipOperation};
use linkage_core::{
    FieldSchema, Graph, GraphConfig, GraphError, KeyCache, RelationshipDocument, ResourceIdentifier, StaticSchema,
    Store,
};

fn schema() -> StaticSchema {
    StaticSchema::new()
        .with_type(
            "person",
            [
                FieldSchema::has_many("tags", "tag").is_async(false).inverse("person"),
                FieldSchema::belongs_to("tag", "tag").is_async(false).inverse("people"),
                FieldSchema::has_many("true_friends", "person")
                    .is_async(false)
                    .inverse("true_friends"),
            ],
        )
        .with_type(
            "tag",
            [
                FieldSchema::belongs_to("person", "person").is_async(false).inverse("tags"),
                FieldSchema::has_many("people", "person").is_async(false).inverse("tag"),
            ],
        )
        .with_type(
            "post",
            [FieldSchema::belongs_to("author", "person").is_async(false).no_inverse()],
        )
}

fn store() -> Arc<Store> {
    Store::new(Arc::new(schema()), GraphConfig::strict())
}

fn graph(config: GraphConfig) -> Graph {
    Graph::new(Arc::new(schema()), Arc::new(KeyCache::new()), config)
}

/// Adding one side of an inverse pair shows up on the other side, and so
/// does removing it.
#[test]
fn inverse_relationships_stay_symmetric() {
    let store = store();
    let person = store
        .push(json!({ "data": { "type": "person", "id": "1", "relationships": { "tags": { "data": [] } } } }))
        .unwrap()
        .remove(0);
    let tags = store.has_many(&person, "tags").unwrap();
    assert!(tags.is_empty().unwrap());

    let tag = store.create_record("tag", Value::Null).unwrap();
    store.set_belongs_to(&tag, "person", Some(&person)).unwrap();
    assert_eq!(tags.keys().unwrap(), vec![tag.clone()]);

    tags.pop().unwrap();
    assert_eq!(store.belongs_to_key(&tag, "person").unwrap(), None);

    let post = store.create_record("post", Value::Null).unwrap();
    store.set_belongs_to(&post, "author", Some(&person)).unwrap();
    assert_eq!(store.belongs_to_key(&post, "author").unwrap(), Some(person));
}

/// Resolving a definition twice returns the same shared definition, even
/// when the inverse side resolved it first.
#[test]
fn definition_resolution_is_idempotent() {
    let mut graph = graph(GraphConfig::strict());
    let from_inverse = graph.definition("tag", "person").unwrap();
    let first = graph.definition("person", "tags").unwrap();
    let second = graph.definition("person", "tags").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &from_inverse));
}

/// A remote payload equal to the canonical state is not a change, even
/// with local edits pending.
#[test]
fn diff_of_canonical_state_is_unchanged() {
    let mut graph = graph(GraphConfig::strict());
    let keys = Arc::clone(graph.keys());
    let person = keys.get_or_create("person", "1");
    let remote = vec![keys.get_or_create("tag", "1"), keys.get_or_create("tag", "2")];

    graph
        .push(RemoteRelationshipOperation::UpdateRelationship {
            record: person.clone(),
            field: "tags".into(),
            value: RelationshipDocument::many(remote.iter().map(|key| key.to_identifier()).collect()),
        })
        .unwrap();
    graph.flush().unwrap();
    graph
        .update(
            LocalRelationshipOperation::Add {
                record: person.clone(),
                field: "tags".into(),
                value: vec![keys.create_local("tag")],
                index: None,
            },
            false,
        )
        .unwrap();

    let config = graph.config().clone();
    let edge = graph.get(&person, "tags").unwrap().as_collection().unwrap();
    let diff = diff_collection(&remote, edge, &config).unwrap();
    assert!(!diff.changed);
    assert!(diff.added.is_empty());
    assert!(diff.removed.is_empty());
}

/// Adding a member twice is an error in strict mode and a no-op in
/// permissive mode. The same holds for removals.
#[test]
fn members_are_never_applied_twice() {
    for strict in [true, false] {
        let config = if strict {
            GraphConfig::strict()
        } else {
            GraphConfig::permissive()
        };
        let mut graph = graph(config);
        let keys = Arc::clone(graph.keys());
        let person = keys.get_or_create("person", "1");
        let tag = keys.get_or_create("tag", "1");
        let add = LocalRelationshipOperation::Add {
            record: person.clone(),
            field: "tags".into(),
            value: vec![tag.clone()],
            index: None,
        };
        let remove = LocalRelationshipOperation::Remove {
            record: person.clone(),
            field: "tags".into(),
            value: vec![tag.clone()],
            index: None,
        };

        graph.update(add.clone(), false).unwrap();
        let again = graph.update(add, false);
        assert_eq!(again.is_err(), strict);
        assert!(matches!(again, Ok(()) | Err(GraphError::AlreadyPresent { .. })));
        assert_eq!(graph.get_data(&person, "tags").unwrap().collection(), &[tag.clone()]);

        graph.update(remove.clone(), false).unwrap();
        let again = graph.update(remove, false);
        assert_eq!(again.is_err(), strict);
        assert!(graph.get_data(&person, "tags").unwrap().collection().is_empty());
    }
}

/// When a multi-member edit fails partway, the members applied before the
/// failure stay applied and the change is still reported.
#[test]
fn partially_applied_edits_are_reported() {
    let mut graph = graph(GraphConfig::strict());
    let keys = Arc::clone(graph.keys());
    let person = keys.get_or_create("person", "1");
    let tags: Vec<_> = ["1", "2", "3"].iter().map(|id| keys.get_or_create("tag", id)).collect();

    graph
        .push(RemoteRelationshipOperation::UpdateRelationship {
            record: person.clone(),
            field: "tags".into(),
            value: RelationshipDocument::many(vec![tags[0].to_identifier()]),
        })
        .unwrap();
    graph.flush().unwrap();
    graph.get_data(&person, "tags").unwrap();

    let added = graph.update(
        LocalRelationshipOperation::Add {
            record: person.clone(),
            field: "tags".into(),
            value: vec![tags[1].clone(), tags[0].clone()],
            index: None,
        },
        false,
    );
    assert!(matches!(added, Err(GraphError::AlreadyPresent { .. })));
    let changes = graph.flush().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].record, person);
    assert_eq!(changes[0].field, "tags");
    assert_eq!(graph.get_data(&person, "tags").unwrap().collection(), &tags[..2]);
    assert_eq!(graph.get_data(&tags[1], "person").unwrap().resource(), Some(&person));

    let removed = graph.update(
        LocalRelationshipOperation::Remove {
            record: person.clone(),
            field: "tags".into(),
            value: vec![tags[1].clone(), tags[2].clone()],
            index: None,
        },
        false,
    );
    assert!(matches!(removed, Err(GraphError::NotPresent { .. })));
    assert_eq!(graph.flush().unwrap().len(), 1);
    assert_eq!(graph.get_data(&person, "tags").unwrap().collection(), &tags[..1]);
    assert_eq!(graph.get_data(&tags[1], "person").unwrap().resource(), None);
}

/// Rollback after array edits restores the canonical state exactly and
/// reports only fields that differed.
#[test]
fn rollback_restores_canonical_state() {
    let store = store();
    let person = store
        .push(json!({
            "data": { "type": "person", "id": "1", "relationships": {
                "tags": { "data": [{ "type": "tag", "id": "1" }, { "type": "tag", "id": "2" }] }
            } }
        }))
        .unwrap()
        .remove(0);
    let tags = store.has_many(&person, "tags").unwrap();
    let remote = tags.keys().unwrap();

    let fresh = store.create_record("tag", Value::Null).unwrap();
    tags.push(vec![fresh.clone()]).unwrap();
    tags.shift().unwrap();
    tags.splice(1, 0, vec![store.keys().get_or_create("tag", "3")]).unwrap();
    assert_ne!(tags.keys().unwrap(), remote);

    let changed = store.rollback_relationships(&person).unwrap();
    assert_eq!(changed.as_slice(), &["tags".to_string()]);
    assert_eq!(tags.keys().unwrap(), remote);
    assert_eq!(store.belongs_to_key(&fresh, "person").unwrap(), None);

    assert!(store.rollback_relationships(&person).unwrap().is_empty());
}

/// A resource may be a member of its own reflexive relationship, exactly
/// once.
#[test]
fn reflexive_self_membership_is_reported_once() {
    let store = store();
    let person = store
        .push(json!({
            "data": { "type": "person", "id": "1", "relationships": {
                "true_friends": { "data": [{ "type": "person", "id": "1" }, { "type": "person", "id": "2" }] }
            } }
        }))
        .unwrap()
        .remove(0);
    let friend = store.keys().peek("person", "2").unwrap();

    let friends = store.has_many(&person, "true_friends").unwrap();
    assert_eq!(friends.keys().unwrap(), vec![person.clone(), friend.clone()]);
    assert_eq!(store.has_many(&friend, "true_friends").unwrap().keys().unwrap(), vec![person]);
}

/// A sync belongsTo materializes the related record, and the same record
/// is returned on every access.
#[test]
fn belongs_to_returns_the_same_record() {
    let store = store();
    store
        .push(json!({ "data": { "type": "tag", "id": "5", "attributes": { "name": "friendly" } } }))
        .unwrap();
    let person = store
        .push(json!({
            "data": { "type": "person", "id": "1", "attributes": { "name": "Tom Dale" },
                      "relationships": { "tag": { "data": { "type": "tag", "id": "5" } } } }
        }))
        .unwrap()
        .remove(0);

    let first = store.belongs_to(&person, "tag").unwrap().unwrap();
    let second = store.belongs_to(&person, "tag").unwrap().unwrap();
    assert_eq!(first.attribute("name"), Some(json!("friendly")));
    assert!(Arc::ptr_eq(&first, &second));
}

/// Deleting and unloading one member keeps unsaved local additions.
#[test]
fn local_additions_survive_sibling_deletion() {
    let store = store();
    let person = store
        .push(json!({
            "data": { "type": "person", "id": "1", "relationships": {
                "tags": { "data": [{ "type": "tag", "id": "1" }] }
            } },
            "included": [{ "type": "tag", "id": "1", "relationships": {
                "person": { "data": { "type": "person", "id": "1" } }
            } }]
        }))
        .unwrap()
        .remove(0);
    let tags = store.has_many(&person, "tags").unwrap();
    let fresh = store.create_record("tag", Value::Null).unwrap();
    tags.push(vec![fresh.clone()]).unwrap();
    let old = store.keys().peek("tag", "1").unwrap();
    assert_eq!(tags.keys().unwrap(), vec![old.clone(), fresh.clone()]);

    store.delete_record(&old).unwrap();
    store.unload_record(&old).unwrap();
    assert_eq!(tags.keys().unwrap(), vec![fresh]);
}

/// An explicit null payload empties both sides.
#[test]
fn null_payload_clears_both_sides() {
    let store = store();
    store
        .push(json!({
            "data": { "type": "tag", "id": "1", "relationships": {
                "people": { "data": [{ "type": "person", "id": "1" }] }
            } }
        }))
        .unwrap();
    let tag = store.keys().peek("tag", "1").unwrap();
    let person = store.keys().peek("person", "1").unwrap();
    let people = store.has_many(&tag, "people").unwrap();
    assert_eq!(people.len().unwrap(), 1);
    assert_eq!(store.belongs_to_key(&person, "tag").unwrap(), Some(tag.clone()));

    store
        .push(json!({ "data": { "type": "tag", "id": "1", "relationships": { "people": { "data": null } } } }))
        .unwrap();
    assert_eq!(people.len().unwrap(), 0);
    assert_eq!(store.belongs_to_key(&person, "tag").unwrap(), None);
}

/// Payload order does not matter: a belongsTo pushed before its inverse
/// hasMany ends up consistent.
#[test]
fn out_of_order_payloads_converge() {
    let store = store();
    store
        .push(json!({
            "data": [
                { "type": "tag", "id": "2", "relationships": { "person": { "data": { "type": "person", "id": "1" } } } },
                { "type": "person", "id": "1", "relationships": {
                    "tags": { "data": [{ "type": "tag", "id": "1" }, { "type": "tag", "id": "2" }] }
                } }
            ]
        }))
        .unwrap();
    let person = store.keys().peek("person", "1").unwrap();
    let tags = store.has_many(&person, "tags").unwrap();
    let ids: Vec<_> = tags
        .keys()
        .unwrap()
        .iter()
        .map(|key| key.id().unwrap_or_default().to_string())
        .collect();
    assert_eq!(ids, vec!["1", "2"]);
}

/// Many edits in one batch produce one array notification.
#[test]
fn batched_edits_notify_once() {
    let store = store();
    let person = store
        .push(json!({ "data": { "type": "person", "id": "1", "relationships": { "tags": { "data": [] } } } }))
        .unwrap()
        .remove(0);
    let tags = store.has_many(&person, "tags").unwrap();
    tags.len().unwrap();

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    tags.subscribe(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    store
        .batch(|store| {
            for id in ["1", "2", "3"] {
                let identifier = ResourceIdentifier::new("person", "1");
                store.push(json!({
                    "data": { "type": "tag", "id": id, "relationships": {
                        "person": { "data": identifier }
                    } }
                }))?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(tags.len().unwrap(), 3);
}

/// Duplicate members pushed to an array are rejected in strict mode and
/// de-duplicated in permissive mode.
#[test]
fn duplicate_array_members_follow_the_mode() {
    for config in [GraphConfig::strict(), GraphConfig::permissive()] {
        let store = Store::new(Arc::new(schema()), config.clone());
        let person = store
            .push(json!({
                "data": { "type": "person", "id": "1", "relationships": {
                    "tags": { "data": [{ "type": "tag", "id": "1" }] }
                } }
            }))
            .unwrap()
            .remove(0);
        let tags = store.has_many(&person, "tags").unwrap();
        let tag = store.keys().peek("tag", "1").unwrap();
        let fresh = store.create_record("tag", Value::Null).unwrap();

        let result = tags.push(vec![fresh.clone(), tag.clone(), fresh.clone()]);
        if config.strict {
            assert!(matches!(result, Err(GraphError::DuplicateMembers { .. })));
            assert_eq!(tags.keys().unwrap(), vec![tag]);
        } else {
            assert_eq!(result.unwrap(), 2);
            assert_eq!(tags.keys().unwrap(), vec![tag, fresh]);
        }
    }
}
