use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use linkage_core::graph::{diff_collection, LocalRelationshipOperation, RemoteRelationshipOperation};
use linkage_core::{FieldSchema, Graph, GraphConfig, KeyCache, RelationshipDocument, ResourceKey, StaticSchema};

fn graph_with_members(len: usize) -> (Graph, ResourceKey, Vec<ResourceKey>) {
    let schema = StaticSchema::new()
        .with_type(
            "person",
            [FieldSchema::has_many("tags", "tag").is_async(false).inverse("person")],
        )
        .with_type(
            "tag",
            [FieldSchema::belongs_to("person", "person").is_async(false).inverse("tags")],
        );
    let keys = Arc::new(KeyCache::new());
    let mut graph = Graph::new(Arc::new(schema), Arc::clone(&keys), GraphConfig::strict());
    let person = keys.get_or_create("person", "1");
    let members: Vec<_> = (0..len).map(|id| keys.get_or_create("tag", &id.to_string())).collect();

    graph
        .push(RemoteRelationshipOperation::UpdateRelationship {
            record: person.clone(),
            field: "tags".into(),
            value: RelationshipDocument::many(members.iter().map(ResourceKey::to_identifier).collect()),
        })
        .unwrap();
    graph.flush().unwrap();
    (graph, person, members)
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_collection");

    for &len in &[16_usize, 256, 4_096] {
        let (mut graph, person, members) = graph_with_members(len);
        let config = graph.config().clone();

        let unchanged = members.clone();
        let mut reversed = members.clone();
        reversed.reverse();
        let mut appended = members.clone();
        appended.push(graph.keys().get_or_create("tag", "appended"));
        let halved = members[..len / 2].to_vec();

        let edge = graph.get(&person, "tags").unwrap().as_collection().unwrap();
        for (name, state) in [
            ("unchanged", &unchanged),
            ("reversed", &reversed),
            ("appended", &appended),
            ("halved", &halved),
        ] {
            group.bench_function(format!("{name}(n={len})"), |b| {
                b.iter(|| black_box(diff_collection(black_box(state), edge, &config).unwrap()))
            });
        }
    }

    group.finish();
}

fn bench_remote_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("remote_update");
    group.sample_size(30);

    for &len in &[256_usize, 4_096] {
        group.bench_function(format!("replace_with_local_additions(n={len})"), |b| {
            b.iter_batched(
                || {
                    let (mut graph, person, mut members) = graph_with_members(len);
                    let fresh = graph.keys().create_local("tag");
                    graph
                        .update(
                            LocalRelationshipOperation::Add {
                                record: person.clone(),
                                field: "tags".into(),
                                value: vec![fresh],
                                index: None,
                            },
                            false,
                        )
                        .unwrap();
                    members.rotate_left(len / 3);
                    (graph, person, members)
                },
                |(mut graph, person, members)| {
                    graph
                        .update(
                            RemoteRelationshipOperation::UpdateRelationship {
                                record: person,
                                field: "tags".into(),
                                value: RelationshipDocument::many(
                                    members.iter().map(ResourceKey::to_identifier).collect(),
                                ),
                            },
                            true,
                        )
                        .unwrap();
                    black_box(graph);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_diff, bench_remote_update);
criterion_main!(benches);
