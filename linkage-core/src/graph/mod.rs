//! Relationship Graph
//!
//! This module tracks every relationship between resources in the cache
//! and keeps both sides of each relationship consistent.
//!
//! # Overview
//!
//! The graph is a registry of edges keyed by `(resource, field)`:
//!
//! - a belongsTo field is a [`ResourceEdge`] holding at most one key
//! - a hasMany field is an ordered [`CollectionEdge`]
//! - a relationship declared without an inverse gets an [`ImplicitEdge`]
//!   on the related resource, so deleting either side can still clean up
//!
//! Every edge keeps two views. The *remote* view is the canonical state
//! last received from the API. The *local* view is what the application
//! sees, including edits that have not been saved yet.
//!
//! # Design Decisions
//!
//! 1. Edge definitions are resolved lazily from the schema on first access
//!    and shared by both sides, so the two sides of a relationship always
//!    agree on its options.
//!
//! 2. Remote operations are queued and applied in batches, deletions first,
//!    so a payload can be ingested in any order.
//!
//! 3. The graph never calls out while mutating. Touched relationships are
//!    collected and returned from [`Graph::flush`].

mod apply;
pub mod definition;
pub mod diff;
pub mod edge;
mod inverse;
pub mod operation;
mod registry;
mod scheduler;

pub use definition::{DefinitionCache, EdgeDefinition, EdgeKind, Side, UpgradedMeta};
pub use diff::{diff_collection, CollectionDiff};
pub use edge::{CollectionEdge, GraphEdge, ImplicitEdge, RelationshipState, ResourceEdge};
pub use operation::{
    LocalRelationshipOperation, RelationshipChange, RelationshipOperation, RemoteRelationshipOperation,
};
pub use registry::{ChangedFields, Graph, RelationshipDiff};
pub use scheduler::UpdateScheduler;
