//! Linkage Core
//!
//! This crate provides the relationship layer of a client-side record
//! cache that syncs with a JSON:API-shaped remote API. It implements:
//!
//! - A bidirectional relationship graph (belongsTo, hasMany and implicit
//!   back-references) with separate local and canonical views
//! - Collection diffing of remote updates against pending local edits
//! - Reactive arrays that re-synchronize lazily and turn array edits into
//!   relationship operations
//! - A store that ingests documents and coalesces change notifications
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `identity`: one stable [`ResourceKey`] per resource
//! - `schema`: relationship declarations consumed by the graph
//! - `graph`: edges, definitions, diffing and the operation pipeline
//! - `reactive`: signals and the reactive array family
//! - `store`: the owning store and its array manager
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use linkage_core::{FieldSchema, GraphConfig, StaticSchema, Store};
//!
//! let schema = StaticSchema::new()
//!     .with_type("person", [FieldSchema::has_many("tags", "tag").is_async(false)])
//!     .with_type("tag", [FieldSchema::belongs_to("person", "person").is_async(false)]);
//! let store = Store::new(Arc::new(schema), GraphConfig::default());
//!
//! let person = store.push(serde_json::json!({
//!     "data": { "type": "person", "id": "1", "relationships": {
//!         "tags": { "data": [{ "type": "tag", "id": "1" }] }
//!     } }
//! }))?.remove(0);
//!
//! let tags = store.has_many(&person, "tags")?;
//! assert_eq!(tags.len()?, 1);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod identity;
pub mod payload;
pub mod reactive;
pub mod schema;
pub mod store;

pub use config::GraphConfig;
pub use error::{GraphError, Result};
pub use graph::Graph;
pub use identity::{KeyCache, ResourceKey};
pub use payload::{Document, RelationshipDocument, ResourceIdentifier};
pub use reactive::{LiveArray, ManyArray, QueryArray, ReactiveResourceArray};
pub use schema::{FieldSchema, SchemaService, StaticSchema};
pub use store::{Record, Store, StoreChange};
