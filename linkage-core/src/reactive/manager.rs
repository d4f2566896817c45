//! Array Manager
//!
//! Reactive arrays do not own their membership. An [`ArrayManager`]
//! supplies it on demand and receives the relationship operations a
//! mutation decomposes into.

use std::fmt;

use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::graph::LocalRelationshipOperation;
use crate::identity::ResourceKey;
use crate::payload::Links;

/// What an array is a view of.
#[derive(Debug, Clone, PartialEq)]
pub enum ArraySource {
    /// Every loaded record of a type.
    Live { resource_type: String },
    /// The result of a query.
    Query { resource_type: String, query: Value },
    /// The local view of a hasMany.
    Many { owner: ResourceKey, field: String },
}

impl ArraySource {
    /// Name of the array kind, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ArraySource::Live { .. } => "LiveArray",
            ArraySource::Query { .. } => "QueryArray",
            ArraySource::Many { .. } => "ManyArray",
        }
    }
}

impl fmt::Display for ArraySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArraySource::Live { resource_type } => write!(f, "live:{resource_type}"),
            ArraySource::Query { resource_type, query } => write!(f, "query:{resource_type}:{query}"),
            ArraySource::Many { owner, field } => write!(f, "{owner}.{field}"),
        }
    }
}

/// Membership pulled from a manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArraySnapshot {
    pub keys: Vec<ResourceKey>,
    pub meta: Option<Value>,
    pub links: Option<Links>,
}

impl ArraySnapshot {
    pub fn new(keys: Vec<ResourceKey>) -> Self {
        Self {
            keys,
            ..Self::default()
        }
    }
}

/// Collaborator behind a reactive array.
///
/// `sync_array` is called while the array holds its own state lock, so
/// implementations must not read or mutate the array from inside it.
pub trait ArrayManager: Send + Sync {
    /// Materialized record type.
    type Record: Clone;

    /// Pull the current membership of `source`.
    fn sync_array(&self, source: &ArraySource) -> Result<ArraySnapshot>;

    /// Apply one relationship operation produced by a mutation.
    fn mutate(&self, op: LocalRelationshipOperation) -> Result<()>;

    /// Materialize a record.
    fn get_record(&self, key: &ResourceKey) -> Option<Self::Record>;

    /// Whether notifications are being held back until an enclosing batch
    /// ends. Arrays then leave notifying to the end of the batch.
    fn is_batching(&self) -> bool {
        false
    }

    /// Refresh the contents of `source` from the remote API.
    fn reload(&self, source: &ArraySource) -> Result<()> {
        Err(GraphError::Unsupported(format!("reloading {source}")))
    }

    /// Create a record belonging in `source`.
    fn create_record(&self, source: &ArraySource, attributes: Value) -> Result<ResourceKey> {
        let _ = attributes;
        Err(GraphError::Unsupported(format!("creating records for {source}")))
    }

    /// Persist records.
    fn save_records(&self, keys: &[ResourceKey]) -> Result<()> {
        Err(GraphError::Unsupported(format!("saving {} records", keys.len())))
    }
}
