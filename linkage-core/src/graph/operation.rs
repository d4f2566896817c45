//! Relationship Operations
//!
//! Every change to the graph is expressed as an operation. Remote
//! operations come from payloads and only make sense against canonical
//! state. Local operations are produced by mutations (usually an array
//! mutation) and may also be applied as remote when a server confirms
//! them.

use serde::Serialize;

use crate::identity::ResourceKey;
use crate::payload::RelationshipDocument;

/// Operations that originate from the remote API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RemoteRelationshipOperation {
    /// Replace the canonical value of one relationship.
    UpdateRelationship {
        record: ResourceKey,
        field: String,
        value: RelationshipDocument,
    },
    /// The record was deleted. Detaches it from every inverse.
    DeleteRecord { record: ResourceKey },
    /// Two identities turned out to be the same resource. Edges of
    /// `record` are moved onto `value`.
    MergeIdentifiers { record: ResourceKey, value: ResourceKey },
}

impl RemoteRelationshipOperation {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteRelationshipOperation::UpdateRelationship { .. } => "updateRelationship",
            RemoteRelationshipOperation::DeleteRecord { .. } => "deleteRecord",
            RemoteRelationshipOperation::MergeIdentifiers { .. } => "mergeIdentifiers",
        }
    }

    pub fn record(&self) -> &ResourceKey {
        match self {
            RemoteRelationshipOperation::UpdateRelationship { record, .. }
            | RemoteRelationshipOperation::DeleteRecord { record }
            | RemoteRelationshipOperation::MergeIdentifiers { record, .. } => record,
        }
    }
}

/// Single-edge mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum LocalRelationshipOperation {
    /// Set a belongsTo, or replace the member at `index` of a hasMany.
    #[serde(rename_all = "camelCase")]
    ReplaceRelatedRecord {
        record: ResourceKey,
        field: String,
        value: Option<ResourceKey>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prior: Option<ResourceKey>,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    /// Replace the full membership of a hasMany.
    ReplaceRelatedRecords {
        record: ResourceKey,
        field: String,
        value: Vec<ResourceKey>,
    },
    /// Insert members into a hasMany, at `index` when given.
    Add {
        record: ResourceKey,
        field: String,
        value: Vec<ResourceKey>,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    /// Remove members from a hasMany. `index` is advisory.
    Remove {
        record: ResourceKey,
        field: String,
        value: Vec<ResourceKey>,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    /// Reorder a hasMany without changing its members.
    SortRelatedRecords {
        record: ResourceKey,
        field: String,
        value: Vec<ResourceKey>,
    },
}

impl LocalRelationshipOperation {
    pub fn name(&self) -> &'static str {
        match self {
            LocalRelationshipOperation::ReplaceRelatedRecord { .. } => "replaceRelatedRecord",
            LocalRelationshipOperation::ReplaceRelatedRecords { .. } => "replaceRelatedRecords",
            LocalRelationshipOperation::Add { .. } => "add",
            LocalRelationshipOperation::Remove { .. } => "remove",
            LocalRelationshipOperation::SortRelatedRecords { .. } => "sortRelatedRecords",
        }
    }

    pub fn record(&self) -> &ResourceKey {
        match self {
            LocalRelationshipOperation::ReplaceRelatedRecord { record, .. }
            | LocalRelationshipOperation::ReplaceRelatedRecords { record, .. }
            | LocalRelationshipOperation::Add { record, .. }
            | LocalRelationshipOperation::Remove { record, .. }
            | LocalRelationshipOperation::SortRelatedRecords { record, .. } => record,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            LocalRelationshipOperation::ReplaceRelatedRecord { field, .. }
            | LocalRelationshipOperation::ReplaceRelatedRecords { field, .. }
            | LocalRelationshipOperation::Add { field, .. }
            | LocalRelationshipOperation::Remove { field, .. }
            | LocalRelationshipOperation::SortRelatedRecords { field, .. } => field,
        }
    }
}

/// Input of [`Graph::update`](super::Graph::update).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RelationshipOperation {
    Remote(RemoteRelationshipOperation),
    Local(LocalRelationshipOperation),
}

impl RelationshipOperation {
    pub fn name(&self) -> &'static str {
        match self {
            RelationshipOperation::Remote(op) => op.name(),
            RelationshipOperation::Local(op) => op.name(),
        }
    }
}

impl From<RemoteRelationshipOperation> for RelationshipOperation {
    fn from(op: RemoteRelationshipOperation) -> Self {
        RelationshipOperation::Remote(op)
    }
}

impl From<LocalRelationshipOperation> for RelationshipOperation {
    fn from(op: LocalRelationshipOperation) -> Self {
        RelationshipOperation::Local(op)
    }
}

/// A relationship whose observable state changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationshipChange {
    pub record: ResourceKey,
    /// Storage key of the field.
    pub field: String,
}
