//! Error Types
//!
//! Every fallible graph and array operation returns [`GraphError`]. The
//! variants fall into three groups:
//!
//! - configuration errors: the schema is missing, ambiguous or
//!   inconsistent. These are raised while resolving edge definitions and
//!   indicate a bad model declaration.
//! - protocol violations: a relationship payload has the wrong shape,
//!   carries duplicates or points at an unknown type.
//! - invariant violations: a mutation tried to add a member that is
//!   already present, remove one that is absent, write out of bounds or
//!   mutate a read-only array.
//!
//! In permissive mode (see [`GraphConfig`](crate::GraphConfig)) protocol
//! and invariant violations are logged and tolerated instead of returned.

use thiserror::Error;

/// Errors raised by the relationship graph and reactive arrays.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------
    /// The schema has no definition for a resource type.
    #[error("no schema is registered for resource type '{0}'")]
    UnknownType(String),

    /// The schema has no relationship with this name on the type.
    #[error("'{resource_type}.{field}' is not a relationship")]
    UnknownRelationship { resource_type: String, field: String },

    /// A relationship did not declare whether it is async.
    #[error("relationship '{resource_type}.{field}' must declare `async` as a boolean")]
    MissingAsync { resource_type: String, field: String },

    /// More than one field on the related type could be the inverse.
    #[error(
        "found multiple possible inverse relationships for '{resource_type}.{field}' on '{related_type}': {candidates:?}"
    )]
    AmbiguousInverse {
        resource_type: String,
        field: String,
        related_type: String,
        candidates: Vec<String>,
    },

    /// A declared inverse could not be found on the related type.
    #[error(
        "expected '{inverse_type}.{inverse_key}' to be the inverse of '{resource_type}.{field}' but no such relationship exists"
    )]
    MissingInverse {
        resource_type: String,
        field: String,
        inverse_type: String,
        inverse_key: String,
    },

    /// A field was resolved as the inverse of a relationship while
    /// declaring `inverse: null` itself.
    #[error(
        "'{inverse_type}.{inverse_key}' declares `inverse: null` but was resolved as the inverse of '{resource_type}.{field}'"
    )]
    InverseDeclaredNull {
        resource_type: String,
        field: String,
        inverse_type: String,
        inverse_key: String,
    },

    /// A field resolved to a definition it is neither side of. This
    /// usually means a subtype inherited a relationship without the
    /// polymorphic flags being declared.
    #[error(
        "'{resource_type}.{field}' resolved to the relationship '{lhs_key}' <-> '{rhs_key}' but is neither side of it; check the polymorphic configuration"
    )]
    Misconfigured {
        resource_type: String,
        field: String,
        lhs_key: String,
        rhs_key: String,
    },

    // ------------------------------------------------------------------
    // Protocol
    // ------------------------------------------------------------------
    /// A relationship payload does not match its relationship kind.
    #[error("invalid payload for '{resource_type}.{field}': {reason}")]
    InvalidPayload {
        resource_type: String,
        field: String,
        reason: String,
    },

    /// A collection payload or mutation contains the same resource twice.
    #[error("duplicate entries for '{owner}.{field}': {duplicates:?}")]
    DuplicateMembers {
        owner: String,
        field: String,
        duplicates: Vec<String>,
    },

    /// A non-polymorphic relationship received a resource of another type.
    #[error("'{resource_type}.{field}' expects only '{expected}' resources, received '{found}'")]
    PolymorphicMismatch {
        resource_type: String,
        field: String,
        expected: String,
        found: String,
    },

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------
    /// An operation was applied to a relationship of the wrong kind.
    #[error("cannot '{op}' on '{resource_type}.{field}', it is a {kind} relationship")]
    WrongKind {
        op: &'static str,
        resource_type: String,
        field: String,
        kind: &'static str,
    },

    /// An operation that only applies to remote state was used locally.
    #[error("'{0}' can only be applied to remote state")]
    RemoteOnly(&'static str),

    /// The member is already part of the relationship.
    #[error("'{member}' is already present in '{owner}.{field}'")]
    AlreadyPresent {
        owner: String,
        field: String,
        member: String,
    },

    /// The member is not part of the relationship.
    #[error("'{member}' is not present in '{owner}.{field}'")]
    NotPresent {
        owner: String,
        field: String,
        member: String,
    },

    /// A sort supplied a different set of members than the relationship holds.
    #[error("sorting '{owner}.{field}' must keep the same members")]
    MembershipChanged { owner: String, field: String },

    /// An array write past the end of the array.
    #[error("index {index} is out of bounds for an array of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// A mutation on a read-only array.
    #[error("mutating this {0} is not allowed")]
    NotEditable(&'static str),

    /// A mutation on a destroyed array.
    #[error("cannot use an array after it has been destroyed")]
    ArrayDestroyed,

    /// A mutation started while another mutation of the same array was
    /// still being applied.
    #[error("cannot mutate an array while another mutation of it is in progress")]
    ReentrantMutation,

    /// `remove` was called while another removal was in flight.
    #[error("cannot remove '{requested}' while still removing '{removing}'")]
    ReentrantRemoval { removing: String, requested: String },

    /// The graph has been destroyed.
    #[error("the relationship graph has been destroyed")]
    Destroyed,

    /// A collaborator does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl GraphError {
    /// True for errors that indicate bad schema declarations. These are
    /// never tolerated in permissive mode.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            GraphError::UnknownType(_)
                | GraphError::UnknownRelationship { .. }
                | GraphError::MissingAsync { .. }
                | GraphError::AmbiguousInverse { .. }
                | GraphError::MissingInverse { .. }
                | GraphError::InverseDeclaredNull { .. }
                | GraphError::Misconfigured { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_classified() {
        assert!(GraphError::UnknownType("post".into()).is_configuration());
        assert!(!GraphError::ArrayDestroyed.is_configuration());
        assert!(!GraphError::DuplicateMembers {
            owner: "post:1".into(),
            field: "tags".into(),
            duplicates: vec!["tag:1".into()],
        }
        .is_configuration());
    }

    #[test]
    fn messages_name_the_relationship() {
        let err = GraphError::WrongKind {
            op: "add",
            resource_type: "person".into(),
            field: "tag".into(),
            kind: "belongsTo",
        };
        assert_eq!(
            err.to_string(),
            "cannot 'add' on 'person.tag', it is a belongsTo relationship"
        );
    }
}
