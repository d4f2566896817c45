//! Many Array
//!
//! Mutable view of the local state of one hasMany relationship. Edits are
//! forwarded to the graph as local operations and become visible on the
//! next read.

use std::ops::Deref;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::array::ReactiveResourceArray;
use super::manager::{ArrayManager, ArraySource};
use crate::config::GraphConfig;
use crate::error::Result;
use crate::identity::ResourceKey;

#[derive(Debug)]
pub struct ManyArray<M: ArrayManager> {
    inner: ReactiveResourceArray<M>,
}

impl<M: ArrayManager> ManyArray<M> {
    pub fn new(owner: ResourceKey, field: impl Into<String>, manager: Arc<M>, config: GraphConfig) -> Self {
        let source = ArraySource::Many {
            owner,
            field: field.into(),
        };
        Self {
            inner: ReactiveResourceArray::new(source, true, manager, config),
        }
    }

    /// The record holding the relationship.
    pub fn owner(&self) -> Option<&ResourceKey> {
        match self.inner.source() {
            ArraySource::Many { owner, .. } => Some(owner),
            _ => None,
        }
    }

    pub fn field(&self) -> &str {
        match self.inner.source() {
            ArraySource::Many { field, .. } => field,
            _ => "",
        }
    }

    /// Create a record through the manager and append it.
    pub fn create_record(&self, attributes: Value) -> Result<ResourceKey> {
        let key = self.inner.manager().create_record(self.inner.source(), attributes)?;
        debug!(source = %self.inner.source(), record = %key, "created record for relationship");
        self.inner.push(vec![key.clone()])?;
        Ok(key)
    }

    /// Persist every member.
    pub fn save(&self) -> Result<()> {
        let keys = self.inner.keys()?;
        self.inner.manager().save_records(&keys)
    }

    /// Refresh the relationship from the remote API.
    pub fn reload(&self) -> Result<()> {
        self.inner.set_is_updating(true);
        let result = self.inner.manager().reload(self.inner.source());
        self.inner.set_is_updating(false);
        self.inner.notify();
        result
    }
}

impl<M: ArrayManager> Deref for ManyArray<M> {
    type Target = ReactiveResourceArray<M>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
