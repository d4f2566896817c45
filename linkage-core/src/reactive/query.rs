//! Query Array
//!
//! Read-only view of the result of a query. The query itself is kept so
//! the result can be refreshed.

use std::ops::Deref;
use std::sync::Arc;

use serde_json::Value;

use super::array::ReactiveResourceArray;
use super::manager::{ArrayManager, ArraySource};
use crate::config::GraphConfig;
use crate::error::Result;

#[derive(Debug)]
pub struct QueryArray<M: ArrayManager> {
    inner: ReactiveResourceArray<M>,
}

impl<M: ArrayManager> QueryArray<M> {
    pub fn new(resource_type: impl Into<String>, query: Value, manager: Arc<M>, config: GraphConfig) -> Self {
        let source = ArraySource::Query {
            resource_type: resource_type.into(),
            query,
        };
        Self {
            inner: ReactiveResourceArray::new(source, false, manager, config),
        }
    }

    pub fn query(&self) -> Option<&Value> {
        match self.inner.source() {
            ArraySource::Query { query, .. } => Some(query),
            _ => None,
        }
    }

    /// Re-run the query.
    pub fn update(&self) -> Result<()> {
        self.inner.set_is_updating(true);
        let result = self.inner.manager().reload(self.inner.source());
        self.inner.set_is_updating(false);
        self.inner.notify();
        result
    }
}

impl<M: ArrayManager> Deref for QueryArray<M> {
    type Target = ReactiveResourceArray<M>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
