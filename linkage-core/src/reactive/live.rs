//! Live Array
//!
//! Read-only view of every loaded record of one type.

use std::ops::Deref;
use std::sync::Arc;

use super::array::ReactiveResourceArray;
use super::manager::{ArrayManager, ArraySource};
use crate::config::GraphConfig;
use crate::error::Result;

#[derive(Debug)]
pub struct LiveArray<M: ArrayManager> {
    inner: ReactiveResourceArray<M>,
}

impl<M: ArrayManager> LiveArray<M> {
    pub fn new(resource_type: impl Into<String>, manager: Arc<M>, config: GraphConfig) -> Self {
        let source = ArraySource::Live {
            resource_type: resource_type.into(),
        };
        Self {
            inner: ReactiveResourceArray::new(source, false, manager, config),
        }
    }

    pub fn resource_type(&self) -> &str {
        match self.inner.source() {
            ArraySource::Live { resource_type } => resource_type,
            _ => "",
        }
    }

    /// Ask the manager to refresh every record of the type.
    pub fn update(&self) -> Result<()> {
        self.inner.set_is_updating(true);
        let result = self.inner.manager().reload(self.inner.source());
        self.inner.set_is_updating(false);
        self.inner.notify();
        result
    }
}

impl<M: ArrayManager> Deref for LiveArray<M> {
    type Target = ReactiveResourceArray<M>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
