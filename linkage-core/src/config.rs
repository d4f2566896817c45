//! Graph Configuration
//!
//! The graph runs in one of two enforcement modes:
//!
//! - **strict**: protocol and invariant violations are returned as
//!   [`GraphError`]s. This is the default for debug builds and is the
//!   contract the test-suite exercises.
//! - **permissive**: violations are logged with `tracing::warn!` and the
//!   offending operation is skipped or degraded. This is the default for
//!   release builds.
//!
//! Configuration errors (bad schema declarations) are always returned,
//! regardless of mode.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GraphError, Result};

/// Settings for a [`Graph`](crate::graph::Graph) and the arrays built on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Return violations as errors instead of logging them.
    pub strict: bool,

    /// Accept duplicate entries in collection payloads and array
    /// mutations, keeping the first occurrence and logging a warning.
    pub allow_duplicates: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            strict: cfg!(debug_assertions),
            allow_duplicates: false,
        }
    }
}

impl GraphConfig {
    /// Strict enforcement, no duplicate tolerance.
    pub fn strict() -> Self {
        Self {
            strict: true,
            allow_duplicates: false,
        }
    }

    /// Permissive enforcement with legacy duplicate tolerance.
    pub fn permissive() -> Self {
        Self {
            strict: false,
            allow_duplicates: true,
        }
    }

    /// Parse a configuration from JSON. Missing keys take their defaults.
    pub fn from_json(input: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    /// Apply the enforcement mode to a violation.
    ///
    /// Configuration errors and strict mode return the error. Otherwise the
    /// violation is logged and `Ok(())` is returned so the caller can skip
    /// the offending step.
    pub fn violation(&self, error: GraphError) -> Result<()> {
        if self.strict || error.is_configuration() {
            return Err(error);
        }
        warn!(%error, "tolerating relationship violation");
        Ok(())
    }
}
