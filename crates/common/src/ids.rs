//! Typed identifiers shared across driver/backend components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable pipeline-run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
