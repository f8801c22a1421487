//! Hierarchy configuration.
//!
//! Passed explicitly to `Hierarchy::open` / `Hierarchy::with_config`; there
//! is no process-wide configuration.

use serde::{Deserialize, Serialize};
use crate::storage::BackendConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    pub backend: BackendConfig,
    /// Reject any mutation that would leave a node deeper than this.
    pub max_depth: Option<u32>,
    /// Re-read and check every rebuilt ancestor chain before committing.
    pub verify_after_mutation: bool,
}

impl HierarchyConfig {
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    pub fn verified(mut self) -> Self {
        self.verify_after_mutation = true;
        self
    }
}
