//! Configuration structures for Cairn trees.

use crate::error::{CairnError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for a B+Tree instance.
///
/// `max_keys_per_node` is the tree's fanout ("order" in Knuth's terminology).
/// It must be even and at least 4 so that `min_keys_per_node = max / 2` is at
/// least 2, which guarantees that a merge during deletion rebalancing always
/// has a sibling to merge with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Maximum number of keys held by any node.
    pub max_keys_per_node: u64,
}

impl TreeConfig {
    /// Creates a configuration with the given fanout.
    pub fn new(max_keys_per_node: u64) -> Self {
        Self { max_keys_per_node }
    }

    /// Minimum number of keys for non-root nodes, derived from the fanout.
    pub fn min_keys_per_node(&self) -> u64 {
        self.max_keys_per_node >> 1
    }

    /// Validates the fanout constraint: even and at least 4.
    pub fn validate(&self) -> Result<()> {
        let min = self.min_keys_per_node();
        if self.max_keys_per_node < 4 || min * 2 != self.max_keys_per_node {
            return Err(CairnError::InvalidConfiguration(self.max_keys_per_node));
        }
        Ok(())
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_keys_per_node: 128,
        }
    }
}
