//! Recursion guard for recursive steps.
//!
//! Each expansion of a recursive step pushes a level key derived from the
//! step's capability and resolved input. Expansion stops with
//! `GraphError::RecursionLimit` when:
//!
//! - the depth would exceed the limit
//! - the new level's key equals the previous level's (no forward progress)
//! - the new level's key repeats any earlier level (a loop)

use std::collections::BTreeMap;

use serde_json::Value;

use conductor_types::task::Capability;

use super::GraphError;
use crate::cache::Fingerprint;

/// Chain of level keys from the outermost run to the current one.
///
/// Guards are values: descending returns a new guard and leaves the parent
/// untouched, so sibling recursive steps never see each other's levels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecursionGuard {
    levels: Vec<Fingerprint>,
}

impl RecursionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nesting depth of runs started under this guard (0 = top level).
    pub fn depth(&self) -> u32 {
        u32::try_from(self.levels.len()).unwrap_or(u32::MAX)
    }

    /// Key of one recursion level.
    pub fn level_key(capability: &Capability, input: &Value) -> Fingerprint {
        Fingerprint::compute(capability, input, &BTreeMap::new(), "recursion")
    }

    /// Enter a new level, enforcing `max_depth` and forward progress.
    pub fn descend(&self, key: Fingerprint, max_depth: u32) -> Result<RecursionGuard, GraphError> {
        let next_depth = self.depth().saturating_add(1);
        if next_depth > max_depth {
            return Err(GraphError::RecursionLimit {
                depth: next_depth,
                reason: format!("maximum depth {max_depth} exceeded"),
            });
        }
        if self.levels.last() == Some(&key) {
            return Err(GraphError::RecursionLimit {
                depth: next_depth,
                reason: "input unchanged from the previous level".to_string(),
            });
        }
        if let Some(pos) = self.levels.iter().position(|k| k == &key) {
            return Err(GraphError::RecursionLimit {
                depth: next_depth,
                reason: format!("input repeats level {}", pos + 1),
            });
        }
        let mut levels = self.levels.clone();
        levels.push(key);
        Ok(Self { levels })
    }
}
