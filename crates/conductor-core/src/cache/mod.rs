//! Two-tier memoization of task results.
//!
//! A small, short-lived in-process tier sits in front of a larger shared
//! tier. Both are keyed by a content fingerprint over the unit of work.

pub mod fingerprint;
pub mod memo;
pub mod tier;

pub use fingerprint::{Fingerprint, canonical_json};
pub use memo::{CacheStats, MemoizationCache};
pub use tier::CacheTier;
