//! Shared context for a workflow run.
//!
//! The run owns a single append-only `ContextStore`. Executors never touch it:
//! they read a `ContextView` snapshot and record proposals on it, which the
//! orchestrator merges once the step completes.

pub mod store;
pub mod view;

pub use store::{ContextStore, VersionedValue};
pub use view::ContextView;
