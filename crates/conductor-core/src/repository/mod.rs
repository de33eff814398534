//! Repository trait definitions (ports).
//!
//! The core only depends on these traits; `conductor-infra` provides the
//! SQLite implementations.

pub mod state;

pub use state::{EngineStateRepository, MemoryStateRepository};
