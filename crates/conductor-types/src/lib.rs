//! Shared domain types for Conductor.
//!
//! This crate contains the types exchanged between the engine, its executors
//! and its adapters: tasks and their outputs, the executor error taxonomy,
//! declarative workflow definitions, engine configuration, lifecycle events
//! and the persisted snapshot rows for the cache and circuit breakers.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod task;
pub mod workflow;

/// Version of the engine that produced fingerprints and persisted state.
///
/// Cache entries and breaker snapshots written by one engine version are
/// never read back by another.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
