//! Scheduling, caching, resilience and batching core of Conductor.
//!
//! This crate runs workflow graphs against pluggable executors. It defines
//! the "ports" (the `Executor` trait and the engine-state repository trait)
//! and depends only on `conductor-types` -- never on `conductor-infra` or any
//! database/IO crate.
//!
//! ```text
//! Graph --validate--> Orchestrator --dispatch--> ResiliencePolicy --> Executor
//!                          |                          |
//!                     ContextStore          CircuitBreakerRegistry
//!                          |
//!                   MemoizationCache / BatchAggregator
//! ```

pub mod batch;
pub mod cache;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod repository;
pub mod resilience;

pub use engine::Engine;
pub use orchestrator::{Orchestrator, RunOptions, RunResult};
