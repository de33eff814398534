//! Micro-batching of compatible tasks.
//!
//! Batch steps do not call their executor directly: they enqueue their task
//! on a per-capability queue. A background worker closes a window on size or
//! time, whichever comes first, dispatches the window through
//! `Executor::execute_batch` and fans the results back out by position.

pub mod aggregator;
pub mod sizing;

pub use aggregator::BatchAggregator;
pub use sizing::AdaptiveBatchSize;
