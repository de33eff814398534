//! SQLite storage layer.
//!
//! Engine-state persistence backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod pool;
pub mod state_store;

pub use pool::DatabasePool;
pub use state_store::SqliteEngineStateStore;
