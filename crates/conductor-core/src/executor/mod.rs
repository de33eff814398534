//! Executors: the pluggable workers that perform tasks for a capability.
//!
//! - `Executor` is the RPITIT trait implementors write against.
//! - `BoxExecutor` erases it for storage in the registry.
//! - `ExecutorRegistry` maps capabilities to executors.

pub mod box_executor;
pub mod contract;
pub mod registry;

pub use box_executor::BoxExecutor;
pub use contract::{BatchItem, Executor};
pub use registry::{ExecutorRegistry, RegistryError};
