//! Capability to executor mapping.

use dashmap::DashMap;
use thiserror::Error;

use conductor_types::task::Capability;

use super::box_executor::BoxExecutor;
use super::contract::Executor;

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("no executor registered for capability '{0}'")]
    NotFound(Capability),
}

/// Thread-safe executor registry.
///
/// Registration may happen while runs are in flight; a run resolves the
/// executor at dispatch time.
#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    executors: DashMap<Capability, BoxExecutor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for a capability.
    pub fn register<T: Executor + 'static>(&self, capability: impl Into<Capability>, executor: T) {
        let capability = capability.into();
        tracing::debug!(capability = %capability, "executor registered");
        self.executors.insert(capability, BoxExecutor::new(executor));
    }

    /// Builder-style registration.
    pub fn with<T: Executor + 'static>(self, capability: impl Into<Capability>, executor: T) -> Self {
        self.register(capability, executor);
        self
    }

    pub fn resolve(&self, capability: &Capability) -> Result<BoxExecutor, RegistryError> {
        self.executors
            .get(capability)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(capability.clone()))
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.executors.contains_key(capability)
    }

    /// Registered capabilities, sorted by name.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self.executors.iter().map(|e| e.key().clone()).collect();
        caps.sort();
        caps
    }
}
