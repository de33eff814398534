//! Storage interface for process-wide engine state.
//!
//! The memoization cache and the circuit breakers outlive a single run. An
//! engine restores them on start-up and flushes them on shutdown; rows are
//! scoped by engine version so an upgrade starts from a clean slate.

use std::sync::Mutex;

use conductor_types::error::RepositoryError;
use conductor_types::state::{BreakerSnapshot, CacheEntry};

/// Repository trait for engine state persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait EngineStateRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Cache
    // -----------------------------------------------------------------------

    /// Load every cache entry written by `engine_version`.
    fn load_cache_entries(
        &self,
        engine_version: &str,
    ) -> impl std::future::Future<Output = Result<Vec<CacheEntry>, RepositoryError>> + Send;

    /// Upsert cache entries by fingerprint.
    fn save_cache_entries(
        &self,
        entries: &[CacheEntry],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete expired entries. Returns how many were removed.
    fn purge_expired_cache(&self) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Circuit breakers
    // -----------------------------------------------------------------------

    fn load_breakers(
        &self,
        engine_version: &str,
    ) -> impl std::future::Future<Output = Result<Vec<BreakerSnapshot>, RepositoryError>> + Send;

    /// Upsert breaker snapshots by capability.
    fn save_breakers(
        &self,
        snapshots: &[BreakerSnapshot],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

/// Process-local implementation, for tests and embedders without a database.
#[derive(Debug, Default)]
pub struct MemoryStateRepository {
    cache: Mutex<Vec<CacheEntry>>,
    breakers: Mutex<Vec<BreakerSnapshot>>,
}

impl MemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EngineStateRepository for MemoryStateRepository {
    async fn load_cache_entries(&self, engine_version: &str) -> Result<Vec<CacheEntry>, RepositoryError> {
        Ok(Self::lock(&self.cache)
            .iter()
            .filter(|e| e.engine_version == engine_version)
            .cloned()
            .collect())
    }

    async fn save_cache_entries(&self, entries: &[CacheEntry]) -> Result<(), RepositoryError> {
        let mut cache = Self::lock(&self.cache);
        for entry in entries {
            cache.retain(|e| e.fingerprint != entry.fingerprint);
            cache.push(entry.clone());
        }
        Ok(())
    }

    async fn purge_expired_cache(&self) -> Result<u64, RepositoryError> {
        let mut cache = Self::lock(&self.cache);
        let before = cache.len();
        cache.retain(|e| !e.is_expired());
        Ok((before - cache.len()) as u64)
    }

    async fn load_breakers(&self, engine_version: &str) -> Result<Vec<BreakerSnapshot>, RepositoryError> {
        Ok(Self::lock(&self.breakers)
            .iter()
            .filter(|s| s.engine_version == engine_version)
            .cloned()
            .collect())
    }

    async fn save_breakers(&self, snapshots: &[BreakerSnapshot]) -> Result<(), RepositoryError> {
        let mut breakers = Self::lock(&self.breakers);
        for snapshot in snapshots {
            breakers.retain(|s| s.capability != snapshot.capability);
            breakers.push(snapshot.clone());
        }
        Ok(())
    }
}
