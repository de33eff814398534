//! The engine: process-wide services shared by every run.
//!
//! An `Engine` owns the executor registry, the memoization cache, the
//! circuit breakers, the batch aggregator and the event bus. Runs are
//! started through an `Orchestrator` obtained from `Engine::orchestrator`.

use std::sync::Arc;

use serde::Serialize;

use conductor_types::ENGINE_VERSION;
use conductor_types::config::EngineConfig;
use conductor_types::error::RepositoryError;
use conductor_types::event::EngineEvent;
use tokio::sync::broadcast;

use crate::batch::BatchAggregator;
use crate::cache::MemoizationCache;
use crate::event::EventBus;
use crate::executor::ExecutorRegistry;
use crate::orchestrator::Orchestrator;
use crate::repository::EngineStateRepository;
use crate::resilience::{CircuitBreakerRegistry, ResiliencePolicy};

/// What `Engine::restore` brought back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub cache_entries: usize,
    pub breakers: usize,
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<ExecutorRegistry>,
    cache: Arc<MemoizationCache>,
    breakers: Arc<CircuitBreakerRegistry>,
    resilience: ResiliencePolicy,
    batcher: Arc<BatchAggregator>,
    events: EventBus,
}

impl Engine {
    /// Create an engine. Must be called inside a tokio runtime: batch
    /// workers are spawned lazily on it.
    pub fn new(config: EngineConfig, registry: Arc<ExecutorRegistry>) -> Self {
        let events = EventBus::new(config.engine.event_capacity);
        let cache = Arc::new(MemoizationCache::new(config.cache.clone(), ENGINE_VERSION));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        let resilience = ResiliencePolicy::new(Arc::clone(&breakers), events.clone());
        let batcher = Arc::new(BatchAggregator::new(Arc::clone(&registry), config.batch.clone()));
        tracing::debug!(
            version = ENGINE_VERSION,
            capabilities = registry.capabilities().len(),
            "engine created"
        );
        Self {
            config,
            registry,
            cache,
            breakers,
            resilience,
            batcher,
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<MemoizationCache> {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn resilience(&self) -> &ResiliencePolicy {
        &self.resilience
    }

    pub fn batcher(&self) -> &Arc<BatchAggregator> {
        &self.batcher
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn orchestrator(self: &Arc<Self>) -> Orchestrator {
        Orchestrator::new(Arc::clone(self))
    }

    /// Reload the cache and breaker state persisted by this engine version.
    pub async fn restore<R: EngineStateRepository>(&self, repo: &R) -> Result<RestoreReport, RepositoryError> {
        let entries = repo.load_cache_entries(ENGINE_VERSION).await?;
        let snapshots = repo.load_breakers(ENGINE_VERSION).await?;
        let report = RestoreReport {
            cache_entries: self.cache.load(entries),
            breakers: self.breakers.restore(&snapshots, ENGINE_VERSION),
        };
        tracing::info!(
            cache_entries = report.cache_entries,
            breakers = report.breakers,
            "engine state restored"
        );
        Ok(report)
    }

    /// Flush the cache and breaker state.
    pub async fn persist<R: EngineStateRepository>(&self, repo: &R) -> Result<(), RepositoryError> {
        self.cache.purge_expired();
        let entries = self.cache.entries();
        let snapshots = self.breakers.snapshot(ENGINE_VERSION);
        repo.save_cache_entries(&entries).await?;
        repo.save_breakers(&snapshots).await?;
        let purged = repo.purge_expired_cache().await?;
        tracing::info!(
            cache_entries = entries.len(),
            breakers = snapshots.len(),
            purged,
            "engine state persisted"
        );
        Ok(())
    }

    /// Close the batch queues and persist state.
    pub async fn shutdown<R: EngineStateRepository>(&self, repo: &R) -> Result<(), RepositoryError> {
        self.batcher.shutdown();
        self.persist(repo).await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("version", &ENGINE_VERSION)
            .field("capabilities", &self.registry.capabilities())
            .field("cache", &self.cache.stats())
            .finish_non_exhaustive()
    }
}
