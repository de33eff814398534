//! The engine's memoization cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use conductor_types::config::CacheConfig;
use conductor_types::state::CacheEntry;
use conductor_types::task::{Capability, TaskOutput};

use super::fingerprint::Fingerprint;
use super::tier::CacheTier;

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub local_hits: u64,
    pub shared_hits: u64,
    pub misses: u64,
    pub writes: u64,
}

/// Two-tier memoization cache.
///
/// - Reads try the local tier, then the shared tier; a shared hit is
///   promoted into the local tier.
/// - Writes go to both tiers.
/// - Entries written by a different engine version are never served.
#[derive(Debug)]
pub struct MemoizationCache {
    local: CacheTier,
    shared: CacheTier,
    config: CacheConfig,
    engine_version: String,
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl MemoizationCache {
    pub fn new(config: CacheConfig, engine_version: impl Into<String>) -> Self {
        Self {
            local: CacheTier::new(
                "local",
                config.local_capacity,
                Duration::from_secs(config.local_ttl_secs),
            ),
            // The shared tier's ceiling is the longest TTL anything may ask for.
            shared: CacheTier::new("shared", config.shared_capacity, Duration::MAX),
            config,
            engine_version: engine_version.into(),
            local_hits: AtomicU64::new(0),
            shared_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<TaskOutput> {
        if let Some(entry) = self.local.get(fingerprint.as_str()) {
            if entry.engine_version == self.engine_version {
                self.local_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value);
            }
        }
        if let Some(entry) = self.shared.get(fingerprint.as_str()) {
            if entry.engine_version == self.engine_version {
                self.shared_hits.fetch_add(1, Ordering::Relaxed);
                let value = entry.value.clone();
                self.local.put(entry);
                return Some(value);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, fingerprint: &Fingerprint, value: TaskOutput, ttl: Duration) {
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            value,
            created_at: Utc::now(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            engine_version: self.engine_version.clone(),
        };
        self.local.put(entry.clone());
        self.shared.put(entry);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// TTL for a capability's results: configured override, then the
    /// executor's own preference, then the shared-tier default.
    pub fn ttl_for(&self, capability: &Capability, executor_hint: Option<Duration>) -> Duration {
        self.config
            .capability_ttl_secs
            .get(capability.as_str())
            .map(|secs| Duration::from_secs(*secs))
            .or(executor_hint)
            .unwrap_or(Duration::from_secs(self.config.shared_ttl_secs))
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) {
        self.local.remove(fingerprint.as_str());
        self.shared.remove(fingerprint.as_str());
    }

    /// Live shared-tier entries, for persistence.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.shared.entries()
    }

    /// Seed the shared tier from persisted entries. Entries from another
    /// engine version or already expired are ignored. Returns how many
    /// entries were loaded.
    pub fn load(&self, entries: impl IntoIterator<Item = CacheEntry>) -> usize {
        let mut loaded = 0;
        for entry in entries {
            if entry.engine_version != self.engine_version || entry.is_expired() {
                continue;
            }
            self.shared.put(entry);
            loaded += 1;
        }
        loaded
    }

    pub fn purge_expired(&self) -> usize {
        self.local.purge_expired() + self.shared.purge_expired()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}
