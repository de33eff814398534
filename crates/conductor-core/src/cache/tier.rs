//! A single bounded cache tier with TTL ceiling and LRU eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use conductor_types::state::CacheEntry;

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    last_used: u64,
}

/// Bounded map of fingerprint to entry.
///
/// Each key is replaced as a whole under its shard lock, so concurrent
/// readers never observe a partially written entry. Recency is tracked with
/// a logical clock; the least recently used entry is evicted when the tier
/// exceeds its capacity.
#[derive(Debug)]
pub struct CacheTier {
    name: &'static str,
    slots: DashMap<String, Slot>,
    capacity: usize,
    max_ttl: Duration,
    clock: AtomicU64,
}

impl CacheTier {
    pub fn new(name: &'static str, capacity: usize, max_ttl: Duration) -> Self {
        Self {
            name,
            slots: DashMap::new(),
            capacity: capacity.max(1),
            max_ttl,
            clock: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Live entry for `fingerprint`. Expired entries are dropped on access.
    pub fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let tick = self.tick();
        {
            let mut slot = self.slots.get_mut(fingerprint)?;
            if !slot.entry.is_expired() {
                slot.last_used = tick;
                return Some(slot.entry.clone());
            }
        }
        self.slots.remove_if(fingerprint, |_, slot| slot.entry.is_expired());
        None
    }

    /// Insert an entry, clamping its TTL to this tier's ceiling.
    pub fn put(&self, mut entry: CacheEntry) {
        let ceiling = u64::try_from(self.max_ttl.as_millis()).unwrap_or(u64::MAX);
        entry.ttl_ms = entry.ttl_ms.min(ceiling);
        let slot = Slot {
            entry,
            last_used: self.tick(),
        };
        self.slots.insert(slot.entry.fingerprint.clone(), slot);

        while self.slots.len() > self.capacity {
            if !self.evict_one() {
                break;
            }
        }
    }

    pub fn remove(&self, fingerprint: &str) -> bool {
        self.slots.remove(fingerprint).is_some()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.entry.is_expired());
        before.saturating_sub(self.slots.len())
    }

    /// Clones of every live entry.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.slots
            .iter()
            .filter(|slot| !slot.entry.is_expired())
            .map(|slot| slot.entry.clone())
            .collect()
    }

    fn evict_one(&self) -> bool {
        // Prefer an expired victim, otherwise the least recently used.
        let victim = self
            .slots
            .iter()
            .min_by_key(|slot| (!slot.entry.is_expired(), slot.last_used))
            .map(|slot| slot.key().clone());
        match victim {
            Some(key) => {
                tracing::trace!(tier = self.name, fingerprint = %key, "cache eviction");
                self.slots.remove(&key).is_some()
            }
            None => false,
        }
    }
}
