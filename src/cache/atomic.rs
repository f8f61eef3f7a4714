//! Capacity-bounded TTL cache with LRU eviction and single-flight fill.
//!
//! `get_or_try_set` guarantees that concurrent misses on one key run the
//! factory once: the first caller fills the slot while the rest wait on the
//! key's lock and then read what it stored.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::flight::KeyedLocks;

struct Slot<V> {
    value: V,
    inserted_at: Instant,
    /// Recency stamp; the key of this slot in `Lru::order`.
    last_access: u64,
    hits: u64,
}

struct Lru<V> {
    slots: HashMap<String, Slot<V>>,
    /// recency stamp → key, oldest first.
    order: BTreeMap<u64, String>,
    clock: u64,
}

impl<V> Lru<V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, key: &str) {
        let stamp = self.tick();
        if let Some(slot) = self.slots.get_mut(key) {
            self.order.remove(&slot.last_access);
            slot.last_access = stamp;
            slot.hits += 1;
            self.order.insert(stamp, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.last_access);
        Some(slot.value)
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.slots.remove(&key);
        Some(key)
    }
}

/// Counters for the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub last_known_good: usize,
}

pub struct AtomicCache<V> {
    capacity: usize,
    ttl: Duration,
    lru: Mutex<Lru<V>>,
    flights: KeyedLocks,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> AtomicCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            lru: Mutex::new(Lru {
                slots: HashMap::new(),
                order: BTreeMap::new(),
                clock: 0,
            }),
            flights: KeyedLocks::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut lru = self.lru.lock();
        let expired = match lru.slots.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(slot) => now.saturating_duration_since(slot.inserted_at) >= self.ttl,
        };
        if expired {
            lru.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        lru.touch(key);
        self.hits.fetch_add(1, Ordering::Relaxed);
        lru.slots.get(key).map(|slot| slot.value.clone())
    }

    pub fn set(&self, key: &str, value: V) {
        let mut lru = self.lru.lock();
        let stamp = lru.tick();
        let previous = lru.slots.remove(key);
        if let Some(old) = &previous {
            lru.order.remove(&old.last_access);
        } else if lru.slots.len() >= self.capacity {
            if let Some(evicted) = lru.evict_oldest() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %evicted, "Evicted least-recently-used cache entry");
            }
        }
        lru.slots.insert(
            key.to_string(),
            Slot {
                value,
                inserted_at: Instant::now(),
                last_access: stamp,
                hits: previous.map_or(0, |old| old.hits),
            },
        );
        lru.order.insert(stamp, key.to_string());
    }

    /// Return the cached value, or run `factory` to produce one. Only one
    /// factory runs per key at a time; `Err` values are handed back to the
    /// caller without being cached.
    pub async fn get_or_try_set<E, F, Fut>(&self, key: &str, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let _flight = self.flights.lock(key).await;
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let value = factory().await?;
        self.set(key, value.clone());
        Ok(value)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.lru.lock().remove(key)
    }

    /// How many times `key` has been served from the cache.
    pub fn access_count(&self, key: &str) -> u64 {
        self.lru.lock().slots.get(key).map_or(0, |slot| slot.hits)
    }

    /// Drop expired entries and idle flight locks.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut lru = self.lru.lock();
            let expired: Vec<String> = lru
                .slots
                .iter()
                .filter(|(_, slot)| now.saturating_duration_since(slot.inserted_at) >= self.ttl)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                lru.remove(key);
            }
            expired.len()
        };
        self.flights.prune();
        removed
    }

    pub fn len(&self) -> usize {
        self.lru.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            last_known_good: 0,
        }
    }
}
