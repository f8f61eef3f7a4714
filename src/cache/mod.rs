//! Status caches.
//!
//! `TtlCache` is the plain key → value store with lazy expiry: an expired
//! entry is removed by the `get` that finds it. `StatusCache` pairs the
//! bounded single-flight primary cache with a last-known-good slot per
//! provider that never expires and only ever holds successful results.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::FetchError;
use crate::types::{ProviderDescriptor, StatusResult};

pub mod atomic;
pub mod flight;

pub use atomic::{AtomicCache, CacheStats};
pub use flight::KeyedLocks;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Option<Duration>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .map_or(false, |ttl| now.saturating_duration_since(self.inserted_at) >= ttl)
    }
}

pub struct TtlCache<V> {
    ttl: Option<Duration>,
    entries: DashMap<String, CacheEntry<V>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            entries: DashMap::new(),
        }
    }

    /// Entries live until overwritten or removed.
    pub fn without_expiry() -> Self {
        Self {
            ttl: None,
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
        }
        // Re-checked under the shard lock in case a fresh value landed.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    pub fn set(&self, key: &str, value: V) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl: self.ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, e)| e.value)
    }

    /// Raw presence check: does not expire or touch the entry.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Status Cache ────────────────────────────────────────────────────

pub struct StatusCache {
    primary: AtomicCache<StatusResult>,
    last_good: TtlCache<StatusResult>,
}

impl StatusCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            primary: AtomicCache::new(capacity, ttl),
            last_good: TtlCache::without_expiry(),
        }
    }

    pub fn primary(&self) -> &AtomicCache<StatusResult> {
        &self.primary
    }

    pub fn get(&self, provider_id: &str) -> Option<StatusResult> {
        self.primary.get(provider_id)
    }

    pub fn last_known_good(&self, provider_id: &str) -> Option<StatusResult> {
        self.last_good.get(provider_id)
    }

    /// Record a completed check. Failed or unknown results never replace
    /// the last-known-good slot. Returns whether the slot was updated.
    pub fn remember(&self, result: &StatusResult) -> bool {
        if !result.is_successful() {
            return false;
        }
        self.last_good.set(&result.provider_id, result.clone());
        true
    }

    /// The answer for a provider whose check could not complete: its
    /// last-known-good result degraded to `unknown`, or a bare failure.
    pub fn fallback(
        &self,
        provider: &ProviderDescriptor,
        error: &FetchError,
        response_time_ms: u64,
    ) -> StatusResult {
        match self.last_good.get(&provider.id) {
            Some(last) => StatusResult::stale_from(&last, error.to_string(), response_time_ms),
            None => StatusResult::failed(provider, error.to_string(), response_time_ms),
        }
    }

    /// Force the next lookup for `provider_id` to miss.
    pub fn invalidate(&self, provider_id: &str) -> bool {
        self.primary.remove(provider_id).is_some()
    }

    pub fn sweep(&self) -> usize {
        self.primary.sweep()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.primary.stats();
        stats.last_known_good = self.last_good.len();
        stats
    }
}
