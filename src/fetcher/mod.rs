//! Status fetcher: the per-provider pipeline and the polling cycle.
//!
//! `fetch` runs, in order: primary cache lookup, circuit breaker gate,
//! provider rate limit, retried interpreter call under the provider's
//! timeout, breaker bookkeeping, then the cache write (or the
//! last-known-good fallback). It always yields a `StatusResult`; every
//! failure is folded into an `unknown` result with its error attached.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreakerRegistry};
use crate::cache::{CacheStats, StatusCache, DEFAULT_TTL};
use crate::error::FetchError;
use crate::http::HttpClient;
use crate::interpret::{probe, Interpretation, InterpreterTable};
use crate::limiter::{RateLimitRule, RateLimiter};
use crate::retry::{Retried, RetryPolicy};
use crate::scheduler::{BatchItem, BatchScheduler, MetricsRecorder, SchedulerConfig, SchedulerMetrics};
use crate::types::{ProviderDescriptor, ServiceStatus, StatusResult};

pub mod poller;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub probe_timeout: Duration,
    /// Outbound quota per provider.
    pub provider_rate: RateLimitRule,
    pub scheduler: SchedulerConfig,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_TTL,
            cache_capacity: 256,
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            probe_timeout: probe::DEFAULT_PROBE_TIMEOUT,
            provider_rate: RateLimitRule::per_minute(30),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Tally of one set of results by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub operational: usize,
    pub degraded: usize,
    pub down: usize,
    pub unknown: usize,
}

impl StatusCounts {
    pub fn tally(results: &[StatusResult]) -> Self {
        let mut counts = Self::default();
        for r in results {
            match r.status {
                ServiceStatus::Operational => counts.operational += 1,
                ServiceStatus::Degraded => counts.degraded += 1,
                ServiceStatus::Down => counts.down += 1,
                ServiceStatus::Unknown => counts.unknown += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.operational + self.degraded + self.down + self.unknown
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `healthy`, `degraded` or `unhealthy`.
    pub status: &'static str,
    pub providers: usize,
    pub last_cycle: StatusCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub open_circuits: usize,
    pub circuits: Vec<BreakerSnapshot>,
    pub cache: CacheStats,
    pub scheduler: SchedulerMetrics,
}

/// Results of the most recent completed polling cycle.
#[derive(Default)]
struct LastCycle {
    results: Vec<StatusResult>,
    finished_at: Option<DateTime<Utc>>,
}

pub struct StatusFetcher {
    config: FetcherConfig,
    providers: Vec<ProviderDescriptor>,
    index: HashMap<String, usize>,
    http: Arc<dyn HttpClient>,
    interpreters: InterpreterTable,
    cache: StatusCache,
    breakers: CircuitBreakerRegistry,
    limiter: Arc<dyn RateLimiter>,
    metrics: Arc<MetricsRecorder>,
    last_cycle: RwLock<LastCycle>,
}

/// Slack on top of a fetch's retry budget for cache, breaker and limiter work.
const CYCLE_ITEM_GRACE: Duration = Duration::from_secs(1);

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl StatusFetcher {
    /// Duplicate ids keep their first entry; later ones are dropped.
    pub fn new(
        providers: Vec<ProviderDescriptor>,
        http: Arc<dyn HttpClient>,
        limiter: Arc<dyn RateLimiter>,
        config: FetcherConfig,
    ) -> Self {
        let mut index = HashMap::new();
        let mut unique = Vec::with_capacity(providers.len());
        for p in providers {
            if index.contains_key(&p.id) {
                warn!(provider = %p.id, "Duplicate provider id; ignoring the later entry");
                continue;
            }
            index.insert(p.id.clone(), unique.len());
            unique.push(p);
        }
        let providers = unique;
        Self {
            interpreters: InterpreterTable::standard(config.probe_timeout),
            cache: StatusCache::new(config.cache_ttl, config.cache_capacity),
            breakers: CircuitBreakerRegistry::new(config.breaker.clone()),
            metrics: Arc::new(MetricsRecorder::new()),
            last_cycle: RwLock::new(LastCycle::default()),
            config,
            providers,
            index,
            http,
            limiter,
        }
    }

    /// Replace the standard strategy table.
    pub fn with_interpreters(mut self, interpreters: InterpreterTable) -> Self {
        self.interpreters = interpreters;
        self
    }

    pub fn providers(&self) -> &[ProviderDescriptor] {
        &self.providers
    }

    pub fn descriptor(&self, provider_id: &str) -> Option<&ProviderDescriptor> {
        self.index.get(provider_id).map(|&i| &self.providers[i])
    }

    pub fn cache(&self) -> &StatusCache {
        &self.cache
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.snapshot()
    }

    /// Check one provider. Served from the primary cache while fresh;
    /// concurrent misses for the same provider share one network check.
    pub async fn fetch(&self, provider: &ProviderDescriptor) -> StatusResult {
        let outcome = self
            .cache
            .primary()
            .get_or_try_set(&provider.id, || self.fetch_uncached(provider))
            .await;
        match outcome {
            Ok(result) | Err(result) => result,
        }
    }

    /// `Ok` results are cached; `Err` carries the fallback answer, which
    /// must not occupy the primary slot.
    async fn fetch_uncached(&self, provider: &ProviderDescriptor) -> Result<StatusResult, StatusResult> {
        let started = Instant::now();
        let id = provider.id.as_str();

        let Some(interpreter) = self.interpreters.for_format(provider.format) else {
            warn!(provider = id, format = %provider.format, "No interpreter registered for format");
            let err = FetchError::Malformed(format!("unsupported response format {}", provider.format));
            return Err(self.cache.fallback(provider, &err, 0));
        };

        if !self.breakers.can_make_request(id) {
            debug!(provider = id, "Circuit open, serving fallback without a network call");
            return Err(self.cache.fallback(provider, &FetchError::CircuitOpen, 0));
        }

        let rule = self.config.provider_rate;
        let decision = self
            .limiter
            .check(&format!("provider:{}", id), rule.limit, rule.window)
            .await;
        if !decision.allowed {
            self.breakers.abandon_probe(id);
            let err = FetchError::RateLimited {
                retry_after_ms: decision.retry_after_ms.unwrap_or(0),
            };
            debug!(provider = id, "Outbound quota exhausted");
            return Err(self.cache.fallback(provider, &err, elapsed_ms(started)));
        }

        let timeout = provider.timeout();
        let http = self.http.as_ref();
        let outcome = self
            .config
            .retry
            .run(move |_| async move {
                match tokio::time::timeout(timeout, interpreter.check(provider, http)).await {
                    Ok(checked) => checked,
                    Err(_) => Err(FetchError::Timeout(timeout)),
                }
            })
            .await;
        let response_time_ms = elapsed_ms(started);

        match outcome {
            Ok(Retried { value: Interpretation { status, details }, retries }) => {
                self.breakers.record_success(id);
                let result = StatusResult::checked(provider, status, response_time_ms, details);
                self.cache.remember(&result);
                debug!(
                    provider = id,
                    status = %status,
                    retries = retries,
                    ms = response_time_ms,
                    strategy = interpreter.name(),
                    "Provider checked"
                );
                Ok(result)
            }
            Err(Retried { value: error, retries }) => {
                self.breakers.record_failure(id);
                warn!(provider = id, retries = retries, "Status check failed: {}", error);
                Err(self.cache.fallback(provider, &error, response_time_ms))
            }
        }
    }

    /// Every enabled provider, concurrently, cache first. Unlike
    /// `fetch_all` this is not a polling cycle: no scheduler, no summary.
    pub async fn current(&self) -> Vec<StatusResult> {
        let checks = self.providers.iter().filter(|p| p.enabled).map(|p| self.fetch(p));
        futures::future::join_all(checks).await
    }

    /// Check one provider by id. `None` if the id is not configured.
    pub async fn provider(&self, provider_id: &str) -> Option<StatusResult> {
        let descriptor = self.descriptor(provider_id)?;
        Some(self.fetch(descriptor).await)
    }

    /// Drop the cached result so the next fetch goes to the network.
    pub fn invalidate(&self, provider_id: &str) -> bool {
        self.cache.invalidate(provider_id)
    }

    /// Bypass the primary cache for one provider.
    pub async fn refresh(&self, provider_id: &str) -> Option<StatusResult> {
        let descriptor = self.descriptor(provider_id)?;
        self.invalidate(provider_id);
        Some(self.fetch(descriptor).await)
    }

    /// Bypass the primary cache for every provider.
    pub async fn refresh_all(self: &Arc<Self>) -> Vec<StatusResult> {
        for p in &self.providers {
            self.invalidate(&p.id);
        }
        self.fetch_all().await
    }

    /// One polling cycle: every enabled provider goes through the batch
    /// scheduler by priority. Results come back in configuration order.
    pub async fn fetch_all(self: &Arc<Self>) -> Vec<StatusResult> {
        let started = Instant::now();
        let cycle = Uuid::new_v4();
        debug!(cycle = %cycle, "Polling cycle starting");
        let scheduler = BatchScheduler::with_metrics(self.config.scheduler.clone(), Arc::clone(&self.metrics));
        let enabled: Vec<&ProviderDescriptor> = self.providers.iter().filter(|p| p.enabled).collect();
        for p in &enabled {
            // `fetch` retries on its own. The scheduler gets one attempt and
            // must not cut it short before the breaker sees the outcome.
            scheduler.enqueue_item(BatchItem {
                id: p.id.clone(),
                payload: (*p).clone(),
                priority: p.priority,
                retry_count: 0,
                max_retries: 0,
                timeout: self.cycle_item_timeout(p),
            });
        }

        let fetcher = Arc::clone(self);
        let batch = scheduler
            .process(move |provider: ProviderDescriptor| {
                let fetcher = Arc::clone(&fetcher);
                async move { Ok::<_, Infallible>(fetcher.fetch(&provider).await) }
            })
            .await;

        let mut by_id: HashMap<String, StatusResult> = HashMap::with_capacity(batch.len());
        for item in batch {
            if let Some(result) = item.value {
                by_id.insert(item.id, result);
            } else if let Some(p) = self.descriptor(&item.id) {
                // The scheduler abandoned the check: count it like a provider timeout.
                warn!(
                    provider = %item.id,
                    "Polling cycle abandoned the check: {}",
                    item.error.as_deref().unwrap_or("no result")
                );
                self.breakers.record_failure(&item.id);
                let error = FetchError::Timeout(item.elapsed);
                by_id.insert(item.id, self.cache.fallback(p, &error, item.elapsed.as_millis() as u64));
            }
        }
        let results: Vec<StatusResult> = enabled
            .iter()
            .filter_map(|p| by_id.remove(&p.id))
            .collect();

        let counts = StatusCounts::tally(&results);
        info!(
            cycle = %cycle,
            total = counts.total(),
            operational = counts.operational,
            degraded = counts.degraded,
            down = counts.down,
            unknown = counts.unknown,
            open_circuits = self.breakers.open_count(),
            duration_ms = elapsed_ms(started),
            "Polling cycle complete"
        );

        *self.last_cycle.write() = LastCycle {
            results: results.clone(),
            finished_at: Some(Utc::now()),
        };
        results
    }

    /// Scheduler timeout for one provider in a polling cycle: never shorter
    /// than a fully retried fetch.
    fn cycle_item_timeout(&self, provider: &ProviderDescriptor) -> Duration {
        let budget = self.config.retry.worst_case(provider.timeout()) + CYCLE_ITEM_GRACE;
        budget.max(self.config.scheduler.item_timeout)
    }

    /// Results of the last completed cycle, without triggering any check.
    pub fn last_results(&self) -> Vec<StatusResult> {
        self.last_cycle.read().results.clone()
    }

    pub fn health(&self) -> HealthReport {
        let (last_cycle, last_cycle_at) = {
            let cycle = self.last_cycle.read();
            (StatusCounts::tally(&cycle.results), cycle.finished_at)
        };
        let open_circuits = self.breakers.open_count();
        let enabled = self.providers.iter().filter(|p| p.enabled).count();

        let status = if last_cycle.total() > 0 && last_cycle.operational == 0 {
            "unhealthy"
        } else if open_circuits > 0 || last_cycle.operational < last_cycle.total() {
            "degraded"
        } else {
            "healthy"
        };

        HealthReport {
            status,
            providers: enabled,
            last_cycle,
            last_cycle_at,
            open_circuits,
            circuits: self.breakers.snapshot(),
            cache: self.cache.stats(),
            scheduler: self.metrics(),
        }
    }

    /// Reclaim expired cache entries and idle outbound limiter windows.
    pub async fn cleanup(&self) -> (usize, usize) {
        let swept = self.cache.sweep();
        let reclaimed = self.limiter.cleanup(self.config.provider_rate.window).await;
        (swept, reclaimed)
    }
}
