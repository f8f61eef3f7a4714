//! Circuit breaker registry, one state machine per provider.
//!
//! ```text
//! Closed --[failures >= threshold]--> Open
//! Open --[reset_timeout since last failure]--> HalfOpen
//! HalfOpen --[probe succeeds]--> Closed (failures = 0)
//! HalfOpen --[probe fails]--> Open (last failure refreshed)
//! ```
//!
//! Each provider's entry lives in its own `DashMap` slot, so updates are
//! atomic per provider without serializing unrelated providers.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Cool-down after the last failure before a probe is let through.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    /// Set while a half-open probe is outstanding.
    probe_started: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            probe_started: None,
        }
    }

    fn cooled_down(&self, now: Instant, reset_timeout: Duration) -> bool {
        self.last_failure
            .map_or(true, |t| now.saturating_duration_since(t) >= reset_timeout)
    }
}

/// Point-in-time view of one provider's breaker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub provider_id: String,
    pub state: CircuitState,
    pub failures: u32,
    pub seconds_since_failure: Option<u64>,
}

pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Breaker>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Gate for a network attempt. May move `Open → HalfOpen`; while half
    /// open, only one probe is admitted at a time.
    pub fn can_make_request(&self, provider_id: &str) -> bool {
        let now = Instant::now();
        let mut breaker = self
            .breakers
            .entry(provider_id.to_string())
            .or_insert_with(Breaker::new);

        let state = breaker.state;
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if breaker.cooled_down(now, self.config.reset_timeout) {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.probe_started = Some(now);
                    info!(provider = provider_id, "Circuit half-open — letting a probe through");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // A probe whose outcome never arrived (cancelled task) must
                // not wedge the breaker forever.
                let stale = breaker
                    .probe_started
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.config.reset_timeout);
                if stale {
                    breaker.probe_started = Some(now);
                }
                stale
            }
        }
    }

    pub fn record_success(&self, provider_id: &str) {
        let mut breaker = self
            .breakers
            .entry(provider_id.to_string())
            .or_insert_with(Breaker::new);
        if breaker.state != CircuitState::Closed {
            info!(provider = provider_id, from = %breaker.state, "Circuit closed — provider recovered");
        }
        breaker.state = CircuitState::Closed;
        breaker.failures = 0;
        breaker.probe_started = None;
    }

    pub fn record_failure(&self, provider_id: &str) {
        let now = Instant::now();
        let mut breaker = self
            .breakers
            .entry(provider_id.to_string())
            .or_insert_with(Breaker::new);
        breaker.failures = breaker.failures.saturating_add(1);
        breaker.last_failure = Some(now);
        breaker.probe_started = None;

        let state = breaker.state;
        match state {
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Open;
                warn!(provider = provider_id, failures = breaker.failures, "Circuit re-opened — probe failed");
            }
            CircuitState::Closed if breaker.failures >= self.config.failure_threshold => {
                breaker.state = CircuitState::Open;
                warn!(
                    provider = provider_id,
                    failures = breaker.failures,
                    reset_secs = self.config.reset_timeout.as_secs(),
                    "Circuit opened — short-circuiting requests"
                );
            }
            _ => {}
        }
    }

    /// Give back a half-open probe slot that was admitted but never used.
    pub fn abandon_probe(&self, provider_id: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(provider_id) {
            breaker.probe_started = None;
        }
    }

    /// Current state without triggering any transition.
    pub fn state(&self, provider_id: &str) -> CircuitState {
        self.breakers
            .get(provider_id)
            .map_or(CircuitState::Closed, |b| b.state)
    }

    pub fn failures(&self, provider_id: &str) -> u32 {
        self.breakers.get(provider_id).map_or(0, |b| b.failures)
    }

    /// Operator override: forget everything about a provider.
    pub fn reset(&self, provider_id: &str) {
        if self.breakers.remove(provider_id).is_some() {
            info!(provider = provider_id, "Circuit manually reset");
        }
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|b| b.state != CircuitState::Closed)
            .count()
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut out: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                provider_id: entry.key().clone(),
                state: entry.state,
                failures: entry.failures,
                seconds_since_failure: entry
                    .last_failure
                    .map(|t| now.saturating_duration_since(t).as_secs()),
            })
            .collect();
        out.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        out
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn trip(registry: &CircuitBreakerRegistry, id: &str) {
        for _ in 0..registry.config().failure_threshold {
            assert!(registry.can_make_request(id));
            registry.record_failure(id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let registry = CircuitBreakerRegistry::default();
        for _ in 0..4 {
            registry.record_failure("openai");
        }
        assert_eq!(registry.state("openai"), CircuitState::Closed);
        assert!(registry.can_make_request("openai"));

        registry.record_failure("openai");
        assert_eq!(registry.state("openai"), CircuitState::Open);
        assert!(!registry.can_make_request("openai"));
        assert_eq!(registry.failures("openai"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout_and_success_closes() {
        let registry = CircuitBreakerRegistry::default();
        trip(&registry, "anthropic");

        advance(Duration::from_secs(59)).await;
        assert!(!registry.can_make_request("anthropic"));

        advance(Duration::from_secs(1)).await;
        assert!(registry.can_make_request("anthropic"));
        assert_eq!(registry.state("anthropic"), CircuitState::HalfOpen);

        registry.record_success("anthropic");
        assert_eq!(registry.state("anthropic"), CircuitState::Closed);
        assert_eq!(registry.failures("anthropic"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_timestamp() {
        let registry = CircuitBreakerRegistry::default();
        trip(&registry, "groq");
        advance(Duration::from_secs(60)).await;
        assert!(registry.can_make_request("groq"));

        registry.record_failure("groq");
        assert_eq!(registry.state("groq"), CircuitState::Open);

        advance(Duration::from_secs(30)).await;
        assert!(!registry.can_make_request("groq"), "cool-down restarts from the failed probe");
        advance(Duration::from_secs(30)).await;
        assert!(registry.can_make_request("groq"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let registry = CircuitBreakerRegistry::default();
        trip(&registry, "mistral");
        advance(Duration::from_secs(60)).await;

        assert!(registry.can_make_request("mistral"));
        assert!(!registry.can_make_request("mistral"));

        registry.abandon_probe("mistral");
        assert!(registry.can_make_request("mistral"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_probe_is_readmitted_after_timeout() {
        let registry = CircuitBreakerRegistry::default();
        trip(&registry, "cohere");
        advance(Duration::from_secs(60)).await;
        assert!(registry.can_make_request("cohere"));

        advance(Duration::from_secs(60)).await;
        assert!(registry.can_make_request("cohere"));
    }

    #[test]
    fn test_success_resets_counter_and_providers_are_isolated() {
        let registry = CircuitBreakerRegistry::default();
        registry.record_failure("a");
        registry.record_failure("a");
        registry.record_failure("b");
        registry.record_success("a");

        assert_eq!(registry.failures("a"), 0);
        assert_eq!(registry.failures("b"), 1);
    }

    #[test]
    fn test_state_query_is_read_only() {
        let registry = CircuitBreakerRegistry::default();
        assert_eq!(registry.state("never-seen"), CircuitState::Closed);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_and_reset() {
        let registry = CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        });
        registry.record_failure("b");
        registry.record_success("a");

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].provider_id, "a");
        assert_eq!(snap[1].state, CircuitState::Open);
        assert_eq!(registry.open_count(), 1);

        registry.reset("b");
        assert_eq!(registry.state("b"), CircuitState::Closed);
        assert_eq!(registry.open_count(), 0);
    }
}
