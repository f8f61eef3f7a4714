//! Rate limiting: one contract, two backings.
//!
//! `SlidingWindowLimiter` keeps windows in process memory.
//! `PersistentLimiter` keeps them in SQLite so several daemon instances
//! share one counter, and lets traffic through whenever its store fails.
//!
//! Only admitted requests are recorded, so a window never retains more
//! than `limit` timestamps.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod persistent;
pub mod sliding;

pub use persistent::PersistentLimiter;
pub use sliding::SlidingWindowLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Set on denial: how long until the oldest request leaves the window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl RateLimitDecision {
    pub fn allowed(limit: u32, remaining: u32) -> Self {
        Self { allowed: true, limit, remaining, retry_after_ms: None }
    }

    pub fn denied(limit: u32, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            retry_after_ms: Some(retry_after.as_millis() as u64),
        }
    }

    /// Verdict used when the limiter itself is broken.
    pub fn fail_open(limit: u32) -> Self {
        Self::allowed(limit, limit)
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count a request for `key` and decide whether it may proceed.
    async fn check(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision;

    /// Same verdict as `check` would give, without recording anything.
    async fn peek(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision;

    /// Forget identifiers with no activity in the last `idle`. Returns how
    /// many records were reclaimed.
    async fn cleanup(&self, idle: Duration) -> usize;
}

// ── Endpoint Classes ────────────────────────────────────────────────

/// Classes of API traffic, each with its own client quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Status,
    Health,
    Provider,
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointClass::Status => write!(f, "status"),
            EndpointClass::Health => write!(f, "health"),
            EndpointClass::Provider => write!(f, "provider"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub fn per_minute(limit: u32) -> Self {
        Self { limit, window: Duration::from_secs(60) }
    }
}

/// Per-client quotas for the API surface.
pub struct ClientLimits {
    limiter: Arc<dyn RateLimiter>,
    rules: HashMap<EndpointClass, RateLimitRule>,
}

impl ClientLimits {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { limiter, rules: HashMap::new() }
    }

    pub fn with_rule(mut self, class: EndpointClass, rule: RateLimitRule) -> Self {
        self.rules.insert(class, rule);
        self
    }

    /// Classes without a rule are unlimited.
    pub async fn check(&self, class: EndpointClass, client: &str) -> RateLimitDecision {
        match self.rules.get(&class) {
            Some(rule) => {
                let key = format!("{}:{}", class, client);
                self.limiter.check(&key, rule.limit, rule.window).await
            }
            None => RateLimitDecision::allowed(u32::MAX, u32::MAX),
        }
    }

    /// Longest configured window; anything idle for longer can go.
    pub fn longest_window(&self) -> Duration {
        self.rules
            .values()
            .map(|r| r.window)
            .max()
            .unwrap_or(Duration::from_secs(60))
    }

    pub async fn cleanup(&self) -> usize {
        self.limiter.cleanup(self.longest_window()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_classes_have_independent_quotas() {
        let limits = ClientLimits::new(Arc::new(SlidingWindowLimiter::new()))
            .with_rule(EndpointClass::Status, RateLimitRule::per_minute(1))
            .with_rule(EndpointClass::Health, RateLimitRule::per_minute(2));

        assert!(limits.check(EndpointClass::Status, "dash").await.allowed);
        assert!(!limits.check(EndpointClass::Status, "dash").await.allowed);
        assert!(limits.check(EndpointClass::Status, "cli").await.allowed);
        assert!(limits.check(EndpointClass::Health, "dash").await.allowed);
        assert!(limits.check(EndpointClass::Provider, "dash").await.allowed, "no rule, no limit");
    }

    #[test]
    fn test_longest_window() {
        let limits = ClientLimits::new(Arc::new(SlidingWindowLimiter::new()))
            .with_rule(EndpointClass::Status, RateLimitRule::per_minute(1))
            .with_rule(
                EndpointClass::Health,
                RateLimitRule { limit: 5, window: Duration::from_secs(300) },
            );
        assert_eq!(limits.longest_window(), Duration::from_secs(300));
    }

    #[test]
    fn test_decision_serialization() {
        let json = serde_json::to_value(RateLimitDecision::denied(5, Duration::from_millis(1500))).unwrap();
        assert_eq!(json["allowed"], false);
        assert_eq!(json["remaining"], 0);
        assert_eq!(json["retryAfterMs"], 1500);
    }
}
