//! In-process sliding window limiter.
//!
//! Each identifier owns a queue of admission timestamps inside a `DashMap`
//! slot; prune, count and append happen under that slot's lock, so
//! concurrent callers never lose an increment.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::{RateLimitDecision, RateLimiter};

#[derive(Default)]
pub struct SlidingWindowLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
}

/// Remove timestamps that fell out of the trailing window.
fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(&front) = window.front() {
        if now.saturating_duration_since(front) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn retry_after(window: &VecDeque<Instant>, now: Instant, span: Duration) -> Duration {
    window
        .front()
        .map_or(span, |&oldest| span.saturating_sub(now.saturating_duration_since(oldest)))
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    fn check_now(&self, key: &str, limit: u32, span: Duration) -> RateLimitDecision {
        let now = Instant::now();
        let mut window = self.windows.entry(key.to_string()).or_default();
        prune(&mut window, now, span);

        let used = window.len() as u32;
        if used < limit {
            window.push_back(now);
            RateLimitDecision::allowed(limit, limit - used - 1)
        } else {
            RateLimitDecision::denied(limit, retry_after(&window, now, span))
        }
    }

    fn peek_now(&self, key: &str, limit: u32, span: Duration) -> RateLimitDecision {
        let now = Instant::now();
        let Some(window) = self.windows.get(key) else {
            return RateLimitDecision::allowed(limit, limit);
        };
        let live: VecDeque<Instant> = window
            .iter()
            .copied()
            .filter(|t| now.saturating_duration_since(*t) < span)
            .collect();
        let used = live.len() as u32;
        if used < limit {
            RateLimitDecision::allowed(limit, limit - used)
        } else {
            RateLimitDecision::denied(limit, retry_after(&live, now, span))
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn check(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        self.check_now(key, limit, window)
    }

    async fn peek(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        self.peek_now(key, limit, window)
    }

    async fn cleanup(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window
                .back()
                .map_or(false, |&newest| now.saturating_duration_since(newest) < idle)
        });
        before - self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::advance;

    const W: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_first_n_allowed_then_denied() {
        let limiter = SlidingWindowLimiter::new();
        for i in 0..5 {
            let d = limiter.check("client", 5, W).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, 4 - i);
        }
        let d = limiter.check("client", 5, W).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.retry_after_ms, Some(60_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new();
        limiter.check("k", 2, W).await;
        advance(Duration::from_secs(30)).await;
        limiter.check("k", 2, W).await;

        let d = limiter.check("k", 2, W).await;
        assert!(!d.allowed);
        assert_eq!(d.retry_after_ms, Some(30_000));

        advance(Duration::from_secs(30)).await;
        assert!(limiter.check("k", 2, W).await.allowed, "oldest request left the window");
        assert!(!limiter.check("k", 2, W).await.allowed);

        advance(W).await;
        assert!(limiter.check("k", 2, W).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_requests_are_not_recorded() {
        let limiter = SlidingWindowLimiter::new();
        limiter.check("k", 1, W).await;
        for _ in 0..10 {
            limiter.check("k", 1, W).await;
        }
        assert_eq!(limiter.windows.get("k").unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_is_idempotent() {
        let limiter = SlidingWindowLimiter::new();
        limiter.check("k", 3, W).await;
        for _ in 0..10 {
            let d = limiter.peek("k", 3, W).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, 2);
        }
        assert_eq!(limiter.peek("unseen", 3, W).await.remaining, 3);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_reclaims_idle_keys() {
        let limiter = SlidingWindowLimiter::new();
        limiter.check("stale", 5, W).await;
        advance(Duration::from_secs(90)).await;
        limiter.check("fresh", 5, W).await;

        assert_eq!(limiter.cleanup(W).await, 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_lose_no_increments() {
        let limiter = Arc::new(SlidingWindowLimiter::new());
        let mut handles = Vec::new();
        for _ in 0..200 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.check("hot", 50, Duration::from_secs(3600)).await.allowed
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
    }
}
