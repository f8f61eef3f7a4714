//! Retry controller: bounded exponential backoff with jitter.
//!
//! Purely temporal: knows nothing about breakers or caches. Delay before
//! retry `n` (0-based) is `base_delay × 2^n + U(0, max_jitter)`.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

/// A value together with how many retries it took to get it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

impl RetryPolicy {
    /// No retries at all; the first error is final.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let backoff = self.base_delay.saturating_mul(factor);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        backoff.saturating_add(jitter)
    }

    /// Longest a fully retried operation can take when every attempt runs
    /// for `attempt_timeout`: all attempts plus every backoff at full jitter.
    pub fn worst_case(&self, attempt_timeout: Duration) -> Duration {
        let attempts = attempt_timeout.saturating_mul(self.max_retries.saturating_add(1));
        (0..self.max_retries).fold(attempts, |total, n| {
            let factor = 1u32.checked_shl(n).unwrap_or(u32::MAX);
            total
                .saturating_add(self.base_delay.saturating_mul(factor))
                .saturating_add(self.max_jitter)
        })
    }

    /// Run `op` until it succeeds or `max_retries` retries are spent.
    /// `op` receives the 0-based attempt number. On exhaustion the last
    /// error is returned along with the retry count.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<Retried<T>, Retried<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(Retried { value, retries: attempt }),
                Err(error) if attempt >= self.max_retries => {
                    return Err(Retried { value: error, retries: attempt });
                }
                Err(error) => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt failed, backing off: {}",
                        error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_within_jitter_bounds() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_jitter: Duration::from_millis(50),
        };
        for attempt in 0..4 {
            let floor = Duration::from_millis(100 * (1 << attempt));
            let d = policy.delay_for(attempt);
            assert!(d >= floor && d <= floor + Duration::from_millis(50), "attempt {} gave {:?}", attempt, d);
        }
    }

    #[test]
    fn test_delay_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(64) >= policy.delay_for(10));
    }

    #[test]
    fn test_worst_case_covers_attempts_and_backoff() {
        let budget = RetryPolicy::default().worst_case(Duration::from_secs(10));
        // 4 attempts of 10s, then 1s + 2s + 4s of backoff and 3 × 1s of jitter.
        assert_eq!(budget, Duration::from_secs(40 + 7 + 3));
        assert_eq!(RetryPolicy::none().worst_case(Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_k_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = RetryPolicy::default()
            .run(move |_| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("flaky") } else { Ok("ok") }
            })
            .await
            .unwrap();
        assert_eq!(out, Retried { value: "ok", retries: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_final_error() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::default()
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(format!("failure #{}", attempt)) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.retries, 3);
        assert_eq!(err.value, "failure #3");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_actually_waits() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_jitter: Duration::ZERO,
        };
        let start = tokio::time::Instant::now();
        let _ = policy.run(|_| async { Err::<(), _>("down") }).await;
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }
}
