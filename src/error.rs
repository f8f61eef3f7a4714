//! Error taxonomy for a single provider check.
//!
//! None of these escape `StatusFetcher::fetch`; they end up as the `error`
//! string of an `unknown` result.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {0}")]
    HttpStatus(u16),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("rate limit exceeded — retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("circuit breaker open — provider is failing, skipping network check")]
    CircuitOpen,
}

impl FetchError {
    /// Translate a transport failure, keeping timeouts distinguishable.
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(timeout)
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Infrastructure failures of the shared rate limiter. Callers never see
/// these: the limiter logs them and lets the request through.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("rate-limit store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("rate-limit task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_user_readable() {
        assert_eq!(
            FetchError::Timeout(Duration::from_secs(3)).to_string(),
            "request timed out after 3000ms"
        );
        assert_eq!(FetchError::HttpStatus(503).to_string(), "HTTP 503");
        assert!(FetchError::CircuitOpen.to_string().contains("circuit breaker"));
    }
}
