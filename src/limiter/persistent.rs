//! Shared sliding window limiter backed by SQLite.
//!
//! Every check is one `BEGIN IMMEDIATE` transaction (prune, count,
//! conditionally insert), so daemons pointing at the same database file
//! share a single counter per identifier. Store failures are logged and
//! the request is admitted.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{RateLimitDecision, RateLimiter};
use crate::error::LimiterError;

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub struct PersistentLimiter {
    db: Arc<Mutex<Connection>>,
    clock: Clock,
}

impl PersistentLimiter {
    /// Open (or create) the limiter database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, LimiterError> {
        let db = Connection::open(db_path)?;

        // WAL so other instances can read while one writes
        db.pragma_update(None, "journal_mode", "WAL")?;
        db.busy_timeout(Duration::from_secs(5))?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS rate_limit_hits (
                identifier TEXT NOT NULL,
                hit_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rate_limit_hits_key ON rate_limit_hits(identifier, hit_at_ms);
            CREATE INDEX IF NOT EXISTS idx_rate_limit_hits_time ON rate_limit_hits(hit_at_ms);
            ",
        )?;

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            clock: Arc::new(|| Utc::now().timestamp_millis()),
        })
    }

    /// Replace the wall clock (epoch milliseconds).
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T, LimiterError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, i64) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let now_ms = (self.clock)();
        let out = tokio::task::spawn_blocking(move || {
            let mut conn = db.lock();
            f(&mut *conn, now_ms)
        })
        .await??;
        Ok(out)
    }
}

fn window_ms(window: Duration) -> i64 {
    window.as_millis().min(i64::MAX as u128) as i64
}

fn count_window(
    conn: &Connection,
    key: &str,
    since_ms: i64,
) -> Result<(u32, Option<i64>), rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*), MIN(hit_at_ms) FROM rate_limit_hits
         WHERE identifier = ?1 AND hit_at_ms > ?2",
        params![key, since_ms],
        |row| Ok((row.get::<_, i64>(0)? as u32, row.get(1)?)),
    )
}

fn decide(limit: u32, used: u32, oldest: Option<i64>, now_ms: i64, span_ms: i64) -> RateLimitDecision {
    if used < limit {
        return RateLimitDecision::allowed(limit, limit - used);
    }
    let wait_ms = oldest.map_or(span_ms, |t| (t + span_ms - now_ms).max(0));
    RateLimitDecision::denied(limit, Duration::from_millis(wait_ms as u64))
}

fn check_tx(
    conn: &mut Connection,
    key: &str,
    limit: u32,
    span_ms: i64,
    now_ms: i64,
) -> Result<RateLimitDecision, rusqlite::Error> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let cutoff = now_ms - span_ms;
    tx.execute(
        "DELETE FROM rate_limit_hits WHERE identifier = ?1 AND hit_at_ms <= ?2",
        params![key, cutoff],
    )?;
    let (used, oldest) = count_window(&tx, key, cutoff)?;

    let decision = if used < limit {
        tx.execute(
            "INSERT INTO rate_limit_hits (identifier, hit_at_ms) VALUES (?1, ?2)",
            params![key, now_ms],
        )?;
        RateLimitDecision::allowed(limit, limit - used - 1)
    } else {
        decide(limit, used, oldest, now_ms, span_ms)
    };
    tx.commit()?;
    Ok(decision)
}

#[async_trait]
impl RateLimiter for PersistentLimiter {
    async fn check(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        let owned = key.to_string();
        let span_ms = window_ms(window);
        match self
            .with_db(move |conn, now_ms| check_tx(conn, &owned, limit, span_ms, now_ms))
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(key = key, "Rate limiter store unavailable, failing open: {}", e);
                RateLimitDecision::fail_open(limit)
            }
        }
    }

    async fn peek(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        let owned = key.to_string();
        let span_ms = window_ms(window);
        match self
            .with_db(move |conn, now_ms| {
                let (used, oldest) = count_window(conn, &owned, now_ms - span_ms)?;
                Ok(decide(limit, used, oldest, now_ms, span_ms))
            })
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(key = key, "Rate limiter store unavailable, failing open: {}", e);
                RateLimitDecision::fail_open(limit)
            }
        }
    }

    async fn cleanup(&self, idle: Duration) -> usize {
        let span_ms = window_ms(idle);
        match self
            .with_db(move |conn, now_ms| {
                conn.execute(
                    "DELETE FROM rate_limit_hits WHERE hit_at_ms <= ?1",
                    params![now_ms - span_ms],
                )
            })
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Rate limiter cleanup failed: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    const W: Duration = Duration::from_secs(60);

    fn limiter_at(path: &Path, clock: &Arc<AtomicI64>) -> PersistentLimiter {
        let clock = Arc::clone(clock);
        PersistentLimiter::open(path)
            .unwrap()
            .with_clock(move || clock.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_limit_and_window_reset() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(AtomicI64::new(1_000_000));
        let limiter = limiter_at(&dir.path().join("limits.db"), &clock);

        for i in 0..3 {
            let d = limiter.check("status:dash", 3, W).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, 2 - i);
            clock.fetch_add(1_000, Ordering::SeqCst);
        }
        let d = limiter.check("status:dash", 3, W).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.retry_after_ms, Some(57_000));

        clock.fetch_add(60_000, Ordering::SeqCst);
        assert!(limiter.check("status:dash", 3, W).await.allowed);
    }

    #[tokio::test]
    async fn test_instances_share_one_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let clock = Arc::new(AtomicI64::new(5_000_000));
        let a = limiter_at(&path, &clock);
        let b = limiter_at(&path, &clock);

        assert!(a.check("provider:openai", 2, W).await.allowed);
        assert!(b.check("provider:openai", 2, W).await.allowed);
        assert!(!a.check("provider:openai", 2, W).await.allowed);
        assert!(!b.check("provider:openai", 2, W).await.allowed);
    }

    #[tokio::test]
    async fn test_peek_does_not_record() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(AtomicI64::new(1_000));
        let limiter = limiter_at(&dir.path().join("peek.db"), &clock);

        limiter.check("k", 2, W).await;
        for _ in 0..5 {
            assert_eq!(limiter.peek("k", 2, W).await.remaining, 1);
        }
        assert!(limiter.check("k", 2, W).await.allowed);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.db");
        let clock = Arc::new(AtomicI64::new(1_000));
        let limiter = limiter_at(&path, &clock);

        Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE rate_limit_hits;")
            .unwrap();

        for _ in 0..5 {
            let d = limiter.check("k", 1, W).await;
            assert!(d.allowed, "broken store must not block traffic");
        }
        assert!(limiter.peek("k", 1, W).await.allowed);
        assert_eq!(limiter.cleanup(W).await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_reclaims_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(AtomicI64::new(1_000));
        let limiter = limiter_at(&dir.path().join("gc.db"), &clock);

        limiter.check("a", 5, W).await;
        limiter.check("b", 5, W).await;
        clock.fetch_add(120_000, Ordering::SeqCst);
        limiter.check("c", 5, W).await;

        assert_eq!(limiter.cleanup(W).await, 2);
        assert_eq!(limiter.peek("c", 5, W).await.remaining, 4);
    }
}
