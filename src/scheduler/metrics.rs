//! Scheduler counters. Observability only: nothing reads these to make
//! scheduling decisions.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct MetricsRecorder {
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    total_latency_ms: AtomicU64,
    busy: Mutex<Duration>,
    /// Items waiting in any scheduler sharing this recorder.
    queued: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerMetrics {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    /// Items completed per second of processing time.
    pub throughput_per_sec: f64,
    pub avg_latency_ms: f64,
    /// Retries per processed item.
    pub retry_rate: f64,
    pub queue_depth: usize,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completion(&self, success: bool, elapsed: Duration) {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_enqueued(&self, n: usize) {
        self.queued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self, n: usize) {
        // Saturating: never wraps below zero.
        let _ = self
            .queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |q| Some(q.saturating_sub(n)));
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Add the wall time of one `process` run.
    pub fn record_run(&self, started: Instant) {
        *self.busy.lock() += started.elapsed();
    }

    pub fn snapshot(&self) -> SchedulerMetrics {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let retries = self.retries.load(Ordering::Relaxed);
        let processed = succeeded + failed;
        let busy_secs = self.busy.lock().as_secs_f64();

        let per = |n: f64| if processed == 0 { 0.0 } else { n / processed as f64 };
        SchedulerMetrics {
            processed,
            succeeded,
            failed,
            retries,
            throughput_per_sec: if busy_secs > 0.0 { processed as f64 / busy_secs } else { 0.0 },
            avg_latency_ms: per(self.total_latency_ms.load(Ordering::Relaxed) as f64),
            retry_rate: per(retries as f64),
            queue_depth: self.queued.load(Ordering::Relaxed),
        }
    }
}
