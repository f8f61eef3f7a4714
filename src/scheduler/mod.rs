//! Priority batch scheduler.
//!
//! A max-heap of pending items feeds a semaphore-bounded worker pool.
//! `process` drains the heap in batches of `batch_size`: permits are taken
//! in priority order, so when the pool is saturated the highest-priority
//! item waiting is always the next to start. Each attempt races a timeout;
//! failed items retry with exponential backoff up to their `max_retries`.
//! Completion order within a batch is whatever the network makes it.

use futures::FutureExt;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{self, AtomicU64};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub mod metrics;

pub use metrics::{MetricsRecorder, SchedulerMetrics};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on items in flight.
    pub concurrency: usize,
    /// Items pulled from the heap per round.
    pub batch_size: usize,
    /// Default per-attempt timeout for enqueued items.
    pub item_timeout: Duration,
    /// Default retry cap for enqueued items.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Pause per item of the previous batch before pulling the next one.
    pub delay_per_item: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            batch_size: 50,
            item_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            delay_per_item: Duration::from_millis(10),
        }
    }
}

/// A unit of scheduled work.
#[derive(Debug, Clone)]
pub struct BatchItem<P> {
    pub id: String,
    pub payload: P,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BatchResult<T> {
    pub id: String,
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<String>,
    pub elapsed: Duration,
    pub retries: u32,
}

struct Queued<P> {
    item: BatchItem<P>,
    seq: u64,
}

impl<P> PartialEq for Queued<P> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P> Eq for Queued<P> {}

impl<P> PartialOrd for Queued<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Queued<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; among equals, earlier enqueue first.
        self.item
            .priority
            .cmp(&other.item.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct BatchScheduler<P> {
    config: SchedulerConfig,
    queue: Mutex<BinaryHeap<Queued<P>>>,
    seq: AtomicU64,
    permits: Arc<Semaphore>,
    metrics: Arc<MetricsRecorder>,
}

impl<P: Clone + Send + 'static> BatchScheduler<P> {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_metrics(config, Arc::new(MetricsRecorder::new()))
    }

    /// Share one recorder across several schedulers (one per polling cycle).
    pub fn with_metrics(config: SchedulerConfig, metrics: Arc<MetricsRecorder>) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            config,
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            permits,
            metrics,
        }
    }

    /// Queue `payload` with the configured timeout and retry cap.
    pub fn enqueue(&self, id: impl Into<String>, payload: P, priority: i32) {
        self.enqueue_item(BatchItem {
            id: id.into(),
            payload,
            priority,
            retry_count: 0,
            max_retries: self.config.max_retries,
            timeout: self.config.item_timeout,
        });
    }

    pub fn enqueue_item(&self, item: BatchItem<P>) {
        let seq = self.seq.fetch_add(1, atomic::Ordering::Relaxed);
        self.queue.lock().push(Queued { item, seq });
        self.metrics.record_enqueued(1);
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.snapshot()
    }

    fn take_batch(&self) -> Vec<BatchItem<P>> {
        let mut queue = self.queue.lock();
        let n = self.config.batch_size.max(1).min(queue.len());
        let batch: Vec<BatchItem<P>> = (0..n).filter_map(|_| queue.pop().map(|q| q.item)).collect();
        self.metrics.record_dequeued(batch.len());
        batch
    }

    /// Drain the queue through `handler`, returning one result per item.
    pub async fn process<T, E, F, Fut>(&self, handler: F) -> Vec<BatchResult<T>>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let handler = Arc::new(handler);
        let started = Instant::now();
        let mut results = Vec::new();

        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                break;
            }
            let size = batch.len();
            debug!(size = size, remaining = self.queue_depth(), "Dispatching batch");

            let mut workers = JoinSet::new();
            for item in batch {
                let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                    error!("Scheduler semaphore closed — abandoning batch");
                    break;
                };
                let handler = Arc::clone(&handler);
                let metrics = Arc::clone(&self.metrics);
                let base_delay = self.config.retry_base_delay;
                workers.spawn(async move {
                    let _permit = permit;
                    run_item(item, handler.as_ref(), base_delay, &metrics).await
                });
            }

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(e) => error!("Batch worker did not complete: {}", e),
                }
            }

            if self.queue_depth() > 0 {
                let pause = self.config.delay_per_item.saturating_mul(size as u32);
                tokio::time::sleep(pause).await;
            }
        }

        self.metrics.record_run(started);
        results
    }
}

async fn run_item<P, T, E, F, Fut>(
    mut item: BatchItem<P>,
    handler: &F,
    base_delay: Duration,
    metrics: &MetricsRecorder,
) -> BatchResult<T>
where
    P: Clone,
    F: Fn(P) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    loop {
        let payload = item.payload.clone();
        let attempt = AssertUnwindSafe(async { handler(payload).await }).catch_unwind();

        let error = match tokio::time::timeout(item.timeout, attempt).await {
            Ok(Ok(Ok(value))) => {
                let elapsed = started.elapsed();
                metrics.record_completion(true, elapsed);
                return BatchResult {
                    id: item.id,
                    success: true,
                    value: Some(value),
                    error: None,
                    elapsed,
                    retries: item.retry_count,
                };
            }
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(_)) => "worker panicked".to_string(),
            Err(_) => format!("timed out after {}ms", item.timeout.as_millis()),
        };

        if item.retry_count >= item.max_retries {
            let elapsed = started.elapsed();
            metrics.record_completion(false, elapsed);
            warn!(id = %item.id, retries = item.retry_count, "Batch item failed: {}", error);
            return BatchResult {
                id: item.id,
                success: false,
                value: None,
                error: Some(error),
                elapsed,
                retries: item.retry_count,
            };
        }

        let factor = 1u32.checked_shl(item.retry_count).unwrap_or(u32::MAX);
        item.retry_count += 1;
        metrics.record_retry();
        debug!(id = %item.id, attempt = item.retry_count, "Retrying batch item: {}", error);
        tokio::time::sleep(base_delay.saturating_mul(factor)).await;
    }
}
