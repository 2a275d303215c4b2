//! Dispatcher - drains the event bus into sinks
//!
//! One delivery task per sink, each with its own bus cursor, so a slow
//! or failing sink only ever hurts itself. A task accumulates events
//! into a batch and delivers when the batch is full or the flush
//! interval has elapsed since the first queued event, whichever comes
//! first.
//!
//! Delivery makes a bounded number of attempts with exponential backoff
//! between them. A batch that exhausts its attempts goes to the fallback
//! sink exactly once (when configured), otherwise it is dropped and
//! counted. Nothing here ever surfaces to a proxied request.
//!
//! Shutdown rides the bus: when the bus stops, each cursor drains its
//! buffered events, the task flushes what remains under a bounded
//! deadline, and closes its sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bus::{EventBus, Subscription};
use crate::config::DispatcherSettings;
use crate::events::RequestEvent;

pub mod plugins;

pub use plugins::EventSink;

/// Backoff ceiling; a misbehaving collector should not stall a cursor
/// for minutes per batch.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Counters for the dispatch pipeline.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub delivered_batches: AtomicU64,
    pub delivered_events: AtomicU64,
    pub retry_attempts: AtomicU64,
    pub failed_batches: AtomicU64,
    pub fallback_batches: AtomicU64,
    pub dropped_events: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DispatchSnapshot {
    pub delivered_batches: u64,
    pub delivered_events: u64,
    pub retry_attempts: u64,
    pub failed_batches: u64,
    pub fallback_batches: u64,
    pub dropped_events: u64,
}

impl DispatchMetrics {
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            delivered_batches: self.delivered_batches.load(Ordering::Relaxed),
            delivered_events: self.delivered_events.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            fallback_batches: self.fallback_batches.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }
}

/// Owns the delivery tasks. Construct with [`Dispatcher::start`], stop
/// by stopping the bus and then awaiting [`Dispatcher::shutdown`].
pub struct Dispatcher {
    tasks: Vec<JoinHandle<()>>,
    metrics: Arc<DispatchMetrics>,
    shutdown_deadline: Duration,
}

impl Dispatcher {
    /// Subscribe every sink to the bus and start its delivery task.
    pub fn start(
        bus: &EventBus,
        sinks: Vec<Arc<dyn EventSink>>,
        fallback: Option<Arc<dyn EventSink>>,
        settings: DispatcherSettings,
    ) -> Self {
        let metrics = Arc::new(DispatchMetrics::default());
        let mut tasks = Vec::with_capacity(sinks.len());
        for sink in sinks {
            let subscription = bus.subscribe();
            let task = tokio::spawn(delivery_loop(
                subscription,
                sink,
                fallback.clone(),
                settings.clone(),
                metrics.clone(),
            ));
            tasks.push(task);
        }
        Self {
            tasks,
            metrics,
            shutdown_deadline: settings.shutdown_flush_deadline,
        }
    }

    pub fn metrics(&self) -> DispatchSnapshot {
        self.metrics.snapshot()
    }

    /// Shared handle to the counters; outlives `shutdown(self)` so the
    /// health endpoint can keep reading them.
    pub fn metrics_handle(&self) -> Arc<DispatchMetrics> {
        self.metrics.clone()
    }

    /// Wait for the delivery tasks to finish their final flush. Call
    /// after `bus.stop()`; tasks that exceed the deadline are abandoned.
    pub async fn shutdown(self) {
        // Margin covers the per-task bounded final flush plus close
        let deadline = self.shutdown_deadline + Duration::from_secs(1);
        for task in self.tasks {
            if tokio::time::timeout(deadline, task).await.is_err() {
                tracing::warn!("Dispatcher task did not finish final flush in time");
            }
        }
    }
}

async fn delivery_loop(
    mut subscription: Subscription,
    sink: Arc<dyn EventSink>,
    fallback: Option<Arc<dyn EventSink>>,
    settings: DispatcherSettings,
    metrics: Arc<DispatchMetrics>,
) {
    let mut batch: Vec<RequestEvent> = Vec::with_capacity(settings.batch_size);
    // Set when the first event of a batch arrives
    let mut flush_at: Option<Instant> = None;

    loop {
        let next = match flush_at {
            Some(deadline) => match tokio::time::timeout_at(deadline, subscription.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    // Interval elapsed with a partial batch
                    deliver(&sink, &fallback, &mut batch, &settings, &metrics).await;
                    flush_at = None;
                    continue;
                }
            },
            None => subscription.recv().await,
        };

        match next {
            Some(event) => {
                if batch.is_empty() {
                    flush_at = Some(Instant::now() + settings.flush_interval);
                }
                batch.push(event);
                if batch.len() >= settings.batch_size {
                    deliver(&sink, &fallback, &mut batch, &settings, &metrics).await;
                    flush_at = None;
                }
            }
            None => {
                // Bus stopped and cursor drained: bounded final flush
                if !batch.is_empty() {
                    let flush = deliver(&sink, &fallback, &mut batch, &settings, &metrics);
                    if tokio::time::timeout(settings.shutdown_flush_deadline, flush)
                        .await
                        .is_err()
                    {
                        tracing::warn!(sink = sink.name(), "Final flush exceeded deadline");
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = sink.close().await {
        tracing::warn!(sink = sink.name(), "Sink close failed: {e:#}");
    }
    tracing::debug!(sink = sink.name(), "Dispatcher task finished");
}

/// Deliver the current batch: up to `max_retries` attempts with
/// `base · 2^k` backoff between them, then fallback or drop. Empty
/// batches are a no-op (no sink call).
async fn deliver(
    sink: &Arc<dyn EventSink>,
    fallback: &Option<Arc<dyn EventSink>>,
    batch: &mut Vec<RequestEvent>,
    settings: &DispatcherSettings,
    metrics: &DispatchMetrics,
) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    let attempts = settings.max_retries.max(1);

    for attempt in 0..attempts {
        match sink.send_events(&events).await {
            Ok(()) => {
                metrics.delivered_batches.fetch_add(1, Ordering::Relaxed);
                metrics
                    .delivered_events
                    .fetch_add(events.len() as u64, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    sink = sink.name(),
                    attempt = attempt + 1,
                    "Sink delivery failed: {e:#}"
                );
                if attempt + 1 < attempts {
                    metrics.retry_attempts.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(backoff_delay(settings.retry_base_delay, attempt)).await;
                }
            }
        }
    }

    metrics.failed_batches.fetch_add(1, Ordering::Relaxed);
    if settings.fallback_on_failure {
        if let Some(fallback) = fallback {
            match fallback.send_events(&events).await {
                Ok(()) => {
                    metrics.fallback_batches.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        sink = sink.name(),
                        events = events.len(),
                        "Batch routed to fallback sink"
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!("Fallback sink failed, dropping batch: {e:#}");
                }
            }
        }
    }
    metrics
        .dropped_events
        .fetch_add(events.len() as u64, Ordering::Relaxed);
}

/// `base · 2^attempt`, capped.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}
