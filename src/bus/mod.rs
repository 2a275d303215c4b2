//! Event bus - bounded publish/subscribe between the request path and
//! the dispatch pipeline
//!
//! The contract the request path relies on:
//!
//! - `publish` never blocks and never fails the caller. When nobody can
//!   take the event it is dropped and counted.
//! - Each subscriber owns an independent cursor over a bounded ring.
//!   A slow subscriber loses the oldest events on its own cursor only;
//!   publishers and other subscribers are unaffected.
//! - `stop` lets subscribers drain what is buffered, then ends their
//!   streams.
//!
//! Two backends: the in-process ring (default), and an AMQP bridge for
//! multi-process deployments behind the `amqp-bus` cargo feature. The
//! broker being down degrades publishing to drop+count, never to a
//! client-visible failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::config::{BusBackend, BusConfig};
use crate::events::RequestEvent;

#[cfg(feature = "amqp-bus")]
pub mod amqp;

/// Counters for observability of the bus itself.
#[derive(Debug, Default)]
pub struct BusMetrics {
    /// Events accepted into the ring.
    pub published: AtomicU64,
    /// Events lost: no live subscriber at publish, or overwritten before
    /// a lagging subscriber reached them.
    pub dropped: AtomicU64,
}

impl BusMetrics {
    pub fn snapshot(&self) -> BusSnapshot {
        BusSnapshot {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BusSnapshot {
    pub published: u64,
    pub dropped: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process ring
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded in-process ring over `tokio::sync::broadcast`: a fixed ring
/// with atomic indices, independent receiver cursors, and oldest-first
/// overwrite on overflow.
pub struct MemoryBus {
    sender: RwLock<Option<broadcast::Sender<RequestEvent>>>,
    metrics: Arc<BusMetrics>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: RwLock::new(Some(tx)),
            metrics: Arc::new(BusMetrics::default()),
        }
    }

    fn publish(&self, event: RequestEvent) {
        let guard = self.sender.read().expect("bus lock poisoned");
        match guard.as_ref() {
            Some(tx) => match tx.send(event) {
                Ok(_) => {
                    self.metrics.published.fetch_add(1, Ordering::Relaxed);
                }
                // No live subscriber: the event has nowhere to go
                Err(_) => {
                    self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
            // Stopped: publishing is a counted no-op
            None => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn subscribe(&self) -> MemorySubscription {
        let guard = self.sender.read().expect("bus lock poisoned");
        let rx = match guard.as_ref() {
            Some(tx) => tx.subscribe(),
            // Already stopped: hand out a cursor that ends immediately
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        };
        MemorySubscription {
            rx,
            metrics: self.metrics.clone(),
            lagged: 0,
        }
    }

    fn stop(&self) {
        // Dropping the sender lets receivers drain buffered events and
        // then observe Closed
        let mut guard = self.sender.write().expect("bus lock poisoned");
        *guard = None;
    }
}

/// One subscriber's cursor over the ring.
pub struct MemorySubscription {
    rx: broadcast::Receiver<RequestEvent>,
    metrics: Arc<BusMetrics>,
    lagged: u64,
}

impl MemorySubscription {
    /// Next event, or `None` once the bus has stopped and the cursor is
    /// drained. Overwritten events are counted and skipped.
    pub async fn recv(&mut self) -> Option<RequestEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.lagged += n;
                    self.metrics.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events this cursor lost to overwrite.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend selection
// ─────────────────────────────────────────────────────────────────────────────

/// The bus handed to the proxy and the dispatcher. Backend is fixed at
/// startup from configuration.
pub enum EventBus {
    Memory(MemoryBus),
    #[cfg(feature = "amqp-bus")]
    Amqp(amqp::AmqpBus),
}

impl EventBus {
    /// Build the configured backend.
    pub fn from_config(config: &BusConfig) -> anyhow::Result<Self> {
        match config.backend {
            BusBackend::Memory => Ok(EventBus::Memory(MemoryBus::new(config.capacity))),
            #[cfg(feature = "amqp-bus")]
            BusBackend::Amqp => Ok(EventBus::Amqp(amqp::AmqpBus::new(config)?)),
            #[cfg(not(feature = "amqp-bus"))]
            BusBackend::Amqp => anyhow::bail!(
                "EVENT_BUS_BACKEND=amqp but this binary was built without the amqp-bus feature"
            ),
        }
    }

    /// In-process bus with the given ring capacity.
    pub fn in_memory(capacity: usize) -> Self {
        EventBus::Memory(MemoryBus::new(capacity))
    }

    /// Publish an event. Non-blocking; drops are counted, never surfaced.
    pub fn publish(&self, event: RequestEvent) {
        match self {
            EventBus::Memory(bus) => bus.publish(event),
            #[cfg(feature = "amqp-bus")]
            EventBus::Amqp(bus) => bus.publish(event),
        }
    }

    /// Open an independent cursor over the event stream.
    pub fn subscribe(&self) -> Subscription {
        match self {
            EventBus::Memory(bus) => Subscription::Memory(bus.subscribe()),
            #[cfg(feature = "amqp-bus")]
            EventBus::Amqp(bus) => Subscription::Amqp(bus.subscribe()),
        }
    }

    /// Stop accepting events; subscribers drain and then end.
    pub fn stop(&self) {
        match self {
            EventBus::Memory(bus) => bus.stop(),
            #[cfg(feature = "amqp-bus")]
            EventBus::Amqp(bus) => bus.stop(),
        }
    }

    pub fn metrics(&self) -> BusSnapshot {
        match self {
            EventBus::Memory(bus) => bus.metrics.snapshot(),
            #[cfg(feature = "amqp-bus")]
            EventBus::Amqp(bus) => bus.metrics().snapshot(),
        }
    }
}

/// A subscriber cursor, independent of the backend.
pub enum Subscription {
    Memory(MemorySubscription),
    #[cfg(feature = "amqp-bus")]
    Amqp(amqp::AmqpSubscription),
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<RequestEvent> {
        match self {
            Subscription::Memory(sub) => sub.recv().await,
            #[cfg(feature = "amqp-bus")]
            Subscription::Amqp(sub) => sub.recv().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Outcome, RequestEvent};
    use chrono::Utc;
    use uuid::Uuid;

    fn event(n: u64) -> RequestEvent {
        RequestEvent {
            request_id: Uuid::new_v4(),
            project_id: None,
            token_id: None,
            token_hash: None,
            method: "POST".into(),
            path: format!("/v1/item/{n}"),
            status: Some(200),
            bytes_in: n,
            bytes_out: 0,
            duration_ms: 0,
            upstream_ms: None,
            started_at: Utc::now(),
            outcome: Outcome::Success,
            error_kind: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe_delivery() {
        let bus = EventBus::in_memory(16);
        let mut sub = bus.subscribe();
        bus.publish(event(1));
        bus.publish(event(2));
        assert_eq!(sub.recv().await.unwrap().bytes_in, 1);
        assert_eq!(sub.recv().await.unwrap().bytes_in, 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_counts_drop() {
        let bus = EventBus::in_memory(16);
        bus.publish(event(1));
        let metrics = bus.metrics();
        assert_eq!(metrics.published, 0);
        assert_eq!(metrics.dropped, 1);
    }

    #[tokio::test]
    async fn test_dropped_plus_delivered_equals_published() {
        let capacity = 8;
        let total = 50u64;
        let bus = EventBus::in_memory(capacity);
        let mut sub = bus.subscribe();

        // Publish everything before the subscriber reads: the ring keeps
        // only the newest `capacity` events
        for n in 0..total {
            bus.publish(event(n));
        }
        bus.stop();

        let mut delivered = 0u64;
        while sub.recv().await.is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, capacity as u64);
        assert_eq!(bus.metrics().dropped + delivered, total);
    }

    #[tokio::test]
    async fn test_independent_cursors() {
        let bus = EventBus::in_memory(16);
        let mut fast = bus.subscribe();
        let mut slow = bus.subscribe();
        bus.publish(event(1));
        assert_eq!(fast.recv().await.unwrap().bytes_in, 1);
        // The slow subscriber still sees it on its own cursor
        assert_eq!(slow.recv().await.unwrap().bytes_in, 1);
    }

    #[tokio::test]
    async fn test_stop_drains_then_closes() {
        let bus = EventBus::in_memory(16);
        let mut sub = bus.subscribe();
        bus.publish(event(7));
        bus.stop();
        // Buffered event still arrives
        assert_eq!(sub.recv().await.unwrap().bytes_in, 7);
        // Then the stream ends
        assert!(sub.recv().await.is_none());
        // Publishing after stop is a counted no-op
        bus.publish(event(8));
        assert!(bus.metrics().dropped >= 1);
    }

    #[tokio::test]
    async fn test_subscribe_after_stop_ends_immediately() {
        let bus = EventBus::in_memory(16);
        bus.stop();
        let mut sub = bus.subscribe();
        assert!(sub.recv().await.is_none());
    }
}
