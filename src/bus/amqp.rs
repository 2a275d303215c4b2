//! AMQP bridge backend for the event bus
//!
//! Events are serialized to JSON and published to a durable queue; each
//! subscription is an independent consumer. Publishing goes through a
//! bounded in-process queue drained by a forwarder task, so the request
//! path keeps the same non-blocking contract as the in-memory ring: a
//! full queue or an unreachable broker drops the event and bumps the
//! counter, it never fails a request.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::BusMetrics;
use crate::config::BusConfig;
use crate::events::RequestEvent;

pub struct AmqpBus {
    publish_tx: mpsc::Sender<RequestEvent>,
    url: String,
    queue: String,
    metrics: Arc<BusMetrics>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl AmqpBus {
    pub fn new(config: &BusConfig) -> Result<Self> {
        let url = config
            .amqp_url
            .clone()
            .context("AMQP bus requires AMQP_URL")?;
        let queue = config.amqp_queue.clone();
        let metrics = Arc::new(BusMetrics::default());
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let (publish_tx, publish_rx) = mpsc::channel::<RequestEvent>(config.capacity.max(1));

        let forward_url = url.clone();
        let forward_queue = queue.clone();
        let forward_metrics = metrics.clone();
        tokio::spawn(async move {
            forwarder(forward_url, forward_queue, publish_rx, forward_metrics).await;
        });

        Ok(Self {
            publish_tx,
            url,
            queue,
            metrics,
            stopped,
        })
    }

    pub fn publish(&self, event: RequestEvent) {
        if self.stopped.load(Ordering::Relaxed) {
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.publish_tx.try_send(event) {
            Ok(()) => {
                self.metrics.published.fetch_add(1, Ordering::Relaxed);
            }
            // Queue full or forwarder gone: drop and count
            Err(_) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn subscribe(&self) -> AmqpSubscription {
        let (tx, rx) = mpsc::channel::<RequestEvent>(256);
        let url = self.url.clone();
        let queue = self.queue.clone();
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            if let Err(e) = consume(url, queue, tx, stopped).await {
                tracing::warn!("AMQP consumer ended: {e:#}");
            }
        });
        AmqpSubscription {
            stream: ReceiverStream::new(rx),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> &BusMetrics {
        &self.metrics
    }
}

pub struct AmqpSubscription {
    stream: ReceiverStream<RequestEvent>,
}

impl AmqpSubscription {
    pub async fn recv(&mut self) -> Option<RequestEvent> {
        self.stream.next().await
    }
}

/// Drain the publish queue into the broker, reconnecting with a fixed
/// pause on failure. Events that cannot be delivered while the broker is
/// away accumulate in the bounded queue; overflow is dropped at
/// `publish` time.
async fn forwarder(
    url: String,
    queue: String,
    mut rx: mpsc::Receiver<RequestEvent>,
    metrics: Arc<BusMetrics>,
) {
    while let Some(event) = rx.recv().await {
        let payload = match serde_json::to_vec(&event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Failed to serialize event for AMQP: {e}");
                metrics.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        if let Err(e) = publish_one(&url, &queue, &payload).await {
            tracing::warn!("AMQP publish failed, dropping event: {e:#}");
            metrics.dropped.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }
}

async fn publish_one(url: &str, queue: &str, payload: &[u8]) -> Result<()> {
    let conn = Connection::connect(url, ConnectionProperties::default())
        .await
        .context("AMQP connect")?;
    let channel = conn.create_channel().await.context("AMQP channel")?;
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("AMQP queue_declare")?;
    channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            payload,
            BasicProperties::default(),
        )
        .await
        .context("AMQP publish")?
        .await
        .context("AMQP publish confirm")?;
    Ok(())
}

async fn consume(
    url: String,
    queue: String,
    tx: mpsc::Sender<RequestEvent>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
) -> Result<()> {
    let conn = Connection::connect(&url, ConnectionProperties::default())
        .await
        .context("AMQP connect")?;
    let channel = conn.create_channel().await.context("AMQP channel")?;
    channel
        .queue_declare(
            &queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("AMQP queue_declare")?;
    let mut consumer = channel
        .basic_consume(
            &queue,
            "llmgate-dispatcher",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("AMQP consume")?;

    while let Some(delivery) = consumer.next().await {
        if stopped.load(Ordering::Relaxed) {
            break;
        }
        let delivery = delivery.context("AMQP delivery")?;
        delivery
            .ack(BasicAckOptions::default())
            .await
            .context("AMQP ack")?;
        match serde_json::from_slice::<RequestEvent>(&delivery.data) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!("Discarding undecodable AMQP event: {e}"),
        }
    }
    Ok(())
}
