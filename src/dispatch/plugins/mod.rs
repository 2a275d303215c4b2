//! Event sink plugins
//!
//! A sink takes batches of request events somewhere durable: a local
//! JSONL file, an HTTP collector. The dispatcher owns delivery policy
//! (batching, retry, fallback); sinks only move bytes.
//!
//! Each sink declares an explicit typed configuration struct and
//! validates it in its constructor - construction *is* the init step, so
//! a misconfigured sink fails at startup, not on the first batch.
//!
//! # Contract
//!
//! - `send_events` either persists the whole batch or returns an error;
//!   partial delivery counts as failure and the dispatcher may resend.
//! - The dispatcher serializes `send_events` calls per sink; sinks need
//!   not be reentrant.
//! - `close` flushes anything buffered. Called once, after the last send.

use async_trait::async_trait;

use crate::events::RequestEvent;

pub mod file;
pub mod http;

pub use file::{FileSink, FileSinkConfig};
pub use http::{HttpSink, HttpSinkConfig};

/// A delivery target for request events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Short name for logs and counters.
    fn name(&self) -> &'static str;

    /// Persist one batch. Must not return Ok on partial delivery.
    async fn send_events(&self, events: &[RequestEvent]) -> anyhow::Result<()>;

    /// Flush and release resources. Errors are logged, not retried.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
