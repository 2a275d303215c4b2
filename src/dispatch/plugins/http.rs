//! HTTP sink - POST batches to an external collector
//!
//! Body shape is `{"events": [...], "count": N}`. Authentication is a
//! literal `Authorization` header value from configuration (so both
//! `Bearer x` and vendor schemes work without special cases).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use super::EventSink;
use crate::events::RequestEvent;

/// Configuration for the HTTP sink.
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    /// Absolute URL receiving the batch POSTs.
    pub endpoint: String,
    /// Verbatim `Authorization` header value, when the collector wants one.
    pub auth_header: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

#[derive(Serialize)]
struct BatchPayload<'a> {
    events: &'a [RequestEvent],
    count: usize,
}

/// Ships event batches to a configured HTTP endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    auth_header: Option<String>,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self> {
        let endpoint = reqwest::Url::parse(&config.endpoint)
            .with_context(|| format!("Invalid HTTP sink endpoint '{}'", config.endpoint))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            bail!("HTTP sink endpoint must be http(s): {}", config.endpoint);
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP sink client")?;
        Ok(Self {
            client,
            endpoint,
            auth_header: config.auth_header,
        })
    }
}

#[async_trait]
impl EventSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send_events(&self, events: &[RequestEvent]) -> Result<()> {
        let payload = BatchPayload {
            events,
            count: events.len(),
        };
        let mut request = self.client.post(self.endpoint.clone()).json(&payload);
        if let Some(auth) = &self.auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }
        let response = request.send().await.context("HTTP sink request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP sink returned {status}");
        }
        Ok(())
    }
}
