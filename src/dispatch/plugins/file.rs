//! File sink - JSON Lines on local disk
//!
//! One JSON object per line, UTF-8, `\n`-terminated, fsync after each
//! batch. The format is deliberately boring so standard tooling works:
//! `jq '.outcome' events.jsonl`, grep, tail -f.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::EventSink;
use crate::events::RequestEvent;

/// Configuration for the file sink.
#[derive(Debug, Clone)]
pub struct FileSinkConfig {
    /// Target JSONL file; parent directories are created.
    pub path: PathBuf,
}

/// Appends events to a JSONL file.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    pub fn new(config: FileSinkConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .with_context(|| format!("Failed to open {}", config.path.display()))?;
        Ok(Self {
            path: config.path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl EventSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn send_events(&self, events: &[RequestEvent]) -> Result<()> {
        let mut file = self.file.lock().await;
        for event in events {
            let line = serde_json::to_string(event).context("Failed to serialize event")?;
            writeln!(file, "{line}").context("Failed to write event line")?;
        }
        file.flush().context("Failed to flush event file")?;
        // Durability boundary is the batch
        file.sync_data().context("Failed to fsync event file")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush().context("Failed to flush event file on close")?;
        file.sync_data().context("Failed to fsync event file on close")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Outcome, RequestEvent};
    use chrono::Utc;
    use uuid::Uuid;

    fn event(path: &str) -> RequestEvent {
        RequestEvent {
            request_id: Uuid::new_v4(),
            project_id: Some("p".into()),
            token_id: None,
            token_hash: None,
            method: "POST".into(),
            path: path.into(),
            status: Some(200),
            bytes_in: 1,
            bytes_out: 2,
            duration_ms: 3,
            upstream_ms: None,
            started_at: Utc::now(),
            outcome: Outcome::Success,
            error_kind: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_appends_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = FileSink::new(FileSinkConfig { path: path.clone() }).unwrap();

        sink.send_events(&[event("/v1/a"), event("/v1/b")])
            .await
            .unwrap();
        sink.send_events(&[event("/v1/c")]).await.unwrap();
        sink.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let parsed: RequestEvent = serde_json::from_str(line).unwrap();
            assert!(parsed.path.starts_with("/v1/"));
        }
        assert!(contents.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/events.jsonl");
        let sink = FileSink::new(FileSinkConfig { path: path.clone() }).unwrap();
        sink.send_events(&[event("/v1/x")]).await.unwrap();
        assert!(path.exists());
    }
}
