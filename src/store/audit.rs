//! Audit writer - best-effort usage recording off the hot path
//!
//! Usage telemetry (one `audit_events` row per request, plus
//! `last_used_at` refresh) must never slow a request down or fail it.
//! Recording is therefore a `try_send` onto a bounded channel drained by
//! a dedicated OS thread that batches rows into transactions, flushing
//! on size or interval. A full channel drops the record and bumps a
//! counter.
//!
//! The same thread runs the retention pass: once every 24 hours, rows
//! older than the configured window are deleted.
//!
//! # Architecture
//!
//! ```text
//! request task ──try_send──▶ sync_channel ──▶ audit-writer thread
//!                                               ├─▶ batch buffer (size or interval)
//!                                               └─▶ SQLite (WAL)
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::config::AuditConfig;
use crate::events::RequestEvent;
use crate::util::fmt_ts;

/// Counters for the audit pipeline itself.
#[derive(Debug, Default)]
pub struct AuditMetrics {
    /// Rows written.
    pub recorded: AtomicU64,
    /// Records dropped because the channel was full.
    pub dropped: AtomicU64,
    /// Records that failed inside a batch (logged, batch continues).
    pub failed: AtomicU64,
    /// Batch flushes performed.
    pub flushes: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct AuditSnapshot {
    pub recorded: u64,
    pub dropped: u64,
    pub failed: u64,
    pub flushes: u64,
}

impl AuditMetrics {
    pub fn snapshot(&self) -> AuditSnapshot {
        AuditSnapshot {
            recorded: self.recorded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

enum WriterCommand {
    Record(Box<RequestEvent>),
    Shutdown,
}

/// Cheap clonable handle used by the request path.
#[derive(Clone)]
pub struct AuditHandle {
    tx: SyncSender<WriterCommand>,
    metrics: Arc<AuditMetrics>,
}

impl AuditHandle {
    /// Queue a usage record. Never blocks; a full queue drops the record.
    pub fn record(&self, event: RequestEvent) {
        match self.tx.try_send(WriterCommand::Record(Box::new(event))) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn metrics(&self) -> AuditSnapshot {
        self.metrics.snapshot()
    }
}

/// Owns the writer thread; one per process.
pub struct AuditWriter {
    handle: AuditHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

impl AuditWriter {
    /// Spawn the writer thread against its own database connection.
    pub fn new(db_path: PathBuf, config: AuditConfig) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<WriterCommand>(config.channel_buffer);
        let metrics = Arc::new(AuditMetrics::default());
        let writer_metrics = metrics.clone();

        let thread = thread::Builder::new()
            .name("audit-writer".into())
            .spawn(move || {
                if let Err(e) = writer_thread(rx, db_path, config, writer_metrics) {
                    tracing::error!("Audit writer thread error: {e:#}");
                }
            })?;

        Ok(Self {
            handle: AuditHandle { tx, metrics },
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> AuditHandle {
        self.handle.clone()
    }

    /// Flush pending records and stop the thread. Blocks until done.
    pub fn shutdown(&self) {
        let _ = self.handle.tx.send(WriterCommand::Shutdown);
        if let Some(thread) = self.thread.lock().expect("audit lock poisoned").take() {
            let _ = thread.join();
        }
    }
}

fn writer_thread(
    rx: mpsc::Receiver<WriterCommand>,
    db_path: PathBuf,
    config: AuditConfig,
    metrics: Arc<AuditMetrics>,
) -> anyhow::Result<()> {
    let conn = Connection::open(&db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")?;

    let mut batch: Vec<RequestEvent> = Vec::with_capacity(config.batch_size);
    let mut last_flush = Instant::now();
    let mut last_cleanup = Instant::now();

    loop {
        match rx.recv_timeout(config.flush_interval) {
            Ok(WriterCommand::Record(event)) => {
                batch.push(*event);
                if batch.len() >= config.batch_size {
                    flush_batch(&conn, &mut batch, &metrics);
                    last_flush = Instant::now();
                }
            }
            Ok(WriterCommand::Shutdown) => {
                flush_batch(&conn, &mut batch, &metrics);
                tracing::debug!("Audit writer shutting down");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !batch.is_empty() && last_flush.elapsed() >= config.flush_interval {
                    flush_batch(&conn, &mut batch, &metrics);
                    last_flush = Instant::now();
                }
                if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                    run_retention_cleanup(&conn, config.retention_days);
                    last_cleanup = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                flush_batch(&conn, &mut batch, &metrics);
                break;
            }
        }
    }
    Ok(())
}

/// Write a batch in one transaction. Individual row failures are logged
/// and counted; the batch is best-effort by contract.
fn flush_batch(conn: &Connection, batch: &mut Vec<RequestEvent>, metrics: &AuditMetrics) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len() as u64;
    let mut failed = 0u64;

    if let Err(e) = conn.execute_batch("BEGIN") {
        tracing::error!("Audit flush could not begin transaction: {e}");
        metrics.failed.fetch_add(count, Ordering::Relaxed);
        batch.clear();
        return;
    }

    for event in batch.drain(..) {
        if let Err(e) = store_event(conn, &event) {
            failed += 1;
            tracing::warn!(request_id = %event.request_id, "Failed to store audit row: {e}");
        }
    }

    if let Err(e) = conn.execute_batch("COMMIT") {
        tracing::error!("Audit flush commit failed: {e}");
        metrics.failed.fetch_add(count, Ordering::Relaxed);
        return;
    }

    metrics.recorded.fetch_add(count - failed, Ordering::Relaxed);
    if failed > 0 {
        metrics.failed.fetch_add(failed, Ordering::Relaxed);
    }
    metrics.flushes.fetch_add(1, Ordering::Relaxed);
}

fn store_event(conn: &Connection, event: &RequestEvent) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit_events (request_id, project_id, token_id, method, path, status,
                                   bytes_in, bytes_out, duration_ms, upstream_ms, outcome,
                                   error_kind, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            event.request_id.to_string(),
            event.project_id,
            event.token_id,
            event.method,
            event.path,
            event.status,
            event.bytes_in as i64,
            event.bytes_out as i64,
            event.duration_ms as i64,
            event.upstream_ms.map(|ms| ms as i64),
            event.outcome.as_str(),
            event.error_kind.map(|k| k.as_str()),
            fmt_ts(event.started_at),
        ],
    )?;
    Ok(())
}

fn run_retention_cleanup(conn: &Connection, retention_days: u32) {
    if retention_days == 0 {
        tracing::trace!("Audit retention cleanup skipped (retention disabled)");
        return;
    }
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    match conn.execute(
        "DELETE FROM audit_events WHERE started_at < ?1",
        [fmt_ts(cutoff)],
    ) {
        Ok(deleted) if deleted > 0 => {
            tracing::info!("Audit retention cleanup removed {deleted} rows");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Audit retention cleanup failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ErrorKind, Outcome};
    use crate::store::run_migrations;
    use uuid::Uuid;

    fn event(outcome: Outcome, error_kind: Option<ErrorKind>) -> RequestEvent {
        RequestEvent {
            request_id: Uuid::new_v4(),
            project_id: Some("p1".into()),
            token_id: Some("t1".into()),
            token_hash: Some("abcd1234".into()),
            method: "POST".into(),
            path: "/v1/chat/completions".into(),
            status: Some(200),
            bytes_in: 10,
            bytes_out: 20,
            duration_ms: 5,
            upstream_ms: Some(4),
            started_at: Utc::now(),
            outcome,
            error_kind,
            metadata: None,
        }
    }

    fn temp_db() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let conn = Connection::open(&path).unwrap();
        run_migrations(&conn).unwrap();
        (dir, path)
    }

    #[test]
    fn test_records_flush_on_shutdown() {
        let (_dir, path) = temp_db();
        let writer = AuditWriter::new(
            path.clone(),
            AuditConfig {
                channel_buffer: 100,
                batch_size: 50,
                flush_interval: Duration::from_secs(10),
                retention_days: 0,
            },
        )
        .unwrap();

        let handle = writer.handle();
        handle.record(event(Outcome::Success, None));
        handle.record(event(Outcome::Denied, Some(ErrorKind::RateLimited)));
        writer.shutdown();

        let conn = Connection::open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);

        let outcomes: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT outcome FROM audit_events ORDER BY id")
                .unwrap();
            let rows = stmt.query_map([], |r| r.get(0)).unwrap();
            rows.map(|r| r.unwrap()).collect()
        };
        assert_eq!(outcomes, vec!["success", "denied"]);

        assert_eq!(handle.metrics().recorded, 2);
        assert_eq!(handle.metrics().dropped, 0);
    }

    #[test]
    fn test_flush_on_batch_size() {
        let (_dir, path) = temp_db();
        let writer = AuditWriter::new(
            path.clone(),
            AuditConfig {
                channel_buffer: 100,
                batch_size: 2,
                flush_interval: Duration::from_secs(60),
                retention_days: 0,
            },
        )
        .unwrap();

        let handle = writer.handle();
        handle.record(event(Outcome::Success, None));
        handle.record(event(Outcome::Success, None));

        // Batch size reached: rows appear without shutdown
        let conn = Connection::open(&path).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM audit_events", [], |r| r.get(0))
                .unwrap();
            if count == 2 {
                break;
            }
            assert!(Instant::now() < deadline, "batch was never flushed");
            std::thread::sleep(Duration::from_millis(20));
        }
        writer.shutdown();
    }

    #[test]
    fn test_retention_cleanup_removes_old_rows() {
        let (_dir, path) = temp_db();
        let conn = Connection::open(&path).unwrap();
        let old = Utc::now() - chrono::Duration::days(100);
        conn.execute(
            "INSERT INTO audit_events (request_id, method, path, outcome, started_at)
             VALUES ('old', 'POST', '/v1/x', 'success', ?1)",
            [fmt_ts(old)],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO audit_events (request_id, method, path, outcome, started_at)
             VALUES ('new', 'POST', '/v1/x', 'success', ?1)",
            [fmt_ts(Utc::now())],
        )
        .unwrap();

        run_retention_cleanup(&conn, 90);
        let remaining: Vec<String> = {
            let mut stmt = conn.prepare("SELECT request_id FROM audit_events").unwrap();
            let rows = stmt.query_map([], |r| r.get(0)).unwrap();
            rows.map(|r| r.unwrap()).collect()
        };
        assert_eq!(remaining, vec!["new"]);
    }
}
