//! Bounded retry queue for outbound RPC attempts to the master.
//!
//! A worker that loses its connection to the master must not lose
//! heartbeats, completion reports, or output uploads — it also must not grow
//! memory without bound while disconnected. Every retriable RPC attempt
//! (`Heartbeat`, `ReportTaskCompletion`, `UploadOutputFiles`) is durably
//! recorded here before being sent, and removed once the master acknowledges
//! it. Failed attempts are retried with exponential backoff.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::debug;

/// Status of a queued RPC attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Ready to send (either never attempted, or backed off and due again).
    Pending,
    /// Currently in flight; prevents a concurrent duplicate send.
    Sending,
    /// Acknowledged by the master; eligible for cleanup.
    Sent,
    /// Permanently failed after exceeding the retry cap.
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Sending => "sending",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "sending" => Ok(QueueStatus::Sending),
            "sent" => Ok(QueueStatus::Sent),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(anyhow::anyhow!("unknown queue status: {other}")),
        }
    }
}

/// The kind of RPC an entry represents, used only for observability — the
/// payload itself carries everything needed to replay the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    Heartbeat,
    ReportTaskCompletion,
    UploadOutputFiles,
}

impl RpcKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcKind::Heartbeat => "heartbeat",
            RpcKind::ReportTaskCompletion => "report_task_completion",
            RpcKind::UploadOutputFiles => "upload_output_files",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "heartbeat" => Ok(RpcKind::Heartbeat),
            "report_task_completion" => Ok(RpcKind::ReportTaskCompletion),
            "upload_output_files" => Ok(RpcKind::UploadOutputFiles),
            other => Err(anyhow::anyhow!("unknown rpc kind: {other}")),
        }
    }
}

/// A single queued RPC attempt, with its JSON-encoded request payload.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub kind: RpcKind,
    pub payload_json: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: u64,
    pub sending: u64,
    pub sent: u64,
    pub failed: u64,
}

const MAX_RETRIES: u32 = 20;
const MAX_BACKOFF_MINUTES: i64 = 60;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS rpc_retry_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            last_error TEXT
        )
        "#,
        [],
    )
    .context("failed to create rpc_retry_queue table")?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_rpc_retry_queue_due ON rpc_retry_queue(status, next_attempt_at)",
        [],
    )
    .context("failed to create rpc_retry_queue index")?;
    Ok(())
}

/// Records a new RPC attempt, immediately due.
pub fn enqueue(conn: &Connection, kind: RpcKind, payload_json: &str, now: u64) -> Result<i64> {
    conn.execute(
        "INSERT INTO rpc_retry_queue (kind, payload_json, status, attempts, next_attempt_at, created_at) \
         VALUES (?1, ?2, 'pending', 0, ?3, ?3)",
        params![kind.as_str(), payload_json, now as i64],
    )
    .context("failed to enqueue rpc attempt")?;
    Ok(conn.last_insert_rowid())
}

/// Returns entries due for (re)send, oldest first, capped at `limit` to keep
/// a single retry pass bounded.
pub fn due_entries(conn: &Connection, now: u64, limit: usize) -> Result<Vec<QueueEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, payload_json, attempts, last_error FROM rpc_retry_queue \
         WHERE status = 'pending' AND next_attempt_at <= ?1 \
         ORDER BY id ASC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![now as i64, limit as i64], |row| {
        let kind_str: String = row.get(1)?;
        Ok((
            row.get::<_, i64>(0)?,
            kind_str,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (id, kind_str, payload_json, attempts, last_error) = row?;
        entries.push(QueueEntry {
            id,
            kind: RpcKind::parse(&kind_str)?,
            payload_json,
            attempts: attempts as u32,
            last_error,
        });
    }
    Ok(entries)
}

/// Marks an entry as currently in flight, preventing a concurrent resend.
pub fn mark_sending(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE rpc_retry_queue SET status = 'sending' WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

/// Marks an entry as acknowledged by the master.
pub fn mark_sent(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE rpc_retry_queue SET status = 'sent' WHERE id = ?1",
        params![id],
    )?;
    debug!(id, "rpc attempt acknowledged");
    Ok(())
}

/// Records a failed attempt and schedules the next retry with exponential
/// backoff (2^attempts minutes, capped), or marks the entry permanently
/// failed once `MAX_RETRIES` is exceeded.
pub fn mark_failed(conn: &Connection, id: i64, now: u64, error: &str) -> Result<()> {
    let attempts: i64 = conn.query_row(
        "SELECT attempts FROM rpc_retry_queue WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    let attempts = attempts + 1;

    if attempts as u32 >= MAX_RETRIES {
        conn.execute(
            "UPDATE rpc_retry_queue SET status = 'failed', attempts = ?2, last_error = ?3 WHERE id = ?1",
            params![id, attempts, error],
        )?;
        return Ok(());
    }

    let backoff_minutes = (1i64 << attempts.min(10)).min(MAX_BACKOFF_MINUTES);
    let next_attempt_at = now as i64 + backoff_minutes * 60;
    conn.execute(
        "UPDATE rpc_retry_queue SET status = 'pending', attempts = ?2, next_attempt_at = ?3, last_error = ?4 WHERE id = ?1",
        params![id, attempts, next_attempt_at, error],
    )?;
    Ok(())
}

/// Deletes acknowledged or permanently-failed entries older than `cutoff`.
pub fn cleanup_before(conn: &Connection, cutoff: u64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM rpc_retry_queue WHERE status IN ('sent', 'failed') AND created_at < ?1",
        params![cutoff as i64],
    )?;
    Ok(deleted)
}

pub fn stats(conn: &Connection) -> Result<QueueStats> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM rpc_retry_queue GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
    })?;

    let mut out = QueueStats::default();
    for row in rows {
        let (status, count) = row?;
        match status.as_str() {
            "pending" => out.pending = count,
            "sending" => out.sending = count,
            "sent" => out.sent = count,
            "failed" => out.failed = count,
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_and_fetch_due() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        let id = enqueue(&conn, RpcKind::Heartbeat, "{}", 100).unwrap();
        let due = due_entries(&conn, 100, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
        assert_eq!(due[0].kind, RpcKind::Heartbeat);
    }

    #[test]
    fn mark_failed_backs_off_and_hides_entry_until_due() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        let id = enqueue(&conn, RpcKind::ReportTaskCompletion, "{}", 100).unwrap();
        mark_sending(&conn, id).unwrap();
        mark_failed(&conn, id, 100, "connection refused").unwrap();

        assert!(due_entries(&conn, 100, 10).unwrap().is_empty());
        assert!(!due_entries(&conn, 100 + 121, 10).unwrap().is_empty());
    }

    #[test]
    fn mark_failed_permanently_after_max_retries() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        let id = enqueue(&conn, RpcKind::Heartbeat, "{}", 100).unwrap();
        for _ in 0..MAX_RETRIES {
            mark_failed(&conn, id, 100, "still down").unwrap();
        }
        let stats = stats(&conn).unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn mark_sent_removed_by_cleanup() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        let id = enqueue(&conn, RpcKind::UploadOutputFiles, "{}", 100).unwrap();
        mark_sent(&conn, id).unwrap();
        assert_eq!(cleanup_before(&conn, 200).unwrap(), 1);
    }
}
