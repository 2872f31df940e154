//! Database management for the worker execution agent.
//!
//! A worker's only durable local state is its bounded retry queue of
//! outbound RPC attempts (heartbeats, completion reports, output uploads)
//! that have not yet been acknowledged by the master — everything else
//! (task assignments, container state) lives for the process lifetime only
//! and is rebuilt from the master's next `AssignTask` call after a restart.

pub mod db_queue;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DATABASE_FILE: &str = "worker.db";

/// Manages the SQLite database backing the worker's local retry queue.
pub struct WorkerDatabase {
    db_path: PathBuf,
    connection: Option<Connection>,
    busy_timeout_s: u64,
}

impl WorkerDatabase {
    pub fn new<P: AsRef<Path>>(data_dir: P, busy_timeout_s: u64) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
        }
        Ok(Self {
            db_path: data_dir.join(DATABASE_FILE),
            connection: None,
            busy_timeout_s,
        })
    }

    /// Creates every table if it does not already exist. Idempotent and safe
    /// to call on every worker startup.
    pub fn initialize(&mut self) -> Result<()> {
        info!("initializing worker database at {}", self.db_path.display());
        let busy_timeout_s = self.busy_timeout_s;
        let conn = self.get_connection(busy_timeout_s)?;
        db_queue::create_table(conn)?;
        info!("worker database initialization complete");
        Ok(())
    }

    pub fn get_connection(&mut self, busy_timeout_s: u64) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("failed to open database: {}", self.db_path.display()))?;

            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("failed to enable WAL mode")?;
            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
                .context("failed to set WAL auto-checkpoint")?;
            conn.busy_timeout(std::time::Duration::from_secs(busy_timeout_s))
                .context("failed to set busy timeout")?;

            self.connection = Some(conn);
        }
        Ok(self
            .connection
            .as_mut()
            .expect("connection set immediately above"))
    }

    fn conn(&mut self) -> Result<&mut Connection> {
        let busy_timeout_s = self.busy_timeout_s;
        self.get_connection(busy_timeout_s)
    }

    pub fn queue(&mut self) -> Result<&mut Connection> {
        self.conn()
    }

    /// Deletes acknowledged or permanently-failed retry-queue entries older
    /// than `retention_days`, followed by a VACUUM + WAL checkpoint.
    pub fn cleanup_old_data(&mut self, retention_days: u32) -> Result<()> {
        let cutoff = shared::utils::current_timestamp() - (retention_days as u64 * 86_400);
        let conn = self.conn()?;

        let deleted = db_queue::cleanup_before(conn, cutoff)?;
        info!(deleted, "cleanup of old worker retry-queue data complete");

        conn.execute("VACUUM", [])?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    /// Performs a WAL checkpoint to bound WAL file growth between cleanups.
    pub fn checkpoint_wal(&mut self) -> Result<i64> {
        let conn = self.conn()?;
        let (busy, log_frames, checkpointed): (i64, i64, i64) =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
        if busy != 0 {
            warn!(log_frames, "WAL checkpoint blocked (busy)");
        } else {
            debug!(checkpointed, log_frames, "WAL checkpoint complete");
        }
        Ok(checkpointed)
    }

    pub fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err(e) = conn.close() {
                warn!(error = ?e, "error closing worker database connection");
            } else {
                debug!("worker database connection closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn initialize_creates_database_file() {
        let dir = TempDir::new().unwrap();
        let mut db = WorkerDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        assert!(dir.path().join(DATABASE_FILE).exists());
    }

    #[test]
    fn close_clears_connection() {
        let dir = TempDir::new().unwrap();
        let mut db = WorkerDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        db.close();
        assert!(db.connection.is_none());
    }
}
