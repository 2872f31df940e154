//! Database management for the master control plane.
//!
//! The master's database is the durable mirror of the in-memory worker
//! registry, task queue, and τ-store: every write here is what lets the
//! Resource Reconciler (component J) and the rest of the master rebuild
//! correct state after a crash. SQLite is chosen for its simplicity and
//! ease of self-contained deployment.

pub mod db_assignments;
pub mod db_files;
pub mod db_results;
pub mod db_tasks;
pub mod db_tau;
pub mod db_workers;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DATABASE_FILE: &str = "master.db";

/// Manages the SQLite database backing the master's persisted state.
pub struct MasterDatabase {
    db_path: PathBuf,
    connection: Option<Connection>,
    busy_timeout_s: u64,
}

impl MasterDatabase {
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
    /// to call on every master startup.
    pub fn initialize(&mut self) -> Result<()> {
        info!("initializing master database at {}", self.db_path.display());
        let busy_timeout_s = self.busy_timeout_s;
        let conn = self.get_connection(busy_timeout_s)?;

        db_workers::create_table(conn)?;
        db_tasks::create_table(conn)?;
        db_assignments::create_table(conn)?;
        db_results::create_table(conn)?;
        db_tau::create_table(conn)?;
        db_files::create_table(conn)?;

        info!("master database initialization complete");
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
            conn.execute("PRAGMA foreign_keys=ON", [])
                .context("failed to enable foreign key constraints")?;
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

    pub fn workers(&mut self) -> Result<&mut Connection> {
        self.conn()
    }

    /// Deletes terminal tasks, their results and file-metadata records, and
    /// assignments older than `retention_days`. Runs a VACUUM + WAL
    /// checkpoint afterward (teacher's `cleanup_old_data` convention).
    pub fn cleanup_old_data(&mut self, retention_days: u32) -> Result<()> {
        let cutoff = shared::utils::current_timestamp() - (retention_days as u64 * 86_400);
        let conn = self.conn()?;

        let tasks_deleted = db_tasks::delete_terminal_before(conn, cutoff)?;
        let results_deleted = db_results::delete_before(conn, cutoff)?;
        let files_deleted = db_files::delete_before(conn, cutoff)?;
        let assignments_deleted = db_assignments::delete_orphaned(conn)?;

        info!(
            tasks_deleted,
            results_deleted, files_deleted, assignments_deleted, "cleanup of old master data complete"
        );

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
                warn!(error = ?e, "error closing master database connection");
            } else {
                debug!("master database connection closed");
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
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        assert!(dir.path().join(DATABASE_FILE).exists());
    }

    #[test]
    fn close_clears_connection() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        db.close();
        assert!(db.connection.is_none());
    }
}
