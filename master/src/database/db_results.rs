//! Result-record database operations for the master.
//!
//! Written exactly once per terminal task (§9: Result records keyed on
//! task_id; a duplicate completion report is silently discarded).

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use shared::model::{TaskResult, TaskStatus};

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS results (
            task_id TEXT PRIMARY KEY,
            worker_id TEXT NOT NULL,
            status TEXT NOT NULL,
            logs TEXT NOT NULL,
            logs_truncated INTEGER NOT NULL DEFAULT 0,
            exit_code INTEGER,
            completed_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("failed to create results table")?;
    Ok(())
}

/// Returns `true` if a row was inserted, `false` if a result already existed
/// for this task (the idempotent-discard path for duplicate completion
/// reports, §4.6).
pub fn insert_once(conn: &Connection, result: &TaskResult) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO results (task_id, worker_id, status, logs, logs_truncated, exit_code, completed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            result.task_id,
            result.worker_id,
            result.status.as_str(),
            result.logs,
            result.logs_truncated as i64,
            result.exit_code,
            result.completed_at as i64,
        ],
    )
    .context("failed to insert result")?;
    Ok(inserted == 1)
}

pub fn get(conn: &Connection, task_id: &str) -> Result<Option<TaskResult>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, worker_id, status, logs, logs_truncated, exit_code, completed_at FROM results WHERE task_id = ?1",
    )?;
    let result = stmt.query_row(params![task_id], |row| {
        let status_str: String = row.get(2)?;
        Ok(TaskResult {
            task_id: row.get(0)?,
            worker_id: row.get(1)?,
            status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
            logs: row.get(3)?,
            logs_truncated: row.get::<_, i64>(4)? != 0,
            exit_code: row.get(5)?,
            completed_at: row.get::<_, i64>(6)? as u64,
        })
    });
    match result {
        Ok(r) => Ok(Some(r)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn delete_before(conn: &Connection, cutoff: u64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM results WHERE completed_at < ?1",
        params![cutoff as i64],
    )?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(task_id: &str) -> TaskResult {
        TaskResult {
            task_id: task_id.to_string(),
            worker_id: "w1".to_string(),
            status: TaskStatus::Completed,
            logs: "ok".to_string(),
            logs_truncated: false,
            exit_code: Some(0),
            completed_at: 100,
        }
    }

    #[test]
    fn second_insert_is_discarded() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        assert!(insert_once(&conn, &sample("t1")).unwrap());
        let mut dup = sample("t1");
        dup.logs = "different".to_string();
        assert!(!insert_once(&conn, &dup).unwrap());
        let found = get(&conn, "t1").unwrap().unwrap();
        assert_eq!(found.logs, "ok");
    }
}
