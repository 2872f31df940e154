//! Assignment-record database operations for the master.
//!
//! Written once per task (§9 idempotency keys: assignment records keyed on
//! task_id, one-shot) and never mutated afterward.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use shared::model::Assignment;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS assignments (
            task_id TEXT PRIMARY KEY,
            worker_id TEXT NOT NULL,
            assigned_at INTEGER NOT NULL,
            load_at_start REAL NOT NULL
        )
        "#,
        [],
    )
    .context("failed to create assignments table")?;
    Ok(())
}

pub fn insert_once(conn: &Connection, assignment: &Assignment) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO assignments (task_id, worker_id, assigned_at, load_at_start) VALUES (?1, ?2, ?3, ?4)",
        params![
            assignment.task_id,
            assignment.worker_id,
            assignment.assigned_at as i64,
            assignment.load_at_start,
        ],
    )
    .context("failed to insert assignment")?;
    Ok(())
}

pub fn get(conn: &Connection, task_id: &str) -> Result<Option<Assignment>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, worker_id, assigned_at, load_at_start FROM assignments WHERE task_id = ?1",
    )?;
    let result = stmt.query_row(params![task_id], |row| {
        Ok(Assignment {
            task_id: row.get(0)?,
            worker_id: row.get(1)?,
            assigned_at: row.get::<_, i64>(2)? as u64,
            load_at_start: row.get(3)?,
        })
    });
    match result {
        Ok(a) => Ok(Some(a)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn sum_requested_resources_by_worker(
    conn: &Connection,
) -> Result<std::collections::HashMap<String, shared::model::ResourceVector>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT t.assigned_worker, SUM(t.req_cpu), SUM(t.req_mem), SUM(t.req_storage), SUM(t.req_gpu)
        FROM tasks t
        WHERE t.status = 'running' AND t.assigned_worker IS NOT NULL
        GROUP BY t.assigned_worker
        "#,
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            shared::model::ResourceVector {
                cpu: row.get(1)?,
                mem: row.get(2)?,
                storage: row.get(3)?,
                gpu: row.get(4)?,
            },
        ))
    })?;
    let mut out = std::collections::HashMap::new();
    for row in rows {
        let (worker_id, totals) = row?;
        out.insert(worker_id, totals);
    }
    Ok(out)
}

/// Deletes assignment rows whose task no longer exists (e.g. pruned by
/// `cleanup_old_data`'s retention sweep on `tasks`).
pub fn delete_orphaned(conn: &Connection) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM assignments WHERE task_id NOT IN (SELECT id FROM tasks)",
        [],
    )?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::db_tasks;
    use shared::model::{ResourceVector, Task, TaskStatus, TaskType};

    #[test]
    fn insert_once_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        let a = Assignment {
            task_id: "t1".to_string(),
            worker_id: "w1".to_string(),
            assigned_at: 10,
            load_at_start: 0.1,
        };
        insert_once(&conn, &a).unwrap();
        let mut a2 = a.clone();
        a2.load_at_start = 0.9;
        insert_once(&conn, &a2).unwrap();
        let found = get(&conn, "t1").unwrap().unwrap();
        assert_eq!(found.load_at_start, 0.1, "second insert must not overwrite");
    }

    #[test]
    fn sum_requested_resources_groups_by_worker() {
        let conn = Connection::open_in_memory().unwrap();
        db_tasks::create_table(&conn).unwrap();
        let mut t = Task {
            id: "t1".into(),
            user: "u".into(),
            name: "n".into(),
            image: "alpine".into(),
            command: None,
            resources: ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 },
            status: TaskStatus::Running,
            submitted_at: 0,
            assigned_at: Some(0),
            started_at: Some(0),
            completed_at: None,
            assigned_worker: Some("w1".to_string()),
            task_type: TaskType::CpuLight,
            tau_at_submission: 5.0,
            sla_multiplier: 2.0,
        };
        db_tasks::insert(&conn, &t).unwrap();
        t.id = "t2".to_string();
        t.resources.cpu = 2.0;
        db_tasks::insert(&conn, &t).unwrap();

        let totals = sum_requested_resources_by_worker(&conn).unwrap();
        assert_eq!(totals.get("w1").unwrap().cpu, 3.0);
    }
}
