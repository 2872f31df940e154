//! Task-queue and task-record database operations for the master.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use shared::model::{ResourceVector, Task, TaskStatus, TaskType};

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            name TEXT NOT NULL,
            image TEXT NOT NULL,
            command TEXT,
            req_cpu REAL NOT NULL,
            req_mem REAL NOT NULL,
            req_storage REAL NOT NULL,
            req_gpu REAL NOT NULL,
            status TEXT NOT NULL,
            submitted_at INTEGER NOT NULL,
            assigned_at INTEGER,
            started_at INTEGER,
            completed_at INTEGER,
            assigned_worker TEXT,
            task_type TEXT NOT NULL,
            tau_at_submission REAL NOT NULL,
            sla_multiplier REAL NOT NULL
        )
        "#,
        [],
    )
    .context("failed to create tasks table")?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status_submitted ON tasks(status, submitted_at)",
        [],
    )?;
    Ok(())
}

const SELECT_COLUMNS: &str = "id, user, name, image, command, req_cpu, req_mem, req_storage, req_gpu, \
    status, submitted_at, assigned_at, started_at, completed_at, assigned_worker, task_type, \
    tau_at_submission, sla_multiplier";

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let status_str: String = row.get(9)?;
    let type_str: String = row.get(15)?;
    Ok(Task {
        id: row.get(0)?,
        user: row.get(1)?,
        name: row.get(2)?,
        image: row.get(3)?,
        command: row.get(4)?,
        resources: ResourceVector {
            cpu: row.get(5)?,
            mem: row.get(6)?,
            storage: row.get(7)?,
            gpu: row.get(8)?,
        },
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Pending),
        submitted_at: row.get::<_, i64>(10)? as u64,
        assigned_at: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
        started_at: row.get::<_, Option<i64>>(12)?.map(|v| v as u64),
        completed_at: row.get::<_, Option<i64>>(13)?.map(|v| v as u64),
        assigned_worker: row.get(14)?,
        task_type: TaskType::parse_or_mixed(&type_str),
        tau_at_submission: row.get(16)?,
        sla_multiplier: row.get(17)?,
    })
}

pub fn insert(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({SELECT_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)"
        ),
        params![
            task.id,
            task.user,
            task.name,
            task.image,
            task.command,
            task.resources.cpu,
            task.resources.mem,
            task.resources.storage,
            task.resources.gpu,
            task.status.as_str(),
            task.submitted_at as i64,
            task.assigned_at.map(|v| v as i64),
            task.started_at.map(|v| v as i64),
            task.completed_at.map(|v| v as i64),
            task.assigned_worker,
            task.task_type.as_str(),
            task.tau_at_submission,
            task.sla_multiplier,
        ],
    )
    .context("failed to insert task")?;
    Ok(())
}

/// Persist a status transition with its associated timestamp fields. Called
/// from the single `queue::transition` chokepoint so every status change
/// lands here exactly once.
#[allow(clippy::too_many_arguments)]
pub fn update_transition(
    conn: &Connection,
    task_id: &str,
    status: TaskStatus,
    assigned_at: Option<u64>,
    started_at: Option<u64>,
    completed_at: Option<u64>,
    assigned_worker: Option<&str>,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE tasks SET
            status = ?2,
            assigned_at = COALESCE(?3, assigned_at),
            started_at = COALESCE(?4, started_at),
            completed_at = COALESCE(?5, completed_at),
            assigned_worker = COALESCE(?6, assigned_worker)
        WHERE id = ?1
        "#,
        params![
            task_id,
            status.as_str(),
            assigned_at.map(|v| v as i64),
            started_at.map(|v| v as i64),
            completed_at.map(|v| v as i64),
            assigned_worker,
        ],
    )
    .context("failed to update task transition")?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE id = ?1"))?;
    match stmt.query_row(params![id], row_to_task) {
        Ok(t) => Ok(Some(t)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn list_by_status(conn: &Connection, status: Option<TaskStatus>) -> Result<Vec<Task>> {
    let mut stmt = match status {
        Some(_) => conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY submitted_at"
        ))?,
        None => conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM tasks ORDER BY submitted_at"))?,
    };
    let rows = match status {
        Some(s) => stmt.query_map(params![s.as_str()], row_to_task)?,
        None => stmt.query_map([], row_to_task)?,
    };
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// FIFO admission order by `submitted_at` over pending tasks.
pub fn list_pending_fifo(conn: &Connection) -> Result<Vec<Task>> {
    list_by_status(conn, Some(TaskStatus::Pending))
}

pub fn delete_terminal_before(conn: &Connection, cutoff: u64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM tasks WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at < ?1",
        params![cutoff as i64],
    )?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            user: "alice".to_string(),
            name: "alpine-1".to_string(),
            image: "alpine:latest".to_string(),
            command: None,
            resources: ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 },
            status: TaskStatus::Pending,
            submitted_at: 100,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            assigned_worker: None,
            task_type: TaskType::CpuLight,
            tau_at_submission: 5.0,
            sla_multiplier: 2.0,
        }
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        insert(&conn, &sample_task("t1")).unwrap();
        let found = get(&conn, "t1").unwrap().unwrap();
        assert_eq!(found.image, "alpine:latest");
        assert_eq!(found.status, TaskStatus::Pending);
    }

    #[test]
    fn transition_updates_status_and_timestamps() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        insert(&conn, &sample_task("t1")).unwrap();
        update_transition(&conn, "t1", TaskStatus::Running, None, Some(150), None, Some("w1")).unwrap();
        let found = get(&conn, "t1").unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Running);
        assert_eq!(found.started_at, Some(150));
        assert_eq!(found.assigned_worker.as_deref(), Some("w1"));
    }

    #[test]
    fn list_pending_fifo_orders_by_submission() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        let mut t2 = sample_task("t2");
        t2.submitted_at = 50;
        insert(&conn, &sample_task("t1")).unwrap();
        insert(&conn, &t2).unwrap();
        let pending = list_pending_fifo(&conn).unwrap();
        assert_eq!(pending[0].id, "t2");
        assert_eq!(pending[1].id, "t1");
    }
}
