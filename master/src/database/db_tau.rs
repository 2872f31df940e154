//! τ-store persistence: per-task-type EMA estimates (component A).

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use shared::model::TaskType;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tau_entries (
            task_type TEXT PRIMARY KEY,
            tau_seconds REAL NOT NULL
        )
        "#,
        [],
    )
    .context("failed to create tau_entries table")?;

    for task_type in TaskType::ALL {
        conn.execute(
            "INSERT OR IGNORE INTO tau_entries (task_type, tau_seconds) VALUES (?1, ?2)",
            params![task_type.as_str(), task_type.default_tau_seconds()],
        )
        .context("failed to seed tau_entries default")?;
    }
    Ok(())
}

pub fn get(conn: &Connection, task_type: TaskType) -> Result<f64> {
    conn.query_row(
        "SELECT tau_seconds FROM tau_entries WHERE task_type = ?1",
        params![task_type.as_str()],
        |row| row.get(0),
    )
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(task_type.default_tau_seconds()),
        e => Err(e),
    })
    .context("failed to read tau entry")
}

pub fn set(conn: &Connection, task_type: TaskType, tau_seconds: f64) -> Result<()> {
    conn.execute(
        "INSERT INTO tau_entries (task_type, tau_seconds) VALUES (?1, ?2) \
         ON CONFLICT(task_type) DO UPDATE SET tau_seconds = excluded.tau_seconds",
        params![task_type.as_str(), tau_seconds],
    )
    .context("failed to upsert tau entry")?;
    Ok(())
}

pub fn get_all(conn: &Connection) -> Result<Vec<(TaskType, f64)>> {
    let mut stmt = conn.prepare("SELECT task_type, tau_seconds FROM tau_entries")?;
    let rows = stmt.query_map([], |row| {
        let type_str: String = row.get(0)?;
        let tau: f64 = row.get(1)?;
        Ok((TaskType::parse_or_mixed(&type_str), tau))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_seeds_all_six_defaults() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        let all = get_all(&conn).unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(get(&conn, TaskType::CpuLight).unwrap(), 5.0);
        assert_eq!(get(&conn, TaskType::GpuTraining).unwrap(), 60.0);
    }

    #[test]
    fn set_updates_existing_entry() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        set(&conn, TaskType::CpuLight, 7.5).unwrap();
        assert_eq!(get(&conn, TaskType::CpuLight).unwrap(), 7.5);
        assert_eq!(get_all(&conn).unwrap().len(), 6);
    }
}
