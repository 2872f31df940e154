//! Worker-registry database operations for the master.
//!
//! Mirrors the in-memory `WorkerRegistry`: every allocation change is also
//! written here so the Resource Reconciler and a restarted master can
//! rebuild authoritative state.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use shared::model::{ResourceVector, Worker};

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            id TEXT PRIMARY KEY,
            address TEXT NOT NULL,
            total_cpu REAL NOT NULL,
            total_mem REAL NOT NULL,
            total_storage REAL NOT NULL,
            total_gpu REAL NOT NULL,
            allocated_cpu REAL NOT NULL DEFAULT 0,
            allocated_mem REAL NOT NULL DEFAULT 0,
            allocated_storage REAL NOT NULL DEFAULT 0,
            allocated_gpu REAL NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 0,
            last_heartbeat INTEGER NOT NULL DEFAULT 0,
            registered_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("failed to create workers table")?;
    Ok(())
}

fn row_to_worker(row: &rusqlite::Row) -> rusqlite::Result<Worker> {
    Ok(Worker {
        id: row.get(0)?,
        address: row.get(1)?,
        total: ResourceVector {
            cpu: row.get(2)?,
            mem: row.get(3)?,
            storage: row.get(4)?,
            gpu: row.get(5)?,
        },
        allocated: ResourceVector {
            cpu: row.get(6)?,
            mem: row.get(7)?,
            storage: row.get(8)?,
            gpu: row.get(9)?,
        },
        active: row.get::<_, i64>(10)? != 0,
        last_heartbeat: row.get::<_, i64>(11)? as u64,
        registered_at: row.get::<_, i64>(12)? as u64,
    })
}

const SELECT_COLUMNS: &str = "id, address, total_cpu, total_mem, total_storage, total_gpu, \
    allocated_cpu, allocated_mem, allocated_storage, allocated_gpu, active, last_heartbeat, registered_at";

pub fn upsert(conn: &Connection, worker: &Worker) -> Result<()> {
    conn.execute(
        &format!(
            r#"
            INSERT INTO workers ({SELECT_COLUMNS})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(id) DO UPDATE SET
                address = excluded.address,
                total_cpu = excluded.total_cpu,
                total_mem = excluded.total_mem,
                total_storage = excluded.total_storage,
                total_gpu = excluded.total_gpu,
                allocated_cpu = excluded.allocated_cpu,
                allocated_mem = excluded.allocated_mem,
                allocated_storage = excluded.allocated_storage,
                allocated_gpu = excluded.allocated_gpu,
                active = excluded.active,
                last_heartbeat = excluded.last_heartbeat
            "#
        ),
        params![
            worker.id,
            worker.address,
            worker.total.cpu,
            worker.total.mem,
            worker.total.storage,
            worker.total.gpu,
            worker.allocated.cpu,
            worker.allocated.mem,
            worker.allocated.storage,
            worker.allocated.gpu,
            worker.active as i64,
            worker.last_heartbeat as i64,
            worker.registered_at as i64,
        ],
    )
    .context("failed to upsert worker")?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM workers WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Worker>> {
    let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM workers WHERE id = ?1"))?;
    let result = stmt.query_row(params![id], row_to_worker);
    match result {
        Ok(w) => Ok(Some(w)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn list_all(conn: &Connection) -> Result<Vec<Worker>> {
    let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM workers ORDER BY id"))?;
    let rows = stmt.query_map([], row_to_worker)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::Worker;

    fn sample_worker(id: &str) -> Worker {
        Worker {
            id: id.to_string(),
            address: "http://127.0.0.1:7100".to_string(),
            total: ResourceVector { cpu: 4.0, mem: 8.0, storage: 100.0, gpu: 0.0 },
            allocated: ResourceVector::default(),
            active: true,
            last_heartbeat: 100,
            registered_at: 1,
        }
    }

    #[test]
    fn upsert_then_get_roundtrips() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        upsert(&conn, &sample_worker("w1")).unwrap();
        let found = get(&conn, "w1").unwrap().unwrap();
        assert_eq!(found.address, "http://127.0.0.1:7100");
        assert_eq!(found.total.cpu, 4.0);
    }

    #[test]
    fn upsert_updates_existing_row() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        let mut w = sample_worker("w1");
        upsert(&conn, &w).unwrap();
        w.allocated.cpu = 2.0;
        upsert(&conn, &w).unwrap();
        let found = get(&conn, "w1").unwrap().unwrap();
        assert_eq!(found.allocated.cpu, 2.0);
        assert_eq!(list_all(&conn).unwrap().len(), 1);
    }

    #[test]
    fn delete_removes_worker() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        upsert(&conn, &sample_worker("w1")).unwrap();
        delete(&conn, "w1").unwrap();
        assert!(get(&conn, "w1").unwrap().is_none());
    }
}
