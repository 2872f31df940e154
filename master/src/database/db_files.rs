//! Output file-metadata database operations for the master (component G).
//!
//! Tracks the on-disk layout `<FILES_BASE_DIR>/<user>/<task_name>/<submitted_at>/<task_id>/...`
//! so the operator API can list and resolve uploaded output files by task.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use shared::model::FileMetadata;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS file_metadata (
            task_id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            task_name TEXT NOT NULL,
            submitted_at INTEGER NOT NULL,
            relative_paths TEXT NOT NULL,
            storage_path TEXT NOT NULL,
            uploaded_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("failed to create file_metadata table")?;
    Ok(())
}

pub fn insert(conn: &Connection, meta: &FileMetadata) -> Result<()> {
    let paths_json = serde_json::to_string(&meta.relative_paths)
        .context("failed to serialize relative_paths")?;
    conn.execute(
        "INSERT INTO file_metadata (task_id, user, task_name, submitted_at, relative_paths, storage_path, uploaded_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(task_id) DO UPDATE SET \
            relative_paths = excluded.relative_paths, \
            storage_path = excluded.storage_path, \
            uploaded_at = excluded.uploaded_at",
        params![
            meta.task_id,
            meta.user,
            meta.task_name,
            meta.submitted_at as i64,
            paths_json,
            meta.storage_path,
            meta.uploaded_at as i64,
        ],
    )
    .context("failed to insert file metadata")?;
    Ok(())
}

pub fn get(conn: &Connection, task_id: &str) -> Result<Option<FileMetadata>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, user, task_name, submitted_at, relative_paths, storage_path, uploaded_at \
         FROM file_metadata WHERE task_id = ?1",
    )?;
    let result = stmt.query_row(params![task_id], |row| {
        let paths_json: String = row.get(4)?;
        Ok(FileMetadata {
            task_id: row.get(0)?,
            user: row.get(1)?,
            task_name: row.get(2)?,
            submitted_at: row.get::<_, i64>(3)? as u64,
            relative_paths: serde_json::from_str(&paths_json).unwrap_or_default(),
            storage_path: row.get(5)?,
            uploaded_at: row.get::<_, i64>(6)? as u64,
        })
    });
    match result {
        Ok(m) => Ok(Some(m)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn delete_before(conn: &Connection, cutoff: u64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM file_metadata WHERE uploaded_at < ?1",
        params![cutoff as i64],
    )?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(task_id: &str) -> FileMetadata {
        FileMetadata {
            task_id: task_id.to_string(),
            user: "alice".to_string(),
            task_name: "alpine-1".to_string(),
            submitted_at: 100,
            relative_paths: vec!["out.txt".to_string(), "logs/run.log".to_string()],
            storage_path: "/data/files/alice/alpine-1/100/t1".to_string(),
            uploaded_at: 150,
        }
    }

    #[test]
    fn insert_then_get_roundtrips_relative_paths() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        insert(&conn, &sample("t1")).unwrap();
        let found = get(&conn, "t1").unwrap().unwrap();
        assert_eq!(found.relative_paths.len(), 2);
        assert_eq!(found.relative_paths[1], "logs/run.log");
    }

    #[test]
    fn insert_upserts_on_conflict() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        insert(&conn, &sample("t1")).unwrap();
        let mut updated = sample("t1");
        updated.relative_paths = vec!["only.txt".to_string()];
        insert(&conn, &updated).unwrap();
        let found = get(&conn, "t1").unwrap().unwrap();
        assert_eq!(found.relative_paths, vec!["only.txt".to_string()]);
    }
}
