// src/db/tasks.rs
// Task row lifecycle (sync functions for pool.interact())

use rusqlite::{Connection, OptionalExtension, params};

use super::types::{TaskKind, TaskRecord, TaskStatus};

/// Parse TaskRecord from a row with standard column order:
/// (id, kind, user_id, conversation_id, status, submitted_at, started_at,
///  finished_at, result, error, attempts)
pub fn parse_task_row(row: &rusqlite::Row) -> rusqlite::Result<TaskRecord> {
    let kind_str: String = row.get(1)?;
    let status_str: String = row.get(4)?;
    let result_str: Option<String> = row.get(8)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        kind: TaskKind::from_str(&kind_str).unwrap_or(TaskKind::Extract),
        user_id: row.get(2)?,
        conversation_id: row.get(3)?,
        status: TaskStatus::from_str(&status_str).unwrap_or(TaskStatus::Pending),
        submitted_at: row.get(5)?,
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
        result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(9)?,
        attempts: row.get::<_, i64>(10)? as u32,
    })
}

const TASK_COLUMNS: &str = "id, kind, user_id, conversation_id, status, submitted_at, \
     started_at, finished_at, result, error, attempts";

/// Create a pending task row. A duplicate id (idempotent resubmission) is
/// a no-op; the existing row wins.
pub fn create_task_sync(
    conn: &Connection,
    task_id: &str,
    kind: TaskKind,
    user_id: &str,
    conversation_id: Option<&str>,
) -> rusqlite::Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO tasks (id, kind, user_id, conversation_id, status)
         VALUES (?, ?, ?, ?, 'pending')",
        params![task_id, kind.as_str(), user_id, conversation_id],
    )?;
    Ok(inserted > 0)
}

/// Transition a task to running and stamp started_at.
pub fn mark_task_running_sync(conn: &Connection, task_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE tasks SET status = 'running',
         started_at = COALESCE(started_at, strftime('%Y-%m-%dT%H:%M:%fZ','now')),
         attempts = attempts + 1
         WHERE id = ?",
        [task_id],
    )?;
    Ok(())
}

/// Terminal success with an optional result payload.
pub fn mark_task_completed_sync(
    conn: &Connection,
    task_id: &str,
    result: Option<&serde_json::Value>,
) -> rusqlite::Result<()> {
    let result_json = result.map(|r| r.to_string());
    conn.execute(
        "UPDATE tasks SET status = 'completed',
         finished_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'),
         result = ?
         WHERE id = ?",
        params![result_json, task_id],
    )?;
    Ok(())
}

/// Terminal failure with the error string recorded.
pub fn mark_task_failed_sync(conn: &Connection, task_id: &str, error: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE tasks SET status = 'failed',
         finished_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'),
         error = ?
         WHERE id = ?",
        params![error, task_id],
    )?;
    Ok(())
}

/// Fetch a task row by id.
pub fn get_task_sync(conn: &Connection, task_id: &str) -> rusqlite::Result<Option<TaskRecord>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"),
        [task_id],
        parse_task_row,
    )
    .optional()
}

/// Delete terminal task rows older than the retention window.
/// Returns the number of rows removed.
pub fn gc_tasks_sync(conn: &Connection, retention_secs: i64) -> rusqlite::Result<usize> {
    let removed = conn.execute(
        "DELETE FROM tasks
         WHERE status IN ('completed', 'failed')
           AND finished_at < strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?)",
        [format!("-{retention_secs} seconds")],
    )?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::ensure_sqlite_vec_registered;
    use crate::db::schema::run_all_migrations;

    fn open_test_conn() -> Connection {
        ensure_sqlite_vec_registered();
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn, 4).unwrap();
        conn
    }

    #[test]
    fn test_task_lifecycle() {
        let conn = open_test_conn();

        assert!(create_task_sync(&conn, "t1", TaskKind::Extract, "u1", Some("c1")).unwrap());
        // Duplicate submission: no second row
        assert!(!create_task_sync(&conn, "t1", TaskKind::Extract, "u1", Some("c1")).unwrap());

        let t = get_task_sync(&conn, "t1").unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.started_at.is_none());
        assert_eq!(t.attempts, 0);

        mark_task_running_sync(&conn, "t1").unwrap();
        let t = get_task_sync(&conn, "t1").unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert!(t.started_at.is_some());
        assert_eq!(t.attempts, 1);

        let result = serde_json::json!({"memory_ids": [1, 2]});
        mark_task_completed_sync(&conn, "t1", Some(&result)).unwrap();
        let t = get_task_sync(&conn, "t1").unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.finished_at.is_some());
        assert_eq!(t.result.unwrap()["memory_ids"][0], 1);
    }

    #[test]
    fn test_task_failure_records_error() {
        let conn = open_test_conn();
        create_task_sync(&conn, "t1", TaskKind::Summarize, "u1", Some("c1")).unwrap();
        mark_task_running_sync(&conn, "t1").unwrap();
        mark_task_failed_sync(&conn, "t1", "deadline exceeded").unwrap();

        let t = get_task_sync(&conn, "t1").unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error.as_deref(), Some("deadline exceeded"));
    }

    #[test]
    fn test_gc_removes_only_old_terminal_rows() {
        let conn = open_test_conn();
        create_task_sync(&conn, "t_old", TaskKind::Extract, "u1", None).unwrap();
        create_task_sync(&conn, "t_live", TaskKind::Extract, "u1", None).unwrap();

        conn.execute(
            "UPDATE tasks SET status = 'completed', finished_at = '2000-01-01T00:00:00.000Z'
             WHERE id = 't_old'",
            [],
        )
        .unwrap();

        let removed = gc_tasks_sync(&conn, 3600).unwrap();
        assert_eq!(removed, 1);
        assert!(get_task_sync(&conn, "t_old").unwrap().is_none());
        assert!(get_task_sync(&conn, "t_live").unwrap().is_some());
    }
}
