// src/db/schema.rs
// Database schema and migrations

use anyhow::Result;
use rusqlite::Connection;

use super::migration_helpers::{add_column_if_missing, table_exists};

/// Run all schema setup and migrations.
///
/// Called during pool initialization. Idempotent - existing tables and
/// columns are left alone.
pub fn run_all_migrations(conn: &Connection, dimensions: usize) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    migrate_vec_memories(conn, dimensions)?;
    migrate_memory_fts(conn)?;
    migrate_tasks_attempts(conn)?;

    Ok(())
}

/// Database schema SQL
pub const SCHEMA: &str = r#"
-- =======================================
-- CONVERSATIONS & MESSAGES
-- =======================================
CREATE TABLE IF NOT EXISTS conversations (
    user_id TEXT NOT NULL,
    id TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    PRIMARY KEY (user_id, id)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    text TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
CREATE INDEX IF NOT EXISTS idx_messages_conv
    ON messages(user_id, conversation_id, created_at, id);

-- =======================================
-- MEMORIES
-- =======================================
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    conversation_id TEXT,
    text TEXT NOT NULL,
    memory_type TEXT NOT NULL,
    importance REAL NOT NULL DEFAULT 0.5,
    confidence REAL NOT NULL DEFAULT 0.5,
    bad INTEGER NOT NULL DEFAULT 0,
    pinned INTEGER NOT NULL DEFAULT 0,
    idempotency_key TEXT NOT NULL,
    has_embedding INTEGER NOT NULL DEFAULT 0,
    provenance TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_fingerprint
    ON memories(user_id, idempotency_key);
CREATE INDEX IF NOT EXISTS idx_memories_recent
    ON memories(user_id, created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_memories_no_embedding
    ON memories(has_embedding) WHERE has_embedding = 0;

-- =======================================
-- SUMMARIES (one row per user/conversation/scope)
-- =======================================
CREATE TABLE IF NOT EXISTS summaries (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT 'rolling',
    content TEXT NOT NULL,
    citations TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    UNIQUE(user_id, conversation_id, scope)
);

-- =======================================
-- INSIGHTS (append-only)
-- =======================================
CREATE TABLE IF NOT EXISTS insights (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    content TEXT NOT NULL,
    supporting TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
CREATE INDEX IF NOT EXISTS idx_insights_user ON insights(user_id, created_at DESC);

-- =======================================
-- TASKS
-- =======================================
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    user_id TEXT NOT NULL,
    conversation_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    submitted_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    started_at TEXT,
    finished_at TEXT,
    result TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_submitted ON tasks(submitted_at);

-- =======================================
-- SECURITY EVENTS (validator refusals)
-- =======================================
CREATE TABLE IF NOT EXISTS security_events (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    context_tag TEXT NOT NULL,
    reason TEXT NOT NULL,
    score REAL NOT NULL DEFAULT 0,
    excerpt TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
CREATE INDEX IF NOT EXISTS idx_security_user ON security_events(user_id, created_at DESC);
"#;

/// Create or migrate the vec0 vector table.
///
/// If the existing table was created with different dimensions, it is
/// dropped and recreated; rows re-embed lazily via the degraded scan since
/// `memories.has_embedding` is reset alongside.
pub fn migrate_vec_memories(conn: &Connection, dimensions: usize) -> Result<()> {
    let current_dim: Option<i64> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type='table' AND name='vec_memories'",
            [],
            |row| {
                let sql: String = row.get(0)?;
                // Parse dimension from SQL like "embedding float[1536]"
                if let Some(start) = sql.find("float[") {
                    let rest = &sql[start + 6..];
                    if let Some(end) = rest.find(']') {
                        if let Ok(dim) = rest[..end].parse::<i64>() {
                            return Ok(Some(dim));
                        }
                    }
                }
                Ok(None)
            },
        )
        .unwrap_or(None);

    if let Some(dim) = current_dim {
        if dim as usize != dimensions {
            tracing::info!(
                "Migrating vec_memories from {} to {} dimensions",
                dim,
                dimensions
            );
            conn.execute_batch("DROP TABLE IF EXISTS vec_memories;")?;
            conn.execute("UPDATE memories SET has_embedding = 0", [])?;
        }
    }

    let create_sql = format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS vec_memories USING vec0(
            embedding float[{dimensions}],
            +memory_id INTEGER
        )"
    );
    conn.execute(&create_sql, [])?;

    Ok(())
}

/// Create the FTS5 lexical index over memory text.
pub fn migrate_memory_fts(conn: &Connection) -> Result<()> {
    let fts_exists = table_exists(conn, "memory_fts");

    if !fts_exists {
        tracing::info!("Creating FTS5 full-text search table for memories");
        conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
                text,
                user_id UNINDEXED,
                memory_id UNINDEXED,
                tokenize='porter unicode61 remove_diacritics 1'
            );",
        )?;

        rebuild_memory_fts(conn)?;
    }

    Ok(())
}

/// Rebuild the FTS5 index from the memories table.
pub fn rebuild_memory_fts(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM memory_fts", [])?;

    let inserted = conn.execute(
        "INSERT INTO memory_fts(rowid, text, user_id, memory_id)
         SELECT id, text, user_id, id FROM memories",
        [],
    )?;

    if inserted > 0 {
        tracing::info!("FTS5 memory index rebuilt with {} entries", inserted);
    }
    Ok(())
}

/// Add the retry-attempt counter to tasks for older databases.
fn migrate_tasks_attempts(conn: &Connection) -> Result<()> {
    add_column_if_missing(conn, "tasks", "attempts", "INTEGER NOT NULL DEFAULT 0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::ensure_sqlite_vec_registered;

    fn open_test_conn() -> Connection {
        ensure_sqlite_vec_registered();
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn, 8).unwrap();
        conn
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = open_test_conn();
        // Second run must not fail
        run_all_migrations(&conn, 8).unwrap();
        assert!(table_exists(&conn, "memories"));
        assert!(table_exists(&conn, "vec_memories"));
        assert!(table_exists(&conn, "memory_fts"));
        assert!(table_exists(&conn, "tasks"));
        assert!(table_exists(&conn, "security_events"));
    }

    #[test]
    fn test_dimension_change_recreates_vec_table() {
        let conn = open_test_conn();

        conn.execute(
            "INSERT INTO memories (user_id, text, memory_type, idempotency_key, has_embedding)
             VALUES ('u1', 'likes rust', 'preference', 'k1', 1)",
            [],
        )
        .unwrap();

        // Re-run with a different dimension: table recreated, embedding
        // markers cleared.
        run_all_migrations(&conn, 16).unwrap();

        let has_embedding: i64 = conn
            .query_row("SELECT has_embedding FROM memories WHERE user_id='u1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(has_embedding, 0);

        let sql: String = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE name='vec_memories'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(sql.contains("float[16]"));
    }

    #[test]
    fn test_fts_rebuild_mirrors_memories() {
        let conn = open_test_conn();

        conn.execute(
            "INSERT INTO memories (user_id, text, memory_type, idempotency_key)
             VALUES ('u1', 'works in berlin as a data scientist', 'fact', 'k1')",
            [],
        )
        .unwrap();
        rebuild_memory_fts(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_fts WHERE memory_fts MATCH 'berlin'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
