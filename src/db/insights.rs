// src/db/insights.rs
// Insight storage (sync functions for pool.interact())

use rusqlite::{Connection, OptionalExtension, params};

use super::types::Insight;

/// Parse Insight from a row with standard column order:
/// (id, user_id, content, supporting, created_at)
pub fn parse_insight_row(row: &rusqlite::Row) -> rusqlite::Result<Insight> {
    let supporting_str: String = row.get(3)?;
    Ok(Insight {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content: row.get(2)?,
        supporting: serde_json::from_str(&supporting_str).unwrap_or_default(),
        created_at: row.get(4)?,
    })
}

/// Append an insight. Insights are never updated or deduplicated.
pub fn insert_insight_sync(
    conn: &Connection,
    user_id: &str,
    content: &str,
    supporting: &[i64],
) -> rusqlite::Result<i64> {
    let supporting_json = serde_json::to_string(supporting).unwrap_or_else(|_| "[]".into());
    conn.execute(
        "INSERT INTO insights (user_id, content, supporting) VALUES (?, ?, ?)",
        params![user_id, content, supporting_json],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Latest insights for a user, newest first.
pub fn list_insights_sync(
    conn: &Connection,
    user_id: &str,
    limit: usize,
) -> rusqlite::Result<Vec<Insight>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, content, supporting, created_at FROM insights
         WHERE user_id = ?
         ORDER BY created_at DESC, id DESC
         LIMIT ?",
    )?;
    let rows = stmt.query_map(params![user_id, limit as i64], parse_insight_row)?;
    rows.collect()
}

/// Timestamp of the most recent insight, used for the mining cadence.
pub fn last_insight_at_sync(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT created_at FROM insights WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        [user_id],
        |row| row.get(0),
    )
    .optional()
}
