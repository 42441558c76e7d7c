// src/db/summaries.rs
// Rolling summary storage (sync functions for pool.interact())

use rusqlite::{Connection, OptionalExtension, params};

use super::types::{Summary, SummaryScope};

/// Parse Summary from a row with standard column order:
/// (id, user_id, conversation_id, scope, content, citations, created_at, updated_at)
pub fn parse_summary_row(row: &rusqlite::Row) -> rusqlite::Result<Summary> {
    let scope_str: String = row.get(3)?;
    let citations_str: String = row.get(5)?;
    Ok(Summary {
        id: row.get(0)?,
        user_id: row.get(1)?,
        conversation_id: row.get(2)?,
        scope: if scope_str == "full" {
            SummaryScope::Full
        } else {
            SummaryScope::Rolling
        },
        content: row.get(4)?,
        citations: serde_json::from_str(&citations_str).unwrap_or_default(),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const SUMMARY_COLUMNS: &str =
    "id, user_id, conversation_id, scope, content, citations, created_at, updated_at";

/// Get the summary for (user, conversation, scope), if any.
pub fn get_summary_sync(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    scope: SummaryScope,
) -> rusqlite::Result<Option<Summary>> {
    conn.query_row(
        &format!(
            "SELECT {SUMMARY_COLUMNS} FROM summaries
             WHERE user_id = ? AND conversation_id = ? AND scope = ?"
        ),
        params![user_id, conversation_id, scope.as_str()],
        parse_summary_row,
    )
    .optional()
}

/// Rewrite the summary in place (at most one row per user/conversation/scope).
pub fn upsert_summary_sync(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    scope: SummaryScope,
    content: &str,
    citations: &[i64],
) -> rusqlite::Result<i64> {
    let citations_json = serde_json::to_string(citations).unwrap_or_else(|_| "[]".into());

    conn.execute(
        "INSERT INTO summaries (user_id, conversation_id, scope, content, citations)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(user_id, conversation_id, scope) DO UPDATE SET
            content = excluded.content,
            citations = excluded.citations,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')",
        params![user_id, conversation_id, scope.as_str(), content, citations_json],
    )?;

    conn.query_row(
        "SELECT id FROM summaries WHERE user_id = ? AND conversation_id = ? AND scope = ?",
        params![user_id, conversation_id, scope.as_str()],
        |row| row.get(0),
    )
}
