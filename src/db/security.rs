// src/db/security.rs
// Security event log for validator refusals (sync functions for pool.interact())

use rusqlite::{Connection, params};

/// Max characters of the offending text retained alongside the event.
const EXCERPT_CHARS: usize = 200;

/// Record a validator refusal. The offending text is truncated to an
/// excerpt; the full text is never persisted.
pub fn record_security_event_sync(
    conn: &Connection,
    user_id: &str,
    context_tag: &str,
    reason: &str,
    score: f64,
    text: &str,
) -> rusqlite::Result<i64> {
    let excerpt: String = text.chars().take(EXCERPT_CHARS).collect();
    conn.execute(
        "INSERT INTO security_events (user_id, context_tag, reason, score, excerpt)
         VALUES (?, ?, ?, ?, ?)",
        params![user_id, context_tag, reason, score, excerpt],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Count security events for a user (test and monitoring support).
pub fn count_security_events_sync(conn: &Connection, user_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM security_events WHERE user_id = ?",
        [user_id],
        |row| row.get(0),
    )
}
