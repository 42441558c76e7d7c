// src/db/conversations.rs
// Conversation and message operations (sync functions for pool.interact())

use rusqlite::{Connection, OptionalExtension, params};

use super::types::{MessageRecord, Role};

/// Parse MessageRecord from a row with standard column order:
/// (id, user_id, conversation_id, role, text, created_at)
pub fn parse_message_row(row: &rusqlite::Row) -> rusqlite::Result<MessageRecord> {
    let role_str: String = row.get(3)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        conversation_id: row.get(2)?,
        role: Role::from_str(&role_str).unwrap_or(Role::User),
        text: row.get(4)?,
        created_at: row.get(5)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, user_id, conversation_id, role, text, created_at";

/// Append a message, creating the conversation lazily if absent.
/// Returns the new message id.
pub fn append_message_sync(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    role: Role,
    text: &str,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO conversations (user_id, id) VALUES (?, ?)",
        params![user_id, conversation_id],
    )?;

    conn.execute(
        "INSERT INTO messages (user_id, conversation_id, role, text) VALUES (?, ?, ?, ?)",
        params![user_id, conversation_id, role.as_str(), text],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Whether the conversation exists for this user.
pub fn conversation_exists_sync(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM conversations WHERE user_id = ? AND id = ?",
        params![user_id, conversation_id],
        |_| Ok(true),
    )
    .optional()
    .map(|o| o.unwrap_or(false))
}

/// Last `limit` messages of a conversation, returned in ascending time.
pub fn recent_messages_sync(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    limit: usize,
) -> rusqlite::Result<Vec<MessageRecord>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM (
             SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE user_id = ? AND conversation_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?
         ) ORDER BY created_at ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![user_id, conversation_id, limit as i64],
        parse_message_row,
    )?;
    rows.collect()
}

/// Get a single message by id, scoped to the user.
pub fn get_message_sync(
    conn: &Connection,
    user_id: &str,
    message_id: i64,
) -> rusqlite::Result<Option<MessageRecord>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ? AND id = ?"),
        params![user_id, message_id],
        parse_message_row,
    )
    .optional()
}

/// Messages of a conversation strictly newer than the watermark, ascending.
/// An empty watermark returns the whole conversation.
pub fn messages_since_sync(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    since: &str,
) -> rusqlite::Result<Vec<MessageRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE user_id = ? AND conversation_id = ? AND created_at > ?
         ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt.query_map(params![user_id, conversation_id, since], parse_message_row)?;
    rows.collect()
}

/// Count user-role turns and their total characters since the watermark.
/// Drives the summarizer triggers.
pub fn user_turns_since_sync(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    since: &str,
) -> rusqlite::Result<(usize, usize)> {
    conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(LENGTH(text)), 0) FROM messages
         WHERE user_id = ? AND conversation_id = ? AND role = 'user' AND created_at > ?",
        params![user_id, conversation_id, since],
        |row| {
            let turns: i64 = row.get(0)?;
            let chars: i64 = row.get(1)?;
            Ok((turns as usize, chars as usize))
        },
    )
}

/// Delete a conversation: cascades to messages and summaries, detaches
/// memories (their conversation_id becomes NULL).
pub fn delete_conversation_sync(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
) -> rusqlite::Result<bool> {
    conn.execute(
        "UPDATE memories SET conversation_id = NULL WHERE user_id = ? AND conversation_id = ?",
        params![user_id, conversation_id],
    )?;
    conn.execute(
        "DELETE FROM messages WHERE user_id = ? AND conversation_id = ?",
        params![user_id, conversation_id],
    )?;
    conn.execute(
        "DELETE FROM summaries WHERE user_id = ? AND conversation_id = ?",
        params![user_id, conversation_id],
    )?;
    let deleted = conn.execute(
        "DELETE FROM conversations WHERE user_id = ? AND id = ?",
        params![user_id, conversation_id],
    )?;
    Ok(deleted > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::ensure_sqlite_vec_registered;
    use crate::db::schema::run_all_migrations;

    fn open_test_conn() -> Connection {
        ensure_sqlite_vec_registered();
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn, 8).unwrap();
        conn
    }

    #[test]
    fn test_append_creates_conversation_lazily() {
        let conn = open_test_conn();
        assert!(!conversation_exists_sync(&conn, "u1", "c1").unwrap());

        let id = append_message_sync(&conn, "u1", "c1", Role::User, "hello").unwrap();
        assert!(id > 0);
        assert!(conversation_exists_sync(&conn, "u1", "c1").unwrap());

        // Second append reuses the conversation
        append_message_sync(&conn, "u1", "c1", Role::Assistant, "hi").unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_recent_messages_ascending_order() {
        let conn = open_test_conn();
        for i in 0..5 {
            append_message_sync(&conn, "u1", "c1", Role::User, &format!("m{i}")).unwrap();
        }

        let msgs = recent_messages_sync(&conn, "u1", "c1", 3).unwrap();
        assert_eq!(msgs.len(), 3);
        // Last three, oldest first
        assert_eq!(msgs[0].text, "m2");
        assert_eq!(msgs[2].text, "m4");
    }

    #[test]
    fn test_messages_scoped_to_user() {
        let conn = open_test_conn();
        append_message_sync(&conn, "u1", "c1", Role::User, "mine").unwrap();
        append_message_sync(&conn, "u2", "c1", Role::User, "theirs").unwrap();

        let msgs = recent_messages_sync(&conn, "u1", "c1", 10).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text, "mine");
    }

    #[test]
    fn test_user_turns_since_counts_only_user_role() {
        let conn = open_test_conn();
        append_message_sync(&conn, "u1", "c1", Role::User, "abcd").unwrap();
        append_message_sync(&conn, "u1", "c1", Role::Assistant, "reply").unwrap();
        append_message_sync(&conn, "u1", "c1", Role::User, "efgh").unwrap();

        let (turns, chars) = user_turns_since_sync(&conn, "u1", "c1", "").unwrap();
        assert_eq!(turns, 2);
        assert_eq!(chars, 8);
    }

    #[test]
    fn test_delete_conversation_cascades_and_detaches() {
        let conn = open_test_conn();
        append_message_sync(&conn, "u1", "c1", Role::User, "hello").unwrap();
        conn.execute(
            "INSERT INTO memories (user_id, conversation_id, text, memory_type, idempotency_key)
             VALUES ('u1', 'c1', 'likes rust', 'preference', 'k1')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO summaries (user_id, conversation_id, scope, content)
             VALUES ('u1', 'c1', 'rolling', 'summary')",
            [],
        )
        .unwrap();

        assert!(delete_conversation_sync(&conn, "u1", "c1").unwrap());

        let msg_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(msg_count, 0);
        let sum_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM summaries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(sum_count, 0);
        // Memory survives, detached
        let conv: Option<String> = conn
            .query_row("SELECT conversation_id FROM memories WHERE user_id='u1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(conv, None);
    }
}
