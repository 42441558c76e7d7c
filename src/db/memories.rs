// src/db/memories.rs
// Memory storage, retrieval-source queries, and embedding state
// (sync functions for pool.interact())

use rusqlite::{Connection, OptionalExtension, params};

use super::types::{Memory, MemoryPatch, MemoryType};

/// Standard memory column list shared by every query that parses a row.
const MEMORY_COLUMNS: &str = "m.id, m.user_id, m.conversation_id, m.text, m.memory_type, \
     m.importance, m.confidence, m.bad, m.pinned, m.idempotency_key, \
     m.has_embedding, m.provenance, m.created_at, m.updated_at";

/// Parse Memory from a rusqlite Row with the MEMORY_COLUMNS order.
pub fn parse_memory_row(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let type_str: String = row.get(4)?;
    let provenance_str: String = row.get(11)?;
    Ok(Memory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        conversation_id: row.get(2)?,
        text: row.get(3)?,
        memory_type: MemoryType::from_str(&type_str).unwrap_or(MemoryType::Fact),
        importance: row.get(5)?,
        confidence: row.get(6)?,
        bad: row.get::<_, i64>(7)? != 0,
        pinned: row.get::<_, i64>(8)? != 0,
        idempotency_key: row.get(9)?,
        has_embedding: row.get::<_, i64>(10)? != 0,
        provenance: serde_json::from_str(&provenance_str)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

/// Serialize an embedding vector to the little-endian byte form sqlite-vec
/// expects.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Optional restriction applied identically to all retrieval-source queries.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub conversation_id: Option<String>,
}

/// New memory record for insertion.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub text: String,
    pub memory_type: MemoryType,
    pub importance: f64,
    pub confidence: f64,
    pub idempotency_key: String,
    pub provenance: serde_json::Value,
}

/// Outcome of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InsertOutcome {
    /// Fresh row created
    Inserted(i64),
    /// A row with the same (user_id, idempotency_key) already exists
    Conflict {
        existing_id: i64,
        existing_confidence: f64,
    },
}

impl InsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            Self::Inserted(id) => *id,
            Self::Conflict { existing_id, .. } => *existing_id,
        }
    }
}

/// Insert a memory. A unique-key violation on (user_id, idempotency_key)
/// is reported as `Conflict` with the existing row so the caller can absorb
/// it; no other error is swallowed.
pub fn insert_memory_sync(conn: &Connection, record: &NewMemory) -> rusqlite::Result<InsertOutcome> {
    let existing: Option<(i64, f64)> = conn
        .query_row(
            "SELECT id, confidence FROM memories WHERE user_id = ? AND idempotency_key = ?",
            params![record.user_id, record.idempotency_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((existing_id, existing_confidence)) = existing {
        return Ok(InsertOutcome::Conflict {
            existing_id,
            existing_confidence,
        });
    }

    let provenance = serde_json::to_string(&record.provenance).unwrap_or_else(|_| "{}".into());
    let result = conn.execute(
        "INSERT INTO memories (user_id, conversation_id, text, memory_type, importance,
         confidence, idempotency_key, provenance)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            record.user_id,
            record.conversation_id,
            record.text,
            record.memory_type.as_str(),
            record.importance,
            record.confidence,
            record.idempotency_key,
            provenance,
        ],
    );

    match result {
        Ok(_) => {
            let id = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO memory_fts (rowid, text, user_id, memory_id) VALUES (?, ?, ?, ?)",
                params![id, record.text, record.user_id, id],
            )?;
            Ok(InsertOutcome::Inserted(id))
        }
        // A concurrent writer can still win the race between the SELECT
        // above and this INSERT; re-read and report the conflict.
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ffi::ErrorCode::ConstraintViolation =>
        {
            let (existing_id, existing_confidence) = conn.query_row(
                "SELECT id, confidence FROM memories WHERE user_id = ? AND idempotency_key = ?",
                params![record.user_id, record.idempotency_key],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
            )?;
            Ok(InsertOutcome::Conflict {
                existing_id,
                existing_confidence,
            })
        }
        Err(e) => Err(e),
    }
}

/// Raise confidence/importance of an existing row (conflict absorption when
/// a re-extraction arrives with higher confidence).
pub fn raise_confidence_sync(
    conn: &Connection,
    user_id: &str,
    memory_id: i64,
    confidence: f64,
    importance: f64,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE memories SET confidence = ?, importance = ?,
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
         WHERE user_id = ? AND id = ?",
        params![confidence, importance, user_id, memory_id],
    )?;
    Ok(())
}

/// Apply a partial update. A text change clears the stored embedding (vec
/// row deleted, has_embedding reset) and rewrites the FTS row; the caller
/// is responsible for re-embedding. Returns false when the row does not
/// exist for this user.
pub fn update_memory_sync(
    conn: &Connection,
    user_id: &str,
    memory_id: i64,
    patch: &MemoryPatch,
) -> rusqlite::Result<bool> {
    if patch.is_empty() {
        return get_memory_sync(conn, user_id, memory_id).map(|m| m.is_some());
    }

    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref text) = patch.text {
        sets.push("text = ?".into());
        values.push(Box::new(text.clone()));
        sets.push("has_embedding = 0".into());
    }
    if let Some(bad) = patch.bad {
        sets.push("bad = ?".into());
        values.push(Box::new(bad as i64));
    }
    if let Some(pinned) = patch.pinned {
        sets.push("pinned = ?".into());
        values.push(Box::new(pinned as i64));
    }
    if let Some(importance) = patch.importance {
        sets.push("importance = ?".into());
        values.push(Box::new(importance));
    }
    if let Some(confidence) = patch.confidence {
        sets.push("confidence = ?".into());
        values.push(Box::new(confidence));
    }
    if let Some(ref provenance) = patch.provenance {
        sets.push("provenance = ?".into());
        values.push(Box::new(
            serde_json::to_string(provenance).unwrap_or_else(|_| "{}".into()),
        ));
    }
    sets.push("updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')".into());

    let sql = format!(
        "UPDATE memories SET {} WHERE user_id = ? AND id = ?",
        sets.join(", ")
    );
    values.push(Box::new(user_id.to_string()));
    values.push(Box::new(memory_id));

    let updated = conn.execute(&sql, rusqlite::params_from_iter(values))?;
    if updated == 0 {
        return Ok(false);
    }

    if let Some(ref text) = patch.text {
        conn.execute("DELETE FROM vec_memories WHERE rowid = ?", [memory_id])?;
        conn.execute("DELETE FROM memory_fts WHERE rowid = ?", [memory_id])?;
        conn.execute(
            "INSERT INTO memory_fts (rowid, text, user_id, memory_id) VALUES (?, ?, ?, ?)",
            params![memory_id, text, user_id, memory_id],
        )?;
    }

    Ok(true)
}

/// Get a single memory by id, scoped to the user.
pub fn get_memory_sync(
    conn: &Connection,
    user_id: &str,
    memory_id: i64,
) -> rusqlite::Result<Option<Memory>> {
    conn.query_row(
        &format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.user_id = ? AND m.id = ?"),
        params![user_id, memory_id],
        parse_memory_row,
    )
    .optional()
}

/// List memories for the API layer (includes bad/pinned flags as stored).
pub fn list_memories_sync(
    conn: &Connection,
    user_id: &str,
    conversation_id: Option<&str>,
    limit: usize,
    offset: usize,
) -> rusqlite::Result<Vec<Memory>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m
         WHERE m.user_id = ?1 AND (?2 IS NULL OR m.conversation_id = ?2)
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT ?3 OFFSET ?4"
    ))?;
    let rows = stmt.query_map(
        params![user_id, conversation_id, limit as i64, offset as i64],
        parse_memory_row,
    )?;
    rows.collect()
}

/// Vector k-NN over embedded memories: cosine distance ascending.
/// Excludes bad memories; rows without embeddings are simply absent from
/// the vec table and never appear.
pub fn vector_topk_sync(
    conn: &Connection,
    user_id: &str,
    embedding_bytes: &[u8],
    k: usize,
    filter: &MemoryFilter,
) -> rusqlite::Result<Vec<(Memory, f32)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MEMORY_COLUMNS}, vec_distance_cosine(v.embedding, ?1) AS distance
         FROM vec_memories v
         JOIN memories m ON v.memory_id = m.id
         WHERE m.user_id = ?2 AND m.bad = 0
           AND (?3 IS NULL OR m.conversation_id = ?3)
         ORDER BY distance
         LIMIT ?4"
    ))?;

    let rows = stmt.query_map(
        params![
            embedding_bytes,
            user_id,
            filter.conversation_id.as_deref(),
            k as i64
        ],
        |row| {
            let memory = parse_memory_row(row)?;
            let distance: f32 = row.get(14)?;
            Ok((memory, distance))
        },
    )?;
    rows.collect()
}

/// Build an FTS5 query from free text: strip special characters, OR the
/// terms, prefix-match the last one.
fn build_fts_query(query: &str) -> String {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| {
            t.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .collect();

    if terms.is_empty() {
        return String::new();
    }

    let last = terms.len() - 1;
    terms
        .iter()
        .enumerate()
        .map(|(i, t)| if i == last { format!("{t}*") } else { t.clone() })
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Lexical top-k: FTS5 bm25 rank returned as a positive higher-is-better
/// value. Falls back to a LIKE scan (uniform rank) when FTS matches
/// nothing, so short or odd queries still surface something.
pub fn lexical_topk_sync(
    conn: &Connection,
    user_id: &str,
    query: &str,
    k: usize,
    filter: &MemoryFilter,
) -> rusqlite::Result<Vec<(Memory, f64)>> {
    let fts_query = build_fts_query(query);
    if fts_query.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {MEMORY_COLUMNS}, -bm25(memory_fts) AS rank
         FROM memory_fts f
         JOIN memories m ON m.id = f.rowid
         WHERE memory_fts MATCH ?1 AND m.user_id = ?2 AND m.bad = 0
           AND (?3 IS NULL OR m.conversation_id = ?3)
         ORDER BY bm25(memory_fts)
         LIMIT ?4"
    ))?;

    let results: Vec<(Memory, f64)> = stmt
        .query_map(
            params![
                fts_query,
                user_id,
                filter.conversation_id.as_deref(),
                k as i64
            ],
            |row| {
                let memory = parse_memory_row(row)?;
                let rank: f64 = row.get(14)?;
                Ok((memory, rank))
            },
        )?
        .filter_map(|r| r.ok())
        .collect();

    if !results.is_empty() {
        return Ok(results);
    }

    like_fallback_sync(conn, user_id, query, k, filter)
}

/// LIKE-based fallback when FTS5 returns nothing. All hits share rank 1.0.
fn like_fallback_sync(
    conn: &Connection,
    user_id: &str,
    query: &str,
    k: usize,
    filter: &MemoryFilter,
) -> rusqlite::Result<Vec<(Memory, f64)>> {
    // Escape SQL LIKE wildcards to prevent injection
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    let pattern = format!("%{}%", escaped.trim());

    let mut stmt = conn.prepare(&format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m
         WHERE m.user_id = ?1 AND m.bad = 0 AND m.text LIKE ?2 ESCAPE '\\'
           AND (?3 IS NULL OR m.conversation_id = ?3)
         ORDER BY m.updated_at DESC
         LIMIT ?4"
    ))?;

    let rows = stmt.query_map(
        params![user_id, pattern, filter.conversation_id.as_deref(), k as i64],
        parse_memory_row,
    )?;
    Ok(rows
        .filter_map(|r| r.ok())
        .map(|m| (m, 1.0))
        .collect())
}

/// Most recent memories ordered (created_at desc, id desc). Excludes bad.
pub fn recent_memories_sync(
    conn: &Connection,
    user_id: &str,
    k: usize,
    filter: &MemoryFilter,
) -> rusqlite::Result<Vec<Memory>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m
         WHERE m.user_id = ?1 AND m.bad = 0
           AND (?2 IS NULL OR m.conversation_id = ?2)
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(
        params![user_id, filter.conversation_id.as_deref(), k as i64],
        parse_memory_row,
    )?;
    rows.collect()
}

/// Store an embedding for a memory and mark it embedded.
pub fn store_embedding_sync(
    conn: &Connection,
    memory_id: i64,
    embedding_bytes: &[u8],
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO vec_memories (rowid, embedding, memory_id) VALUES (?, ?, ?)",
        params![memory_id, embedding_bytes, memory_id],
    )?;
    conn.execute(
        "UPDATE memories SET has_embedding = 1 WHERE id = ?",
        [memory_id],
    )?;
    Ok(())
}

/// Find memories that still lack an embedding (degraded-scan support).
pub fn memories_without_embedding_sync(
    conn: &Connection,
    limit: usize,
) -> rusqlite::Result<Vec<Memory>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m
         WHERE m.has_embedding = 0
         ORDER BY m.created_at ASC
         LIMIT ?"
    ))?;
    let rows = stmt.query_map([limit as i64], parse_memory_row)?;
    rows.collect()
}

/// Count memories created after the watermark (insight-miner trigger).
pub fn count_memories_since_sync(
    conn: &Connection,
    user_id: &str,
    since: &str,
) -> rusqlite::Result<usize> {
    conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE user_id = ? AND created_at > ?",
        params![user_id, since],
        |row| row.get::<_, i64>(0).map(|c| c as usize),
    )
}

/// High-confidence, non-bad memories for insight mining, newest first.
pub fn high_confidence_memories_sync(
    conn: &Connection,
    user_id: &str,
    min_confidence: f64,
    limit: usize,
) -> rusqlite::Result<Vec<Memory>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m
         WHERE m.user_id = ? AND m.bad = 0 AND m.confidence >= ?
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT ?"
    ))?;
    let rows = stmt.query_map(
        params![user_id, min_confidence, limit as i64],
        parse_memory_row,
    )?;
    rows.collect()
}

/// Memories created inside a (since, until] window for one conversation;
/// feeds the summarizer's citation whitelist.
pub fn memories_in_window_sync(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    since: &str,
) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM memories
         WHERE user_id = ? AND conversation_id = ? AND created_at > ?
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![user_id, conversation_id, since], |row| row.get(0))?;
    rows.collect()
}

/// Which of the given ids exist for this user.
pub fn existing_memory_ids_sync(
    conn: &Connection,
    user_id: &str,
    ids: &[i64],
) -> rusqlite::Result<Vec<i64>> {
    let mut found = Vec::with_capacity(ids.len());
    let mut stmt = conn.prepare("SELECT 1 FROM memories WHERE user_id = ? AND id = ?")?;
    for id in ids {
        if stmt.exists(params![user_id, id])? {
            found.push(*id);
        }
    }
    Ok(found)
}

/// Hard delete, including vector and FTS rows. Scoped to the user.
pub fn delete_memory_sync(
    conn: &Connection,
    user_id: &str,
    memory_id: i64,
) -> rusqlite::Result<bool> {
    let owned = conn
        .query_row(
            "SELECT 1 FROM memories WHERE user_id = ? AND id = ?",
            params![user_id, memory_id],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    if !owned {
        return Ok(false);
    }

    conn.execute("DELETE FROM vec_memories WHERE rowid = ?", [memory_id])?;
    conn.execute("DELETE FROM memory_fts WHERE rowid = ?", [memory_id])?;
    let deleted = conn.execute(
        "DELETE FROM memories WHERE user_id = ? AND id = ?",
        params![user_id, memory_id],
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
        run_all_migrations(&conn, 4).unwrap();
        conn
    }

    fn new_memory(user: &str, text: &str, key: &str) -> NewMemory {
        NewMemory {
            user_id: user.into(),
            conversation_id: Some("c1".into()),
            text: text.into(),
            memory_type: MemoryType::Fact,
            importance: 0.6,
            confidence: 0.8,
            idempotency_key: key.into(),
            provenance: serde_json::json!({}),
        }
    }

    #[test]
    fn test_insert_then_conflict() {
        let conn = open_test_conn();

        let first = insert_memory_sync(&conn, &new_memory("u1", "lives in tokyo", "k1")).unwrap();
        let id = match first {
            InsertOutcome::Inserted(id) => id,
            other => panic!("expected insert, got {other:?}"),
        };

        let second = insert_memory_sync(&conn, &new_memory("u1", "lives in tokyo", "k1")).unwrap();
        match second {
            InsertOutcome::Conflict {
                existing_id,
                existing_confidence,
            } => {
                assert_eq!(existing_id, id);
                assert!((existing_confidence - 0.8).abs() < f64::EPSILON);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // Same key for a different user is a fresh insert
        let third = insert_memory_sync(&conn, &new_memory("u2", "lives in tokyo", "k1")).unwrap();
        assert!(matches!(third, InsertOutcome::Inserted(_)));
    }

    #[test]
    fn test_text_update_clears_embedding_and_rewrites_fts() {
        let conn = open_test_conn();
        let outcome = insert_memory_sync(&conn, &new_memory("u1", "old text here", "k1")).unwrap();
        let id = outcome.id();

        store_embedding_sync(&conn, id, &embedding_to_bytes(&[0.1, 0.2, 0.3, 0.4])).unwrap();
        let m = get_memory_sync(&conn, "u1", id).unwrap().unwrap();
        assert!(m.has_embedding);

        let patch = MemoryPatch {
            text: Some("brand new words".into()),
            ..Default::default()
        };
        assert!(update_memory_sync(&conn, "u1", id, &patch).unwrap());

        let m = get_memory_sync(&conn, "u1", id).unwrap().unwrap();
        assert!(!m.has_embedding);
        assert_eq!(m.text, "brand new words");

        // FTS now matches the new text, not the old
        let hits = lexical_topk_sync(&conn, "u1", "brand", 10, &MemoryFilter::default()).unwrap();
        assert_eq!(hits.len(), 1);
        let stale = lexical_topk_sync(&conn, "u1", "old", 10, &MemoryFilter::default()).unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn test_vector_topk_excludes_bad_and_respects_user() {
        let conn = open_test_conn();
        let a = insert_memory_sync(&conn, &new_memory("u1", "memory a", "ka"))
            .unwrap()
            .id();
        let b = insert_memory_sync(&conn, &new_memory("u1", "memory b", "kb"))
            .unwrap()
            .id();
        let other = insert_memory_sync(&conn, &new_memory("u2", "memory other", "ko"))
            .unwrap()
            .id();

        store_embedding_sync(&conn, a, &embedding_to_bytes(&[1.0, 0.0, 0.0, 0.0])).unwrap();
        store_embedding_sync(&conn, b, &embedding_to_bytes(&[0.0, 1.0, 0.0, 0.0])).unwrap();
        store_embedding_sync(&conn, other, &embedding_to_bytes(&[1.0, 0.0, 0.0, 0.0])).unwrap();

        let query = embedding_to_bytes(&[1.0, 0.0, 0.0, 0.0]);
        let results = vector_topk_sync(&conn, "u1", &query, 10, &MemoryFilter::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.id, a);
        assert!(results[0].1 < results[1].1);

        // Mark a bad: it disappears from vector reads
        update_memory_sync(
            &conn,
            "u1",
            a,
            &MemoryPatch {
                bad: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        let results = vector_topk_sync(&conn, "u1", &query, 10, &MemoryFilter::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, b);
    }

    #[test]
    fn test_lexical_topk_ranks_matches() {
        let conn = open_test_conn();
        insert_memory_sync(
            &conn,
            &new_memory("u1", "works as a data scientist in berlin", "k1"),
        )
        .unwrap();
        insert_memory_sync(&conn, &new_memory("u1", "enjoys hiking on weekends", "k2")).unwrap();

        let hits =
            lexical_topk_sync(&conn, "u1", "data scientist work", 10, &MemoryFilter::default())
                .unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].0.text.contains("data scientist"));
    }

    #[test]
    fn test_lexical_like_fallback() {
        let conn = open_test_conn();
        insert_memory_sync(&conn, &new_memory("u1", "uses c++ daily", "k1")).unwrap();

        // "++" strips to nothing useful for FTS; the LIKE fallback finds it
        let hits = lexical_topk_sync(&conn, "u1", "c++", 10, &MemoryFilter::default()).unwrap();
        assert!(!hits.is_empty());
    }

    #[test]
    fn test_conversation_filter_applies() {
        let conn = open_test_conn();
        let mut m = new_memory("u1", "scoped to c1", "k1");
        m.conversation_id = Some("c1".into());
        insert_memory_sync(&conn, &m).unwrap();
        let mut m2 = new_memory("u1", "scoped to c2", "k2");
        m2.conversation_id = Some("c2".into());
        insert_memory_sync(&conn, &m2).unwrap();

        let filter = MemoryFilter {
            conversation_id: Some("c1".into()),
        };
        let recents = recent_memories_sync(&conn, "u1", 10, &filter).unwrap();
        assert_eq!(recents.len(), 1);
        assert_eq!(recents[0].text, "scoped to c1");
    }

    #[test]
    fn test_delete_memory_scoped_to_user() {
        let conn = open_test_conn();
        let id = insert_memory_sync(&conn, &new_memory("u1", "mine", "k1"))
            .unwrap()
            .id();

        assert!(!delete_memory_sync(&conn, "u2", id).unwrap());
        assert!(delete_memory_sync(&conn, "u1", id).unwrap());
        assert!(get_memory_sync(&conn, "u1", id).unwrap().is_none());
    }

    #[test]
    fn test_existing_memory_ids_filters_foreign_rows() {
        let conn = open_test_conn();
        let mine = insert_memory_sync(&conn, &new_memory("u1", "mine", "k1"))
            .unwrap()
            .id();
        let theirs = insert_memory_sync(&conn, &new_memory("u2", "theirs", "k2"))
            .unwrap()
            .id();

        let found = existing_memory_ids_sync(&conn, "u1", &[mine, theirs, 9999]).unwrap();
        assert_eq!(found, vec![mine]);
    }
}
