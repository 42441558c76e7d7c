// src/writer/mod.rs
// Memory extraction and write path

mod extract;
mod fingerprint;

pub use extract::{Candidate, EXTRACTION_SYSTEM_PROMPT, parse_candidates};
pub use fingerprint::{fingerprint, hex_encode, normalize};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WriterConfig;
use crate::db::{
    self, DatabasePool, InsertOutcome, MemoryPatch, NewMemory, Role, embedding_to_bytes,
};
use crate::embeddings::Embedder;
use crate::error::{MemoriaError, Result};
use crate::guard::{ContextTag, Validator, sanitize};
use crate::llm::{Completion, CompletionOptions};

/// What a writer run did, reported to the orchestrator as the task result.
#[derive(Debug, Clone, Default)]
pub struct WriterOutcome {
    /// All memory ids belonging to this message's candidates (inserted or
    /// pre-existing)
    pub memory_ids: Vec<i64>,
    pub inserted: usize,
    /// Conflicts absorbed with a confidence raise
    pub updated: usize,
    /// Memories left without an embedding after the retry budget
    pub embed_failures: usize,
}

/// Extracts typed memories from user turns, deduplicates by fingerprint,
/// and keeps embedding state consistent.
pub struct Writer {
    pool: Arc<DatabasePool>,
    embedder: Option<Arc<dyn Embedder>>,
    completion: Arc<dyn Completion>,
    validator: Arc<dyn Validator>,
    config: WriterConfig,
}

impl Writer {
    pub fn new(
        pool: Arc<DatabasePool>,
        embedder: Option<Arc<dyn Embedder>>,
        completion: Arc<dyn Completion>,
        validator: Arc<dyn Validator>,
        config: WriterConfig,
    ) -> Self {
        Self {
            pool,
            embedder,
            completion,
            validator,
            config,
        }
    }

    /// Run extraction for one user message. Idempotent per
    /// (user, conversation, message): re-running absorbs every insert as a
    /// conflict and produces the same set of memory ids.
    pub async fn run(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: i64,
        cancel: &CancellationToken,
    ) -> Result<WriterOutcome> {
        let message = {
            let user_id = user_id.to_string();
            self.pool
                .run(move |conn| db::get_message_sync(conn, &user_id, message_id))
                .await?
                .ok_or_else(|| MemoriaError::NotFound(format!("message {message_id}")))?
        };

        if message.role != Role::User {
            return Err(MemoriaError::InvalidInput(format!(
                "extraction expects a user message, got {}",
                message.role.as_str()
            )));
        }

        // Step 1 - validate before the text goes anywhere near a prompt.
        self.check_safe(user_id, &message.text, ContextTag::WriterExtract)
            .await?;

        if cancel.is_cancelled() {
            return Err(MemoriaError::Cancelled);
        }

        // Step 2 - extract candidates.
        let raw = self
            .completion
            .complete(
                EXTRACTION_SYSTEM_PROMPT,
                &sanitize(&message.text),
                &CompletionOptions::extraction(),
            )
            .await?;

        if cancel.is_cancelled() {
            return Err(MemoriaError::Cancelled);
        }

        // Step 3 - parse strictly, filter by confidence.
        let candidates: Vec<Candidate> = parse_candidates(&raw, self.config.max_candidate_chars)
            .into_iter()
            .filter(|c| c.confidence >= self.config.min_confidence)
            .collect();

        if candidates.is_empty() {
            debug!(user_id, message_id, "no durable candidates extracted");
            return Ok(WriterOutcome::default());
        }

        // Steps 4+5 - fingerprint and insert, absorbing conflicts.
        let mut outcome = WriterOutcome::default();
        let mut to_embed: Vec<(i64, String)> = Vec::new();

        for candidate in candidates {
            let key = fingerprint(&candidate.text, candidate.memory_type);
            let record = NewMemory {
                user_id: user_id.to_string(),
                conversation_id: Some(conversation_id.to_string()),
                text: candidate.text.clone(),
                memory_type: candidate.memory_type,
                importance: candidate.importance,
                confidence: candidate.confidence,
                idempotency_key: key,
                provenance: serde_json::json!({
                    "source": "extraction",
                    "message_id": message_id,
                }),
            };

            let insert_result = {
                let record = record.clone();
                self.pool
                    .run(move |conn| db::insert_memory_sync(conn, &record))
                    .await?
            };

            match insert_result {
                InsertOutcome::Inserted(id) => {
                    outcome.inserted += 1;
                    outcome.memory_ids.push(id);
                    to_embed.push((id, record.text));
                }
                InsertOutcome::Conflict {
                    existing_id,
                    existing_confidence,
                } => {
                    // Absorbed: a higher-confidence re-extraction refreshes
                    // the row, otherwise it is a no-op.
                    if existing_confidence < candidate.confidence {
                        let user_id = user_id.to_string();
                        let confidence = candidate.confidence;
                        let importance = candidate.importance;
                        self.pool
                            .run(move |conn| {
                                db::raise_confidence_sync(
                                    conn,
                                    &user_id,
                                    existing_id,
                                    confidence,
                                    importance,
                                )
                            })
                            .await?;
                        outcome.updated += 1;
                    }
                    outcome.memory_ids.push(existing_id);
                }
            }
        }

        // Step 6 - embed the fresh rows.
        if cancel.is_cancelled() {
            return Err(MemoriaError::Cancelled);
        }
        outcome.embed_failures = self.embed_with_retry(&to_embed).await;

        info!(
            user_id,
            message_id,
            inserted = outcome.inserted,
            updated = outcome.updated,
            embed_failures = outcome.embed_failures,
            "writer run complete"
        );
        Ok(outcome)
    }

    /// Correction path: replace a memory's text in place. The id and
    /// idempotency_key are intentionally untouched; the corrected memory
    /// keeps its identity and only the embedding is regenerated.
    pub async fn correct(
        &self,
        user_id: &str,
        memory_id: i64,
        new_text: &str,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        self.check_safe(user_id, new_text, ContextTag::Correction)
            .await?;

        let sanitized = sanitize(new_text);
        if sanitized.is_empty() {
            return Err(MemoriaError::InvalidInput(
                "corrected text is empty after sanitization".into(),
            ));
        }

        let updated = {
            let user_id = user_id.to_string();
            let patch = MemoryPatch {
                text: Some(sanitized.clone()),
                ..Default::default()
            };
            self.pool
                .run(move |conn| db::update_memory_sync(conn, &user_id, memory_id, &patch))
                .await?
        };
        if !updated {
            return Err(MemoriaError::NotFound(format!("memory {memory_id}")));
        }

        if cancel.is_cancelled() {
            return Err(MemoriaError::Cancelled);
        }

        let failures = self.embed_with_retry(&[(memory_id, sanitized)]).await;
        if failures > 0 {
            warn!(user_id, memory_id, "correction left memory without embedding");
        }

        Ok(memory_id)
    }

    /// Re-embed memories that are still missing vectors (degraded rows from
    /// earlier failures). Called opportunistically by the orchestrator.
    pub async fn embed_pending(&self, limit: usize) -> Result<usize> {
        let pending = self
            .pool
            .run(move |conn| db::memories_without_embedding_sync(conn, limit))
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let batch: Vec<(i64, String)> =
            pending.into_iter().map(|m| (m.id, m.text)).collect();
        let total = batch.len();
        let failures = self.embed_with_retry(&batch).await;
        Ok(total - failures)
    }

    async fn check_safe(&self, user_id: &str, text: &str, tag: ContextTag) -> Result<()> {
        let verdict = self.validator.validate(text, tag).await?;
        if verdict.safe {
            return Ok(());
        }

        let reason = verdict
            .reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "policy_violation".into());
        let score = verdict.score;
        {
            let user_id = user_id.to_string();
            let text = text.to_string();
            let tag_str = tag.as_str();
            self.pool
                .run(move |conn| {
                    db::record_security_event_sync(conn, &user_id, tag_str, &reason, score, &text)
                })
                .await?;
        }
        Err(verdict.into_error(tag))
    }

    /// Batch-embed with a bounded per-item retry budget. Exhausted items
    /// keep a null embedding and get `provenance.embedding_failed` set.
    /// Returns the number of items that failed permanently.
    async fn embed_with_retry(&self, batch: &[(i64, String)]) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let Some(embedder) = self.embedder.as_ref() else {
            // No embedder configured: rows stay unembedded, vector reads
            // skip them. Not an error.
            debug!("no embedder configured, {} rows left unembedded", batch.len());
            return batch.len();
        };

        let mut remaining: Vec<(i64, String)> = batch.to_vec();
        let mut permanent: Vec<(i64, String)> = Vec::new();
        let mut backoff = Duration::from_millis(self.config.embed_retry_backoff_ms);

        for attempt in 0..self.config.embed_retry_attempts {
            if remaining.is_empty() {
                break;
            }
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            let texts: Vec<String> = remaining.iter().map(|(_, t)| t.clone()).collect();
            let results = embedder.embed_batch(&texts).await;

            let mut still_failing = Vec::new();
            for ((id, text), result) in remaining.into_iter().zip(results) {
                match result {
                    Ok(vector) => {
                        let bytes = embedding_to_bytes(&vector);
                        let store_result = self
                            .pool
                            .run(move |conn| db::store_embedding_sync(conn, id, &bytes))
                            .await;
                        if let Err(e) = store_result {
                            warn!(memory_id = id, "failed to store embedding: {}", e);
                            still_failing.push((id, text));
                        }
                    }
                    Err(e) if e.is_transient() => {
                        debug!(memory_id = id, attempt, "embedding attempt failed: {}", e);
                        still_failing.push((id, text));
                    }
                    Err(e) => {
                        // Fatal (e.g. dimension mismatch): retrying cannot help.
                        warn!(memory_id = id, "embedding failed permanently: {}", e);
                        permanent.push((id, text));
                    }
                }
            }
            remaining = still_failing;
        }
        remaining.extend(permanent);

        let failures = remaining.len();
        for (id, _) in remaining {
            let mark_result = self
                .pool
                .run(move |conn| {
                    // Merge the degraded marker into the existing provenance
                    // rather than replacing it.
                    let row: Option<(String, String)> = conn
                        .query_row(
                            "SELECT user_id, provenance FROM memories WHERE id = ?",
                            [id],
                            |r| Ok((r.get(0)?, r.get(1)?)),
                        )
                        .ok();
                    let Some((owner, provenance_str)) = row else {
                        return Ok(false);
                    };
                    let mut provenance: serde_json::Value =
                        serde_json::from_str(&provenance_str)
                            .unwrap_or(serde_json::Value::Object(Default::default()));
                    if let Some(map) = provenance.as_object_mut() {
                        map.insert("embedding_failed".into(), serde_json::Value::Bool(true));
                    }
                    let patch = MemoryPatch {
                        provenance: Some(provenance),
                        ..Default::default()
                    };
                    db::update_memory_sync(conn, &owner, id, &patch)
                })
                .await;
            if let Err(e) = mark_result {
                warn!(memory_id = id, "failed to mark degraded embedding: {}", e);
            }
        }
        failures
    }
}
