// src/engine.rs
// MemoryEngine - the facade the API layer talks to

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::{
    self, DatabasePool, Insight, Memory, MemoryPatch, Role, Summary, SummaryScope, TaskKind,
    TaskRecord,
};
use crate::embeddings::Embedder;
use crate::error::{MemoriaError, Result};
use crate::guard::{ContextTag, Validator, sanitize};
use crate::llm::{Completion, CompletionOptions};
use crate::miner::InsightMiner;
use crate::orchestrator::{Orchestrator, TaskPayload};
use crate::retrieval::{RankedMemory, Retriever};
use crate::summarizer::Summarizer;
use crate::writer::Writer;

const RESPONDER_SYSTEM_PROMPT: &str = "\
You are a helpful assistant with long-term memory about the user. Use the
provided memory context and conversation summary when they are relevant;
never invent memories that are not listed. Answer the user directly.";

/// Foreground chat result.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub assistant_text: String,
    pub cited_memory_ids: Vec<i64>,
    pub assistant_message_id: i64,
}

/// The memory engine. All four capabilities are injected by reference;
/// swapping a hosted provider for a local one (or a test fake) is a
/// constructor argument, never a code change.
pub struct MemoryEngine {
    pool: Arc<DatabasePool>,
    retriever: Retriever,
    summarizer: Arc<Summarizer>,
    miner: Arc<InsightMiner>,
    orchestrator: Orchestrator,
    completion: Arc<dyn Completion>,
    validator: Arc<dyn Validator>,
    config: EngineConfig,
}

impl MemoryEngine {
    pub fn new(
        pool: Arc<DatabasePool>,
        embedder: Option<Arc<dyn Embedder>>,
        completion: Arc<dyn Completion>,
        validator: Arc<dyn Validator>,
        config: EngineConfig,
    ) -> Self {
        let retriever = Retriever::new(
            pool.clone(),
            embedder.clone(),
            config.retrieval.clone(),
        );
        let writer = Arc::new(Writer::new(
            pool.clone(),
            embedder,
            completion.clone(),
            validator.clone(),
            config.writer.clone(),
        ));
        let summarizer = Arc::new(Summarizer::new(
            pool.clone(),
            completion.clone(),
            validator.clone(),
            config.summary.clone(),
        ));
        let miner = Arc::new(InsightMiner::new(
            pool.clone(),
            completion.clone(),
            validator.clone(),
            config.insight.clone(),
        ));
        let orchestrator = Orchestrator::spawn(
            pool.clone(),
            writer,
            summarizer.clone(),
            miner.clone(),
            config.orchestrator.clone(),
        );

        Self {
            pool,
            retriever,
            summarizer,
            miner,
            orchestrator,
            completion,
            validator,
            config,
        }
    }

    /// Foreground chat turn: assemble bounded memory context, answer, then
    /// schedule the background write path. Degrades gracefully - if every
    /// retrieval source fails the answer is produced with no memory
    /// context and `cited_memory_ids` is empty.
    pub async fn assemble_and_answer(
        &self,
        user_id: &str,
        conversation_id: &str,
        user_text: &str,
    ) -> Result<ChatResponse> {
        let deadline = Duration::from_secs(self.config.orchestrator.chat_deadline_secs);

        // Validate before the text is persisted or enters any prompt.
        self.check_safe(user_id, user_text, ContextTag::ResponderUser)
            .await?;
        let user_text = sanitize(user_text);
        if user_text.is_empty() {
            return Err(MemoriaError::InvalidInput("empty message".into()));
        }

        // The append commits before any background task referring to it is
        // submitted.
        let user_message_id = {
            let user_id = user_id.to_string();
            let conversation_id = conversation_id.to_string();
            let text = user_text.clone();
            self.pool
                .run(move |conn| {
                    db::append_message_sync(conn, &user_id, &conversation_id, Role::User, &text)
                })
                .await?
        };

        let task_id = self
            .orchestrator
            .record_foreground(
                TaskKind::ChatAssemble,
                user_id,
                Some(conversation_id),
                &serde_json::json!({"message_id": user_message_id}),
            )
            .await?;

        let answer = tokio::time::timeout(
            deadline,
            self.answer_turn(user_id, conversation_id, &user_text, user_message_id),
        )
        .await
        .map_err(MemoriaError::from)
        .and_then(|r| r);

        match answer {
            Ok(response) => {
                let result = serde_json::json!({
                    "assistant_text": response.assistant_text,
                    "cited_memory_ids": response.cited_memory_ids,
                    "assistant_message_id": response.assistant_message_id,
                });
                if let Err(e) = self
                    .orchestrator
                    .finish_foreground(&task_id, Ok(result))
                    .await
                {
                    warn!(task_id = %task_id, "failed to close chat task row: {}", e);
                }

                // Background follow-ups are submitted after the answer is
                // secured; their failure never affects the response.
                self.schedule_turn_followups(user_id, conversation_id, user_message_id)
                    .await;

                Ok(response)
            }
            Err(e) => {
                let _ = self
                    .orchestrator
                    .finish_foreground(&task_id, Err(e.to_string()))
                    .await;
                // The turn still happened; extraction is still worthwhile.
                self.schedule_turn_followups(user_id, conversation_id, user_message_id)
                    .await;
                Err(e)
            }
        }
    }

    /// Inner foreground path without the deadline wrapper.
    async fn answer_turn(
        &self,
        user_id: &str,
        conversation_id: &str,
        user_text: &str,
        user_message_id: i64,
    ) -> Result<ChatResponse> {
        // Retrieval degrades to empty on any failure.
        let context = match self
            .retriever
            .retrieve(user_id, user_text, None)
            .await
        {
            Ok(ranked) => ranked,
            Err(e) => {
                warn!("retrieval failed, answering without memory context: {}", e);
                Vec::new()
            }
        };
        let cited_memory_ids: Vec<i64> = context.iter().map(|r| r.memory.id).collect();

        let summary = {
            let user_id = user_id.to_string();
            let conversation_id = conversation_id.to_string();
            self.pool
                .run(move |conn| {
                    db::get_summary_sync(conn, &user_id, &conversation_id, SummaryScope::Rolling)
                })
                .await
                .unwrap_or_else(|e| {
                    warn!("summary read failed, answering without it: {}", e);
                    None
                })
        };

        let recent: Vec<db::MessageRecord> = {
            let user_id = user_id.to_string();
            let conversation_id = conversation_id.to_string();
            self.pool
                .run(move |conn| db::recent_messages_sync(conn, &user_id, &conversation_id, 10))
                .await
                .unwrap_or_else(|e| {
                    warn!("recent-message read failed: {}", e);
                    Vec::new()
                })
                .into_iter()
                // The current turn was already appended; it closes the
                // rendered prompt instead of appearing in the history.
                .filter(|m| m.id != user_message_id)
                .collect()
        };

        let system_prompt = build_responder_prompt(&context, summary.as_ref());
        let user_prompt = render_turn(&recent, user_text);

        let assistant_text = self
            .completion
            .complete(&system_prompt, &user_prompt, &CompletionOptions::responder())
            .await?;

        let assistant_message_id = {
            let user_id = user_id.to_string();
            let conversation_id = conversation_id.to_string();
            let text = assistant_text.clone();
            self.pool
                .run(move |conn| {
                    db::append_message_sync(
                        conn,
                        &user_id,
                        &conversation_id,
                        Role::Assistant,
                        &text,
                    )
                })
                .await?
        };

        Ok(ChatResponse {
            assistant_text,
            cited_memory_ids,
            assistant_message_id,
        })
    }

    /// Submit the background tasks a completed turn triggers. Best-effort:
    /// an overloaded queue is logged and the turn still succeeds.
    async fn schedule_turn_followups(
        &self,
        user_id: &str,
        conversation_id: &str,
        user_message_id: i64,
    ) {
        if let Err(e) = self
            .submit_extract(user_id, conversation_id, user_message_id)
            .await
        {
            warn!("extract submission failed: {}", e);
        }

        match self.summarizer.is_due(user_id, conversation_id).await {
            Ok(true) => {
                if let Err(e) = self.submit_summarize(user_id, conversation_id).await {
                    warn!("summarize submission failed: {}", e);
                }
            }
            Ok(false) => {}
            Err(e) => debug!("summarize due-check failed: {}", e),
        }

        match self.miner.is_due(user_id).await {
            Ok(true) => {
                if let Err(e) = self.submit_insights(user_id).await {
                    warn!("insights submission failed: {}", e);
                }
            }
            Ok(false) => {}
            Err(e) => debug!("insights due-check failed: {}", e),
        }
    }

    /// Hybrid retrieval without the chat wrapping (exposed to the API
    /// layer for memory search endpoints).
    pub async fn retrieve(
        &self,
        user_id: &str,
        query: &str,
        conversation_id: Option<&str>,
    ) -> Result<Vec<RankedMemory>> {
        self.retriever.retrieve(user_id, query, conversation_id).await
    }

    pub async fn submit_extract(
        &self,
        user_id: &str,
        conversation_id: &str,
        user_message_id: i64,
    ) -> Result<String> {
        self.orchestrator
            .submit(TaskPayload::Extract {
                user_id: user_id.to_string(),
                conversation_id: conversation_id.to_string(),
                message_id: user_message_id,
            })
            .await
    }

    pub async fn submit_summarize(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<String> {
        self.orchestrator
            .submit(TaskPayload::Summarize {
                user_id: user_id.to_string(),
                conversation_id: conversation_id.to_string(),
            })
            .await
    }

    pub async fn submit_insights(&self, user_id: &str) -> Result<String> {
        self.orchestrator
            .submit(TaskPayload::Insights {
                user_id: user_id.to_string(),
            })
            .await
    }

    pub async fn submit_correction(
        &self,
        user_id: &str,
        memory_id: i64,
        new_text: &str,
    ) -> Result<String> {
        // Surface validation refusal at submission time rather than as a
        // failed background task.
        self.check_safe(user_id, new_text, ContextTag::Correction)
            .await?;
        self.orchestrator
            .submit(TaskPayload::Correct {
                user_id: user_id.to_string(),
                memory_id,
                new_text: new_text.to_string(),
            })
            .await
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskRecord> {
        self.orchestrator.status(task_id).await
    }

    /// Best-effort cancellation of a queued or running task.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.orchestrator.cancel(task_id)
    }

    pub async fn list_memories(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Memory>> {
        let user_id = user_id.to_string();
        let conversation_id = conversation_id.map(String::from);
        self.pool
            .run(move |conn| {
                db::list_memories_sync(conn, &user_id, conversation_id.as_deref(), limit, offset)
            })
            .await
    }

    pub async fn list_insights(&self, user_id: &str, limit: usize) -> Result<Vec<Insight>> {
        let user_id = user_id.to_string();
        self.pool
            .run(move |conn| db::list_insights_sync(conn, &user_id, limit))
            .await
    }

    pub async fn get_summary(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Summary>> {
        let user_id = user_id.to_string();
        let conversation_id = conversation_id.to_string();
        self.pool
            .run(move |conn| {
                db::get_summary_sync(conn, &user_id, &conversation_id, SummaryScope::Rolling)
            })
            .await
    }

    pub async fn set_pinned(&self, user_id: &str, memory_id: i64, pinned: bool) -> Result<()> {
        self.patch_memory(
            user_id,
            memory_id,
            MemoryPatch {
                pinned: Some(pinned),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn mark_bad(&self, user_id: &str, memory_id: i64) -> Result<()> {
        self.patch_memory(
            user_id,
            memory_id,
            MemoryPatch {
                bad: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn delete_memory(&self, user_id: &str, memory_id: i64) -> Result<()> {
        let deleted = {
            let user_id = user_id.to_string();
            self.pool
                .run(move |conn| db::delete_memory_sync(conn, &user_id, memory_id))
                .await?
        };
        if !deleted {
            return Err(MemoriaError::NotFound(format!("memory {memory_id}")));
        }
        Ok(())
    }

    /// Stop the background workers. In-flight tasks finish first.
    pub fn shutdown(&self) {
        info!("memory engine shutting down");
        self.orchestrator.shutdown();
    }

    async fn patch_memory(
        &self,
        user_id: &str,
        memory_id: i64,
        patch: MemoryPatch,
    ) -> Result<()> {
        let updated = {
            let user_id = user_id.to_string();
            self.pool
                .run(move |conn| db::update_memory_sync(conn, &user_id, memory_id, &patch))
                .await?
        };
        if !updated {
            return Err(MemoriaError::NotFound(format!("memory {memory_id}")));
        }
        Ok(())
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
            let _ = self
                .pool
                .run(move |conn| {
                    db::record_security_event_sync(conn, &user_id, tag_str, &reason, score, &text)
                })
                .await;
        }
        Err(verdict.into_error(tag))
    }
}

/// Render the memory context block for the responder.
fn build_responder_prompt(context: &[RankedMemory], summary: Option<&Summary>) -> String {
    let mut prompt = String::from(RESPONDER_SYSTEM_PROMPT);

    if let Some(summary) = summary {
        prompt.push_str("\n\nConversation summary:\n");
        prompt.push_str(&summary.content);
    }

    if !context.is_empty() {
        prompt.push_str("\n\nMemories about the user:\n");
        for ranked in context {
            prompt.push_str(&format!(
                "- [{}] ({}) {}\n",
                ranked.memory.id,
                ranked.memory.memory_type,
                ranked.memory.text
            ));
        }
    }

    prompt
}

/// Render the recent turns plus the current message into the user prompt.
fn render_turn(recent: &[db::MessageRecord], user_text: &str) -> String {
    let mut prompt = String::new();
    for message in recent {
        prompt.push_str(message.role.as_str());
        prompt.push_str(": ");
        prompt.push_str(&message.text);
        prompt.push('\n');
    }
    prompt.push_str("user: ");
    prompt.push_str(user_text);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryType;

    fn ranked(id: i64, text: &str) -> RankedMemory {
        RankedMemory {
            memory: Memory {
                id,
                user_id: "u1".into(),
                conversation_id: None,
                text: text.into(),
                memory_type: MemoryType::Fact,
                importance: 0.6,
                confidence: 0.8,
                bad: false,
                pinned: false,
                idempotency_key: "k".into(),
                has_embedding: true,
                provenance: serde_json::json!({}),
                created_at: "2025-06-01T00:00:00.000Z".into(),
                updated_at: "2025-06-01T00:00:00.000Z".into(),
            },
            vector_score: 0.5,
            lexical_score: 0.0,
            recency_rank: 0,
            fused: 0.3,
        }
    }

    #[test]
    fn test_responder_prompt_lists_memories() {
        let prompt = build_responder_prompt(&[ranked(3, "works in berlin")], None);
        assert!(prompt.contains("[3] (fact) works in berlin"));
        assert!(!prompt.contains("Conversation summary"));
    }

    #[test]
    fn test_responder_prompt_without_context() {
        let prompt = build_responder_prompt(&[], None);
        assert!(!prompt.contains("Memories about the user"));
    }

    #[test]
    fn test_render_turn_appends_current_text() {
        let prompt = render_turn(&[], "hello");
        assert_eq!(prompt, "user: hello");
    }
}
