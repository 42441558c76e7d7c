// src/summarizer/mod.rs
// Rolling conversation summarizer

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SummaryConfig;
use crate::db::{self, DatabasePool, MessageRecord, SummaryScope};
use crate::error::{MemoriaError, Result};
use crate::guard::{ContextTag, Validator, sanitize};
use crate::llm::{Completion, CompletionOptions};

/// Stand-in for messages the validator refused; the summarizer never sees
/// their content.
const UNSAFE_PLACEHOLDER: &str = "[message removed]";

/// Fixed system prompt for the folding call.
const SUMMARIZER_SYSTEM_PROMPT: &str = "\
You maintain a rolling summary of a conversation between a user and an assistant.

You are given the existing summary (possibly empty) and the messages since it
was last updated. Fold the new messages into the summary, preserving durable
facts, decisions, and open threads. Drop pleasantries. Keep the result under
the stated character limit.

You are also given a list of memory ids recorded during these messages. Cite
the ids whose content the summary draws on.

Return a JSON object: {\"summary\": \"...\", \"citations\": [1, 2]}";

/// Result of one summarizer run.
#[derive(Debug, Clone, Default)]
pub struct SummarizeOutcome {
    pub summary_id: Option<i64>,
    pub citations: Vec<i64>,
    /// True when there was nothing new to fold
    pub skipped: bool,
}

/// Maintains one rolling summary per (user, conversation), rewritten in
/// place. A failed run leaves the prior summary untouched.
pub struct Summarizer {
    pool: Arc<DatabasePool>,
    completion: Arc<dyn Completion>,
    validator: Arc<dyn Validator>,
    config: SummaryConfig,
}

impl Summarizer {
    pub fn new(
        pool: Arc<DatabasePool>,
        completion: Arc<dyn Completion>,
        validator: Arc<dyn Validator>,
        config: SummaryConfig,
    ) -> Self {
        Self {
            pool,
            completion,
            validator,
            config,
        }
    }

    /// Whether enough new conversation has accumulated to justify a fold.
    pub async fn is_due(&self, user_id: &str, conversation_id: &str) -> Result<bool> {
        let watermark = self.watermark(user_id, conversation_id).await?;
        let (turns, chars) = {
            let user_id = user_id.to_string();
            let conversation_id = conversation_id.to_string();
            self.pool
                .run(move |conn| {
                    db::user_turns_since_sync(conn, &user_id, &conversation_id, &watermark)
                })
                .await?
        };
        Ok(turns >= self.config.trigger_turns || chars >= self.config.trigger_chars)
    }

    /// Fold messages since the last summary into a new rolling summary.
    pub async fn run(
        &self,
        user_id: &str,
        conversation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SummarizeOutcome> {
        let prior = {
            let user_id = user_id.to_string();
            let conversation_id = conversation_id.to_string();
            self.pool
                .run(move |conn| {
                    db::get_summary_sync(conn, &user_id, &conversation_id, SummaryScope::Rolling)
                })
                .await?
        };
        let watermark = prior
            .as_ref()
            .map(|s| s.updated_at.clone())
            .unwrap_or_default();

        let messages = {
            let user_id = user_id.to_string();
            let conversation_id = conversation_id.to_string();
            let watermark = watermark.clone();
            self.pool
                .run(move |conn| {
                    db::messages_since_sync(conn, &user_id, &conversation_id, &watermark)
                })
                .await?
        };

        if messages.is_empty() {
            debug!(user_id, conversation_id, "nothing new to summarize");
            return Ok(SummarizeOutcome {
                skipped: true,
                ..Default::default()
            });
        }

        // Memory ids created in the covered window are the only citable ids.
        let citable = {
            let user_id = user_id.to_string();
            let conversation_id = conversation_id.to_string();
            let watermark = watermark.clone();
            self.pool
                .run(move |conn| {
                    db::memories_in_window_sync(conn, &user_id, &conversation_id, &watermark)
                })
                .await?
        };

        if cancel.is_cancelled() {
            return Err(MemoriaError::Cancelled);
        }

        let transcript = self.render_messages(&messages).await?;
        let prior_content = prior.as_ref().map(|s| s.content.as_str()).unwrap_or("");

        let user_prompt = format!(
            "Character limit: {}\n\nExisting summary:\n{}\n\nMemory ids recorded in this window: {:?}\n\nNew messages:\n{}",
            self.config.max_chars,
            if prior_content.is_empty() { "(none)" } else { prior_content },
            citable,
            transcript,
        );

        let raw = self
            .completion
            .complete(
                SUMMARIZER_SYSTEM_PROMPT,
                &user_prompt,
                &CompletionOptions::summarization(),
            )
            .await?;

        if cancel.is_cancelled() {
            return Err(MemoriaError::Cancelled);
        }

        let (content, requested_citations) = parse_summary_output(&raw, self.config.max_chars);
        if content.is_empty() {
            return Err(MemoriaError::Transient(
                "summarizer produced empty content".into(),
            ));
        }

        // Citations must reference memories of this user created in the
        // covered window; anything else is silently dropped.
        let citations: Vec<i64> = {
            let requested: Vec<i64> = requested_citations
                .into_iter()
                .filter(|id| citable.contains(id))
                .collect();
            let user_id = user_id.to_string();
            self.pool
                .run(move |conn| db::existing_memory_ids_sync(conn, &user_id, &requested))
                .await?
        };

        let summary_id = {
            let user_id = user_id.to_string();
            let conversation_id = conversation_id.to_string();
            let content = content.clone();
            let citations = citations.clone();
            self.pool
                .run(move |conn| {
                    db::upsert_summary_sync(
                        conn,
                        &user_id,
                        &conversation_id,
                        SummaryScope::Rolling,
                        &content,
                        &citations,
                    )
                })
                .await?
        };

        info!(
            user_id,
            conversation_id,
            chars = content.len(),
            citations = citations.len(),
            "rolling summary updated"
        );
        Ok(SummarizeOutcome {
            summary_id: Some(summary_id),
            citations,
            skipped: false,
        })
    }

    async fn watermark(&self, user_id: &str, conversation_id: &str) -> Result<String> {
        let user_id = user_id.to_string();
        let conversation_id = conversation_id.to_string();
        let prior = self
            .pool
            .run(move |conn| {
                db::get_summary_sync(conn, &user_id, &conversation_id, SummaryScope::Rolling)
            })
            .await?;
        Ok(prior.map(|s| s.updated_at).unwrap_or_default())
    }

    /// Validate each message and render the transcript. Unsafe messages are
    /// replaced with a placeholder rather than dropped, so turn structure
    /// survives.
    async fn render_messages(&self, messages: &[MessageRecord]) -> Result<String> {
        let mut transcript = String::new();
        for message in messages {
            let verdict = self
                .validator
                .validate(&message.text, ContextTag::SummarizerInput)
                .await?;
            let text = if verdict.safe {
                sanitize(&message.text)
            } else {
                debug!(message_id = message.id, "unsafe message replaced in summary input");
                UNSAFE_PLACEHOLDER.to_string()
            };
            transcript.push_str(message.role.as_str());
            transcript.push_str(": ");
            transcript.push_str(&text);
            transcript.push('\n');
        }
        Ok(transcript)
    }
}

/// Parse the summarizer's JSON output; fall back to treating the raw text
/// as the summary when the shape is broken. The length bound is enforced
/// here regardless of what the model returned.
fn parse_summary_output(raw: &str, max_chars: usize) -> (String, Vec<i64>) {
    let (content, citations) = match serde_json::from_str::<serde_json::Value>(raw.trim()) {
        Ok(value) => {
            let content = value["summary"].as_str().unwrap_or("").to_string();
            let citations = value["citations"]
                .as_array()
                .map(|items| items.iter().filter_map(|v| v.as_i64()).collect())
                .unwrap_or_default();
            if content.is_empty() {
                (raw.trim().to_string(), citations)
            } else {
                (content, citations)
            }
        }
        Err(_) => (raw.trim().to_string(), Vec::new()),
    };

    let bounded: String = if content.chars().count() > max_chars {
        content.chars().take(max_chars).collect()
    } else {
        content
    };
    (bounded, citations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_output() {
        let raw = r#"{"summary": "user works in berlin", "citations": [3, 7]}"#;
        let (content, citations) = parse_summary_output(raw, 2000);
        assert_eq!(content, "user works in berlin");
        assert_eq!(citations, vec![3, 7]);
    }

    #[test]
    fn test_parse_fallback_raw_text() {
        let (content, citations) = parse_summary_output("just prose, no json", 2000);
        assert_eq!(content, "just prose, no json");
        assert!(citations.is_empty());
    }

    #[test]
    fn test_length_bound_enforced() {
        let long = format!(r#"{{"summary": "{}", "citations": []}}"#, "a".repeat(5000));
        let (content, _) = parse_summary_output(&long, 2000);
        assert_eq!(content.chars().count(), 2000);
    }

    #[test]
    fn test_non_integer_citations_dropped() {
        let raw = r#"{"summary": "s", "citations": [1, "two", 3.5, 4]}"#;
        let (_, citations) = parse_summary_output(raw, 2000);
        assert_eq!(citations, vec![1, 4]);
    }
}
