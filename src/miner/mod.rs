// src/miner/mod.rs
// Insight mining over high-confidence memories

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::InsightConfig;
use crate::db::{self, DatabasePool, Memory, MemoryType};
use crate::error::{MemoriaError, Result};
use crate::guard::{ContextTag, Validator};
use crate::llm::{Completion, CompletionOptions};

const MINER_SYSTEM_PROMPT: &str = "\
You derive higher-order observations about a user from a list of their
stored memories. Each memory is given as `id: text`.

Produce at most the requested number of insights. An insight is a single
statement that generalizes across several memories. For each insight list
the ids of the memories supporting it; an insight without supports is
worthless.

Return a JSON object:
{\"insights\": [{\"content\": \"...\", \"supporting\": [1, 2]}]}";

/// Result of one mining run.
#[derive(Debug, Clone, Default)]
pub struct MinerOutcome {
    pub insight_ids: Vec<i64>,
    /// Candidate insights dropped for lacking valid supports
    pub dropped: usize,
}

/// Periodically groups recent high-confidence memories into insights with
/// supporting citations. Append-only output.
pub struct InsightMiner {
    pool: Arc<DatabasePool>,
    completion: Arc<dyn Completion>,
    validator: Arc<dyn Validator>,
    config: InsightConfig,
}

impl InsightMiner {
    pub fn new(
        pool: Arc<DatabasePool>,
        completion: Arc<dyn Completion>,
        validator: Arc<dyn Validator>,
        config: InsightConfig,
    ) -> Self {
        Self {
            pool,
            completion,
            validator,
            config,
        }
    }

    /// Whether the mining cadence has come due for this user: enough new
    /// memories since the last run, or the wall-time interval elapsed.
    pub async fn is_due(&self, user_id: &str) -> Result<bool> {
        let last_run = {
            let user_id = user_id.to_string();
            self.pool
                .run(move |conn| db::last_insight_at_sync(conn, &user_id))
                .await?
        };

        let Some(last_run) = last_run else {
            // Never mined: due as soon as there is anything to mine.
            let user_id = user_id.to_string();
            let count = self
                .pool
                .run(move |conn| db::count_memories_since_sync(conn, &user_id, ""))
                .await?;
            return Ok(count > 0);
        };

        let new_memories = {
            let user_id = user_id.to_string();
            let since = last_run.clone();
            self.pool
                .run(move |conn| db::count_memories_since_sync(conn, &user_id, &since))
                .await?
        };
        if new_memories >= self.config.trigger_new_memories {
            return Ok(true);
        }

        let elapsed = chrono::DateTime::parse_from_rfc3339(&last_run)
            .map(|t| chrono::Utc::now().signed_duration_since(t).num_seconds())
            .unwrap_or(i64::MAX);
        Ok(elapsed >= self.config.interval_secs as i64 && new_memories > 0)
    }

    /// Mine insights for one user.
    pub async fn run(&self, user_id: &str, cancel: &CancellationToken) -> Result<MinerOutcome> {
        let sources = {
            let user_id = user_id.to_string();
            let min_confidence = self.config.min_confidence;
            let limit = self.config.source_limit;
            self.pool
                .run(move |conn| {
                    db::high_confidence_memories_sync(conn, &user_id, min_confidence, limit)
                })
                .await?
        };

        if sources.is_empty() {
            debug!(user_id, "no high-confidence memories to mine");
            return Ok(MinerOutcome::default());
        }

        // Group by type; each group is mined independently.
        let mut groups: HashMap<MemoryType, Vec<Memory>> = HashMap::new();
        for memory in sources {
            groups.entry(memory.memory_type).or_default().push(memory);
        }

        let mut outcome = MinerOutcome::default();
        for (memory_type, group) in groups {
            if cancel.is_cancelled() {
                return Err(MemoriaError::Cancelled);
            }
            if group.len() < 2 {
                // One memory cannot generalize into an insight.
                continue;
            }
            self.mine_group(user_id, memory_type, &group, &mut outcome)
                .await?;
        }

        info!(
            user_id,
            insights = outcome.insight_ids.len(),
            dropped = outcome.dropped,
            "insight mining complete"
        );
        Ok(outcome)
    }

    async fn mine_group(
        &self,
        user_id: &str,
        memory_type: MemoryType,
        group: &[Memory],
        outcome: &mut MinerOutcome,
    ) -> Result<()> {
        // Memory text is user-derived; validate before it enters a prompt.
        let mut listing = String::new();
        for memory in group {
            let verdict = self
                .validator
                .validate(&memory.text, ContextTag::InsightInput)
                .await?;
            if !verdict.safe {
                debug!(memory_id = memory.id, "unsafe memory skipped in insight input");
                continue;
            }
            listing.push_str(&format!("{}: {}\n", memory.id, memory.text));
        }
        if listing.is_empty() {
            return Ok(());
        }

        let user_prompt = format!(
            "Memory type: {}\nMax insights: {}\n\nMemories:\n{}",
            memory_type, self.config.per_group, listing
        );

        let raw = self
            .completion
            .complete(MINER_SYSTEM_PROMPT, &user_prompt, &CompletionOptions::insights())
            .await?;

        let candidates = parse_miner_output(&raw, self.config.per_group);

        let valid_ids: Vec<i64> = group.iter().map(|m| m.id).collect();
        for (content, supporting) in candidates {
            // Supports must come from this group; the group is already
            // user-scoped, so this doubles as the per-user existence check.
            let supports: Vec<i64> = supporting
                .into_iter()
                .filter(|id| valid_ids.contains(id))
                .collect();
            if supports.is_empty() {
                outcome.dropped += 1;
                continue;
            }

            let id = {
                let user_id = user_id.to_string();
                let content = content.clone();
                let supports = supports.clone();
                self.pool
                    .run(move |conn| {
                        db::insert_insight_sync(conn, &user_id, &content, &supports)
                    })
                    .await?
            };
            outcome.insight_ids.push(id);
        }

        Ok(())
    }
}

/// Parse the miner's JSON output into (content, supporting-ids) pairs,
/// bounded by `per_group`. Malformed elements are skipped.
fn parse_miner_output(raw: &str, per_group: usize) -> Vec<(String, Vec<i64>)> {
    let value: serde_json::Value = match serde_json::from_str(raw.trim()) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let items = match value["insights"].as_array() {
        Some(items) => items,
        None => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| {
            let content = item["content"].as_str()?.trim().to_string();
            if content.is_empty() {
                return None;
            }
            let supporting: Vec<i64> = item["supporting"]
                .as_array()
                .map(|ids| ids.iter().filter_map(|v| v.as_i64()).collect())
                .unwrap_or_default();
            Some((content, supporting))
        })
        .take(per_group)
        .collect()
}
