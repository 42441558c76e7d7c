// src/config/engine.rs
// Engine tunables with serde defaults

use serde::{Deserialize, Serialize};

/// Hybrid retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Candidates fetched from the vector index
    pub k_vec: usize,
    /// Candidates fetched from the lexical index
    pub k_lex: usize,
    /// Candidates fetched by recency
    pub k_recent: usize,
    /// Maximum memories returned to the caller
    pub k_out: usize,
    /// Weight of the normalized vector score in fusion
    pub w_vec: f32,
    /// Weight of the normalized lexical score in fusion
    pub w_lex: f32,
    /// Score floor applied to pinned memories
    pub pinned_floor: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_vec: 40,
            k_lex: 40,
            k_recent: 10,
            k_out: 20,
            w_vec: 0.6,
            w_lex: 0.4,
            pinned_floor: 0.5,
        }
    }
}

/// Memory extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Candidates below this confidence are dropped
    pub min_confidence: f64,
    /// Max candidate text length after sanitization
    pub max_candidate_chars: usize,
    /// Per-memory embedding retry attempts before marking degraded
    pub embed_retry_attempts: u32,
    /// Base backoff between embedding retries, milliseconds
    pub embed_retry_backoff_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            max_candidate_chars: 1000,
            embed_retry_attempts: 3,
            embed_retry_backoff_ms: 250,
        }
    }
}

/// Rolling summarizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// New user turns since the last summary that trigger a fold
    pub trigger_turns: usize,
    /// New-turn characters since the last summary that trigger a fold
    pub trigger_chars: usize,
    /// Hard cap on summary content length
    pub max_chars: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            trigger_turns: 8,
            trigger_chars: 4000,
            max_chars: 2000,
        }
    }
}

/// Insight miner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    /// High-confidence memories considered per mining run
    pub source_limit: usize,
    /// Minimum confidence for a memory to feed insights
    pub min_confidence: f64,
    /// Max insights requested per type group
    pub per_group: usize,
    /// New memories since the last run that trigger mining
    pub trigger_new_memories: usize,
    /// Wall-time cadence in seconds (whichever trigger fires first)
    pub interval_secs: u64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            source_limit: 100,
            min_confidence: 0.7,
            per_group: 3,
            trigger_new_memories: 25,
            interval_secs: 3600,
        }
    }
}

/// Task orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Bounded queue capacity; submissions above it are rejected
    pub queue_capacity: usize,
    /// Number of worker tasks pulling from the queue
    pub workers: usize,
    /// Duplicate submissions within this window coalesce, seconds
    pub dedup_window_secs: u64,
    /// Terminal task rows older than this are garbage collected, seconds
    pub retention_secs: i64,
    /// Foreground chat deadline, seconds
    pub chat_deadline_secs: u64,
    /// Extract task deadline, seconds
    pub extract_deadline_secs: u64,
    /// Summarize task deadline, seconds
    pub summarize_deadline_secs: u64,
    /// Insights task deadline, seconds
    pub insights_deadline_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            workers: 4,
            dedup_window_secs: 30,
            retention_secs: 24 * 3600,
            chat_deadline_secs: 10,
            extract_deadline_secs: 15,
            summarize_deadline_secs: 20,
            insights_deadline_secs: 30,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retrieval: RetrievalConfig,
    pub writer: WriterConfig,
    pub summary: SummaryConfig,
    pub insight: InsightConfig,
    pub orchestrator: OrchestratorConfig,
}
