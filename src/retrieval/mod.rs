// src/retrieval/mod.rs
// Hybrid memory retrieval: dense vectors + lexical rank + recency

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::db::{
    self, DatabasePool, Memory, MemoryFilter, embedding_to_bytes,
};
use crate::embeddings::Embedder;
use crate::error::Result;
use crate::guard::sanitize;

/// One retrieved memory with its per-source scores and the fused score.
#[derive(Debug, Clone)]
pub struct RankedMemory {
    pub memory: Memory,
    /// Normalized vector similarity, 0 when absent from the vector source
    pub vector_score: f32,
    /// Normalized lexical rank, 0 when absent from the lexical source
    pub lexical_score: f32,
    /// Reverse position in the recency source (higher = newer); tie-break
    /// only, never part of the fused score
    pub recency_rank: usize,
    pub fused: f32,
}

/// Convert cosine distance to a similarity score in [0, 1].
pub fn distance_to_score(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Hybrid ranker over the three store sources.
///
/// Each source degrades independently: a failed query contributes an empty
/// set and the remaining sources still produce a result. The embedder is
/// optional; without one the vector source is always empty.
pub struct Retriever {
    pool: Arc<DatabasePool>,
    embedder: Option<Arc<dyn Embedder>>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        pool: Arc<DatabasePool>,
        embedder: Option<Arc<dyn Embedder>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            pool,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve up to `k_out` memories for a query under strict per-user
    /// isolation. Never returns memories marked bad.
    pub async fn retrieve(
        &self,
        user_id: &str,
        query: &str,
        conversation_id: Option<&str>,
    ) -> Result<Vec<RankedMemory>> {
        let query = sanitize(query);
        let filter = MemoryFilter {
            conversation_id: conversation_id.map(String::from),
        };

        // Empty query: vector and lexical are skipped, recency carries the
        // result alone.
        let (vector_hits, lexical_hits, recent) = if query.is_empty() {
            let recent = self.fetch_recent(user_id, &filter).await;
            (Vec::new(), Vec::new(), recent)
        } else {
            let query_vec = self.embed_query(&query).await;

            let vector_fut = self.fetch_vector(user_id, query_vec, &filter);
            let lexical_fut = self.fetch_lexical(user_id, &query, &filter);
            let recent_fut = self.fetch_recent(user_id, &filter);

            tokio::join!(vector_fut, lexical_fut, recent_fut)
        };

        let ranked = fuse(&self.config, vector_hits, lexical_hits, recent);
        debug!(
            user_id,
            results = ranked.len(),
            "hybrid retrieval complete"
        );
        Ok(ranked)
    }

    /// Embed the query text. Failures degrade to no vector source.
    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(query).await {
            Ok(vec) => Some(vec),
            Err(e) => {
                warn!("query embedding failed, vector source skipped: {}", e);
                None
            }
        }
    }

    async fn fetch_vector(
        &self,
        user_id: &str,
        query_vec: Option<Vec<f32>>,
        filter: &MemoryFilter,
    ) -> Vec<(Memory, f32)> {
        let Some(query_vec) = query_vec else {
            return Vec::new();
        };
        let bytes = embedding_to_bytes(&query_vec);
        let user_id = user_id.to_string();
        let filter = filter.clone();
        let k = self.config.k_vec;

        match self
            .pool
            .run(move |conn| db::vector_topk_sync(conn, &user_id, &bytes, k, &filter))
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!("vector source failed, treated as empty: {}", e);
                Vec::new()
            }
        }
    }

    async fn fetch_lexical(
        &self,
        user_id: &str,
        query: &str,
        filter: &MemoryFilter,
    ) -> Vec<(Memory, f64)> {
        let user_id = user_id.to_string();
        let query = query.to_string();
        let filter = filter.clone();
        let k = self.config.k_lex;

        match self
            .pool
            .run(move |conn| db::lexical_topk_sync(conn, &user_id, &query, k, &filter))
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!("lexical source failed, treated as empty: {}", e);
                Vec::new()
            }
        }
    }

    async fn fetch_recent(&self, user_id: &str, filter: &MemoryFilter) -> Vec<Memory> {
        let user_id = user_id.to_string();
        let filter = filter.clone();
        let k = self.config.k_recent;

        match self
            .pool
            .run(move |conn| db::recent_memories_sync(conn, &user_id, k, &filter))
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!("recency source failed, treated as empty: {}", e);
                Vec::new()
            }
        }
    }
}

/// Fuse the three sources into a single ordering.
///
/// `fused = w_vec * s_vec + w_lex * s_lex`, missing per-source scores are
/// 0, pinned memories get a score floor, recency breaks ties.
fn fuse(
    config: &RetrievalConfig,
    vector_hits: Vec<(Memory, f32)>,
    lexical_hits: Vec<(Memory, f64)>,
    recent: Vec<Memory>,
) -> Vec<RankedMemory> {
    let mut entries: HashMap<i64, RankedMemory> = HashMap::new();

    for (memory, distance) in vector_hits {
        let score = distance_to_score(distance);
        entries
            .entry(memory.id)
            .or_insert_with(|| RankedMemory {
                memory,
                vector_score: 0.0,
                lexical_score: 0.0,
                recency_rank: 0,
                fused: 0.0,
            })
            .vector_score = score;
    }

    let max_rank = lexical_hits
        .iter()
        .map(|(_, rank)| *rank)
        .fold(0.0_f64, f64::max);
    for (memory, rank) in lexical_hits {
        let score = if max_rank > 0.0 {
            (rank / max_rank) as f32
        } else {
            0.0
        };
        entries
            .entry(memory.id)
            .or_insert_with(|| RankedMemory {
                memory,
                vector_score: 0.0,
                lexical_score: 0.0,
                recency_rank: 0,
                fused: 0.0,
            })
            .lexical_score = score;
    }

    let recent_len = recent.len();
    for (position, memory) in recent.into_iter().enumerate() {
        // Reverse position: newest gets the highest ordinal
        let rank = recent_len - position;
        entries
            .entry(memory.id)
            .or_insert_with(|| RankedMemory {
                memory,
                vector_score: 0.0,
                lexical_score: 0.0,
                recency_rank: 0,
                fused: 0.0,
            })
            .recency_rank = rank;
    }

    let mut ranked: Vec<RankedMemory> = entries
        .into_values()
        .map(|mut entry| {
            let mut fused =
                config.w_vec * entry.vector_score + config.w_lex * entry.lexical_score;
            if entry.memory.pinned {
                fused = fused.max(config.pinned_floor);
            }
            entry.fused = fused;
            entry
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.recency_rank.cmp(&a.recency_rank))
            .then_with(|| b.memory.created_at.cmp(&a.memory.created_at))
            .then_with(|| a.memory.id.cmp(&b.memory.id))
    });
    ranked.truncate(config.k_out);
    ranked
}
