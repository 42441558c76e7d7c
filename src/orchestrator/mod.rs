// src/orchestrator/mod.rs
// Background task orchestration: bounded queue, worker pool, idempotent
// submission, single-flight coalescing

mod ids;

pub use ids::{payload_hash, task_id};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::db::{self, DatabasePool, TaskKind, TaskRecord};
use crate::error::{MemoriaError, Result};
use crate::miner::InsightMiner;
use crate::summarizer::Summarizer;
use crate::writer::Writer;

/// Run the task-row GC every N completed tasks.
const GC_EVERY: u64 = 32;

/// Payload of a background task submission.
#[derive(Debug, Clone)]
pub enum TaskPayload {
    Extract {
        user_id: String,
        conversation_id: String,
        message_id: i64,
    },
    Summarize {
        user_id: String,
        conversation_id: String,
    },
    Insights {
        user_id: String,
    },
    Correct {
        user_id: String,
        memory_id: i64,
        new_text: String,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Extract { .. } => TaskKind::Extract,
            Self::Summarize { .. } => TaskKind::Summarize,
            Self::Insights { .. } => TaskKind::Insights,
            Self::Correct { .. } => TaskKind::Correct,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::Extract { user_id, .. }
            | Self::Summarize { user_id, .. }
            | Self::Insights { user_id }
            | Self::Correct { user_id, .. } => user_id,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Extract {
                conversation_id, ..
            }
            | Self::Summarize {
                conversation_id, ..
            } => Some(conversation_id),
            Self::Insights { .. } | Self::Correct { .. } => None,
        }
    }

    /// Stable JSON form used for the payload hash. Correction text is
    /// hashed rather than embedded so the id stays bounded.
    fn stable_json(&self) -> serde_json::Value {
        match self {
            Self::Extract { message_id, .. } => serde_json::json!({"message_id": message_id}),
            Self::Summarize { .. } => serde_json::json!({}),
            Self::Insights { .. } => serde_json::json!({}),
            Self::Correct {
                memory_id,
                new_text,
                ..
            } => serde_json::json!({
                "memory_id": memory_id,
                "text_hash": payload_hash(&serde_json::Value::String(new_text.clone())),
            }),
        }
    }
}

/// Key for single-flight coalescing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    user_id: String,
    conversation_id: Option<String>,
    kind: TaskKind,
}

struct QueuedTask {
    id: String,
    payload: TaskPayload,
    cancel: CancellationToken,
}

/// Mutable submission state; the lock is held only for map lookups and
/// inserts, never across an await point.
#[derive(Default)]
struct SubmissionState {
    /// task_id -> submission instant, for the dedup window
    dedup: HashMap<String, Instant>,
    /// single-flight key -> in-flight task id
    in_flight: HashMap<FlightKey, String>,
    /// task_id -> cancellation handle
    cancel_tokens: HashMap<String, CancellationToken>,
}

struct Inner {
    pool: Arc<DatabasePool>,
    writer: Arc<Writer>,
    summarizer: Arc<Summarizer>,
    miner: Arc<InsightMiner>,
    config: OrchestratorConfig,
    queue_tx: mpsc::Sender<QueuedTask>,
    state: Mutex<SubmissionState>,
    completed_counter: AtomicU64,
}

/// Submits and tracks background tasks. All LLM-heavy mutation runs here;
/// the foreground chat path only assembles and answers.
pub struct Orchestrator {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    /// Build the orchestrator and spawn its worker pool.
    pub fn spawn(
        pool: Arc<DatabasePool>,
        writer: Arc<Writer>,
        summarizer: Arc<Summarizer>,
        miner: Arc<InsightMiner>,
        config: OrchestratorConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            pool,
            writer,
            summarizer,
            miner,
            config,
            queue_tx,
            state: Mutex::new(SubmissionState::default()),
            completed_counter: AtomicU64::new(0),
        });

        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        for worker_id in 0..inner.config.workers {
            let inner = inner.clone();
            let queue_rx = queue_rx.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, inner, queue_rx, shutdown_rx).await;
            });
        }

        Self { inner, shutdown_tx }
    }

    /// Submit a task. Returns the deterministic task id; a duplicate
    /// submission inside the dedup window, or one that coalesces onto an
    /// in-flight single-flight task, returns the existing id without
    /// enqueuing a second run.
    pub async fn submit(&self, payload: TaskPayload) -> Result<String> {
        let kind = payload.kind();
        let hash = payload_hash(&payload.stable_json());
        let id = task_id(kind, payload.user_id(), payload.conversation_id(), &hash);

        let flight_key = FlightKey {
            user_id: payload.user_id().to_string(),
            conversation_id: payload.conversation_id().map(String::from),
            kind,
        };

        let cancel = CancellationToken::new();
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());

            // Single-flight: a running or queued task for the same
            // (user, conversation, kind) absorbs this submission.
            if kind.is_single_flight() {
                if let Some(in_flight_id) = state.in_flight.get(&flight_key) {
                    debug!(task_id = %in_flight_id, %kind, "submission coalesced onto in-flight task");
                    return Ok(in_flight_id.clone());
                }
            }

            // Dedup window: identical payloads collapse to one run.
            let window = Duration::from_secs(self.inner.config.dedup_window_secs);
            state.dedup.retain(|_, at| at.elapsed() < window);
            if state.dedup.contains_key(&id) {
                debug!(task_id = %id, "duplicate submission inside dedup window");
                return Ok(id);
            }

            state.dedup.insert(id.clone(), Instant::now());
            if kind.is_single_flight() {
                state.in_flight.insert(flight_key.clone(), id.clone());
            }
            state.cancel_tokens.insert(id.clone(), cancel.clone());
        }

        // Persist the pending row before enqueueing so status() always
        // resolves an id we returned.
        {
            let id = id.clone();
            let user_id = payload.user_id().to_string();
            let conversation_id = payload.conversation_id().map(String::from);
            self.inner
                .pool
                .run(move |conn| {
                    db::create_task_sync(conn, &id, kind, &user_id, conversation_id.as_deref())
                })
                .await?;
        }

        let queued = QueuedTask {
            id: id.clone(),
            payload,
            cancel,
        };
        if let Err(e) = self.inner.queue_tx.try_send(queued) {
            // Queue full (or closed): back out the submission state and
            // surface Overload for the API layer to translate.
            {
                let mut state = self
                    .inner
                    .state
                    .lock()
                    .unwrap_or_else(|err| err.into_inner());
                state.dedup.remove(&id);
                state.cancel_tokens.remove(&id);
                if kind.is_single_flight() {
                    state.in_flight.remove(&flight_key);
                }
            }
            let reason = match &e {
                mpsc::error::TrySendError::Full(_) => "task queue full",
                mpsc::error::TrySendError::Closed(_) => "task queue closed",
            };
            {
                let id = id.clone();
                let reason = reason.to_string();
                let _ = self
                    .inner
                    .pool
                    .run(move |conn| db::mark_task_failed_sync(conn, &id, &reason))
                    .await;
            }
            return Err(MemoriaError::Overload(reason.into()));
        }

        Ok(id)
    }

    /// Look up a task's current state.
    pub async fn status(&self, task_id: &str) -> Result<TaskRecord> {
        let id = task_id.to_string();
        self.inner
            .pool
            .run(move |conn| db::get_task_sync(conn, &id))
            .await?
            .ok_or_else(|| MemoriaError::NotFound(format!("task {task_id}")))
    }

    /// Best-effort cancellation: the signal is observed at component
    /// boundaries; in-flight external calls finish but their results are
    /// discarded.
    pub fn cancel(&self, task_id: &str) -> bool {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.cancel_tokens.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Record a foreground task row (chat_assemble runs synchronously in
    /// the engine but stays observable through the same status API).
    pub async fn record_foreground(
        &self,
        kind: TaskKind,
        user_id: &str,
        conversation_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<String> {
        let hash = payload_hash(payload);
        let id = task_id(kind, user_id, conversation_id, &hash);
        {
            let id = id.clone();
            let user_id = user_id.to_string();
            let conversation_id = conversation_id.map(String::from);
            self.inner
                .pool
                .run(move |conn| {
                    db::create_task_sync(conn, &id, kind, &user_id, conversation_id.as_deref())?;
                    db::mark_task_running_sync(conn, &id)
                })
                .await?;
        }
        Ok(id)
    }

    /// Close out a foreground task row.
    pub async fn finish_foreground(
        &self,
        task_id: &str,
        result: std::result::Result<serde_json::Value, String>,
    ) -> Result<()> {
        let id = task_id.to_string();
        self.inner
            .pool
            .run(move |conn| match result {
                Ok(value) => db::mark_task_completed_sync(conn, &id, Some(&value)),
                Err(error) => db::mark_task_failed_sync(conn, &id, &error),
            })
            .await
    }

    /// Signal workers to stop after their current task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn worker_loop(
    worker_id: usize,
    inner: Arc<Inner>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedTask>>>,
    shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker_id, "task worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let task = {
            let mut rx = queue_rx.lock().await;
            rx.recv().await
        };
        let Some(task) = task else {
            break; // queue closed
        };

        execute_task(&inner, task).await;
    }
    debug!(worker_id, "task worker stopped");
}

/// Run one task to a terminal state. Background tasks never propagate
/// errors; every outcome lands on the task row.
async fn execute_task(inner: &Arc<Inner>, task: QueuedTask) {
    let QueuedTask {
        id,
        payload,
        cancel,
    } = task;
    let kind = payload.kind();
    let retry_cap = kind.retry_cap();
    let deadline = deadline_for(&inner.config, kind);

    let mut attempt: u32 = 0;
    let outcome = loop {
        {
            let id_for_run = id.clone();
            if let Err(e) = inner
                .pool
                .run(move |conn| db::mark_task_running_sync(conn, &id_for_run))
                .await
            {
                warn!(task_id = %id, "failed to mark task running: {}", e);
            }
        }

        if cancel.is_cancelled() {
            break Err(MemoriaError::Cancelled);
        }

        let result = match tokio::time::timeout(
            deadline,
            run_payload(inner, &payload, &cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        match result {
            Ok(value) => break Ok(value),
            Err(e) if e.is_transient() && attempt < retry_cap => {
                attempt += 1;
                let backoff = retry_backoff(attempt);
                debug!(task_id = %id, attempt, "transient task failure, retrying in {:?}: {}", backoff, e);
                tokio::time::sleep(backoff).await;
            }
            Err(e) => break Err(e),
        }
    };

    match &outcome {
        Ok(value) => {
            let id_for_row = id.clone();
            let value = value.clone();
            if let Err(e) = inner
                .pool
                .run(move |conn| db::mark_task_completed_sync(conn, &id_for_row, Some(&value)))
                .await
            {
                warn!(task_id = %id, "failed to record task completion: {}", e);
            }
            info!(task_id = %id, %kind, "task completed");
        }
        Err(e) => {
            let id_for_row = id.clone();
            let message = e.to_string();
            if let Err(store_err) = inner
                .pool
                .run(move |conn| db::mark_task_failed_sync(conn, &id_for_row, &message))
                .await
            {
                warn!(task_id = %id, "failed to record task failure: {}", store_err);
            }
            warn!(task_id = %id, %kind, "task failed: {}", e);
        }
    }

    // Release single-flight and cancellation state.
    {
        let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.cancel_tokens.remove(&id);
        let flight_key = FlightKey {
            user_id: payload.user_id().to_string(),
            conversation_id: payload.conversation_id().map(String::from),
            kind,
        };
        if state.in_flight.get(&flight_key) == Some(&id) {
            state.in_flight.remove(&flight_key);
        }
    }

    // Periodic housekeeping: task-row GC plus a sweep over memories whose
    // embedding never landed.
    let completed = inner.completed_counter.fetch_add(1, Ordering::Relaxed) + 1;
    if completed % GC_EVERY == 0 {
        let retention = inner.config.retention_secs;
        match inner
            .pool
            .run(move |conn| db::gc_tasks_sync(conn, retention))
            .await
        {
            Ok(removed) if removed > 0 => debug!(removed, "task GC"),
            Ok(_) => {}
            Err(e) => warn!("task GC failed: {}", e),
        }

        match inner.writer.embed_pending(32).await {
            Ok(recovered) if recovered > 0 => debug!(recovered, "recovered pending embeddings"),
            Ok(_) => {}
            Err(e) => warn!("pending-embedding sweep failed: {}", e),
        }
    }
}

async fn run_payload(
    inner: &Arc<Inner>,
    payload: &TaskPayload,
    cancel: &CancellationToken,
) -> Result<serde_json::Value> {
    match payload {
        TaskPayload::Extract {
            user_id,
            conversation_id,
            message_id,
        } => {
            let outcome = inner
                .writer
                .run(user_id, conversation_id, *message_id, cancel)
                .await?;
            Ok(serde_json::json!({
                "memory_ids": outcome.memory_ids,
                "inserted": outcome.inserted,
                "updated": outcome.updated,
                "embed_failures": outcome.embed_failures,
            }))
        }
        TaskPayload::Summarize {
            user_id,
            conversation_id,
        } => {
            let outcome = inner
                .summarizer
                .run(user_id, conversation_id, cancel)
                .await?;
            Ok(serde_json::json!({
                "summary_id": outcome.summary_id,
                "citations": outcome.citations,
                "skipped": outcome.skipped,
            }))
        }
        TaskPayload::Insights { user_id } => {
            let outcome = inner.miner.run(user_id, cancel).await?;
            Ok(serde_json::json!({
                "insight_ids": outcome.insight_ids,
                "dropped": outcome.dropped,
            }))
        }
        TaskPayload::Correct {
            user_id,
            memory_id,
            new_text,
        } => {
            let id = inner
                .writer
                .correct(user_id, *memory_id, new_text, cancel)
                .await?;
            Ok(serde_json::json!({"memory_id": id}))
        }
    }
}

fn deadline_for(config: &OrchestratorConfig, kind: TaskKind) -> Duration {
    let secs = match kind {
        TaskKind::ChatAssemble => config.chat_deadline_secs,
        TaskKind::Extract | TaskKind::Correct => config.extract_deadline_secs,
        TaskKind::Summarize => config.summarize_deadline_secs,
        TaskKind::Insights => config.insights_deadline_secs,
    };
    Duration::from_secs(secs)
}

/// Exponential backoff with jitter: 500ms * 2^(attempt-1), +-25%.
fn retry_backoff(attempt: u32) -> Duration {
    let base_ms = 500u64.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(6));
    let jitter = rand::random::<f64>() * 0.5 + 0.75;
    Duration::from_millis((base_ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_kind_and_scope() {
        let p = TaskPayload::Extract {
            user_id: "u1".into(),
            conversation_id: "c1".into(),
            message_id: 7,
        };
        assert_eq!(p.kind(), TaskKind::Extract);
        assert_eq!(p.user_id(), "u1");
        assert_eq!(p.conversation_id(), Some("c1"));

        let p = TaskPayload::Insights {
            user_id: "u2".into(),
        };
        assert_eq!(p.conversation_id(), None);
    }

    #[test]
    fn test_stable_json_ignores_redundant_scope_fields() {
        // user/conversation are part of the id derivation, not the payload
        let a = TaskPayload::Summarize {
            user_id: "u1".into(),
            conversation_id: "c1".into(),
        };
        assert_eq!(a.stable_json(), serde_json::json!({}));
    }

    #[test]
    fn test_correction_payload_hashes_text() {
        let a = TaskPayload::Correct {
            user_id: "u1".into(),
            memory_id: 3,
            new_text: "one".into(),
        };
        let b = TaskPayload::Correct {
            user_id: "u1".into(),
            memory_id: 3,
            new_text: "two".into(),
        };
        assert_ne!(a.stable_json(), b.stable_json());
    }

    #[test]
    fn test_retry_backoff_grows() {
        let first = retry_backoff(1);
        let third = retry_backoff(3);
        assert!(first >= Duration::from_millis(375));
        assert!(first <= Duration::from_millis(625));
        assert!(third > first);
    }

    #[test]
    fn test_deadline_per_kind() {
        let config = OrchestratorConfig::default();
        assert_eq!(
            deadline_for(&config, TaskKind::ChatAssemble),
            Duration::from_secs(10)
        );
        assert_eq!(
            deadline_for(&config, TaskKind::Extract),
            Duration::from_secs(15)
        );
        assert_eq!(
            deadline_for(&config, TaskKind::Summarize),
            Duration::from_secs(20)
        );
    }
}
