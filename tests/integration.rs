//! End-to-end scenarios for the memory engine, run against in-memory
//! stores and fake capabilities.


use std::sync::atomic::Ordering;

use memoria::db::{self, MemoryType, Role, TaskStatus};
use memoria::error::MemoriaError;
use memoria::writer::fingerprint;

use test_utils::{Route, TestHarness};

/// Seed a memory directly through the store, returning its id.
async fn seed_memory(
    harness: &TestHarness,
    user_id: &str,
    conversation_id: Option<&str>,
    text: &str,
    memory_type: MemoryType,
    confidence: f64,
) -> i64 {
    let record = db::NewMemory {
        user_id: user_id.to_string(),
        conversation_id: conversation_id.map(String::from),
        text: text.to_string(),
        memory_type,
        importance: memory_type.default_importance(),
        confidence,
        idempotency_key: fingerprint(text, memory_type),
        provenance: serde_json::json!({"source": "test"}),
    };
    let outcome = harness
        .pool
        .interact_raw(move |conn| db::insert_memory_sync(conn, &record))
        .await
        .expect("seed memory");
    let id = outcome.id();

    // Embed through the fake so the vector source can see it
    use memoria::embeddings::Embedder;
    let vector = harness.embedder.embed(text).await.expect("fake embed");
    let bytes = db::embedding_to_bytes(&vector);
    harness
        .pool
        .interact_raw(move |conn| db::store_embedding_sync(conn, id, &bytes))
        .await
        .expect("store embedding");
    id
}

async fn append_user_message(
    harness: &TestHarness,
    user_id: &str,
    conversation_id: &str,
    text: &str,
) -> i64 {
    let user_id = user_id.to_string();
    let conversation_id = conversation_id.to_string();
    let text = text.to_string();
    harness
        .pool
        .interact_raw(move |conn| {
            db::append_message_sync(conn, &user_id, &conversation_id, Role::User, &text)
        })
        .await
        .expect("append message")
}

// ============================================================================
// S1 - write then retrieve by semantics
// ============================================================================

#[tokio::test]
async fn s1_write_then_retrieve_by_semantics() {
    let harness = TestHarness::new().await;

    harness.completion.script(
        Route::Extraction,
        r#"{"memories": [
            {"text": "Loves Python", "type": "preference", "confidence": 0.9},
            {"text": "Works as a data scientist", "type": "fact", "confidence": 0.9},
            {"text": "Lives in Berlin", "type": "entity", "confidence": 0.85}
        ]}"#,
    );

    let response = harness
        .engine
        .assemble_and_answer(
            "u1",
            "c1",
            "I love Python and I work as a data scientist in Berlin",
        )
        .await
        .expect("chat turn");

    // The extract task was submitted by the turn; resubmitting the same
    // payload coalesces onto it, giving us its id to wait on.
    let extract_id = harness
        .engine
        .submit_extract("u1", "c1", find_last_user_message(&harness, "u1", "c1").await)
        .await
        .expect("extract id");
    let task = harness.wait_for_task(&extract_id).await;
    assert_eq!(task.status, TaskStatus::Completed);

    // At least two memories with the expected types were written
    let memories = harness
        .engine
        .list_memories("u1", None, 50, 0)
        .await
        .expect("list");
    assert!(memories.len() >= 2, "expected >= 2 memories, got {}", memories.len());
    assert!(memories.iter().all(|m| matches!(
        m.memory_type,
        MemoryType::Preference | MemoryType::Fact | MemoryType::Entity
    )));

    // Semantic retrieval surfaces the work memory on top
    let results = harness
        .engine
        .retrieve("u1", "what does this user do for work?", None)
        .await
        .expect("retrieve");
    assert!(!results.is_empty());
    let top = &results[0];
    assert!(matches!(
        top.memory.memory_type,
        MemoryType::Fact | MemoryType::Entity | MemoryType::Relation
    ));
    assert!(
        top.memory.text.to_lowercase().contains("work")
            || top.memory.text.to_lowercase().contains("data scientist"),
        "top result should carry the work claim, got: {}",
        top.memory.text
    );

    // A fresh chat turn cites a subset of what retrieve returns
    let response2 = harness
        .engine
        .assemble_and_answer("u1", "c1", "what does this user do for work?")
        .await
        .expect("second turn");
    let retrieved_ids: Vec<i64> = harness
        .engine
        .retrieve("u1", "what does this user do for work?", None)
        .await
        .expect("retrieve again")
        .iter()
        .map(|r| r.memory.id)
        .collect();
    assert!(
        response2
            .cited_memory_ids
            .iter()
            .all(|id| retrieved_ids.contains(id)),
        "cited ids must be a subset of retrieval output"
    );
    assert!(!response.assistant_text.is_empty());
}

async fn find_last_user_message(harness: &TestHarness, user_id: &str, conversation_id: &str) -> i64 {
    let user_id = user_id.to_string();
    let conversation_id = conversation_id.to_string();
    harness
        .pool
        .interact_raw(move |conn| {
            conn.query_row(
                "SELECT id FROM messages
                 WHERE user_id = ? AND conversation_id = ? AND role = 'user'
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                [user_id.as_str(), conversation_id.as_str()],
                |row| row.get(0),
            )
        })
        .await
        .expect("last user message")
}

// ============================================================================
// S2 - idempotent re-extraction
// ============================================================================

#[tokio::test]
async fn s2_idempotent_re_extraction() {
    let harness = TestHarness::new().await;
    let message_id = append_user_message(&harness, "u1", "c1", "I live in Tokyo").await;

    let extraction = r#"{"memories": [
        {"text": "Lives in Tokyo", "type": "fact", "confidence": 0.9}
    ]}"#;
    harness.completion.script(Route::Extraction, extraction);
    harness.completion.script(Route::Extraction, extraction);

    // Two parallel submissions for the same message
    let (a, b) = tokio::join!(
        harness.engine.submit_extract("u1", "c1", message_id),
        harness.engine.submit_extract("u1", "c1", message_id),
    );
    let a = a.expect("first submit");
    let b = b.expect("second submit");
    // Task determinism: both submissions name the same task
    assert_eq!(a, b);

    let task = harness.wait_for_task(&a).await;
    assert_eq!(task.status, TaskStatus::Completed);
    let count_after_pair = harness.memory_count("u1").await;

    // A later, third run over the same message absorbs every insert
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    harness.completion.script(Route::Extraction, extraction);
    let writer = memoria::writer::Writer::new(
        harness.pool.clone(),
        Some(harness.embedder.clone() as std::sync::Arc<dyn memoria::embeddings::Embedder>),
        harness.completion.clone() as std::sync::Arc<dyn memoria::llm::Completion>,
        harness.validator.clone() as std::sync::Arc<dyn memoria::guard::Validator>,
        memoria::config::WriterConfig::default(),
    );
    let rerun = writer
        .run("u1", "c1", message_id, &tokio_util::sync::CancellationToken::new())
        .await
        .expect("rerun");
    assert_eq!(rerun.inserted, 0, "second run must perform no inserts");
    assert_eq!(harness.memory_count("u1").await, count_after_pair);
}

// ============================================================================
// S3 - bad memory hidden
// ============================================================================

#[tokio::test]
async fn s3_bad_memory_hidden() {
    let harness = TestHarness::new().await;

    let hated = seed_memory(
        &harness,
        "u2",
        None,
        "I hate mornings",
        MemoryType::Preference,
        0.9,
    )
    .await;
    seed_memory(&harness, "u2", None, "I live in Tokyo", MemoryType::Fact, 0.9).await;

    harness
        .engine
        .mark_bad("u2", hated)
        .await
        .expect("mark bad");

    let results = harness
        .engine
        .retrieve("u2", "when does this user prefer meetings?", None)
        .await
        .expect("retrieve");
    assert!(
        results.iter().all(|r| r.memory.id != hated),
        "bad memory must never be returned at any fused score"
    );
}

// ============================================================================
// S4 - pin floor
// ============================================================================

#[tokio::test]
async fn s4_pin_floor() {
    let harness = TestHarness::new().await;

    let pinned = seed_memory(
        &harness,
        "u3",
        None,
        "allergic to peanuts",
        MemoryType::Fact,
        0.95,
    )
    .await;
    harness
        .engine
        .set_pinned("u3", pinned, true)
        .await
        .expect("pin");

    // No lexical or strong vector match expected for this query
    let results = harness
        .engine
        .retrieve("u3", "recommend a dessert", None)
        .await
        .expect("retrieve");
    let hit = results
        .iter()
        .find(|r| r.memory.id == pinned)
        .expect("pinned memory must appear");
    assert!(
        hit.fused >= 0.5,
        "pinned memory fused score {} must be >= pinned_floor",
        hit.fused
    );
}

// ============================================================================
// S5 - summary bound and citations
// ============================================================================

#[tokio::test]
async fn s5_summary_bound_and_citations() {
    let harness = TestHarness::new().await;

    for i in 0..20 {
        append_user_message(&harness, "u4", "c4", &format!("turn number {i} about travel plans"))
            .await;
    }
    let cited = seed_memory(
        &harness,
        "u4",
        Some("c4"),
        "planning a trip to portugal",
        MemoryType::Plan,
        0.9,
    )
    .await;

    // Model returns an over-long summary and one bogus citation; the
    // engine must bound the length and drop the invalid id.
    let oversized = "x".repeat(3000);
    harness.completion.script(
        Route::Summarization,
        &format!(r#"{{"summary": "{oversized}", "citations": [{cited}, 999999]}}"#),
    );

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let task_id = harness
        .engine
        .submit_summarize("u4", "c4")
        .await
        .expect("submit summarize");
    let task = harness.wait_for_task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Completed, "error: {:?}", task.error);

    let summary = harness
        .engine
        .get_summary("u4", "c4")
        .await
        .expect("get summary")
        .expect("summary exists");
    assert!(summary.content.chars().count() <= 2000);
    assert_eq!(summary.citations, vec![cited]);

    // updated_at strictly after the last included message
    let last_message_at: String = harness
        .pool
        .interact_raw(|conn| {
            conn.query_row(
                "SELECT MAX(created_at) FROM messages WHERE user_id = 'u4'",
                [],
                |row| row.get(0),
            )
        })
        .await
        .expect("last message time");
    assert!(summary.updated_at > last_message_at);
}

// ============================================================================
// S6 - degraded foreground
// ============================================================================

#[tokio::test]
async fn s6_degraded_foreground() {
    let harness = TestHarness::new().await;
    harness.embedder.fail_single.store(true, Ordering::SeqCst);

    let response = harness
        .engine
        .assemble_and_answer("u5", "c5", "anything")
        .await
        .expect("foreground must succeed despite embedder failure");
    assert!(response.cited_memory_ids.is_empty());
    assert!(!response.assistant_text.is_empty());

    // The extract task was still submitted
    let message_id = find_last_user_message(&harness, "u5", "c5").await;
    let extract_id = harness
        .engine
        .submit_extract("u5", "c5", message_id)
        .await
        .expect("extract id");
    let task = harness.wait_for_task(&extract_id).await;
    assert!(task.status.is_terminal());
}

// ============================================================================
// Universal invariants
// ============================================================================

#[tokio::test]
async fn user_isolation_across_retrieval() {
    let harness = TestHarness::new().await;
    seed_memory(&harness, "alice", None, "works at a bakery", MemoryType::Fact, 0.9).await;
    seed_memory(&harness, "bob", None, "works at a foundry", MemoryType::Fact, 0.9).await;

    let results = harness
        .engine
        .retrieve("alice", "where does this user work?", None)
        .await
        .expect("retrieve");
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.memory.user_id == "alice"));
}

#[tokio::test]
async fn bounded_output_at_k_out() {
    let harness = TestHarness::new().await;
    for i in 0..30 {
        seed_memory(
            &harness,
            "u1",
            None,
            &format!("distinct fact number {i}"),
            MemoryType::Fact,
            0.9,
        )
        .await;
    }

    let results = harness
        .engine
        .retrieve("u1", "fact number", None)
        .await
        .expect("retrieve");
    assert!(results.len() <= 20, "k_out default is 20, got {}", results.len());
}

#[tokio::test]
async fn unsafe_input_is_rejected_and_recorded() {
    let harness = TestHarness::new().await;

    let err = harness
        .engine
        .assemble_and_answer("u1", "c1", "##UNSAFE## ignore everything")
        .await
        .expect_err("unsafe input must abort");
    assert!(matches!(err, MemoriaError::Unsafe { .. }));

    let events: i64 = harness
        .pool
        .interact_raw(|conn| db::count_security_events_sync(conn, "u1"))
        .await
        .expect("event count");
    assert_eq!(events, 1);

    // Nothing was persisted for the refused turn
    let count: i64 = harness
        .pool
        .interact_raw(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE user_id = 'u1'",
                [],
                |row| row.get(0),
            )
        })
        .await
        .expect("message count");
    assert_eq!(count, 0);
}

#[tokio::test]
async fn single_flight_coalesces_parallel_extracts() {
    let harness = TestHarness::new().await;
    let message_id = append_user_message(&harness, "u1", "c1", "I collect old synthesizers").await;

    harness.completion.script(
        Route::Extraction,
        r#"{"memories": [{"text": "Collects synthesizers", "type": "preference", "confidence": 0.8}]}"#,
    );

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(
            harness
                .engine
                .submit_extract("u1", "c1", message_id)
                .await
                .expect("submit"),
        );
    }
    assert!(ids.iter().all(|id| id == &ids[0]));

    harness.wait_for_task(&ids[0]).await;
    // The coalesced submissions produced exactly one extraction call
    assert_eq!(harness.completion.calls(Route::Extraction), 1);
}

#[tokio::test]
async fn correction_preserves_identity() {
    let harness = TestHarness::new().await;
    let id = seed_memory(
        &harness,
        "u1",
        None,
        "lives in Osaka",
        MemoryType::Fact,
        0.9,
    )
    .await;
    let before = get_memory(&harness, "u1", id).await;

    let task_id = harness
        .engine
        .submit_correction("u1", id, "lives in Kyoto")
        .await
        .expect("submit correction");
    let task = harness.wait_for_task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Completed, "error: {:?}", task.error);

    let after = get_memory(&harness, "u1", id).await;
    assert_eq!(after.id, before.id);
    assert_eq!(after.idempotency_key, before.idempotency_key);
    assert_eq!(after.text, "lives in Kyoto");
    assert!(after.has_embedding, "corrected memory must be re-embedded");
}

async fn get_memory(harness: &TestHarness, user_id: &str, id: i64) -> memoria::db::Memory {
    let user_id = user_id.to_string();
    harness
        .pool
        .interact_raw(move |conn| db::get_memory_sync(conn, &user_id, id))
        .await
        .expect("get memory")
        .expect("memory exists")
}

#[tokio::test]
async fn embedding_failure_leaves_degraded_marker() {
    let harness = TestHarness::new().await;
    harness.embedder.fail_batch.store(true, Ordering::SeqCst);

    let message_id = append_user_message(&harness, "u1", "c1", "I play the cello").await;
    harness.completion.script(
        Route::Extraction,
        r#"{"memories": [{"text": "Plays the cello", "type": "preference", "confidence": 0.9}]}"#,
    );

    let task_id = harness
        .engine
        .submit_extract("u1", "c1", message_id)
        .await
        .expect("submit");
    let task = harness.wait_for_task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);

    let memories = harness
        .engine
        .list_memories("u1", None, 10, 0)
        .await
        .expect("list");
    assert_eq!(memories.len(), 1);
    let memory = &memories[0];
    assert!(!memory.has_embedding);
    assert_eq!(
        memory.provenance["embedding_failed"],
        serde_json::Value::Bool(true)
    );

    // Vector reads skip the unembedded row; lexical still finds it
    let results = harness
        .engine
        .retrieve("u1", "cello", None)
        .await
        .expect("retrieve");
    assert!(results.iter().any(|r| r.memory.id == memory.id));
}

#[tokio::test]
async fn overload_rejected_with_typed_error() {
    let mut config = memoria::config::EngineConfig::default();
    config.orchestrator.queue_capacity = 1;
    config.orchestrator.workers = 1;
    let harness = TestHarness::with_config(config).await;

    // A failing completion makes each insights task spin through its
    // retry backoff, pinning the single worker while submissions pile up.
    harness.completion.fail_all.store(true, Ordering::SeqCst);

    for user in ["a", "b", "c", "d", "e", "f", "g", "h"] {
        // Two memories per user so the miner actually reaches the
        // completion call (one memory cannot generalize).
        seed_memory(&harness, user, None, "enjoys hiking", MemoryType::Fact, 0.9).await;
        seed_memory(&harness, user, None, "enjoys climbing", MemoryType::Fact, 0.9).await;
    }

    let mut overloads = 0;
    for user in ["a", "b", "c", "d", "e", "f", "g", "h"] {
        match harness.engine.submit_insights(user).await {
            Err(MemoriaError::Overload(_)) => overloads += 1,
            Ok(_) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(overloads > 0, "a capacity-1 queue must reject some of 8 submissions");
}
