// src/db/mod.rs
// Unified database layer with rusqlite + sqlite-vec

mod conversations;
mod insights;
mod memories;
mod migration_helpers;
pub mod pool;
pub mod schema;
mod security;
mod summaries;
mod tasks;
mod types;

pub use conversations::{
    append_message_sync, conversation_exists_sync, delete_conversation_sync, get_message_sync,
    messages_since_sync, parse_message_row, recent_messages_sync, user_turns_since_sync,
};
pub use insights::{insert_insight_sync, last_insight_at_sync, list_insights_sync, parse_insight_row};
pub use memories::{
    InsertOutcome, MemoryFilter, NewMemory, count_memories_since_sync, delete_memory_sync,
    embedding_to_bytes, existing_memory_ids_sync, get_memory_sync, high_confidence_memories_sync,
    insert_memory_sync, lexical_topk_sync, list_memories_sync, memories_in_window_sync,
    memories_without_embedding_sync, parse_memory_row, raise_confidence_sync, recent_memories_sync,
    store_embedding_sync, update_memory_sync, vector_topk_sync,
};
pub use pool::DatabasePool;
pub use security::{count_security_events_sync, record_security_event_sync};
pub use summaries::{get_summary_sync, parse_summary_row, upsert_summary_sync};
pub use tasks::{
    create_task_sync, gc_tasks_sync, get_task_sync, mark_task_completed_sync,
    mark_task_failed_sync, mark_task_running_sync, parse_task_row,
};
pub use types::*;
