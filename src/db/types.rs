// src/db/types.rs
// Row structs and closed enums shared across the engine

use serde::{Deserialize, Serialize};

/// Closed set of memory types the extractor may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Preference,
    Fact,
    Plan,
    Entity,
    Relation,
}

impl MemoryType {
    /// Parse from the stored text form
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "preference" => Some(Self::Preference),
            "fact" => Some(Self::Fact),
            "plan" => Some(Self::Plan),
            "entity" => Some(Self::Entity),
            "relation" => Some(Self::Relation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preference => "preference",
            Self::Fact => "fact",
            Self::Plan => "plan",
            Self::Entity => "entity",
            Self::Relation => "relation",
        }
    }

    /// Default importance assigned when the extractor omits one.
    pub fn default_importance(&self) -> f64 {
        match self {
            Self::Preference => 0.7,
            Self::Plan => 0.8,
            Self::Fact => 0.6,
            Self::Entity => 0.5,
            Self::Relation => 0.5,
        }
    }

    pub fn all() -> &'static [MemoryType] {
        &[
            Self::Preference,
            Self::Fact,
            Self::Plan,
            Self::Entity,
            Self::Relation,
        ]
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// A durable, typed statement about the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub text: String,
    pub memory_type: MemoryType,
    pub importance: f64,
    pub confidence: f64,
    pub bad: bool,
    pub pinned: bool,
    pub idempotency_key: String,
    pub has_embedding: bool,
    pub provenance: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

/// One chat message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub user_id: String,
    pub conversation_id: String,
    pub role: Role,
    pub text: String,
    pub created_at: String,
}

/// Summary scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryScope {
    Rolling,
    Full,
}

impl SummaryScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rolling => "rolling",
            Self::Full => "full",
        }
    }
}

/// Rolling or full summary of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub user_id: String,
    pub conversation_id: String,
    pub scope: SummaryScope,
    pub content: String,
    pub citations: Vec<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Higher-order statement derived from multiple memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: i64,
    pub user_id: String,
    pub content: String,
    pub supporting: Vec<i64>,
    pub created_at: String,
}

/// Background task kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ChatAssemble,
    Extract,
    Summarize,
    Insights,
    Correct,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatAssemble => "chat_assemble",
            Self::Extract => "extract",
            Self::Summarize => "summarize",
            Self::Insights => "insights",
            Self::Correct => "correct",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "chat_assemble" => Some(Self::ChatAssemble),
            "extract" => Some(Self::Extract),
            "summarize" => Some(Self::Summarize),
            "insights" => Some(Self::Insights),
            "correct" => Some(Self::Correct),
            _ => None,
        }
    }

    /// Whether concurrent runs for the same (user, conversation) coalesce.
    pub fn is_single_flight(&self) -> bool {
        matches!(self, Self::Extract | Self::Summarize)
    }

    /// Retry budget on transient failures.
    pub fn retry_cap(&self) -> u32 {
        match self {
            Self::Extract => 3,
            Self::Summarize => 2,
            Self::Insights => 2,
            Self::Correct => 2,
            Self::ChatAssemble => 0,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One background task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub kind: TaskKind,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub status: TaskStatus,
    pub submitted_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Partial update applied to a memory row. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    /// New text; clears the stored embedding until re-embedded
    pub text: Option<String>,
    pub bad: Option<bool>,
    pub pinned: Option<bool>,
    pub importance: Option<f64>,
    pub confidence: Option<f64>,
    pub provenance: Option<serde_json::Value>,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.bad.is_none()
            && self.pinned.is_none()
            && self.importance.is_none()
            && self.confidence.is_none()
            && self.provenance.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_type_round_trip() {
        for t in MemoryType::all() {
            assert_eq!(MemoryType::from_str(t.as_str()), Some(*t));
        }
        assert_eq!(MemoryType::from_str("opinion"), None);
    }

    #[test]
    fn test_default_importance_by_type() {
        assert!((MemoryType::Preference.default_importance() - 0.7).abs() < f64::EPSILON);
        assert!((MemoryType::Plan.default_importance() - 0.8).abs() < f64::EPSILON);
        assert!((MemoryType::Fact.default_importance() - 0.6).abs() < f64::EPSILON);
        assert!((MemoryType::Entity.default_importance() - 0.5).abs() < f64::EPSILON);
        assert!((MemoryType::Relation.default_importance() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_task_kind_single_flight() {
        assert!(TaskKind::Extract.is_single_flight());
        assert!(TaskKind::Summarize.is_single_flight());
        assert!(!TaskKind::Insights.is_single_flight());
        assert!(!TaskKind::ChatAssemble.is_single_flight());
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
