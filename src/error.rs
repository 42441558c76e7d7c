// src/error.rs
// Standardized error types for the memoria engine

use thiserror::Error;

/// Why the validator refused a piece of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsafeReason {
    PromptInjection,
    ControlCharacters,
    OversizedInput,
    PolicyViolation,
}

impl std::fmt::Display for UnsafeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PromptInjection => write!(f, "prompt_injection"),
            Self::ControlCharacters => write!(f, "control_characters"),
            Self::OversizedInput => write!(f, "oversized_input"),
            Self::PolicyViolation => write!(f, "policy_violation"),
        }
    }
}

/// Main error type for the memoria library.
///
/// The variants map onto the engine's propagation policy: `Transient` is
/// retried with backoff, `Conflict` is absorbed at the write path,
/// `Unsafe` aborts the operation and records a security event, and the
/// rest are surfaced to the caller.
#[derive(Error, Debug)]
pub enum MemoriaError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-key violation on memory insert. Carries the id of the
    /// existing row so callers can treat the insert as a success.
    #[error("conflict: memory already exists with id {0}")]
    Conflict(i64),

    #[error("unsafe input ({tag}): {reason}")]
    Unsafe { tag: &'static str, reason: UnsafeReason },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("overloaded: {0}")]
    Overload(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using MemoriaError
pub type Result<T> = std::result::Result<T, MemoriaError>;

impl MemoriaError {
    /// Whether the retry machinery is allowed to re-attempt this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, MemoriaError::Transient(_))
    }

    /// Whether this error is terminal for a task (no retry budget applies).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MemoriaError::Fatal(_) | MemoriaError::Unsafe { .. } | MemoriaError::Cancelled
        )
    }
}

impl From<reqwest::Error> for MemoriaError {
    fn from(err: reqwest::Error) -> Self {
        // Network-level failures and timeouts are retryable; everything
        // else from the HTTP stack is treated the same way since the
        // capability contract only distinguishes transient vs fatal.
        if err.is_timeout() || err.is_connect() || err.is_request() {
            MemoriaError::Transient(err.to_string())
        } else {
            MemoriaError::Fatal(err.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for MemoriaError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            MemoriaError::Cancelled
        } else {
            MemoriaError::Fatal(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for MemoriaError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MemoriaError::Transient("deadline exceeded".to_string())
    }
}

impl From<String> for MemoriaError {
    fn from(s: String) -> Self {
        MemoriaError::Fatal(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        assert!(MemoriaError::Transient("timeout".into()).is_transient());
        assert!(!MemoriaError::Fatal("schema".into()).is_transient());
        assert!(!MemoriaError::Conflict(1).is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MemoriaError::Fatal("dim mismatch".into()).is_fatal());
        assert!(MemoriaError::Cancelled.is_fatal());
        assert!(
            MemoriaError::Unsafe {
                tag: "writer_extract",
                reason: UnsafeReason::PromptInjection
            }
            .is_fatal()
        );
        assert!(!MemoriaError::Transient("x".into()).is_fatal());
    }

    #[test]
    fn test_deadline_maps_to_transient() {
        let err: MemoriaError = match tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(async {
                tokio::time::timeout(std::time::Duration::from_millis(1), async {
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                })
                .await
            }) {
            Err(elapsed) => elapsed.into(),
            Ok(_) => panic!("timeout expected"),
        };
        assert!(err.is_transient());
    }
}
