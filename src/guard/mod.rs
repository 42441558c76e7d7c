// src/guard/mod.rs
// Input validation capability and structural sanitization
//
// Every boundary where untrusted text enters a prompt goes through a
// `Validator`. The production validator is injected by the embedding
// application; `BaselineValidator` is the local default binding with a
// small set of heuristics.

use async_trait::async_trait;

use crate::error::{MemoriaError, Result, UnsafeReason};

/// Hard cap on any single piece of text entering a prompt.
pub const MAX_INPUT_CHARS: usize = 16_000;

/// Closed set of validation contexts. The tag tells the validator where
/// the text is headed so it can apply context-appropriate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextTag {
    WriterExtract,
    SummarizerInput,
    InsightInput,
    ResponderUser,
    Correction,
}

impl ContextTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WriterExtract => "writer_extract",
            Self::SummarizerInput => "summarizer_input",
            Self::InsightInput => "insight_input",
            Self::ResponderUser => "responder_user",
            Self::Correction => "correction",
        }
    }
}

impl std::fmt::Display for ContextTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validation verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub safe: bool,
    pub reason: Option<UnsafeReason>,
    pub score: f64,
}

impl Verdict {
    pub fn safe() -> Self {
        Self {
            safe: true,
            reason: None,
            score: 0.0,
        }
    }

    pub fn unsafe_because(reason: UnsafeReason, score: f64) -> Self {
        Self {
            safe: false,
            reason: Some(reason),
            score,
        }
    }

    /// Turn an unsafe verdict into the typed error callers must propagate.
    pub fn into_error(self, tag: ContextTag) -> MemoriaError {
        MemoriaError::Unsafe {
            tag: tag.as_str(),
            reason: self.reason.unwrap_or(UnsafeReason::PolicyViolation),
        }
    }
}

/// Validation capability consumed by the engine. Concrete bindings are
/// injected at construction; tests substitute fakes.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, text: &str, tag: ContextTag) -> Result<Verdict>;
}

/// Structural sanitization applied regardless of verdict: strips control
/// characters (keeping newlines and tabs), collapses CRLF, trims, and
/// enforces the global length cap on a char boundary.
pub fn sanitize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    let trimmed = cleaned.trim();
    if trimmed.chars().count() <= MAX_INPUT_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().take(MAX_INPUT_CHARS).collect()
    }
}

/// Phrases that mark an obvious instruction-override attempt. The
/// production validator replaces this heuristic; these cover the blatant
/// cases for local use.
const OVERRIDE_MARKERS: &[&str] = &[
    "ignore previous instructions",
    "ignore all previous instructions",
    "disregard your instructions",
    "you are now",
    "system prompt:",
    "</system>",
];

/// Default local validator: length cap, raw-control-character check, and
/// obvious override phrases. Deliberately conservative about false
/// positives - it exists so the engine is never run with validation off.
#[derive(Debug, Default, Clone)]
pub struct BaselineValidator;

#[async_trait]
impl Validator for BaselineValidator {
    async fn validate(&self, text: &str, tag: ContextTag) -> Result<Verdict> {
        if text.chars().count() > MAX_INPUT_CHARS {
            return Ok(Verdict::unsafe_because(UnsafeReason::OversizedInput, 1.0));
        }

        let control_chars = text
            .chars()
            .filter(|c| c.is_control() && *c != '\n' && *c != '\t' && *c != '\r')
            .count();
        if control_chars > 8 {
            return Ok(Verdict::unsafe_because(
                UnsafeReason::ControlCharacters,
                0.8,
            ));
        }

        let lowered = text.to_lowercase();
        for marker in OVERRIDE_MARKERS {
            if lowered.contains(marker) {
                tracing::warn!(tag = %tag, marker, "override phrase detected in input");
                return Ok(Verdict::unsafe_because(UnsafeReason::PromptInjection, 0.9));
            }
        }

        Ok(Verdict::safe())
    }
}
