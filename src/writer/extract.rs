// src/writer/extract.rs
// Strict parsing of extractor output

use serde::Deserialize;
use tracing::debug;

use crate::db::MemoryType;
use crate::guard::sanitize;

/// Fixed system prompt for the extraction call. The model must answer with
/// a JSON object holding a `memories` array; anything else is discarded
/// element by element.
pub const EXTRACTION_SYSTEM_PROMPT: &str = "\
You extract durable facts about the user from a single chat message.

Return a JSON object of the form:
{\"memories\": [{\"text\": \"...\", \"type\": \"...\", \"confidence\": 0.0, \"importance\": 0.0}]}

Rules:
- \"type\" must be one of: preference, fact, plan, entity, relation.
- \"text\" is a single self-contained statement about the user, under 1000 characters.
- \"confidence\" in [0,1] reflects how certain the statement is from the message alone.
- \"importance\" is optional; omit it unless clearly warranted.
- Only extract durable information. Skip pleasantries, questions, and one-off context.
- Return {\"memories\": []} when nothing durable is present.";

/// Raw candidate as the model emits it. Unknown keys reject the element,
/// not the batch.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCandidate {
    text: String,
    #[serde(rename = "type")]
    memory_type: String,
    confidence: f64,
    #[serde(default)]
    importance: Option<f64>,
}

/// A validated extraction candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub text: String,
    pub memory_type: MemoryType,
    pub confidence: f64,
    pub importance: f64,
}

/// Parse the raw completion output into bounded, typed candidates.
///
/// Tolerates either a bare JSON array or an object with a `memories` key.
/// Each element is parsed independently; malformed elements are skipped so
/// one bad entry never aborts the batch.
pub fn parse_candidates(raw: &str, max_chars: usize) -> Vec<Candidate> {
    let value: serde_json::Value = match serde_json::from_str(raw.trim()) {
        Ok(v) => v,
        Err(e) => {
            debug!("extractor output is not JSON: {}", e);
            return Vec::new();
        }
    };

    let elements = match &value {
        serde_json::Value::Array(items) => items.as_slice(),
        serde_json::Value::Object(map) => match map.get("memories").and_then(|m| m.as_array()) {
            Some(items) => items.as_slice(),
            None => {
                debug!("extractor output object lacks a memories array");
                return Vec::new();
            }
        },
        _ => return Vec::new(),
    };

    let mut candidates = Vec::with_capacity(elements.len());
    for element in elements {
        match validate_element(element, max_chars) {
            Some(candidate) => candidates.push(candidate),
            None => debug!("discarding malformed extraction element"),
        }
    }
    candidates
}

/// Per-element try/skip: strict deserialization plus field bounds.
fn validate_element(element: &serde_json::Value, max_chars: usize) -> Option<Candidate> {
    let raw: RawCandidate = serde_json::from_value(element.clone()).ok()?;

    let memory_type = MemoryType::from_str(&raw.memory_type)?;

    if !(0.0..=1.0).contains(&raw.confidence) {
        return None;
    }
    if let Some(importance) = raw.importance {
        if !(0.0..=1.0).contains(&importance) {
            return None;
        }
    }

    let text = sanitize(&raw.text);
    if text.is_empty() || text.chars().count() > max_chars {
        return None;
    }

    Some(Candidate {
        text,
        memory_type,
        confidence: raw.confidence,
        importance: raw.importance.unwrap_or_else(|| memory_type.default_importance()),
    })
}
