// src/orchestrator/ids.rs
// Deterministic task identity

use sha2::{Digest, Sha256};

use crate::db::TaskKind;
use crate::writer::hex_encode;

/// Field separator inside the hash input, matching the fingerprint format.
const SEPARATOR: u8 = 0x1F;

/// Stable hash of a task payload. serde_json orders object keys, so the
/// same logical payload always serializes identically.
pub fn payload_hash(payload: &serde_json::Value) -> String {
    let canonical = payload.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Derive the task id:
/// hex(SHA256(kind ‖ 0x1F ‖ user_id ‖ 0x1F ‖ conversation_id-or-empty ‖ 0x1F ‖ payload_hash)).
/// Never truncated; duplicate submissions of the same payload collide by
/// construction.
pub fn task_id(
    kind: TaskKind,
    user_id: &str,
    conversation_id: Option<&str>,
    payload_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(user_id.as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(conversation_id.unwrap_or("").as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(payload_hash.as_bytes());
    hex_encode(&hasher.finalize())
}
