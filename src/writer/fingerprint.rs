// src/writer/fingerprint.rs
// Stable memory fingerprints (idempotency keys)

use sha2::{Digest, Sha256};

use crate::db::MemoryType;

/// Field separator inside the hash input. Changing normalization or this
/// byte invalidates every stored idempotency_key, so both are part of the
/// persistence contract.
const SEPARATOR: u8 = 0x1F;

/// Normalize candidate text before hashing: lowercase, collapse runs of
/// whitespace to single spaces, strip trailing punctuation.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(['.', ',', ';', ':', '!', '?'])
        .trim_end()
        .to_string()
}

/// Compute the fingerprint: hex(SHA256(normalized_text ‖ 0x1F ‖ type)).
pub fn fingerprint(text: &str, memory_type: MemoryType) -> String {
    let normalized = normalize(text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(memory_type.as_str().as_bytes());
    hex_encode(&hasher.finalize())
}

/// Lowercase hex without allocating through format! per byte.
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0F) as usize] as char);
    }
    out
}
