//! Deterministic content fingerprinting for duplicate detection.
//!
//! A post fingerprint is SHA3-256 over a canonical JSON object built from
//! the normalized text and the sorted media references, so field order,
//! surrounding whitespace, and casing never change the digest. A thread
//! fingerprint chains the member digests in position order and hashes again.

use serde::Serialize;
use sha3::{Digest, Sha3_256};

/// Trim surrounding whitespace and case-fold. Empty content stays an empty
/// string, which still produces a digest distinguishable from "no post".
pub fn normalize(content: &str) -> String {
    content.trim().to_lowercase()
}

#[derive(Serialize)]
struct CanonicalPost<'a> {
    content: &'a str,
    #[serde(rename = "mediaIds")]
    media_ids: String,
}

/// Fingerprint of a single post.
pub fn post_fingerprint(content: &str, media_ids: &[String]) -> String {
    let normalized = normalize(content);
    let mut sorted: Vec<&str> = media_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let canonical = serde_json::to_string(&CanonicalPost {
        content: &normalized,
        media_ids: sorted.join(","),
    })
    .expect("canonical post serialization");
    hex::encode(Sha3_256::digest(canonical.as_bytes()))
}

/// Fingerprint of an ordered thread, given each member's `(position, digest)`.
/// A missing position falls back to the input index. Returns `None` for an
/// empty thread, which must never match any other draft.
pub fn thread_fingerprint(parts: &[(Option<i64>, String)]) -> Option<String> {
    if parts.is_empty() {
        return None;
    }
    let mut keyed: Vec<(i64, &str)> = parts
        .iter()
        .enumerate()
        .map(|(idx, (pos, digest))| (pos.unwrap_or(idx as i64), digest.as_str()))
        .collect();
    keyed.sort_by_key(|(pos, _)| *pos);
    let combined: String = keyed.iter().map(|(_, digest)| *digest).collect();
    Some(hex::encode(Sha3_256::digest(combined.as_bytes())))
}
