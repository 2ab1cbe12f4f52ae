//! Shared utility functions used across the codebase.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// SHA-256 hex digest of a JSON value's serialized form.
///
/// `serde_json` keeps object keys in sorted order (no `preserve_order`
/// feature), so equal values always produce equal digests.
pub fn digest_json(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]*$").unwrap())
}

/// Whether `value` is a usable agent/tool identifier.
pub fn is_identifier(value: &str) -> bool {
    identifier_regex().is_match(value)
}

/// Shorten `text` to at most `max_chars` characters, appending an ellipsis.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Sanitize a string for use as a filename.
pub fn sanitize_filename(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "default".to_string()
    } else {
        out
    }
}
