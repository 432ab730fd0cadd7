//! Helpers for sanitizing client-supplied names and for keeping paths out of
//! tracing span attributes.
//!
//! Client filenames end up inside generated temp and artifact names, so they
//! are reduced to a safe stem first. Spans only ever see a file name or a
//! hash, never a full storage path.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Longest stem kept from a client-supplied filename.
pub const MAX_STEM_LEN: usize = 50;

/// Returns only the filename component of a path (no directory).
///
/// Safe for span fields: reveals the file name without exposing the full path.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Returns a short deterministic hash of a path for correlation without
/// exposing the actual path.
pub fn hash_path(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    let hash = hasher.finish();
    format!("{:016x}", hash)
}

static RE_UNSAFE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]").unwrap());

/// Reduces a claimed filename to a stem usable inside generated file names.
///
/// Directory components and the claimed extension are dropped, whitespace
/// becomes `_`, anything outside `[A-Za-z0-9._-]` becomes `-`, and the result
/// is truncated to [`MAX_STEM_LEN`] characters. Never returns an empty string.
pub fn sanitize_file_stem(claimed_name: &str) -> String {
    let base = claimed_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let stem = match base.rfind('.') {
        Some(0) | None => base,
        Some(dot) => &base[..dot],
    };

    let spaced: String = stem
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    let cleaned = RE_UNSAFE.replace_all(&spaced, "-");
    let trimmed = cleaned.trim_matches('.');

    let truncated: String = trimmed.chars().take(MAX_STEM_LEN).collect();
    if truncated.is_empty() {
        "file".to_string()
    } else {
        truncated
    }
}

/// Whether `id` has the shape of an issued public document id.
///
/// Checked before any registry lookup so malformed ids never reach SQL.
pub fn is_public_id(id: &str) -> bool {
    (16..=128).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
