//! Stable hashing and error-text normalization.
//!
//! Hashes are truncated SHA-256 hex digests so they stay stable across
//! processes and platforms (unlike `std::hash`).

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Hex characters kept from a digest.
pub const HASH_LEN: usize = 16;

/// Inputs longer than this are truncated before hashing for loop detection.
pub const HASH_INPUT_LIMIT: usize = 4_000;

/// Number of leading words that identify a skill pattern.
const SKILL_KEY_WORDS: usize = 8;

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
        .unwrap()
});
static CLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}:\d{2}:\d{2}(?:\.\d+)?\b").unwrap());
static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());
static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:[A-Za-z]:)?(?:[\w.~-]*[/\\])+([\w.-]+)").unwrap());
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bline\s+\d+").unwrap());
static POSITION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":\d+(?::\d+)?\b").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'[^']*'|"[^"]*"|`[^`]*`"#).unwrap());
static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z][a-z_]+").unwrap());

/// Truncated SHA-256 hex digest of `text`.
pub fn stable_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..HASH_LEN].to_string()
}

/// Stable hash of at most [`HASH_INPUT_LIMIT`] bytes of `text`.
pub fn truncated_hash(text: &str) -> String {
    stable_hash(truncate_at_char_boundary(text, HASH_INPUT_LIMIT))
}

/// Normalize an error message so that incidental detail does not change its identity.
///
/// Strips timestamps, memory addresses, directory components of paths and line
/// numbers, then lowercases and collapses whitespace.
pub fn normalize_error(text: &str) -> String {
    let text = TIMESTAMP_RE.replace_all(text, "<ts>");
    let text = CLOCK_RE.replace_all(&text, "<time>");
    let text = ADDRESS_RE.replace_all(&text, "<addr>");
    let text = PATH_RE.replace_all(&text, "$1");
    let text = LINE_RE.replace_all(&text, "line <n>");
    let text = POSITION_RE.replace_all(&text, ":<n>");
    let text = WHITESPACE_RE.replace_all(text.trim(), " ");
    text.to_lowercase()
}

/// Identity key of a learning: hash of the normalized error text.
pub fn hash_error_pattern(text: &str) -> String {
    stable_hash(&normalize_error(text))
}

/// Identity key of a skill candidate.
///
/// Coarser than [`hash_error_pattern`]: quoted values and numbers are dropped
/// and only the leading words count, so phrasings that differ in the
/// offending symbol still aggregate into one candidate.
pub fn skill_pattern_hash(text: &str) -> String {
    let normalized = normalize_error(text);
    let unquoted = QUOTED_RE.replace_all(&normalized, " ");
    let words: Vec<&str> = WORD_RE
        .find_iter(&unquoted)
        .map(|m| m.as_str())
        .take(SKILL_KEY_WORDS)
        .collect();
    stable_hash(&format!("skill:{}", words.join(" ")))
}

/// Slice `text` to at most `limit` bytes without splitting a UTF-8 character.
pub fn truncate_at_char_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
