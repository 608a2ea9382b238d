//! Identity normalization for fuzzy sheet data.
//!
//! All entity matching in the diff engine goes through these keys; raw display
//! strings are never compared. Both functions are pure and idempotent.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Canonicalize a free-text name or group label into a stable matching key.
///
/// Strips diacritics (NFD decomposition, combining marks dropped), lowercases,
/// trims, and collapses internal whitespace runs to single spaces.
///
/// Example: "  Kvutzá  BET " → "kvutza bet"
pub fn normalize_key(text: &str) -> String {
    let folded: String = text.nfd().filter(|c| !is_combining_mark(*c)).collect();
    folded
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonicalize an email address: trim and lowercase only.
///
/// No accent folding — emails are identifiers, not natural-language text.
pub fn normalize_email(text: &str) -> String {
    text.trim().to_lowercase()
}
