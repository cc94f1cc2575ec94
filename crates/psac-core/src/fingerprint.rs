//! Content fingerprints used to detect listing edits between scrapes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Fingerprint of text that normalizes to nothing.
///
/// Distinct from a missing fingerprint (`None` on a stored message).
pub const EMPTY_FINGERPRINT: &str = "";

/// Canonical form hashed by [`fingerprint`].
///
/// NFC-composes, lowercases, unifies line endings to `\n`, turns tabs into
/// spaces, trims, and collapses runs of spaces.
pub fn normalize(text: &str) -> String {
    let lowered = text.nfc().collect::<String>().to_lowercase();
    let unified = lowered
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\t', " ");

    let mut out = String::with_capacity(unified.len());
    let mut previous_space = false;
    for ch in unified.trim().chars() {
        if ch == ' ' {
            if previous_space {
                continue;
            }
            previous_space = true;
        } else {
            previous_space = false;
        }
        out.push(ch);
    }
    out
}

/// SHA-256 over the normalized UTF-8 bytes, base64 encoded.
pub fn fingerprint(text: &str) -> String {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return EMPTY_FINGERPRINT.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    STANDARD.encode(hasher.finalize())
}
