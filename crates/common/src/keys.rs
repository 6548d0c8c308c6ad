//! Parsing of configured API key lists

use crate::Secret;

/// Split a raw key list into individual secrets.
///
/// Accepts comma- and newline-separated values (so both `GEMINI_API_KEYS=a,b`
/// and a key file with one key per line resolve the same way). Entries are
/// trimmed and empty entries dropped. Order and duplicates are kept; the pool
/// deduplicates when it is built.
pub fn split_key_list(raw: &str) -> Vec<Secret<String>> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(Secret::from)
        .collect()
}
