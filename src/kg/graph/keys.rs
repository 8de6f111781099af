//! Deterministic identities.
//!
//! Graph rows and bookkeeping chunks are addressed by keys computed from
//! content alone, so repeated or concurrent writes of the same fact land on
//! the same row.

use sha2::{Digest, Sha256};

use crate::kg::domain::{GraphTarget, SourceTable};

/// Longest sanitized entity name, in characters.
pub const MAX_NAME_CHARS: usize = 100;

/// Separator between the two endpoint names of a relation key.
pub const RELATION_KEY_SEPARATOR: char = '|';

/// Normalize a raw entity name into its record key.
///
/// Trims, collapses whitespace runs to a single `_`, keeps only letters,
/// digits, `_` and CJK ideographs, then truncates to [`MAX_NAME_CHARS`].
/// Returns an empty string when nothing usable remains.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_space = false;
    for c in raw.trim().chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('_');
                in_space = true;
            }
            continue;
        }
        if c.is_alphanumeric() || c == '_' || is_cjk(c) {
            out.push(c);
            in_space = false;
        }
    }
    // A name made only of whitespace and punctuation leaves bare underscores.
    if out.chars().all(|c| c == '_') {
        return String::new();
    }
    out.chars().take(MAX_NAME_CHARS).collect()
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF | 0x20000..=0x2FA1F
        | 0x3040..=0x30FF | 0xAC00..=0xD7AF)
}

/// Order-independent key for the edge between two sanitized names.
pub fn relation_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}{RELATION_KEY_SEPARATOR}{hi}")
}

/// Hex SHA-256 of a description; stamped next to an entity's embedding.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Key of the bookkeeping chunk derived from one source row.
pub fn chunk_key(source: &SourceTable, row_key: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [
        source.namespace.as_str(),
        source.database.as_str(),
        source.table.as_str(),
        row_key,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

/// Provenance id of a source row as recorded on graph rows.
///
/// A record id (`table:row`) when the source lives in the target's database,
/// otherwise prefixed with the source's `namespace/database/`.
pub fn provenance_id(source: &SourceTable, target: &GraphTarget, row_key: &str) -> String {
    if source.namespace == target.namespace && source.database == target.database {
        format!("{}:{row_key}", source.table)
    } else {
        format!(
            "{}/{}/{}:{row_key}",
            source.namespace, source.database, source.table
        )
    }
}
