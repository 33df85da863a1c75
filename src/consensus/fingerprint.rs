//! Finding fingerprints.
//!
//! Two findings are "the same issue" when their normalized category, file
//! path and line bucket agree. Reviewers rarely point at the exact same line,
//! so lines are grouped into buckets of [`DEFAULT_LINE_BUCKET`].

use sha2::{Digest, Sha256};
use wfc_common::Finding;

pub const DEFAULT_LINE_BUCKET: u32 = 3;

/// Lowercase, with whitespace and underscores folded to single `-`.
pub fn normalize_category(category: &str) -> String {
    category
        .trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Forward slashes, no leading `./`.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    normalized
}

/// Hex SHA-256 of `(category, path, line / bucket)`.
pub fn fingerprint(finding: &Finding, line_bucket: u32) -> String {
    let bucket = finding.line() / line_bucket.max(1);
    let mut hasher = Sha256::new();
    hasher.update(normalize_category(finding.category()).as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize_path(finding.file_path()).as_bytes());
    hasher.update([0x1f]);
    hasher.update(bucket.to_be_bytes());
    hex::encode(hasher.finalize())
}
