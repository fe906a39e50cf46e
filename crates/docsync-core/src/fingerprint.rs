//! Content fingerprints.
//!
//! A fingerprint is `(hash, len, ts)` over the canonical JSON of a document.
//! Two fingerprints match when hash and length agree; the timestamp only
//! records when the content was written.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: i32,
    pub len: usize,
    pub ts: u64,
}

impl Fingerprint {
    pub fn of(canonical: &str, ts: u64) -> Self {
        Self {
            hash: string_hash(canonical),
            len: canonical.encode_utf16().count(),
            ts,
        }
    }

    pub fn matches(&self, other: &Fingerprint) -> bool {
        self.hash == other.hash && self.len == other.len
    }

    pub fn matches_content(&self, canonical: &str) -> bool {
        self.matches(&Fingerprint::of(canonical, self.ts))
    }
}

/// 32-bit rolling hash over UTF-16 code units (`h = h * 31 + c`, wrapping).
/// Matches the meta records already present in browser storage.
pub fn string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}
