//! Content ids and the adaptive truncated-name scheme.

use crate::errors::StoreError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex characters of the content id used for on-disk names until a collision
/// forces more.
pub const DEFAULT_NAME_LEN: usize = 14;

/// Hard ceiling on the truncated name length. Unreachable in practice with a
/// 256-bit digest; hitting it is a fatal inconsistency.
pub const MAX_NAME_LEN: usize = 32;

/// SHA-256 of a file's raw bytes, hex encoded. The sole notion of identity
/// for stored inputs.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn of(bytes: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(bytes);
        Self(hex::encode(h.finalize()))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// First `len` hex characters, the on-disk name before bucketing.
    pub fn truncated(&self, len: NameLength) -> &str {
        &self.0[..len.get().min(self.0.len())]
    }

    /// Split the truncated name into a 2-character bucket directory and the
    /// remaining filename, bounding per-directory fan-out.
    pub fn bucket(&self, len: NameLength) -> (String, String) {
        let name = self.truncated(len);
        (name[..2].to_string(), name[2..].to_string())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", &self.0[..12.min(self.0.len())])
    }
}

/// Process-wide truncated-name length for one trim pass: monotonically
/// non-decreasing, threaded explicitly through the retry loop rather than
/// held in a global.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NameLength {
    value: usize,
    ceiling: usize,
}

impl NameLength {
    pub fn new(value: usize) -> Self {
        Self::with_ceiling(value, MAX_NAME_LEN)
    }

    pub fn with_ceiling(value: usize, ceiling: usize) -> Self {
        // A name shorter than 3 hex chars cannot be split into a 2-char
        // bucket plus a filename.
        Self {
            value: value.max(3),
            ceiling: ceiling.max(3),
        }
    }

    pub fn get(self) -> usize {
        self.value
    }

    /// One more hex character after a truncation collision; fatal past the
    /// ceiling.
    pub fn bump(self) -> Result<Self, StoreError> {
        if self.value >= self.ceiling {
            return Err(StoreError::NameLengthExceeded {
                ceiling: self.ceiling,
            });
        }
        Ok(Self {
            value: self.value + 1,
            ceiling: self.ceiling,
        })
    }
}

impl Default for NameLength {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_LEN)
    }
}
