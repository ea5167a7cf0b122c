//! Length-and-digest descriptors for repository artifacts.
//!
//! Every artifact referenced by signed metadata (the snapshot from the
//! timestamp, root/mirrors/index from the snapshot, package tarballs from a
//! targets document) is pinned by a [`FileInfo`]: its exact length plus one
//! or more content digests keyed by algorithm. Comparisons use the overlap
//! rule so repositories can add algorithms without breaking older clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash algorithm identifier for SHA-256, the only algorithm we emit.
pub const HASH_SHA256: &str = "sha256";

/// Advertised length and content digests of a repository artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// Exact length of the artifact in bytes.
    pub length: u64,
    /// Hex digests keyed by algorithm name (e.g., `sha256`).
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
}

impl FileInfo {
    /// Computes the descriptor for an in-memory artifact.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert(HASH_SHA256.to_string(), sha256_hex(bytes));
        FileInfo {
            length: bytes.len() as u64,
            hashes,
        }
    }

    /// Returns `true` when `other` describes the same artifact.
    ///
    /// Lengths must match exactly. Digests are compared per algorithm; at
    /// least one algorithm must be present on both sides, and every shared
    /// algorithm must agree. Digest comparison is case-insensitive since
    /// repositories differ in hex casing.
    pub fn matches(&self, other: &FileInfo) -> bool {
        if self.length != other.length {
            return false;
        }
        let mut overlap = false;
        for (algorithm, digest) in &self.hashes {
            let Some(other_digest) = other.hashes.get(algorithm) else {
                continue;
            };
            if !digest.eq_ignore_ascii_case(other_digest) {
                return false;
            }
            overlap = true;
        }
        overlap
    }

    /// Checks an artifact's raw bytes against this descriptor.
    pub fn verifies(&self, bytes: &[u8]) -> bool {
        self.matches(&FileInfo::from_slice(bytes))
    }
}

impl PartialEq for FileInfo {
    /// Equality follows the overlap rule rather than field-by-field identity.
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

/// Computes the lowercase hex SHA-256 digest of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
