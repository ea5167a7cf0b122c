//! Wire-format metadata documents for the four repository roles.
//!
//! Every role document travels as `{"signed": <payload>, "signatures":
//! [...]}`. Signature checks run over the canonical JSON rendering of the
//! `signed` subtree exactly as it arrived, so [`SignedDocument`] keeps that
//! subtree as a raw [`serde_json::Value`] and typed payloads are parsed out
//! of it only after (or independently of) verification. Re-serializing a
//! typed struct would silently drop unknown fields and break signatures.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use olpc_cjson::CanonicalFormatter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fileinfo::FileInfo;
use crate::keys::{KeyId, PublicKey};

/// Cache and repository file name for root metadata.
pub const META_ROOT: &str = "root.json";
/// Cache and repository file name for timestamp metadata.
pub const META_TIMESTAMP: &str = "timestamp.json";
/// Cache and repository file name for snapshot metadata.
pub const META_SNAPSHOT: &str = "snapshot.json";
/// Cache and repository file name for mirrors metadata.
pub const META_MIRRORS: &str = "mirrors.json";
/// Repository file name of the uncompressed package index.
pub const INDEX_TAR: &str = "index.tar";
/// Repository file name of the gzip-compressed package index.
pub const INDEX_TAR_GZ: &str = "index.tar.gz";

/// The four top-level metadata roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleName {
    Root,
    Timestamp,
    Snapshot,
    Mirrors,
}

impl RoleName {
    /// Canonical file name for this role's metadata document.
    pub fn file_name(self) -> &'static str {
        match self {
            RoleName::Root => META_ROOT,
            RoleName::Timestamp => META_TIMESTAMP,
            RoleName::Snapshot => META_SNAPSHOT,
            RoleName::Mirrors => META_MIRRORS,
        }
    }
}

impl std::fmt::Display for RoleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleName::Root => f.write_str("root"),
            RoleName::Timestamp => f.write_str("timestamp"),
            RoleName::Snapshot => f.write_str("snapshot"),
            RoleName::Mirrors => f.write_str("mirrors"),
        }
    }
}

/// One signature from the envelope of a signed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Fingerprint of the signing key, listed in root metadata.
    pub keyid: KeyId,
    /// Hex-encoded signature over the canonical `signed` subtree.
    pub sig: String,
    /// Signature method (e.g., `ed25519`).
    pub method: String,
}

/// A metadata document as it arrived over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedDocument {
    /// The raw signed subtree, kept unparsed for signature fidelity.
    pub signed: Value,
    /// Signature envelope.
    pub signatures: Vec<Signature>,
}

impl SignedDocument {
    /// Parses a signed document from raw JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Renders the `signed` subtree in canonical JSON form.
    ///
    /// This is the exact byte sequence signatures are computed over.
    pub fn canonical_signed(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
        self.signed.serialize(&mut ser)?;
        Ok(buf)
    }

    /// Deserializes the signed subtree into a typed payload.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.signed.clone())
    }
}

/// Common surface of a typed role payload.
pub trait RoleDocument: DeserializeOwned {
    /// Which role's key set and threshold govern this payload.
    const ROLE: RoleName;

    /// Monotonically increasing document version.
    fn version(&self) -> u64;

    /// Instant after which the document is no longer trusted.
    fn expires(&self) -> DateTime<Utc>;
}

/// Authorized key ids plus signature threshold for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    /// Fingerprints of the keys authorized for the role.
    pub keyids: Vec<KeyId>,
    /// Minimum count of distinct valid signatures required.
    pub threshold: u32,
}

/// Root metadata: key sets and thresholds for every role, itself included.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_type", rename = "root")]
pub struct Root {
    pub version: u64,
    pub expires: DateTime<Utc>,
    /// All known public keys, keyed by fingerprint.
    pub keys: BTreeMap<KeyId, PublicKey>,
    /// Per-role authorized key ids and thresholds.
    pub roles: BTreeMap<RoleName, RoleKeys>,
}

impl RoleDocument for Root {
    const ROLE: RoleName = RoleName::Root;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

/// Timestamp metadata: pins the current snapshot document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_type", rename = "timestamp")]
pub struct Timestamp {
    pub version: u64,
    pub expires: DateTime<Utc>,
    /// File infos keyed by file name; carries exactly `snapshot.json`.
    pub meta: BTreeMap<String, FileInfo>,
}

impl Timestamp {
    /// Info of the snapshot document this timestamp attests to.
    pub fn snapshot_info(&self) -> Option<&FileInfo> {
        self.meta.get(META_SNAPSHOT)
    }
}

impl RoleDocument for Timestamp {
    const ROLE: RoleName = RoleName::Timestamp;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

/// Snapshot metadata: pins root, mirrors, and the package index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_type", rename = "snapshot")]
pub struct Snapshot {
    pub version: u64,
    pub expires: DateTime<Utc>,
    /// File infos keyed by file name (`root.json`, `mirrors.json`,
    /// `index.tar`, `index.tar.gz`).
    pub meta: BTreeMap<String, FileInfo>,
}

impl Snapshot {
    /// Info of the root document this snapshot attests to.
    pub fn root_info(&self) -> Option<&FileInfo> {
        self.meta.get(META_ROOT)
    }

    /// Info of the mirrors document, when the repository publishes one.
    pub fn mirrors_info(&self) -> Option<&FileInfo> {
        self.meta.get(META_MIRRORS)
    }

    /// Info of the package index in the given encoding.
    pub fn index_info(&self, gzipped: bool) -> Option<&FileInfo> {
        self.meta.get(if gzipped { INDEX_TAR_GZ } else { INDEX_TAR })
    }

    /// Info used to detect index changes: the gzip entry when published,
    /// the uncompressed one otherwise.
    pub fn preferred_index_info(&self) -> Option<&FileInfo> {
        self.index_info(true).or_else(|| self.index_info(false))
    }
}

impl RoleDocument for Snapshot {
    const ROLE: RoleName = RoleName::Snapshot;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

/// What portion of the repository a mirror carries.
///
/// Only full mirrors are usable; a document declaring any other variant
/// fails deserialization rather than being silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorContent {
    Full,
}

/// One alternate download origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mirror {
    /// Base URL all repository-relative paths resolve against.
    pub url_base: String,
    /// Portion of the repository the mirror serves.
    pub content: MirrorContent,
}

/// Mirrors metadata: alternate download origins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_type", rename = "mirrors")]
pub struct Mirrors {
    pub version: u64,
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub mirrors: Vec<Mirror>,
}

impl RoleDocument for Mirrors {
    const ROLE: RoleName = RoleName::Mirrors;

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

/// Per-package targets document extracted from the index.
///
/// These documents ride inside the signed index rather than being fetched
/// individually, so they carry no role of their own; see the package
/// downloader for how they are admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_type", rename = "targets")]
pub struct PackageTargets {
    pub version: u64,
    pub expires: DateTime<Utc>,
    /// Repository-relative tarball paths and their pinned infos.
    #[serde(default)]
    pub targets: BTreeMap<String, FileInfo>,
}
