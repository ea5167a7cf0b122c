// Signing fixtures shared across unit tests.
//
// Produces wire-format signed metadata (and tar archives for index tests)
// so tests can emulate a repository without reproducing the signing logic
// inline. Keys are derived from fixed seeds to keep fixtures deterministic.

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signer, SigningKey};
use olpc_cjson::CanonicalFormatter;
use serde::Serialize;
use serde_json::{json, Value};

use crate::fileinfo::FileInfo;
use crate::keys::{KeyEnv, KeyId, PublicKey, METHOD_ED25519};
use crate::metadata::Root;
use crate::trust::Trusted;

/// Returns `now` shifted by the given number of hours.
pub(crate) fn hours_from_now(hours: i64) -> DateTime<Utc> {
    Utc::now() + Duration::hours(hours)
}

/// Canonical JSON bytes of a serde value.
pub(crate) fn canonical(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
    value.serialize(&mut ser).expect("canonical serialization");
    buf
}

/// Holds one signing key per role, derived from a seed base.
pub(crate) struct RepoSigner {
    pub root_key: SigningKey,
    pub timestamp_key: SigningKey,
    pub snapshot_key: SigningKey,
    pub mirrors_key: SigningKey,
    timestamp_threshold: u32,
}

impl RepoSigner {
    /// Default fixture keys (seed base 1).
    pub(crate) fn new() -> Self {
        Self::with_seed_base(1)
    }

    /// Fixture keys derived from `base`; distinct bases yield distinct keys.
    pub(crate) fn with_seed_base(base: u8) -> Self {
        RepoSigner {
            root_key: SigningKey::from_bytes(&[base; 32]),
            timestamp_key: SigningKey::from_bytes(&[base.wrapping_add(1); 32]),
            snapshot_key: SigningKey::from_bytes(&[base.wrapping_add(2); 32]),
            mirrors_key: SigningKey::from_bytes(&[base.wrapping_add(3); 32]),
            timestamp_threshold: 1,
        }
    }

    /// A rotated repository: new root key, same subordinate keys.
    pub(crate) fn rotated(&self, root_seed: u8) -> RepoSigner {
        RepoSigner {
            root_key: SigningKey::from_bytes(&[root_seed; 32]),
            timestamp_key: self.timestamp_key.clone(),
            snapshot_key: self.snapshot_key.clone(),
            mirrors_key: self.mirrors_key.clone(),
            timestamp_threshold: self.timestamp_threshold,
        }
    }

    /// Public key wrapper for a signing key.
    pub(crate) fn public(key: &SigningKey) -> PublicKey {
        PublicKey::ed25519(hex::encode(key.verifying_key().as_bytes()))
    }

    /// Fingerprint of a signing key.
    pub(crate) fn key_id(key: &SigningKey) -> KeyId {
        Self::public(key).key_id()
    }

    /// Fingerprints pinned during bootstrap (the root key only).
    pub(crate) fn root_key_ids(&self) -> Vec<KeyId> {
        vec![Self::key_id(&self.root_key)]
    }

    /// The unsigned root payload for this signer's key set.
    pub(crate) fn root_payload(&self, version: u64, expires: DateTime<Utc>) -> Value {
        let keys = [
            &self.root_key,
            &self.timestamp_key,
            &self.snapshot_key,
            &self.mirrors_key,
        ];
        let mut key_table = serde_json::Map::new();
        for key in keys {
            key_table.insert(
                Self::key_id(key).as_str().to_string(),
                serde_json::to_value(Self::public(key)).expect("key value"),
            );
        }
        json!({
            "_type": "root",
            "version": version,
            "expires": expires,
            "keys": Value::Object(key_table),
            "roles": {
                "root": { "keyids": [Self::key_id(&self.root_key)], "threshold": 1 },
                "timestamp": {
                    "keyids": [Self::key_id(&self.timestamp_key)],
                    "threshold": self.timestamp_threshold,
                },
                "snapshot": { "keyids": [Self::key_id(&self.snapshot_key)], "threshold": 1 },
                "mirrors": { "keyids": [Self::key_id(&self.mirrors_key)], "threshold": 1 },
            },
        })
    }

    /// Signs a payload with the given keys, producing wire bytes.
    pub(crate) fn sign(payload: &Value, keys: &[&SigningKey]) -> Vec<u8> {
        let message = canonical(payload);
        let signatures: Vec<Value> = keys
            .iter()
            .map(|key| {
                json!({
                    "keyid": Self::key_id(key),
                    "sig": hex::encode(key.sign(&message).to_bytes()),
                    "method": METHOD_ED25519,
                })
            })
            .collect();
        serde_json::to_vec(&json!({ "signed": payload, "signatures": signatures }))
            .expect("wire document")
    }

    /// Wire bytes of this signer's root, self-signed.
    pub(crate) fn root(&self, version: u64, expires: DateTime<Utc>) -> Vec<u8> {
        Self::sign(&self.root_payload(version, expires), &[&self.root_key])
    }

    /// Wire bytes of this signer's root co-signed by another signer's root key.
    pub(crate) fn root_signed_also_by(
        &self,
        version: u64,
        expires: DateTime<Utc>,
        other: &RepoSigner,
    ) -> Vec<u8> {
        Self::sign(
            &self.root_payload(version, expires),
            &[&self.root_key, &other.root_key],
        )
    }

    /// Wire bytes of this signer's root signed only by a foreign root key.
    pub(crate) fn root_signed_only_by(
        &self,
        version: u64,
        expires: DateTime<Utc>,
        other: &RepoSigner,
    ) -> Vec<u8> {
        Self::sign(&self.root_payload(version, expires), &[&other.root_key])
    }

    /// Parses this signer's own root into a trusted value plus key env.
    pub(crate) fn trusted_root(&self) -> (Trusted<Root>, KeyEnv) {
        let payload = self.root_payload(1, hours_from_now(24));
        let root: Root = serde_json::from_value(payload).expect("root payload");
        let env = KeyEnv::from_root(&root);
        (Trusted::admit(root), env)
    }

    /// Like [`trusted_root`] but requiring `threshold` timestamp signatures.
    pub(crate) fn trusted_root_with_timestamp_threshold(
        &self,
        threshold: u32,
    ) -> (Trusted<Root>, KeyEnv) {
        let signer = RepoSigner {
            root_key: self.root_key.clone(),
            timestamp_key: self.timestamp_key.clone(),
            snapshot_key: self.snapshot_key.clone(),
            mirrors_key: self.mirrors_key.clone(),
            timestamp_threshold: threshold,
        };
        signer.trusted_root()
    }

    /// Timestamp payload attesting to the given snapshot bytes.
    pub(crate) fn timestamp_payload(
        version: u64,
        expires: DateTime<Utc>,
        snapshot_bytes: &[u8],
    ) -> Value {
        json!({
            "_type": "timestamp",
            "version": version,
            "expires": expires,
            "meta": {
                "snapshot.json": serde_json::to_value(FileInfo::from_slice(snapshot_bytes))
                    .expect("file info"),
            },
        })
    }

    /// Wire bytes of a signed timestamp.
    pub(crate) fn timestamp(
        &self,
        version: u64,
        expires: DateTime<Utc>,
        snapshot_bytes: &[u8],
    ) -> Vec<u8> {
        Self::sign(
            &Self::timestamp_payload(version, expires, snapshot_bytes),
            &[&self.timestamp_key],
        )
    }

    /// A timestamp carrying the same key's signature twice.
    pub(crate) fn timestamp_signed_twice_same_key(
        &self,
        version: u64,
        expires: DateTime<Utc>,
        snapshot_bytes: &[u8],
    ) -> Vec<u8> {
        Self::sign(
            &Self::timestamp_payload(version, expires, snapshot_bytes),
            &[&self.timestamp_key, &self.timestamp_key],
        )
    }

    /// Wire bytes of a signed snapshot with the given meta entries.
    pub(crate) fn snapshot(
        &self,
        version: u64,
        expires: DateTime<Utc>,
        entries: &[(&str, FileInfo)],
    ) -> Vec<u8> {
        let mut meta = serde_json::Map::new();
        for (name, info) in entries {
            meta.insert(
                (*name).to_string(),
                serde_json::to_value(info).expect("file info"),
            );
        }
        Self::sign(
            &json!({
                "_type": "snapshot",
                "version": version,
                "expires": expires,
                "meta": Value::Object(meta),
            }),
            &[&self.snapshot_key],
        )
    }

    /// Wire bytes of a signed mirrors document listing full mirrors.
    pub(crate) fn mirrors(&self, version: u64, expires: DateTime<Utc>, urls: &[&str]) -> Vec<u8> {
        let mirrors: Vec<Value> = urls
            .iter()
            .map(|url| json!({ "url_base": url, "content": "full" }))
            .collect();
        Self::sign(
            &json!({
                "_type": "mirrors",
                "version": version,
                "expires": expires,
                "mirrors": mirrors,
            }),
            &[&self.mirrors_key],
        )
    }
}

/// Builds an ustar archive from `(path, contents)` entries.
pub(crate) fn tar_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (path, contents) in entries {
        out.extend_from_slice(&tar_header(path, contents.len() as u64));
        out.extend_from_slice(contents);
        let pad = (512 - contents.len() % 512) % 512;
        out.extend_from_slice(&vec![0u8; pad]);
    }
    // Archive terminator: two zero blocks.
    out.extend_from_slice(&[0u8; 1024]);
    out
}

/// One 512-byte ustar header for a regular file.
fn tar_header(path: &str, size: u64) -> [u8; 512] {
    let mut header = [0u8; 512];
    assert!(path.len() < 100, "fixture paths must fit the name field");
    header[..path.len()].copy_from_slice(path.as_bytes());
    header[100..108].copy_from_slice(b"0000644\0");
    header[108..116].copy_from_slice(b"0000000\0");
    header[116..124].copy_from_slice(b"0000000\0");
    let size_octal = format!("{size:011o}\0");
    header[124..136].copy_from_slice(size_octal.as_bytes());
    header[136..148].copy_from_slice(b"00000000000\0");
    header[148..156].copy_from_slice(b"        ");
    header[156] = b'0';
    header[257..263].copy_from_slice(b"ustar\0");
    header[263..265].copy_from_slice(b"00");
    let checksum: u64 = header.iter().map(|b| u64::from(*b)).sum();
    let checksum_octal = format!("{checksum:06o}\0 ");
    header[148..156].copy_from_slice(checksum_octal.as_bytes());
    header
}

/// In-memory [`RemoteRepository`] serving scripted files.
///
/// Records every resolved fetch so tests can assert request counts, and
/// captures applied mirror lists.
pub(crate) struct FakeRepository {
    files: std::cell::RefCell<std::collections::BTreeMap<String, Vec<u8>>>,
    requests: std::cell::RefCell<Vec<String>>,
    mirrors: std::cell::RefCell<Vec<String>>,
}

impl FakeRepository {
    pub(crate) fn new() -> Self {
        FakeRepository {
            files: Default::default(),
            requests: Default::default(),
            mirrors: Default::default(),
        }
    }

    /// Installs (or replaces) a served file.
    pub(crate) fn put(&self, path: &str, bytes: &[u8]) {
        self.files.borrow_mut().insert(path.to_string(), bytes.to_vec());
    }

    /// Resolved paths of every fetch so far, in order.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }

    /// Forgets the request log.
    pub(crate) fn clear_requests(&self) {
        self.requests.borrow_mut().clear();
    }

    /// The most recently applied mirror list.
    pub(crate) fn applied_mirrors(&self) -> Vec<String> {
        self.mirrors.borrow().clone()
    }
}

impl crate::remote::RemoteRepository for FakeRepository {
    fn fetch(
        &self,
        _attempt: u32,
        file: &crate::remote::RemoteFile,
    ) -> Result<crate::remote::Fetched, crate::remote::RemoteError> {
        for (format, rel_path) in file.candidates() {
            if let Some(bytes) = self.files.borrow().get(&rel_path) {
                self.requests.borrow_mut().push(rel_path.clone());
                return Ok(crate::remote::Fetched {
                    format,
                    path: rel_path,
                    staged: crate::remote::StagedFile::from_bytes(bytes)?,
                });
            }
        }
        Err(crate::remote::RemoteError::NotFound(file.to_string()))
    }

    fn apply_mirrors(&self, mirrors: &[crate::metadata::Mirror]) {
        *self.mirrors.borrow_mut() = mirrors.iter().map(|m| m.url_base.clone()).collect();
    }
}

/// Gzip-compresses a byte slice (index fixtures).
pub(crate) fn gzip(bytes: &[u8]) -> Vec<u8> {
    use std::io::Write;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).expect("gzip write");
    encoder.finish().expect("gzip finish")
}
