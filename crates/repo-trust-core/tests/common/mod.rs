// Repository fixtures shared across integration tests.
//
// Builds fully signed metadata generations plus a package index and serves
// them from an httptest server, so end-to-end tests exercise the real HTTP
// fetcher against realistic repository layouts.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signer, SigningKey};
use httptest::{matchers::request, responders::status_code, Expectation, Server};
use serde_json::{json, Value};

use repo_trust_core::{FileInfo, KeyId, PublicKey, SignedDocument};

/// Returns `now` shifted by the given number of hours.
pub fn hours_from_now(hours: i64) -> DateTime<Utc> {
    Utc::now() + Duration::hours(hours)
}

/// Signing keys for a three-key root plus one key per subordinate role.
pub struct Keys {
    pub root: [SigningKey; 3],
    pub timestamp: SigningKey,
    pub snapshot: SigningKey,
    pub mirrors: SigningKey,
}

impl Keys {
    pub fn new() -> Self {
        Keys {
            root: [
                SigningKey::from_bytes(&[11; 32]),
                SigningKey::from_bytes(&[12; 32]),
                SigningKey::from_bytes(&[13; 32]),
            ],
            timestamp: SigningKey::from_bytes(&[21; 32]),
            snapshot: SigningKey::from_bytes(&[22; 32]),
            mirrors: SigningKey::from_bytes(&[23; 32]),
        }
    }

    pub fn root_key_ids(&self) -> Vec<KeyId> {
        self.root.iter().map(key_id).collect()
    }
}

/// Public key wrapper for a signing key.
pub fn public(key: &SigningKey) -> PublicKey {
    PublicKey::ed25519(hex::encode(key.verifying_key().as_bytes()))
}

/// Fingerprint of a signing key.
pub fn key_id(key: &SigningKey) -> KeyId {
    public(key).key_id()
}

/// Signs a payload with the given keys, producing wire bytes.
pub fn sign(payload: &Value, keys: &[&SigningKey]) -> Vec<u8> {
    // Canonicalization must match what the verifier recomputes, so go
    // through the same public code path.
    let shell = SignedDocument {
        signed: payload.clone(),
        signatures: Vec::new(),
    };
    let message = shell.canonical_signed().expect("canonical form");
    let signatures: Vec<Value> = keys
        .iter()
        .map(|key| {
            json!({
                "keyid": key_id(key),
                "sig": hex::encode(key.sign(&message).to_bytes()),
                "method": "ed25519",
            })
        })
        .collect();
    serde_json::to_vec(&json!({ "signed": payload, "signatures": signatures }))
        .expect("wire document")
}

/// Root payload requiring 2 of the 3 root keys.
pub fn root_payload(keys: &Keys, version: u64, expires: DateTime<Utc>) -> Value {
    let mut key_table = serde_json::Map::new();
    for key in keys.root.iter().chain([&keys.timestamp, &keys.snapshot, &keys.mirrors]) {
        key_table.insert(
            key_id(key).as_str().to_string(),
            serde_json::to_value(public(key)).expect("key value"),
        );
    }
    json!({
        "_type": "root",
        "version": version,
        "expires": expires,
        "keys": Value::Object(key_table),
        "roles": {
            "root": { "keyids": keys.root_key_ids(), "threshold": 2 },
            "timestamp": { "keyids": [key_id(&keys.timestamp)], "threshold": 1 },
            "snapshot": { "keyids": [key_id(&keys.snapshot)], "threshold": 1 },
            "mirrors": { "keyids": [key_id(&keys.mirrors)], "threshold": 1 },
        },
    })
}

/// One package to publish: name, version, tarball contents.
pub struct PackageFixture<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub tarball: &'a [u8],
}

/// Builds the complete file map of one repository generation.
///
/// Contains root/timestamp/snapshot metadata, the index in both encodings,
/// and every package tarball under `package/`.
pub fn repo_files(
    keys: &Keys,
    root_bytes: &[u8],
    version: u64,
    packages: &[PackageFixture<'_>],
) -> BTreeMap<String, Vec<u8>> {
    let expires = hours_from_now(12);
    let mut files = BTreeMap::new();

    let mut index_entries: Vec<(String, Vec<u8>)> = Vec::new();
    for package in packages {
        let tarball_path = format!("package/{}-{}.tar.gz", package.name, package.version);
        let mut targets = serde_json::Map::new();
        targets.insert(
            tarball_path.clone(),
            serde_json::to_value(FileInfo::from_slice(package.tarball)).expect("file info"),
        );
        let targets_doc = sign(
            &json!({
                "_type": "targets",
                "version": 1,
                "expires": expires,
                "targets": targets,
            }),
            &[],
        );
        index_entries.push((
            format!("{}/{}/package.json", package.name, package.version),
            targets_doc,
        ));
        files.insert(tarball_path, package.tarball.to_vec());
    }
    let entries: Vec<(&str, &[u8])> = index_entries
        .iter()
        .map(|(path, bytes)| (path.as_str(), bytes.as_slice()))
        .collect();
    let tar = tar_archive(&entries);
    let tgz = gzip(&tar);

    let snapshot = sign(
        &json!({
            "_type": "snapshot",
            "version": version,
            "expires": expires,
            "meta": {
                "root.json": FileInfo::from_slice(root_bytes),
                "index.tar": FileInfo::from_slice(&tar),
                "index.tar.gz": FileInfo::from_slice(&tgz),
            },
        }),
        &[&keys.snapshot],
    );
    let timestamp = sign(
        &json!({
            "_type": "timestamp",
            "version": version,
            "expires": expires,
            "meta": { "snapshot.json": FileInfo::from_slice(&snapshot) },
        }),
        &[&keys.timestamp],
    );

    files.insert("root.json".to_string(), root_bytes.to_vec());
    files.insert("timestamp.json".to_string(), timestamp);
    files.insert("snapshot.json".to_string(), snapshot);
    files.insert("index.tar".to_string(), tar);
    files.insert("index.tar.gz".to_string(), tgz);
    files
}

/// Registers every file with the server (any number of hits allowed).
pub fn serve(server: &Server, files: &BTreeMap<String, Vec<u8>>) {
    for (path, bytes) in files {
        server.expect(
            Expectation::matching(request::method_path("GET", format!("/{path}")))
                .times(0..)
                .respond_with(status_code(200).body(bytes.clone())),
        );
    }
}

/// Builds an ustar archive from `(path, contents)` entries.
pub fn tar_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (path, contents) in entries {
        out.extend_from_slice(&tar_header(path, contents.len() as u64));
        out.extend_from_slice(contents);
        let pad = (512 - contents.len() % 512) % 512;
        out.extend_from_slice(&vec![0u8; pad]);
    }
    out.extend_from_slice(&[0u8; 1024]);
    out
}

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

/// Gzip-compresses a byte slice.
pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    use std::io::Write;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).expect("gzip write");
    encoder.finish().expect("gzip finish")
}
