//! Public keys, key fingerprints, and signature verification.
//!
//! Root metadata carries the full key set for every role; this module owns
//! the wire representation of those keys and the ed25519 verification
//! primitive the trust engine counts thresholds with. A key's fingerprint
//! (its [`KeyId`]) is the SHA-256 of the canonical JSON form of the key
//! object, so a pinned fingerprint commits to the exact key material.

use std::collections::BTreeMap;

use olpc_cjson::CanonicalFormatter;
use serde::{Deserialize, Serialize};

use crate::fileinfo::sha256_hex;
use crate::metadata::{RoleName, Root};

/// Signature method string for ed25519, the only method we verify.
pub const METHOD_ED25519: &str = "ed25519";

/// Hex-encoded fingerprint identifying a public key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Wraps a hex fingerprint, normalising to lowercase.
    pub fn new(hex: impl Into<String>) -> Self {
        KeyId(hex.into().to_lowercase())
    }

    /// Returns the fingerprint as a hex string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public key as serialized inside root metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Key type; only `ed25519` keys verify.
    pub keytype: String,
    /// Key material container.
    pub keyval: KeyValue,
}

/// Key material wrapper mirroring the wire layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Hex-encoded 32-byte ed25519 public key.
    pub public: String,
}

impl PublicKey {
    /// Constructs an ed25519 key from hex-encoded public material.
    pub fn ed25519(public_hex: impl Into<String>) -> Self {
        PublicKey {
            keytype: METHOD_ED25519.to_string(),
            keyval: KeyValue {
                public: public_hex.into(),
            },
        }
    }

    /// Computes the fingerprint of this key.
    ///
    /// The fingerprint is the SHA-256 of the canonical JSON serialization of
    /// the key object, so any change to the key material or type yields a
    /// different id.
    pub fn key_id(&self) -> KeyId {
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
        // Serialization of a plain struct into a Vec cannot fail.
        self.serialize(&mut ser)
            .expect("public key canonical serialization");
        KeyId::new(sha256_hex(&buf))
    }

    /// Verifies an ed25519 signature over `message`.
    ///
    /// Returns `false` for malformed key material, malformed signatures, and
    /// non-ed25519 key types alike; the caller only counts successes.
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> bool {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};

        if self.keytype != METHOD_ED25519 {
            return false;
        }
        let Ok(public_bytes) = hex::decode(&self.keyval.public) else {
            return false;
        };
        let Ok(public_arr) = <[u8; 32]>::try_from(public_bytes.as_slice()) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&public_arr) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(sig_arr) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_arr);
        key.verify(message, &signature).is_ok()
    }
}

/// Key environment derived from a trusted root: fingerprint → public key.
///
/// Keys whose advertised fingerprint does not match the recomputed one are
/// dropped on construction, so a forged root cannot smuggle arbitrary key
/// material under a pinned id.
#[derive(Debug, Clone, Default)]
pub struct KeyEnv {
    keys: BTreeMap<KeyId, PublicKey>,
}

impl KeyEnv {
    /// Builds the environment from a root document's key table.
    pub fn from_root(root: &Root) -> Self {
        let mut keys = BTreeMap::new();
        for (claimed_id, key) in &root.keys {
            if key.key_id() == *claimed_id {
                keys.insert(claimed_id.clone(), key.clone());
            } else {
                tracing::warn!(
                    keyid = %claimed_id,
                    "root lists a key whose fingerprint does not match; ignoring it"
                );
            }
        }
        KeyEnv { keys }
    }

    /// Looks up a key by fingerprint.
    pub fn get(&self, keyid: &KeyId) -> Option<&PublicKey> {
        self.keys.get(keyid)
    }

    /// Returns the keys authorized for `role` per the root's role table.
    pub fn role_keys<'a>(&'a self, root: &'a Root, role: RoleName) -> Vec<(&'a KeyId, &'a PublicKey)> {
        match root.roles.get(&role) {
            Some(role_keys) => role_keys
                .keyids
                .iter()
                .filter_map(|id| self.keys.get(id).map(|key| (id, key)))
                .collect(),
            None => Vec::new(),
        }
    }
}
