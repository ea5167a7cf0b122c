//! Trust evaluation for signed metadata.
//!
//! This module owns every path by which a document becomes [`Trusted`]:
//! role verification against a trusted root (signature threshold, version
//! monotonicity, expiry), pinned-fingerprint verification during bootstrap,
//! and root succession (old-then-new thresholds). The cache re-admits
//! previously verified files through a crate-private constructor; nothing
//! else can mint a `Trusted` value.

use std::collections::HashSet;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::fileinfo::FileInfo;
use crate::keys::{KeyEnv, KeyId};
use crate::metadata::{RoleDocument, Root, Signature, SignedDocument, Snapshot, Timestamp};

/// Verification failures. All variants are recoverable at the driver level
/// except as part of a [`VerificationError::Loop`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerificationError {
    /// Fewer than `threshold` distinct valid signatures from authorized keys.
    #[error("'{role}' has {valid} valid signature(s), {threshold} required")]
    Signatures {
        role: String,
        threshold: u32,
        valid: u32,
    },
    /// The document's version is older than the trusted predecessor's.
    #[error("version rollback: trusted version {stored}, received {received}")]
    Version { stored: u64, received: u64 },
    /// The document's expiry is in the past.
    #[error("metadata expired at {expires}")]
    Expired { expires: DateTime<Utc> },
    /// An artifact did not match its attested file info.
    #[error("file info mismatch for '{0}'")]
    FileInfo(String),
    /// A targets document does not list the requested path.
    #[error("target '{0}' not listed in its targets document")]
    UnknownTarget(String),
    /// A document could not be decoded.
    #[error("cannot deserialize '{path}': {cause}")]
    Deserialization { path: String, cause: String },
    /// The retry ceiling was reached without a clean iteration.
    #[error("update aborted after {n} failed attempt(s): {0}", n = .0.len())]
    Loop(VerificationHistory),
}

impl VerificationError {
    /// Builds a [`VerificationError::Deserialization`] from any displayable cause.
    pub(crate) fn deserialization(path: &str, cause: impl std::fmt::Display) -> Self {
        VerificationError::Deserialization {
            path: path.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Why one driver iteration was abandoned.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateFailure {
    /// A sub-step failed verification; a root refresh followed.
    Verification(VerificationError),
    /// The root was rotated mid-iteration and staged work was discarded.
    RootRotated,
}

impl std::fmt::Display for UpdateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateFailure::Verification(err) => err.fmt(f),
            UpdateFailure::RootRotated => f.write_str("root metadata rotated"),
        }
    }
}

/// Record of abandoned iterations within a single update call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerificationHistory(Vec<UpdateFailure>);

impl VerificationHistory {
    /// Appends one abandoned-iteration record.
    pub fn record(&mut self, failure: UpdateFailure) {
        self.0.push(failure);
    }

    /// Number of abandoned iterations so far.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` when no iteration has been abandoned.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The recorded failures, oldest first.
    pub fn entries(&self) -> &[UpdateFailure] {
        &self.0
    }
}

impl std::fmt::Display for VerificationHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, failure) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "attempt {}: {failure}", idx + 1)?;
        }
        Ok(())
    }
}

/// Marker wrapper asserting a value passed verification.
///
/// There is no public constructor; values enter the trusted realm through
/// the verification functions below or through the cache's local-file
/// admission. Read access goes through `Deref`.
#[derive(Debug, Clone)]
pub struct Trusted<T> {
    inner: T,
}

impl<T> Trusted<T> {
    /// Crate-private admission; public paths all verify first.
    pub(crate) fn admit(inner: T) -> Self {
        Trusted { inner }
    }

    /// Consumes the wrapper, returning the inner value.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> Deref for Trusted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

/// Extracts the attested snapshot info from a trusted timestamp.
pub fn trusted_snapshot_info(timestamp: &Trusted<Timestamp>) -> Option<Trusted<FileInfo>> {
    timestamp.snapshot_info().cloned().map(Trusted::admit)
}

/// Extracts the attested root info from a trusted snapshot.
pub fn trusted_root_info(snapshot: &Trusted<Snapshot>) -> Option<Trusted<FileInfo>> {
    snapshot.root_info().cloned().map(Trusted::admit)
}

/// Extracts the attested mirrors info from a trusted snapshot.
pub fn trusted_mirrors_info(snapshot: &Trusted<Snapshot>) -> Option<Trusted<FileInfo>> {
    snapshot.mirrors_info().cloned().map(Trusted::admit)
}

/// Extracts the attested index info (preferring the gzip entry) from a
/// trusted snapshot.
pub fn trusted_index_info(snapshot: &Trusted<Snapshot>) -> Option<Trusted<FileInfo>> {
    snapshot.preferred_index_info().cloned().map(Trusted::admit)
}

/// Verifies a role document against the trusted root.
///
/// Checks, in order: the signature threshold for `T::ROLE` under the root's
/// key table, version monotonicity against `prior_version` (when supplied),
/// and expiry against `now` (when supplied). `path` only labels errors.
pub fn verify_role<T: RoleDocument>(
    root: &Trusted<Root>,
    key_env: &KeyEnv,
    path: &str,
    prior_version: Option<u64>,
    now: Option<DateTime<Utc>>,
    bytes: &[u8],
) -> Result<Trusted<T>, VerificationError> {
    let document =
        SignedDocument::from_slice(bytes).map_err(|e| VerificationError::deserialization(path, e))?;

    let Some(role_keys) = root.roles.get(&T::ROLE) else {
        return Err(VerificationError::Signatures {
            role: T::ROLE.to_string(),
            threshold: 0,
            valid: 0,
        });
    };
    check_threshold(
        &document,
        path,
        T::ROLE.to_string(),
        &role_keys.keyids,
        role_keys.threshold,
        key_env,
    )?;

    let payload: T = document
        .parse()
        .map_err(|e| VerificationError::deserialization(path, e))?;
    check_version_and_expiry(&payload, prior_version, now)?;
    Ok(Trusted::admit(payload))
}

/// Verifies a root document against caller-pinned key fingerprints.
///
/// Used only during bootstrap. The public keys come from the candidate root
/// itself; the pinned fingerprints bind them, since a fingerprint commits to
/// the exact key material. A threshold of zero means trust-on-first-use.
/// The accepted root must additionally satisfy its own root-role threshold,
/// otherwise it could never verify a successor.
pub fn verify_fingerprints(
    pinned: &[KeyId],
    threshold: u32,
    path: &str,
    bytes: &[u8],
) -> Result<Trusted<Root>, VerificationError> {
    let document =
        SignedDocument::from_slice(bytes).map_err(|e| VerificationError::deserialization(path, e))?;
    let candidate: Root = document
        .parse()
        .map_err(|e| VerificationError::deserialization(path, e))?;
    let candidate_env = KeyEnv::from_root(&candidate);

    check_threshold(
        &document,
        path,
        "root (pinned fingerprints)".to_string(),
        pinned,
        threshold,
        &candidate_env,
    )?;
    check_self_threshold(&document, path, &candidate, &candidate_env)?;
    Ok(Trusted::admit(candidate))
}

/// Verifies a replacement root under both the old and the new thresholds.
///
/// Continuity: the candidate must satisfy the currently trusted root's
/// root-role threshold. Self-consistency: it must also satisfy the root-role
/// threshold it declares for itself. Either failure rejects the succession.
pub fn verify_root_succession(
    old_root: &Trusted<Root>,
    old_env: &KeyEnv,
    path: &str,
    now: Option<DateTime<Utc>>,
    bytes: &[u8],
) -> Result<Trusted<Root>, VerificationError> {
    let candidate: Trusted<Root> = verify_role(
        old_root,
        old_env,
        path,
        Some(old_root.version),
        now,
        bytes,
    )?;

    let document =
        SignedDocument::from_slice(bytes).map_err(|e| VerificationError::deserialization(path, e))?;
    let candidate_env = KeyEnv::from_root(&candidate);
    check_self_threshold(&document, path, &candidate, &candidate_env)?;
    Ok(candidate)
}

/// Checks an artifact's bytes against an attested file info.
pub fn verify_file_info(expected: &FileInfo, artifact: &[u8]) -> bool {
    expected.verifies(artifact)
}

/// Counts distinct valid signatures from `authorized` keys and enforces
/// `threshold`.
fn check_threshold(
    document: &SignedDocument,
    path: &str,
    role: String,
    authorized: &[KeyId],
    threshold: u32,
    key_env: &KeyEnv,
) -> Result<(), VerificationError> {
    let message = document
        .canonical_signed()
        .map_err(|e| VerificationError::deserialization(path, e))?;

    let mut valid: HashSet<&KeyId> = HashSet::new();
    for Signature { keyid, sig, method } in &document.signatures {
        if !authorized.contains(keyid) {
            continue;
        }
        let Some(key) = key_env.get(keyid) else {
            continue;
        };
        if key.keytype != *method {
            // Unknown or mismatched methods never count toward the threshold.
            continue;
        }
        if key.verify(&message, sig) {
            valid.insert(keyid);
        }
    }

    let valid = valid.len() as u32;
    if valid < threshold {
        tracing::warn!(%role, threshold, valid, path, "signature threshold not met");
        return Err(VerificationError::Signatures {
            role,
            threshold,
            valid,
        });
    }
    Ok(())
}

/// Enforces a candidate root's own root-role threshold.
fn check_self_threshold(
    document: &SignedDocument,
    path: &str,
    candidate: &Root,
    candidate_env: &KeyEnv,
) -> Result<(), VerificationError> {
    let Some(own_role) = candidate.roles.get(&crate::metadata::RoleName::Root) else {
        return Err(VerificationError::Signatures {
            role: "root (self)".to_string(),
            threshold: 0,
            valid: 0,
        });
    };
    check_threshold(
        document,
        path,
        "root (self)".to_string(),
        &own_role.keyids,
        own_role.threshold,
        candidate_env,
    )
}

/// Version and expiry checks shared by all role verifications.
fn check_version_and_expiry<T: RoleDocument>(
    payload: &T,
    prior_version: Option<u64>,
    now: Option<DateTime<Utc>>,
) -> Result<(), VerificationError> {
    if let Some(stored) = prior_version {
        let received = payload.version();
        if received < stored {
            return Err(VerificationError::Version { stored, received });
        }
    }
    if let Some(now) = now {
        let expires = payload.expires();
        if expires <= now {
            return Err(VerificationError::Expired { expires });
        }
    }
    Ok(())
}
