//! The update state machine.
//!
//! One `check_for_updates` call refreshes the metadata roles in protocol
//! order: timestamp first, then snapshot, then (when the snapshot says the
//! root moved) the root itself, then mirrors and the package index. Every
//! artifact is verified in staging and only committed to the cache once the
//! whole iteration succeeded, so a failure anywhere leaves the locally
//! trusted state untouched.
//!
//! Verification failures are treated as evidence of a stale local root: the
//! driver refreshes the root and retries the iteration. The retry ceiling
//! converts a sustained attack (for example an endless stream of rotations)
//! into a single reported verification loop instead of a livelock.

use chrono::{DateTime, Utc};

use crate::cache::{CacheBatch, MetadataCache};
use crate::error::{Error, Result};
use crate::fileinfo::{sha256_hex, FileInfo};
use crate::index::decompress_index;
use crate::metadata::{
    RoleName, Snapshot, Timestamp, META_ROOT, META_SNAPSHOT, META_TIMESTAMP, INDEX_TAR_GZ,
};
use crate::remote::{DownloadFormat, RemoteError, RemoteFile, RemoteRepository};
use crate::trust::{
    self, Trusted, UpdateFailure, VerificationError, VerificationHistory,
};

/// Retry ceiling for abandoned iterations within one update call.
///
/// Fixed but arbitrary; it bounds how long an attacker serving an infinite
/// sequence of root rotations can keep the client busy.
const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// Result of a successful update call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// New metadata (and possibly a new index) was committed to the cache.
    HasUpdates,
    /// The repository advertises the snapshot we already trust.
    NoUpdates,
}

/// Why the root updater is running.
enum RootRefreshReason {
    /// The snapshot advertised a new root file info; the staged root must
    /// match it, and the root is changed by assumption.
    NewInfo(Trusted<FileInfo>),
    /// A child verification step failed; any staged root is acceptable and
    /// change is decided by comparing hashes.
    Verification,
}

/// Top-level update driver.
pub struct UpdateDriver<'a, R> {
    repository: &'a R,
    cache: &'a MetadataCache,
}

impl<'a, R: RemoteRepository> UpdateDriver<'a, R> {
    /// Builds a driver over a remote repository and a local cache.
    pub fn new(repository: &'a R, cache: &'a MetadataCache) -> Self {
        UpdateDriver { repository, cache }
    }

    /// Refreshes the trust chain against the remote repository.
    ///
    /// Passing `now` enables expiry checking; without it only signatures and
    /// version monotonicity are enforced. The whole call runs against a
    /// single mirror and holds the cache lock across its
    /// verification-then-commit window.
    pub fn check_for_updates(&self, now: Option<DateTime<Utc>>) -> Result<UpdateOutcome> {
        // A mirrors document committed by an earlier call takes effect now;
        // the selection never changes mid-protocol.
        let info = self.cache.cached_info()?;
        if let Some(mirrors) = &info.mirrors {
            self.repository.apply_mirrors(&mirrors.mirrors);
        }
        drop(info);

        self.repository
            .with_mirror(|| self.cache.locked(|| self.run_update(now)))
    }

    /// The bounded retry loop around individual update iterations.
    fn run_update(&self, now: Option<DateTime<Utc>>) -> Result<UpdateOutcome> {
        let mut history = VerificationHistory::default();
        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            match self.update_iteration(attempt, now) {
                Ok(outcome) => return Ok(outcome),
                Err(Error::Verification(err)) => {
                    // Working hypothesis: our root is stale and the remote
                    // has rotated keys. Refresh it and try again; a failure
                    // of the refresh itself is surfaced as-is.
                    tracing::warn!(attempt, %err, "verification failed; refreshing root");
                    history.record(UpdateFailure::Verification(err));
                    self.refresh_root(attempt, RootRefreshReason::Verification, now)?;
                }
                Err(Error::RootUpdated) => {
                    tracing::info!(attempt, "root rotated; restarting update");
                    history.record(UpdateFailure::RootRotated);
                }
                Err(other) => return Err(other),
            }
        }
        Err(VerificationError::Loop(history).into())
    }

    /// One pass of the timestamp → snapshot → root? → mirrors → index order.
    fn update_iteration(
        &self,
        attempt: u32,
        now: Option<DateTime<Utc>>,
    ) -> Result<UpdateOutcome> {
        // Re-read local state every iteration; a root refresh in between
        // may have replaced the root and cleared the subordinate roles.
        let cached = self.cache.cached_info()?;

        // Timestamp.
        let timestamp_bytes = self.fetch_bytes(attempt, &RemoteFile::Role(RoleName::Timestamp))?;
        let new_timestamp: Trusted<Timestamp> = trust::verify_role(
            &cached.root,
            &cached.key_env,
            META_TIMESTAMP,
            cached.timestamp.as_ref().map(|t| t.version),
            now,
            &timestamp_bytes,
        )?;
        let new_snapshot_info = trust::trusted_snapshot_info(&new_timestamp).ok_or_else(|| {
            VerificationError::deserialization(META_TIMESTAMP, "missing snapshot meta entry")
        })?;

        // Freshness short-circuit: an unchanged snapshot means nothing below
        // it can have changed either.
        if let Some(cached_info) = cached.snapshot_info() {
            if cached_info.matches(&new_snapshot_info) {
                tracing::debug!("snapshot info unchanged; repository is current");
                return Ok(UpdateOutcome::NoUpdates);
            }
        }

        // Snapshot: hash-checked against the new timestamp, then verified.
        let snapshot_bytes = self.fetch_bytes(attempt, &RemoteFile::Role(RoleName::Snapshot))?;
        if !new_snapshot_info.verifies(&snapshot_bytes) {
            return Err(VerificationError::FileInfo(META_SNAPSHOT.to_string()).into());
        }
        let new_snapshot: Trusted<Snapshot> = trust::verify_role(
            &cached.root,
            &cached.key_env,
            META_SNAPSHOT,
            cached.snapshot.as_ref().map(|s| s.version),
            now,
            &snapshot_bytes,
        )?;
        if let (Some(prev), Some(prev_info)) = (cached.snapshot.as_ref(), cached.snapshot_info()) {
            // A different document under an unchanged version number defeats
            // the monotonicity evidence; require a strict bump on change.
            if new_snapshot.version == prev.version && !prev_info.matches(&new_snapshot_info) {
                return Err(VerificationError::Version {
                    stored: prev.version,
                    received: new_snapshot.version,
                }
                .into());
            }
        }

        // Root change detection. An absent cached root info means the first
        // iteration after bootstrap; treating that as a change would loop.
        if let (Some(cached_root_info), Some(new_root_info)) =
            (cached.root_info(), trust::trusted_root_info(&new_snapshot))
        {
            if !cached_root_info.matches(&new_root_info) {
                self.refresh_root(attempt, RootRefreshReason::NewInfo(new_root_info), now)?;
                // Abandon the iteration before anything staged is committed.
                return Err(Error::RootUpdated);
            }
        }

        let mut batch = CacheBatch::default();
        batch.put_role(RoleName::Timestamp, &timestamp_bytes);
        batch.put_role(RoleName::Snapshot, &snapshot_bytes);

        // Mirrors, when published and changed (or not yet cached).
        if let Some(new_info) = trust::trusted_mirrors_info(&new_snapshot) {
            let changed = match cached.mirrors_info() {
                Some(old) => !old.matches(&new_info),
                None => true,
            };
            if changed || cached.mirrors.is_none() {
                let bytes =
                    self.fetch_bytes(attempt, &RemoteFile::Role(RoleName::Mirrors))?;
                if !new_info.verifies(&bytes) {
                    return Err(
                        VerificationError::FileInfo(RoleName::Mirrors.file_name().to_string())
                            .into(),
                    );
                }
                trust::verify_role::<crate::metadata::Mirrors>(
                    &cached.root,
                    &cached.key_env,
                    RoleName::Mirrors.file_name(),
                    cached.mirrors.as_ref().map(|m| m.version),
                    now,
                    &bytes,
                )?;
                batch.put_role(RoleName::Mirrors, &bytes);
            }
        }

        // Package index, when changed (or not yet cached).
        if let Some(new_info) = trust::trusted_index_info(&new_snapshot) {
            let changed = match cached.index_info() {
                Some(old) => !old.matches(&new_info),
                None => true,
            };
            if changed || self.cache.index_bytes()?.is_none() {
                let fetched = self.repository.fetch(attempt, &RemoteFile::Index)?;
                let bytes = fetched.staged.read().map_err(RemoteError::Io)?;
                let gzipped = fetched.format == DownloadFormat::Gzip;
                // Verify against the info of the format actually delivered.
                let delivered_info = new_snapshot.index_info(gzipped).ok_or_else(|| {
                    VerificationError::deserialization(
                        META_SNAPSHOT,
                        format!("no meta entry for delivered index '{}'", fetched.path),
                    )
                })?;
                if !delivered_info.verifies(&bytes) {
                    return Err(VerificationError::FileInfo(fetched.path).into());
                }
                let tar = if gzipped {
                    // Hash-verified yet undecodable means the repository
                    // signed a broken index; retrying cannot help.
                    decompress_index(&bytes).map_err(|e| Error::InvalidFileInIndex {
                        file: INDEX_TAR_GZ.to_string(),
                        cause: e.to_string(),
                    })?
                } else {
                    bytes
                };
                batch.put_index(&tar);
            }
        }

        self.cache.commit(batch)?;
        tracing::info!(
            timestamp_version = new_timestamp.version,
            snapshot_version = new_snapshot.version,
            "trusted metadata updated"
        );
        Ok(UpdateOutcome::HasUpdates)
    }

    /// The root updater sub-protocol.
    ///
    /// Fetches the remote root, verifies it under the old trusted root's
    /// threshold and then under its own, commits it, and clears the
    /// subordinate roles if (and only if) the root actually changed.
    /// Clearing unconditionally would destroy legitimate version evidence;
    /// never clearing would let a compromised timestamp/snapshot key pin
    /// `version = MAX` and freeze the client forever.
    fn refresh_root(
        &self,
        attempt: u32,
        reason: RootRefreshReason,
        now: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let cached = self.cache.cached_info()?;
        let bytes = self.fetch_bytes(attempt, &RemoteFile::Role(RoleName::Root))?;
        if let RootRefreshReason::NewInfo(expected) = &reason {
            if !expected.verifies(&bytes) {
                return Err(VerificationError::FileInfo(META_ROOT.to_string()).into());
            }
        }
        let new_root = trust::verify_root_succession(
            &cached.root,
            &cached.key_env,
            META_ROOT,
            now,
            &bytes,
        )?;

        let changed = match reason {
            RootRefreshReason::NewInfo(_) => true,
            RootRefreshReason::Verification => {
                sha256_hex(&cached.root_bytes) != sha256_hex(&bytes)
            }
        };

        self.cache.put_role(RoleName::Root, &bytes)?;
        if changed {
            tracing::info!(
                old_version = cached.root.version,
                new_version = new_root.version,
                "root metadata changed; dropping subordinate roles"
            );
            self.cache.clear_roles()?;
        } else {
            tracing::debug!(version = new_root.version, "root metadata unchanged");
        }
        Ok(())
    }

    /// Fetches a remote file and reads its staged bytes.
    fn fetch_bytes(&self, attempt: u32, file: &RemoteFile) -> Result<Vec<u8>> {
        let fetched = self.repository.fetch(attempt, file)?;
        Ok(fetched.staged.read().map_err(RemoteError::Io)?)
    }
}
