//! Initial acquisition of root metadata.
//!
//! Before the first update a client has no trusted root to verify anything
//! against. Bootstrap fetches the remote root and verifies it only against
//! caller-supplied pinned key fingerprints (obtained out of band), then
//! commits it and clears any unrelated cached state. Bootstrapping never
//! retries; any failure is surfaced directly.

use crate::cache::MetadataCache;
use crate::error::Result;
use crate::keys::KeyId;
use crate::metadata::{RoleName, META_ROOT};
use crate::remote::{RemoteError, RemoteFile, RemoteRepository};
use crate::trust;

/// One-shot acquirer of the initial trusted root.
pub struct Bootstrapper<'a, R> {
    repository: &'a R,
    cache: &'a MetadataCache,
}

impl<'a, R: RemoteRepository> Bootstrapper<'a, R> {
    /// Builds a bootstrapper over a remote repository and a local cache.
    pub fn new(repository: &'a R, cache: &'a MetadataCache) -> Self {
        Bootstrapper { repository, cache }
    }

    /// Fetches and pins the initial root.
    ///
    /// The root must carry at least `threshold` valid signatures from keys
    /// whose fingerprints appear in `pinned`. A threshold of zero means
    /// trust-on-first-use: the first root the repository serves is adopted.
    /// On success the root is committed and timestamp/snapshot/mirrors are
    /// dropped, discarding any pre-existing unrelated state.
    pub fn run(&self, pinned: &[KeyId], threshold: u32) -> Result<()> {
        self.repository
            .with_mirror(|| self.cache.locked(|| self.run_inner(pinned, threshold)))
    }

    fn run_inner(&self, pinned: &[KeyId], threshold: u32) -> Result<()> {
        let fetched = self.repository.fetch(0, &RemoteFile::Role(RoleName::Root))?;
        let bytes = fetched.staged.read().map_err(RemoteError::Io)?;
        let root = trust::verify_fingerprints(pinned, threshold, META_ROOT, &bytes)?;
        self.cache.put_role(RoleName::Root, &bytes)?;
        self.cache.clear_roles()?;
        tracing::info!(
            version = root.version,
            pinned = pinned.len(),
            threshold,
            "trusted root bootstrapped"
        );
        Ok(())
    }
}
