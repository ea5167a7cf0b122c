//! Package resolution and hash-gated tarball download.
//!
//! Runs only after a successful update cycle: the cached index is already
//! attested by the trusted snapshot, so the per-package targets documents it
//! contains are admitted en bloc. The downloader resolves a package against
//! the index, extracts the tarball's attested file info, and refuses to
//! deliver bytes that do not match it.

use std::path::Path;

use crate::cache::MetadataCache;
use crate::error::{Error, Result};
use crate::index::TarIndex;
use crate::metadata::{PackageTargets, SignedDocument, INDEX_TAR};
use crate::remote::{RemoteError, RemoteFile, RemoteRepository};
use crate::trust::{Trusted, VerificationError};

/// Name plus version identifying one package release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageId {
    pub name: String,
    pub version: String,
}

impl PackageId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        PackageId {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Index path of the package's targets document.
    pub fn targets_path(&self) -> String {
        format!("{}/{}/package.json", self.name, self.version)
    }

    /// Repository-relative path of the package tarball.
    pub fn tarball_path(&self) -> String {
        format!("package/{self}.tar.gz")
    }
}

impl std::fmt::Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

/// Downloads packages gated on the locally trusted index.
pub struct PackageDownloader<'a, R> {
    repository: &'a R,
    cache: &'a MetadataCache,
}

impl<'a, R: RemoteRepository> PackageDownloader<'a, R> {
    /// Builds a downloader over a remote repository and a local cache.
    pub fn new(repository: &'a R, cache: &'a MetadataCache) -> Self {
        PackageDownloader { repository, cache }
    }

    /// Downloads `package` to `dest`, verifying it against the index.
    pub fn download(&self, package: &PackageId, dest: &Path) -> Result<()> {
        self.repository
            .with_mirror(|| self.cache.locked(|| self.download_inner(package, dest)))
    }

    fn download_inner(&self, package: &PackageId, dest: &Path) -> Result<()> {
        // The trusted root must be present; index admission hangs off it.
        let _cached = self.cache.cached_info()?;
        let index_bytes = self.cache.index_bytes()?.ok_or_else(|| {
            Error::LocalFileCorrupted("no package index in cache; run an update first".to_string())
        })?;
        let index = TarIndex::parse(index_bytes)
            .map_err(|e| invalid_index_file(INDEX_TAR, &e))?;

        let targets_path = package.targets_path();
        let Some(entry_bytes) = index
            .entry_bytes(&targets_path)
            .map_err(|e| invalid_index_file(&targets_path, &e))?
        else {
            tracing::debug!(%package, path = %targets_path, "package not present in index");
            return Err(Error::InvalidPackage(package.clone()));
        };
        let targets = self.admit_package_targets(&targets_path, &entry_bytes)?;

        let tarball_path = package.tarball_path();
        let Some(info) = targets.targets.get(&tarball_path) else {
            return Err(VerificationError::UnknownTarget(tarball_path).into());
        };

        let fetched = self
            .repository
            .fetch(0, &RemoteFile::Package(tarball_path.clone()))?;
        if !fetched.staged.verify(info).map_err(RemoteError::Io)? {
            return Err(VerificationError::FileInfo(tarball_path).into());
        }
        fetched.staged.copy_to(dest).map_err(RemoteError::Io)?;
        tracing::info!(%package, dest = %dest.display(), "package downloaded and verified");
        Ok(())
    }

    /// Admits a targets document extracted from the trusted index.
    ///
    /// The index arrived hash-attested by the snapshot, so the document is
    /// trusted en bloc today. Per-target author signatures, once the
    /// repository publishes them, get verified here before admission.
    fn admit_package_targets(
        &self,
        file: &str,
        bytes: &[u8],
    ) -> Result<Trusted<PackageTargets>> {
        let document =
            SignedDocument::from_slice(bytes).map_err(|e| invalid_index_file(file, &e))?;
        let targets: PackageTargets =
            document.parse().map_err(|e| invalid_index_file(file, &e))?;
        Ok(Trusted::admit(targets))
    }
}

/// Maps index-content failures onto the fatal error class.
fn invalid_index_file(file: &str, cause: &dyn std::fmt::Display) -> Error {
    Error::InvalidFileInIndex {
        file: file.to_string(),
        cause: cause.to_string(),
    }
}
