//! Crate-level error taxonomy.
//!
//! Two classes: recoverable errors participate in (or result from) the
//! driver's retry loop and are safe to retry from the caller's side, while
//! fatal errors indicate a broken local invariant that retrying cannot fix.

use thiserror::Error;

use crate::cache::CacheError;
use crate::download::PackageId;
use crate::remote::RemoteError;
use crate::trust::VerificationError;

/// Errors surfaced by the update driver, bootstrapper, and downloader.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote metadata failed verification.
    #[error("verification failed: {0}")]
    Verification(#[from] VerificationError),
    /// Root metadata was rotated; the current iteration was abandoned
    /// before committing any staged files.
    #[error("root metadata was updated; update restarted")]
    RootUpdated,
    /// The requested package does not exist in the index.
    #[error("unknown package '{0}'")]
    InvalidPackage(PackageId),
    /// A file inside the verified index could not be used.
    #[error("invalid file '{file}' in package index: {cause}")]
    InvalidFileInIndex { file: String, cause: String },
    /// Locally cached state is corrupt.
    #[error("local cache corrupted: {0}")]
    LocalFileCorrupted(String),
    /// The remote repository could not be reached or misbehaved.
    #[error("remote repository error: {0}")]
    Remote(#[from] RemoteError),
}

impl Error {
    /// `true` for errors that retrying (or re-running the update) may fix.
    ///
    /// [`Error::LocalFileCorrupted`] and [`Error::InvalidFileInIndex`]
    /// indicate broken local invariants, not an attack, and are final.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Verification(_)
            | Error::RootUpdated
            | Error::InvalidPackage(_)
            | Error::Remote(_) => true,
            Error::LocalFileCorrupted(_) | Error::InvalidFileInIndex { .. } => false,
        }
    }
}

impl From<CacheError> for Error {
    /// Cache failures are local by definition.
    fn from(err: CacheError) -> Self {
        Error::LocalFileCorrupted(err.to_string())
    }
}

/// Convenience alias for crate results.
pub type Result<T> = std::result::Result<T, Error>;
