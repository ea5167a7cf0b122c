//! Client-side update and verification core for a TUF-style package
//! repository.
//!
//! The crate orchestrates the trust-chain update protocol: it fetches,
//! verifies, and caches the four signed metadata roles (root, timestamp,
//! snapshot, mirrors) plus the package index, detects rollback and freeze
//! attacks, bootstraps trust from out-of-band pinned key fingerprints, and
//! gates package downloads on hash verification against signed metadata.
//!
//! The usual flow: [`Bootstrapper`] pins the initial root once, then
//! [`UpdateDriver::check_for_updates`] keeps the local [`MetadataCache`]
//! current, and [`PackageDownloader`] delivers hash-verified tarballs
//! resolved through the cached index.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod download;
pub mod driver;
pub mod error;
pub mod fileinfo;
pub mod index;
pub mod keys;
pub mod metadata;
pub mod remote;
pub mod trust;

#[cfg(test)]
mod test_support;

pub use bootstrap::Bootstrapper;
pub use cache::{CacheBatch, CacheError, CacheIdentity, CachedInfo, MetadataCache};
pub use config::ClientEnv;
pub use download::{PackageDownloader, PackageId};
pub use driver::{UpdateDriver, UpdateOutcome};
pub use error::{Error, Result};
pub use fileinfo::FileInfo;
pub use index::{IndexEntry, IndexError, IndexReader, TarIndex};
pub use keys::{KeyEnv, KeyId, PublicKey};
pub use metadata::{
    Mirror, MirrorContent, Mirrors, PackageTargets, RoleDocument, RoleKeys, RoleName, Root,
    Signature, SignedDocument, Snapshot, Timestamp,
};
pub use remote::{
    DownloadFormat, Fetched, HttpRepository, RemoteError, RemoteFile, RemoteRepository, StagedFile,
};
pub use trust::{
    verify_file_info, verify_fingerprints, verify_role, verify_root_succession, Trusted,
    UpdateFailure, VerificationError, VerificationHistory,
};
