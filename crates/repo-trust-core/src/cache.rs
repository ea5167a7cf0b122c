//! Sled-backed storage for locally trusted metadata and the package index.
//!
//! The cache holds the four role documents plus the uncompressed index tar,
//! keyed by their canonical file names. An identity record ties the cache to
//! one repository URL and client version; opening a cache whose identity
//! differs discards it and starts clean, so state from one repository can
//! never leak into another.
//!
//! Files read back from the cache are re-admitted as trusted without
//! re-verifying signatures: they were verified when they entered, and the
//! chain of trust is anchored at the root, which was either bootstrapped or
//! verified by its predecessor.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::{Config as SledConfig, Db, Tree};
use thiserror::Error;
use time::OffsetDateTime;

use crate::fileinfo::FileInfo;
use crate::keys::KeyEnv;
use crate::metadata::{Mirrors, RoleName, Root, SignedDocument, Snapshot, Timestamp, INDEX_TAR};
use crate::trust::{self, Trusted};

/// Tree holding the cache identity record.
const META_TREE: &str = "__meta";
/// Key of the JSON-encoded [`CacheIdentity`].
const IDENTITY_KEY: &[u8] = b"identity.json";
/// Tree holding trusted metadata documents and the index.
const DATA_TREE: &str = "trusted_metadata";

/// Errors emitted by the metadata cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no trusted root in cache; bootstrap first")]
    MissingRoot,
    #[error("cached file '{file}' is corrupt: {cause}")]
    Corrupt { file: String, cause: String },
}

/// Convenience alias for cache results.
type Result<T> = std::result::Result<T, CacheError>;

/// Identity record persisted alongside the cached metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheIdentity {
    /// Repository base URL this cache belongs to.
    pub repository_url: String,
    /// Client version that created the cache.
    pub client_version: String,
    /// RFC3339 timestamp when the cache was created.
    pub creation_time: OffsetDateTime,
}

/// Staged writes applied to the cache in one atomic step.
#[derive(Debug, Default)]
pub struct CacheBatch {
    batch: sled::Batch,
}

impl CacheBatch {
    /// Stages a role document for commit.
    pub fn put_role(&mut self, role: RoleName, bytes: &[u8]) {
        self.batch.insert(role.file_name().as_bytes(), bytes);
    }

    /// Stages the uncompressed index tar for commit.
    pub fn put_index(&mut self, bytes: &[u8]) {
        self.batch.insert(INDEX_TAR.as_bytes(), bytes);
    }
}

/// Store for locally trusted metadata, scoped to one repository.
#[derive(Debug, Clone)]
pub struct MetadataCache {
    db: Db,
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl MetadataCache {
    /// Opens (or creates) a cache at `path` for the given repository.
    ///
    /// An existing cache with a different repository URL or client version
    /// is discarded and recreated; mixing trusted state across repositories
    /// would break the version-monotonicity evidence the cache exists to keep.
    pub fn open<P, S1, S2>(path: P, repository_url: S1, client_version: S2) -> Result<Self>
    where
        P: AsRef<Path>,
        S1: AsRef<str>,
        S2: AsRef<str>,
    {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories automatically.
                fs::create_dir_all(parent)?;
            }
        }
        let repository_url = repository_url.as_ref();
        let client_version = client_version.as_ref();

        match sled_config(&path).open() {
            Ok(db) => {
                let cache = MetadataCache::from_db(db, path.clone());
                if cache.identity_matches(repository_url, client_version)? {
                    Ok(cache)
                } else {
                    tracing::warn!(
                        path = %path.display(),
                        repository_url,
                        "cache identity mismatch; discarding cached state"
                    );
                    drop(cache);
                    reset_path(&path)?;
                    let db = sled_config(&path).open()?;
                    let cache = MetadataCache::from_db(db, path);
                    cache.write_identity(repository_url, client_version)?;
                    Ok(cache)
                }
            }
            Err(sled::Error::Io(_)) => {
                // Stale locks or damaged files; rebuild from scratch.
                reset_path(&path)?;
                let db = sled_config(&path).open()?;
                let cache = MetadataCache::from_db(db, path);
                cache.write_identity(repository_url, client_version)?;
                Ok(cache)
            }
            Err(err) => Err(CacheError::Db(err)),
        }
    }

    /// Opens an in-memory cache (state is lost on drop).
    pub fn open_ephemeral<S1, S2>(repository_url: S1, client_version: S2) -> Result<Self>
    where
        S1: AsRef<str>,
        S2: AsRef<str>,
    {
        let db = SledConfig::new().temporary(true).open()?;
        let cache = MetadataCache::from_db(db, PathBuf::new());
        cache.write_identity(repository_url.as_ref(), client_version.as_ref())?;
        Ok(cache)
    }

    fn from_db(db: Db, path: PathBuf) -> Self {
        MetadataCache {
            db,
            path,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Filesystem path backing the cache (empty for ephemeral caches).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the persisted identity record.
    pub fn identity(&self) -> Result<CacheIdentity> {
        let tree = self.db.open_tree(META_TREE)?;
        let Some(bytes) = tree.get(IDENTITY_KEY)? else {
            return Err(CacheError::Corrupt {
                file: "identity.json".to_string(),
                cause: "identity record missing".to_string(),
            });
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Runs `action` while holding the cache lock.
    ///
    /// The lock must span the whole verification-then-commit window of an
    /// update or download call; concurrent callers serialize here.
    pub fn locked<R>(&self, action: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock().expect("cache lock poisoned");
        action()
    }

    /// Raw bytes of a cached role document, if present.
    pub fn role_bytes(&self, role: RoleName) -> Result<Option<Vec<u8>>> {
        let tree = self.data_tree()?;
        Ok(tree.get(role.file_name().as_bytes())?.map(|v| v.to_vec()))
    }

    /// Raw bytes of the cached root document.
    ///
    /// The root must exist after bootstrap; absence is an error.
    pub fn root_bytes(&self) -> Result<Vec<u8>> {
        self.role_bytes(RoleName::Root)?.ok_or(CacheError::MissingRoot)
    }

    /// Raw bytes of the cached uncompressed index tar, if present.
    pub fn index_bytes(&self) -> Result<Option<Vec<u8>>> {
        let tree = self.data_tree()?;
        Ok(tree.get(INDEX_TAR.as_bytes())?.map(|v| v.to_vec()))
    }

    /// Writes one role document immediately (bootstrap and root refresh).
    pub fn put_role(&self, role: RoleName, bytes: &[u8]) -> Result<()> {
        let tree = self.data_tree()?;
        tree.insert(role.file_name().as_bytes(), bytes)?;
        tree.flush()?;
        Ok(())
    }

    /// Applies a staged batch atomically and flushes it to disk.
    pub fn commit(&self, batch: CacheBatch) -> Result<()> {
        let tree = self.data_tree()?;
        tree.apply_batch(batch.batch)?;
        tree.flush()?;
        Ok(())
    }

    /// Drops timestamp, snapshot, and mirrors; root and index survive.
    ///
    /// Runs after a root rotation: the subordinate documents were verified
    /// under keys that may no longer be authorized, while the index content
    /// is re-attested by the next snapshot before it is used again.
    pub fn clear_roles(&self) -> Result<()> {
        let tree = self.data_tree()?;
        let mut batch = sled::Batch::default();
        for role in [RoleName::Timestamp, RoleName::Snapshot, RoleName::Mirrors] {
            batch.remove(role.file_name().as_bytes());
        }
        tree.apply_batch(batch)?;
        tree.flush()?;
        Ok(())
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Loads the trusted local state for one driver iteration.
    ///
    /// The root must be present; timestamp, snapshot, and mirrors are
    /// admitted when cached. Parse failures are local corruption, not an
    /// attack, and surface as [`CacheError::Corrupt`].
    pub fn cached_info(&self) -> Result<CachedInfo> {
        let root_bytes = self.root_bytes()?;
        let root: Trusted<Root> = admit_cached(&root_bytes, RoleName::Root.file_name())?;
        let key_env = KeyEnv::from_root(&root);

        let timestamp = self
            .role_bytes(RoleName::Timestamp)?
            .map(|bytes| admit_cached::<Timestamp>(&bytes, RoleName::Timestamp.file_name()))
            .transpose()?;
        let snapshot = self
            .role_bytes(RoleName::Snapshot)?
            .map(|bytes| admit_cached::<Snapshot>(&bytes, RoleName::Snapshot.file_name()))
            .transpose()?;
        let mirrors = self
            .role_bytes(RoleName::Mirrors)?
            .map(|bytes| admit_cached::<Mirrors>(&bytes, RoleName::Mirrors.file_name()))
            .transpose()?;

        Ok(CachedInfo {
            root,
            root_bytes,
            key_env,
            timestamp,
            snapshot,
            mirrors,
        })
    }

    fn data_tree(&self) -> Result<Tree> {
        Ok(self.db.open_tree(DATA_TREE)?)
    }

    fn identity_matches(&self, repository_url: &str, client_version: &str) -> Result<bool> {
        let tree = self.db.open_tree(META_TREE)?;
        match tree.get(IDENTITY_KEY)? {
            None => {
                self.write_identity(repository_url, client_version)?;
                Ok(true)
            }
            Some(bytes) => {
                let identity: CacheIdentity = serde_json::from_slice(&bytes)?;
                Ok(identity.repository_url == repository_url
                    && identity.client_version == client_version)
            }
        }
    }

    fn write_identity(&self, repository_url: &str, client_version: &str) -> Result<()> {
        let identity = CacheIdentity {
            repository_url: repository_url.to_string(),
            client_version: client_version.to_string(),
            creation_time: OffsetDateTime::now_utc(),
        };
        let tree = self.db.open_tree(META_TREE)?;
        tree.insert(IDENTITY_KEY, serde_json::to_vec(&identity)?)?;
        tree.flush()?;
        Ok(())
    }
}

/// Per-iteration snapshot of the locally trusted state.
#[derive(Debug, Clone)]
pub struct CachedInfo {
    /// The trusted root; always present after bootstrap.
    pub root: Trusted<Root>,
    /// Raw bytes of the cached root (hash comparisons during root refresh).
    pub root_bytes: Vec<u8>,
    /// Key environment derived from the trusted root.
    pub key_env: KeyEnv,
    pub timestamp: Option<Trusted<Timestamp>>,
    pub snapshot: Option<Trusted<Snapshot>>,
    pub mirrors: Option<Trusted<Mirrors>>,
}

impl CachedInfo {
    /// Snapshot info attested by the cached timestamp.
    pub fn snapshot_info(&self) -> Option<Trusted<FileInfo>> {
        self.timestamp.as_ref().and_then(trust::trusted_snapshot_info)
    }

    /// Root info attested by the cached snapshot.
    pub fn root_info(&self) -> Option<Trusted<FileInfo>> {
        self.snapshot.as_ref().and_then(trust::trusted_root_info)
    }

    /// Mirrors info attested by the cached snapshot.
    pub fn mirrors_info(&self) -> Option<Trusted<FileInfo>> {
        self.snapshot.as_ref().and_then(trust::trusted_mirrors_info)
    }

    /// Index info attested by the cached snapshot.
    pub fn index_info(&self) -> Option<Trusted<FileInfo>> {
        self.snapshot.as_ref().and_then(trust::trusted_index_info)
    }
}

/// Re-admits a cached document as trusted without re-verifying signatures.
fn admit_cached<T: DeserializeOwned>(bytes: &[u8], file: &str) -> Result<Trusted<T>> {
    let corrupt = |cause: &dyn std::fmt::Display| CacheError::Corrupt {
        file: file.to_string(),
        cause: cause.to_string(),
    };
    let document = SignedDocument::from_slice(bytes).map_err(|e| corrupt(&e))?;
    let payload: T = document.parse().map_err(|e| corrupt(&e))?;
    Ok(Trusted::admit(payload))
}

/// Builds the sled configuration for a cache path.
fn sled_config(path: &Path) -> SledConfig {
    SledConfig::new().path(path).cache_capacity(16 * 1024 * 1024)
}

/// Deletes the cache file or directory to start from a clean slate.
fn reset_path(path: &Path) -> Result<()> {
    if path.exists() {
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}
