//! Remote artifact fetching and staging.
//!
//! Downloads land in temporary staging files first; the driver verifies a
//! staged artifact against signed metadata before anything is promoted into
//! the cache, and abandoned staging files disappear with their handles.
//! The [`RemoteRepository`] trait keeps the transport swappable; the bundled
//! [`HttpRepository`] speaks plain HTTP(S) with gzip format negotiation for
//! the package index and honors the repository's published mirror list.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use reqwest::{StatusCode, Url};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::fileinfo::FileInfo;
use crate::metadata::{Mirror, RoleName, INDEX_TAR, INDEX_TAR_GZ};

/// Request timeout applied to every remote fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors surfaced by remote fetching.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The artifact was not found under any acceptable name.
    #[error("'{0}' was not found on the repository")]
    NotFound(String),
    /// The server answered with an unexpected status code.
    #[error("unexpected status {status} fetching '{path}'")]
    Status { status: u16, path: String },
    /// Networking or TLS failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Staging I/O failure.
    #[error("staging error: {0}")]
    Io(#[from] std::io::Error),
    /// The repository or mirror base URL is unusable.
    #[error("invalid repository url: {0}")]
    InvalidUrl(String),
}

/// Convenience alias for remote results.
type Result<T> = std::result::Result<T, RemoteError>;

/// Encoding an artifact was actually delivered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadFormat {
    Uncompressed,
    Gzip,
}

/// A remote artifact the driver can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFile {
    /// A role metadata document.
    Role(RoleName),
    /// The package index; served gzipped or plain, gzip preferred.
    Index,
    /// A package tarball at a repository-relative path.
    Package(String),
}

impl RemoteFile {
    /// Acceptable `(format, repository-relative path)` pairs, most
    /// preferred first.
    pub fn candidates(&self) -> Vec<(DownloadFormat, String)> {
        match self {
            RemoteFile::Role(role) => {
                vec![(DownloadFormat::Uncompressed, role.file_name().to_string())]
            }
            RemoteFile::Index => vec![
                (DownloadFormat::Gzip, INDEX_TAR_GZ.to_string()),
                (DownloadFormat::Uncompressed, INDEX_TAR.to_string()),
            ],
            RemoteFile::Package(path) => {
                vec![(DownloadFormat::Uncompressed, path.clone())]
            }
        }
    }
}

impl std::fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteFile::Role(role) => f.write_str(role.file_name()),
            RemoteFile::Index => f.write_str(INDEX_TAR_GZ),
            RemoteFile::Package(path) => f.write_str(path),
        }
    }
}

/// A downloaded artifact held in temporary storage.
///
/// The backing temp file is deleted when the handle drops, so abandoned
/// downloads never reach the cache.
#[derive(Debug)]
pub struct StagedFile {
    file: NamedTempFile,
    length: u64,
}

impl StagedFile {
    /// Stages an in-memory download.
    pub fn from_bytes(bytes: &[u8]) -> std::io::Result<Self> {
        let mut file = NamedTempFile::new()?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(StagedFile {
            file,
            length: bytes.len() as u64,
        })
    }

    /// Length of the staged artifact in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Checks the staged content against an attested file info.
    pub fn verify(&self, expected: &FileInfo) -> std::io::Result<bool> {
        if expected.length != self.length {
            return Ok(false);
        }
        let bytes = self.read()?;
        Ok(expected.verifies(&bytes))
    }

    /// Reads the staged content back into memory.
    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        let mut reader = self.file.reopen()?;
        let mut bytes = Vec::with_capacity(self.length as usize);
        reader.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Copies the staged content to its final destination.
    pub fn copy_to(&self, dest: &Path) -> std::io::Result<()> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::copy(self.file.path(), dest)?;
        Ok(())
    }
}

/// Result of a successful fetch.
#[derive(Debug)]
pub struct Fetched {
    /// Encoding the server actually delivered.
    pub format: DownloadFormat,
    /// Repository-relative path that resolved.
    pub path: String,
    /// Handle to the staged download.
    pub staged: StagedFile,
}

/// Source of remote artifacts.
pub trait RemoteRepository {
    /// Downloads `file` to a staging location.
    ///
    /// `attempt` is the driver's current iteration, letting implementations
    /// vary behavior across retries.
    fn fetch(&self, attempt: u32, file: &RemoteFile) -> Result<Fetched>;

    /// Pins a single origin for the duration of `action`.
    ///
    /// Every fetch inside one driver call must hit the same origin so that
    /// mirrors cannot answer inconsistently for different roles. The default
    /// is a no-op for transports without a mirror concept.
    fn with_mirror<T>(&self, action: impl FnOnce() -> T) -> T
    where
        Self: Sized,
    {
        action()
    }

    /// Installs the repository's published mirror list.
    ///
    /// Takes effect on the next [`RemoteRepository::with_mirror`] scope,
    /// never mid-protocol.
    fn apply_mirrors(&self, _mirrors: &[Mirror]) {}
}

/// HTTP(S) implementation of [`RemoteRepository`].
#[derive(Debug)]
pub struct HttpRepository {
    http: HttpClient,
    base_url: Url,
    /// Alternate origins from the mirrors role, usable from the next call.
    mirrors: Mutex<Vec<Url>>,
    /// Origin pinned by the current `with_mirror` scope.
    active: Mutex<Option<Url>>,
    /// Rotation counter across `with_mirror` scopes.
    rotation: AtomicUsize,
}

impl HttpRepository {
    /// Builds a repository client for the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = parse_base_url(base_url)?;
        let http = HttpClient::builder()
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(HttpRepository {
            http,
            base_url,
            mirrors: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            rotation: AtomicUsize::new(0),
        })
    }

    /// Origin used for fetches right now: the pinned mirror or the base URL.
    fn origin(&self) -> Url {
        self.active
            .lock()
            .expect("mirror selection lock poisoned")
            .clone()
            .unwrap_or_else(|| self.base_url.clone())
    }

    fn fetch_one(&self, origin: &Url, rel_path: &str) -> Result<Option<Vec<u8>>> {
        let url = origin
            .join(rel_path)
            .map_err(|e| RemoteError::InvalidUrl(e.to_string()))?;
        tracing::debug!(%url, "fetching remote artifact");
        let response = self.http.get(url).send()?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes()?.to_vec())),
            status => Err(RemoteError::Status {
                status: status.as_u16(),
                path: rel_path.to_string(),
            }),
        }
    }
}

impl RemoteRepository for HttpRepository {
    fn fetch(&self, attempt: u32, file: &RemoteFile) -> Result<Fetched> {
        let origin = self.origin();
        let candidates = file.candidates();
        let mut last_missing = String::new();
        for (format, rel_path) in candidates {
            match self.fetch_one(&origin, &rel_path)? {
                Some(bytes) => {
                    tracing::debug!(
                        path = %rel_path,
                        attempt,
                        length = bytes.len(),
                        "remote artifact staged"
                    );
                    return Ok(Fetched {
                        format,
                        path: rel_path,
                        staged: StagedFile::from_bytes(&bytes)?,
                    });
                }
                None => last_missing = rel_path,
            }
        }
        Err(RemoteError::NotFound(last_missing))
    }

    fn with_mirror<T>(&self, action: impl FnOnce() -> T) -> T {
        {
            let mirrors = self.mirrors.lock().expect("mirror list lock poisoned");
            let mut active = self.active.lock().expect("mirror selection lock poisoned");
            // Slot 0 is the primary base URL; mirrors follow in rotation.
            let slot = self.rotation.fetch_add(1, Ordering::Relaxed) % (mirrors.len() + 1);
            *active = if slot == 0 {
                None
            } else {
                Some(mirrors[slot - 1].clone())
            };
        }
        let result = action();
        let mut active = self.active.lock().expect("mirror selection lock poisoned");
        *active = None;
        result
    }

    fn apply_mirrors(&self, mirrors: &[Mirror]) {
        let mut parsed = Vec::new();
        for mirror in mirrors {
            match parse_base_url(&mirror.url_base) {
                Ok(url) => parsed.push(url),
                Err(err) => {
                    tracing::warn!(url_base = %mirror.url_base, %err, "skipping unusable mirror");
                }
            }
        }
        *self.mirrors.lock().expect("mirror list lock poisoned") = parsed;
    }
}

/// Parses a base URL, ensuring a trailing slash so joins stay inside it.
fn parse_base_url(raw: &str) -> Result<Url> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|e| RemoteError::InvalidUrl(format!("{raw}: {e}")))
}
