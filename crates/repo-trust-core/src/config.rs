//! Environment-driven client configuration.
//!
//! Derives the settings a host process needs to wire the update client
//! (repository URL, cache location, TLS preference, and the pinned root
//! fingerprints used during bootstrap) from environment variables, while
//! staying embedder-agnostic: everything can also be constructed directly.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::keys::KeyId;

/// Environment variable carrying the repository base URL.
const ENV_URL: &str = "PKG_REPO_URL";
/// Environment variable carrying the cache directory.
const ENV_CACHE_DIR: &str = "PKG_REPO_CACHE_DIR";
/// Environment variable toggling plain-HTTP repository access.
const ENV_NO_TLS: &str = "PKG_REPO_NO_TLS";
/// Environment variable listing pinned root key fingerprints
/// (comma-separated hex).
const ENV_ROOT_KEYS: &str = "PKG_REPO_ROOT_KEYS";
/// Environment variable overriding the bootstrap signature threshold.
const ENV_ROOT_THRESHOLD: &str = "PKG_REPO_ROOT_THRESHOLD";

/// Captures environment-derived options for the update client.
#[derive(Debug, Clone)]
pub struct ClientEnv {
    /// Repository base URL, when configured.
    pub repository_url: Option<String>,
    /// Cache directory, when configured.
    pub cache_dir: Option<PathBuf>,
    /// When `true`, `http://` repository URLs are acceptable.
    pub no_tls: bool,
    /// Pinned root key fingerprints for bootstrap.
    pub root_key_ids: Vec<KeyId>,
    /// Bootstrap signature threshold. Defaults to the number of pinned
    /// fingerprints; zero (no pinned keys) means trust-on-first-use.
    pub root_threshold: u32,
}

impl ClientEnv {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let repository_url = map.get(ENV_URL).and_then(|value| sanitize_non_empty(value));
        let cache_dir = map
            .get(ENV_CACHE_DIR)
            .and_then(|value| sanitize_non_empty(value))
            .map(PathBuf::from);
        let no_tls = parse_bool(map.get(ENV_NO_TLS).map(String::as_str), false);
        let root_key_ids: Vec<KeyId> = map
            .get(ENV_ROOT_KEYS)
            .map(|raw| {
                raw.split(',')
                    .filter_map(sanitize_non_empty)
                    .map(KeyId::new)
                    .collect()
            })
            .unwrap_or_default();
        let root_threshold = map
            .get(ENV_ROOT_THRESHOLD)
            .and_then(|value| value.trim().parse().ok())
            // Requiring every pinned key is the conservative default.
            .unwrap_or(root_key_ids.len() as u32);

        ClientEnv {
            repository_url,
            cache_dir,
            no_tls,
            root_key_ids,
            root_threshold,
        }
    }
}

/// Interprets common truthy/falsy spellings, with a default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value {
        Some(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        None => default,
    }
}

/// Trims a value and drops it entirely when empty.
fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
