//! Core data model for the image cache.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Metadata for one cached image, keyed by its remote URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Local file owned exclusively by the cache.
    pub path: PathBuf,
    /// Opaque version token, usually the `v` query parameter of the URL.
    pub version: String,
    /// When the download that produced this entry completed.
    pub saved_at: DateTime<Utc>,
    /// Most recent successful lookup or write; drives eviction order.
    pub last_used_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether this entry satisfies a request for `version` at `now`,
    /// ignoring file existence (the store checks the filesystem separately).
    ///
    /// An empty requested version matches an empty stored version.
    pub fn is_current(&self, now: DateTime<Utc>, version: &str, max_age: Duration) -> bool {
        self.version == version && now - self.saved_at <= max_age
    }
}

/// A recorded download failure; the URL is not retried until `ban_until`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    pub ban_until: DateTime<Utc>,
}

impl FailureEntry {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.ban_until
    }
}

/// Where a requested image can be loaded from.
///
/// Network and storage failures never surface as errors; a request that
/// could not produce a local file resolves to `Remote` with the original
/// URL so the caller always has something renderable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// A valid local copy owned by the cache.
    Local(PathBuf),
    /// Degraded fallback: the original remote URL, unchanged.
    Remote(String),
}

impl ImageSource {
    pub fn is_local(&self) -> bool {
        matches!(self, ImageSource::Local(_))
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            ImageSource::Local(path) => Some(path),
            ImageSource::Remote(_) => None,
        }
    }
}

/// Per-request overrides; `None` falls back to the [`CacheConfig`] defaults.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Expected content version; parsed from the URL when absent.
    pub version: Option<String>,
    /// Maximum acceptable age of a cached copy.
    pub max_age: Option<Duration>,
    /// Network timeout for the download.
    pub timeout: Option<std::time::Duration>,
    /// Bypass the valid-cache short-circuit and download unconditionally.
    pub force: bool,
}

/// Cache-wide configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the blob files and the persisted indexes.
    pub cache_dir: PathBuf,
    /// Hard bound on the number of entries, enforced by LRU eviction.
    pub max_entries: usize,
    /// Default maximum age of a cached copy.
    pub max_age: Duration,
    /// Default network timeout.
    pub timeout: std::time::Duration,
    /// Maximum simultaneous downloads.
    pub max_concurrency: usize,
    /// How long a URL is suppressed after a failed download.
    pub failure_ban: Duration,
    /// Default idle threshold for [`cleanup_by_age`](crate::ImageCache::cleanup_by_age).
    pub idle_cleanup: Duration,
}

impl CacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_entries: 400,
            max_age: Duration::days(2),
            timeout: std::time::Duration::from_millis(6000),
            max_concurrency: 4,
            failure_ban: Duration::minutes(30),
            idle_cleanup: Duration::days(45),
        }
    }
}

/// Best-effort diagnostic snapshot; never used for correctness decisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries in the metadata index.
    pub entries: usize,
    /// Index entries whose backing file still exists.
    pub entries_with_file: usize,
    /// Blob files actually present in the cache directory.
    pub files_on_disk: usize,
    /// Total size of those files in bytes.
    pub total_size_bytes: u64,
}

/// Extract the `v` query parameter from a URL, decoded, or `""`.
pub fn version_from_url(url: &str) -> String {
    let Ok(parsed) = url::Url::parse(url) else {
        return String::new();
    };
    parsed
        .query_pairs()
        .find(|(key, _)| key == "v")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}
