//! Persistent metadata and failure stores.
//!
//! Both stores hold their maps in memory behind an `RwLock`, hydrated from a
//! JSON file in the cache directory and written back after every mutation.
//! Reads and writes fail soft: an unreadable or corrupt file hydrates to an
//! empty map, and a failed write is logged without disturbing in-memory
//! state. The next successful write reconciles the file.

use crate::types::{CacheEntry, CacheStats, FailureEntry};
use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const INDEX_FILE: &str = "index.json";
const FAILURES_FILE: &str = "failures.json";

async fn read_map<T: DeserializeOwned>(path: &Path) -> HashMap<String, T> {
    match fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = ?path, error = %e, "Corrupt store file, starting empty");
                HashMap::new()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to read store file, starting empty");
            HashMap::new()
        }
    }
}

async fn write_map<T: Serialize>(path: &Path, map: &HashMap<String, T>) {
    let bytes = match serde_json::to_vec(map) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to encode store file");
            return;
        }
    };
    if let Err(e) = fs::write(path, bytes).await {
        warn!(path = ?path, error = %e, "Failed to persist store file");
    }
}

/// Durable URL -> [`CacheEntry`] mapping plus the blob files it owns.
pub struct MetadataStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    cache_dir: PathBuf,
    index_path: PathBuf,
}

impl MetadataStore {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cache_dir: cache_dir.to_path_buf(),
            index_path: cache_dir.join(INDEX_FILE),
        }
    }

    /// Hydrate the in-memory map from the index file.
    pub async fn load(&self) {
        let map = read_map(&self.index_path).await;
        debug!(entries = map.len(), "Metadata index loaded");
        *self.entries.write().await = map;
    }

    async fn persist(&self) {
        let snapshot = self.entries.read().await.clone();
        write_map(&self.index_path, &snapshot).await;
    }

    /// Blob file path for a URL, named by the URL's sha256 digest.
    pub fn blob_path(&self, url: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        self.cache_dir.join(hex::encode(hasher.finalize()))
    }

    /// Look up a valid entry and touch its `last_used_at`.
    ///
    /// Validity requires a matching version, freshness within `max_age`, and
    /// an existing backing file. Anything else is a miss, never an error.
    pub async fn lookup(&self, url: &str, version: &str, max_age: Duration) -> Option<PathBuf> {
        let now = Utc::now();
        let entry = { self.entries.read().await.get(url).cloned() }?;

        if !entry.is_current(now, version, max_age) {
            debug!(url = %url, stored = %entry.version, wanted = %version, "Cache miss: stale or version mismatch");
            return None;
        }
        if !fs::try_exists(&entry.path).await.unwrap_or(false) {
            debug!(url = %url, path = ?entry.path, "Cache miss: backing file missing");
            return None;
        }

        {
            let mut entries = self.entries.write().await;
            if let Some(e) = entries.get_mut(url) {
                e.last_used_at = now;
            }
        }
        self.persist().await;
        debug!(url = %url, path = ?entry.path, "Cache hit");
        Some(entry.path)
    }

    /// Save downloaded content and record its entry.
    ///
    /// A new version for an existing URL overwrites the same blob file, so
    /// the superseded content is never served again.
    pub async fn insert(&self, url: &str, version: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.blob_path(url);
        fs::write(&path, bytes).await?;

        let now = Utc::now();
        {
            let mut entries = self.entries.write().await;
            entries.insert(
                url.to_string(),
                CacheEntry {
                    path: path.clone(),
                    version: version.to_string(),
                    saved_at: now,
                    last_used_at: now,
                },
            );
        }
        self.persist().await;
        Ok(path)
    }

    /// Enforce the entry bound by evicting least-recently-used entries.
    ///
    /// Backing files are deleted best-effort; an orphaned file is cleanup
    /// cosmetics, not a correctness problem.
    pub async fn prune(&self, max_entries: usize) {
        let victims: Vec<(String, PathBuf)> = {
            let entries = self.entries.read().await;
            if entries.len() <= max_entries {
                return;
            }
            let overflow = entries.len() - max_entries;
            let mut by_age: Vec<_> = entries
                .iter()
                .map(|(url, e)| (e.last_used_at, url.clone(), e.path.clone()))
                .collect();
            by_age.sort_by_key(|(used, _, _)| *used);
            by_age
                .into_iter()
                .take(overflow)
                .map(|(_, url, path)| (url, path))
                .collect()
        };

        {
            let mut entries = self.entries.write().await;
            for (url, _) in &victims {
                entries.remove(url);
            }
        }
        for (url, path) in &victims {
            let _ = fs::remove_file(path).await;
            debug!(url = %url, "Evicted least-recently-used entry");
        }
        self.persist().await;
    }

    /// Remove every entry not used within `idle`, deleting backing files.
    pub async fn cleanup_by_age(&self, idle: Duration) {
        let now = Utc::now();
        let victims: Vec<(String, PathBuf)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, e)| now - e.last_used_at > idle)
                .map(|(url, e)| (url.clone(), e.path.clone()))
                .collect()
        };
        if victims.is_empty() {
            return;
        }

        {
            let mut entries = self.entries.write().await;
            for (url, _) in &victims {
                entries.remove(url);
            }
        }
        for (url, path) in &victims {
            let _ = fs::remove_file(path).await;
            debug!(url = %url, "Removed idle entry");
        }
        self.persist().await;
    }

    /// Reconcile the index against the files actually on disk.
    pub async fn stats(&self) -> CacheStats {
        let snapshot = self.entries.read().await.clone();

        let mut entries_with_file = 0;
        for entry in snapshot.values() {
            if fs::try_exists(&entry.path).await.unwrap_or(false) {
                entries_with_file += 1;
            }
        }

        let mut files_on_disk = 0;
        let mut total_size_bytes = 0;
        if let Ok(mut dir) = fs::read_dir(&self.cache_dir).await {
            while let Ok(Some(item)) = dir.next_entry().await {
                let name = item.file_name();
                if name == INDEX_FILE || name == FAILURES_FILE {
                    continue;
                }
                if let Ok(meta) = item.metadata().await {
                    if meta.is_file() {
                        files_on_disk += 1;
                        total_size_bytes += meta.len();
                    }
                }
            }
        }

        CacheStats {
            entries: snapshot.len(),
            entries_with_file,
            files_on_disk,
            total_size_bytes,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn set_timestamps(
        &self,
        url: &str,
        saved_at: chrono::DateTime<Utc>,
        last_used_at: chrono::DateTime<Utc>,
    ) {
        let mut entries = self.entries.write().await;
        if let Some(e) = entries.get_mut(url) {
            e.saved_at = saved_at;
            e.last_used_at = last_used_at;
        }
    }

    #[cfg(test)]
    pub(crate) async fn get_entry(&self, url: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(url).cloned()
    }
}

/// Durable URL -> [`FailureEntry`] mapping backing the retry ban.
pub struct FailureStore {
    bans: RwLock<HashMap<String, FailureEntry>>,
    path: PathBuf,
}

impl FailureStore {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            bans: RwLock::new(HashMap::new()),
            path: cache_dir.join(FAILURES_FILE),
        }
    }

    pub async fn load(&self) {
        let map = read_map(&self.path).await;
        debug!(bans = map.len(), "Failure index loaded");
        *self.bans.write().await = map;
    }

    async fn persist(&self) {
        let snapshot = self.bans.read().await.clone();
        write_map(&self.path, &snapshot).await;
    }

    /// An expired ban counts as absent without being deleted.
    pub async fn is_banned(&self, url: &str) -> bool {
        let bans = self.bans.read().await;
        bans.get(url).is_some_and(|ban| ban.is_active(Utc::now()))
    }

    pub async fn mark(&self, url: &str, ban: Duration) {
        {
            let mut bans = self.bans.write().await;
            bans.insert(
                url.to_string(),
                FailureEntry {
                    ban_until: Utc::now() + ban,
                },
            );
        }
        self.persist().await;
        debug!(url = %url, "Marked download failure");
    }

    pub async fn clear(&self, url: &str) {
        let removed = {
            let mut bans = self.bans.write().await;
            bans.remove(url).is_some()
        };
        if removed {
            self.persist().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_ban_until(&self, url: &str, ban_until: chrono::DateTime<Utc>) {
        let mut bans = self.bans.write().await;
        bans.insert(url.to_string(), FailureEntry { ban_until });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.load().await;

        let url = "https://x/img.jpg?v=2";
        let path = store.insert(url, "2", b"image bytes").await.unwrap();
        assert!(path.exists());

        let hit = store.lookup(url, "2", Duration::days(2)).await;
        assert_eq!(hit, Some(path));
    }

    #[tokio::test]
    async fn test_lookup_version_mismatch_is_miss() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.load().await;

        let url = "https://x/img.jpg?v=1";
        store.insert(url, "1", b"old").await.unwrap();

        assert!(store.lookup(url, "2", Duration::days(2)).await.is_none());
        assert!(store.lookup(url, "1", Duration::days(2)).await.is_some());
    }

    #[tokio::test]
    async fn test_lookup_expired_is_miss() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.load().await;

        let url = "https://x/img.jpg";
        store.insert(url, "", b"bytes").await.unwrap();
        let old = Utc::now() - Duration::days(3);
        store.set_timestamps(url, old, old).await;

        assert!(store.lookup(url, "", Duration::days(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_lookup_missing_file_is_miss() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.load().await;

        let url = "https://x/img.jpg";
        let path = store.insert(url, "", b"bytes").await.unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(store.lookup(url, "", Duration::days(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_lookup_touches_last_used() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.load().await;

        let url = "https://x/img.jpg";
        store.insert(url, "", b"bytes").await.unwrap();
        let old = Utc::now() - Duration::hours(1);
        store.set_timestamps(url, old, old).await;

        store.lookup(url, "", Duration::days(2)).await.unwrap();
        let entry = store.get_entry(url).await.unwrap();
        assert!(entry.last_used_at > old);
    }

    #[tokio::test]
    async fn test_index_survives_reload() {
        let dir = tempdir().unwrap();
        let url = "https://x/img.jpg?v=5";

        {
            let store = MetadataStore::new(dir.path());
            store.load().await;
            store.insert(url, "5", b"bytes").await.unwrap();
        }

        let store = MetadataStore::new(dir.path());
        store.load().await;
        assert!(store.lookup(url, "5", Duration::days(2)).await.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_index_hydrates_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), b"{not json!").unwrap();

        let store = MetadataStore::new(dir.path());
        store.load().await;
        assert_eq!(store.len().await, 0);

        // The store remains usable and the next write reconciles the file.
        store.insert("https://x/a.jpg", "", b"a").await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_prune_keeps_most_recently_used() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.load().await;

        let base = Utc::now();
        let mut paths = Vec::new();
        for i in 0..5 {
            let url = format!("https://x/{i}.jpg");
            let path = store.insert(&url, "", b"bytes").await.unwrap();
            let used = base - Duration::minutes(10 - i);
            store.set_timestamps(&url, used, used).await;
            paths.push((url, path));
        }

        store.prune(3).await;

        assert_eq!(store.len().await, 3);
        // Oldest-used two are gone, files included.
        for (url, path) in &paths[..2] {
            assert!(store.get_entry(url).await.is_none());
            assert!(!path.exists());
        }
        for (url, path) in &paths[2..] {
            assert!(store.get_entry(url).await.is_some());
            assert!(path.exists());
        }
    }

    #[tokio::test]
    async fn test_prune_noop_under_bound() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.load().await;

        store.insert("https://x/a.jpg", "", b"a").await.unwrap();
        store.prune(400).await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_by_age_removes_idle_entries() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.load().await;

        let idle_url = "https://x/idle.jpg";
        let fresh_url = "https://x/fresh.jpg";
        let idle_path = store.insert(idle_url, "", b"idle").await.unwrap();
        store.insert(fresh_url, "", b"fresh").await.unwrap();

        let long_ago = Utc::now() - Duration::days(60);
        store.set_timestamps(idle_url, long_ago, long_ago).await;

        store.cleanup_by_age(Duration::days(45)).await;

        assert!(store.get_entry(idle_url).await.is_none());
        assert!(!idle_path.exists());
        assert!(store.get_entry(fresh_url).await.is_some());
    }

    #[tokio::test]
    async fn test_stats_reconciles_index_and_disk() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.load().await;

        store.insert("https://x/a.jpg", "", b"aaaa").await.unwrap();
        let gone = store.insert("https://x/b.jpg", "", b"bb").await.unwrap();
        std::fs::remove_file(&gone).unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.entries_with_file, 1);
        assert_eq!(stats.files_on_disk, 1);
        assert_eq!(stats.total_size_bytes, 4);
    }

    #[tokio::test]
    async fn test_failure_ban_and_clear() {
        let dir = tempdir().unwrap();
        let failures = FailureStore::new(dir.path());
        failures.load().await;

        let url = "https://x/img.jpg";
        assert!(!failures.is_banned(url).await);

        failures.mark(url, Duration::minutes(30)).await;
        assert!(failures.is_banned(url).await);

        failures.clear(url).await;
        assert!(!failures.is_banned(url).await);
    }

    #[tokio::test]
    async fn test_expired_ban_counts_as_absent() {
        let dir = tempdir().unwrap();
        let failures = FailureStore::new(dir.path());
        failures.load().await;

        let url = "https://x/img.jpg";
        failures
            .set_ban_until(url, Utc::now() - Duration::seconds(1))
            .await;
        assert!(!failures.is_banned(url).await);
    }

    #[tokio::test]
    async fn test_failure_store_survives_reload() {
        let dir = tempdir().unwrap();
        let url = "https://x/img.jpg";

        {
            let failures = FailureStore::new(dir.path());
            failures.load().await;
            failures.mark(url, Duration::minutes(30)).await;
        }

        let failures = FailureStore::new(dir.path());
        failures.load().await;
        assert!(failures.is_banned(url).await);
    }
}
