//! Public cache facade and maintenance operations.

use crate::fetch::{Downloader, HttpDownloader};
use crate::scheduler::DownloadScheduler;
use crate::store::{FailureStore, MetadataStore};
use crate::types::{version_from_url, CacheConfig, CacheStats, FetchOptions, ImageSource};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Persistent local cache for remotely-hosted images.
///
/// Cloning is cheap; clones share the same stores and download scheduler.
pub struct ImageCache<D = HttpDownloader> {
    store: Arc<MetadataStore>,
    failures: Arc<FailureStore>,
    scheduler: DownloadScheduler<D>,
    config: CacheConfig,
}

impl<D> Clone for ImageCache<D> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            failures: Arc::clone(&self.failures),
            scheduler: self.scheduler.clone(),
            config: self.config.clone(),
        }
    }
}

impl ImageCache<HttpDownloader> {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_downloader(config, HttpDownloader::new())
    }
}

impl<D: Downloader> ImageCache<D> {
    pub fn with_downloader(config: CacheConfig, downloader: D) -> Self {
        let store = Arc::new(MetadataStore::new(&config.cache_dir));
        let failures = Arc::new(FailureStore::new(&config.cache_dir));
        let scheduler = DownloadScheduler::new(
            Arc::clone(&store),
            Arc::clone(&failures),
            Arc::new(downloader),
            config.clone(),
        );
        Self {
            store,
            failures,
            scheduler,
            config,
        }
    }

    /// Create the cache directory and hydrate both stores.
    pub async fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.config.cache_dir).await?;
        self.store.load().await;
        self.failures.load().await;
        info!(cache_dir = ?self.config.cache_dir, "Image cache initialized");
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Lookup-only check: a valid local copy or nothing. Never networks.
    pub async fn try_local(&self, url: &str, opts: &FetchOptions) -> Option<PathBuf> {
        if url.is_empty() {
            return None;
        }
        let version = opts
            .version
            .clone()
            .unwrap_or_else(|| version_from_url(url));
        let max_age = opts.max_age.unwrap_or(self.config.max_age);
        self.store.lookup(url, &version, max_age).await
    }

    /// Wait-for-result retrieval: the local path on a hit or after a
    /// successful download, the original URL otherwise.
    pub async fn get(&self, url: &str, opts: FetchOptions) -> ImageSource {
        if url.is_empty() {
            return ImageSource::Remote(String::new());
        }
        self.scheduler.fetch(url, &opts).await
    }

    /// Fire-and-forget retrieval for first paint: a hit resolves locally,
    /// a miss returns the remote URL immediately while a background task
    /// warms the cache for future requests.
    pub async fn get_or_net(&self, url: &str, opts: FetchOptions) -> ImageSource {
        if url.is_empty() {
            return ImageSource::Remote(String::new());
        }
        if let Some(path) = self.try_local(url, &opts).await {
            return ImageSource::Local(path);
        }

        debug!(url = %url, "Serving remote url while cache warms");
        let cache = self.clone();
        let url_owned = url.to_string();
        tokio::spawn(async move {
            // The warm result is discarded; failures end up in the
            // failure store like any other fetch.
            let _ = cache.scheduler.fetch(&url_owned, &opts).await;
        });
        ImageSource::Remote(url.to_string())
    }

    /// Prefetch a batch concurrently, bounded by the scheduler capacity.
    /// Returns once every URL has settled to a local path or a fallback.
    pub async fn warmup(&self, urls: &[String], opts: FetchOptions) -> Vec<ImageSource> {
        if urls.is_empty() {
            return Vec::new();
        }
        debug!(count = urls.len(), "Warmup batch");
        let fetches = urls.iter().map(|url| self.get(url, opts.clone()));
        futures::future::join_all(fetches).await
    }

    /// Delete entries idle for longer than `idle_days`. Invoked by the
    /// application at its discretion, typically at startup.
    pub async fn cleanup_by_age(&self, idle_days: i64) {
        self.store
            .cleanup_by_age(chrono::Duration::days(idle_days))
            .await;
        debug!(idle_days, "Idle cleanup finished");
    }

    /// Diagnostic snapshot reconciling the index against files on disk.
    pub async fn stats(&self) -> CacheStats {
        self.store.stats().await
    }
}
