//! Bounded-concurrency download scheduler.
//!
//! At most `max_concurrency` downloads run at once; admission is FIFO
//! through a fair semaphore, completion order is whatever the network
//! yields. Concurrent requests for the same URL are coalesced onto a single
//! in-flight download, and recently failed URLs are suppressed for the
//! configured ban window.

use crate::fetch::Downloader;
use crate::store::{FailureStore, MetadataStore};
use crate::types::{version_from_url, CacheConfig, FetchOptions, ImageSource};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, warn};

type InFlightMap = Arc<Mutex<HashMap<String, broadcast::Sender<ImageSource>>>>;

pub struct DownloadScheduler<D> {
    store: Arc<MetadataStore>,
    failures: Arc<FailureStore>,
    downloader: Arc<D>,
    permits: Arc<Semaphore>,
    in_flight: InFlightMap,
    config: CacheConfig,
}

impl<D> Clone for DownloadScheduler<D> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            failures: Arc::clone(&self.failures),
            downloader: Arc::clone(&self.downloader),
            permits: Arc::clone(&self.permits),
            in_flight: Arc::clone(&self.in_flight),
            config: self.config.clone(),
        }
    }
}

/// Role assigned to a request after in-flight registration.
enum FlightRole {
    /// First request for this URL; performs the download.
    Fetcher(FlightGuard),
    /// A download is already in flight; awaits its broadcast result.
    Waiter(broadcast::Receiver<ImageSource>),
}

/// Removes the in-flight entry on drop so a cancelled fetcher cannot leave
/// later requests waiting on a dead channel.
struct FlightGuard {
    url: String,
    sender: broadcast::Sender<ImageSource>,
    in_flight: InFlightMap,
}

impl FlightGuard {
    fn complete(self, result: &ImageSource) {
        // Remove before sending so a request arriving in between starts a
        // fresh flight instead of subscribing to a finished one.
        remove_flight(&self.in_flight, &self.url);
        let _ = self.sender.send(result.clone());
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        remove_flight(&self.in_flight, &self.url);
    }
}

fn remove_flight(in_flight: &InFlightMap, url: &str) {
    let mut map = match in_flight.lock() {
        Ok(map) => map,
        Err(poisoned) => poisoned.into_inner(),
    };
    map.remove(url);
}

impl<D: Downloader> DownloadScheduler<D> {
    pub fn new(
        store: Arc<MetadataStore>,
        failures: Arc<FailureStore>,
        downloader: Arc<D>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            failures,
            downloader,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Resolve a URL to a local path, downloading if necessary.
    ///
    /// Never fails: a banned URL, a network error, a timeout, or a storage
    /// failure all resolve to [`ImageSource::Remote`] with the original URL.
    pub async fn fetch(&self, url: &str, opts: &FetchOptions) -> ImageSource {
        let version = opts
            .version
            .clone()
            .unwrap_or_else(|| version_from_url(url));
        let max_age = opts.max_age.unwrap_or(self.config.max_age);
        let timeout = opts.timeout.unwrap_or(self.config.timeout);

        if !opts.force {
            if let Some(path) = self.store.lookup(url, &version, max_age).await {
                return ImageSource::Local(path);
            }
        }

        if self.failures.is_banned(url).await {
            debug!(url = %url, "Skipping download: failure ban active");
            return ImageSource::Remote(url.to_string());
        }

        match self.register(url) {
            FlightRole::Waiter(mut rx) => match rx.recv().await {
                Ok(result) => result,
                // The fetcher was cancelled before broadcasting.
                Err(_) => ImageSource::Remote(url.to_string()),
            },
            FlightRole::Fetcher(guard) => {
                let result = self
                    .run_download(url, &version, max_age, timeout, opts.force)
                    .await;
                guard.complete(&result);
                result
            }
        }
    }

    fn register(&self, url: &str) -> FlightRole {
        let mut in_flight = match self.in_flight.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        match in_flight.get(url) {
            Some(sender) => FlightRole::Waiter(sender.subscribe()),
            None => {
                let (sender, _) = broadcast::channel(1);
                in_flight.insert(url.to_string(), sender.clone());
                FlightRole::Fetcher(FlightGuard {
                    url: url.to_string(),
                    sender,
                    in_flight: Arc::clone(&self.in_flight),
                })
            }
        }
    }

    async fn run_download(
        &self,
        url: &str,
        version: &str,
        max_age: chrono::Duration,
        timeout: std::time::Duration,
        force: bool,
    ) -> ImageSource {
        // FIFO admission: the fair semaphore bounds concurrent downloads.
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return ImageSource::Remote(url.to_string()),
        };

        // A submission for the same URL may have completed while this one
        // waited for a slot.
        if !force {
            if let Some(path) = self.store.lookup(url, version, max_age).await {
                return ImageSource::Local(path);
            }
        }

        debug!(url = %url, version = %version, "Download start");
        match self.downloader.fetch(url, timeout).await {
            Ok(bytes) => match self.store.insert(url, version, &bytes).await {
                Ok(path) => {
                    self.failures.clear(url).await;
                    self.store.prune(self.config.max_entries).await;
                    debug!(url = %url, path = ?path, size = bytes.len(), "Download cached");
                    ImageSource::Local(path)
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to save downloaded image");
                    self.failures.mark(url, self.config.failure_ban).await;
                    ImageSource::Remote(url.to_string())
                }
            },
            Err(e) => {
                warn!(url = %url, error = %e, "Download failed");
                self.failures.mark(url, self.config.failure_ban).await;
                ImageSource::Remote(url.to_string())
            }
        }
    }
}
