//! Network downloader seam.

use crate::error::FetchError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Fetches the raw bytes of a remote image.
///
/// This is the only network touchpoint of the cache; tests substitute their
/// own implementation to exercise the scheduler without sockets.
pub trait Downloader: Send + Sync + 'static {
    fn fetch(
        &self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// [`reqwest`]-backed downloader with a per-request timeout.
#[derive(Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader for HttpDownloader {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).timeout(timeout).send().await?;

        let status = response.status();
        if !status.is_success() {
            debug!(url = %url, status = %status, "Download returned non-success status");
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        debug!(url = %url, size = bytes.len(), "Download complete");
        Ok(bytes.to_vec())
    }
}
