//! Persistent local cache for remotely-hosted images.
//!
//! Maps remote image URLs to durable local files, with bounded-concurrency
//! downloading, version and staleness checks, time-boxed failure backoff,
//! and least-recently-used eviction. Every retrieval resolves to either a
//! local path or the original remote URL as a degraded fallback; network
//! and storage failures never surface as errors to callers.
//!
//! Four retrieval modes, layered over one scheduler:
//! - [`ImageCache::try_local`] — lookup-only, never networks
//! - [`ImageCache::get`] — wait for a local path or fallback
//! - [`ImageCache::get_or_net`] — fallback immediately, warm in background
//! - [`ImageCache::warmup`] — batch prefetch

pub mod cache;
pub mod error;
pub mod fetch;
pub mod scheduler;
pub mod store;
pub mod types;

pub use cache::ImageCache;
pub use error::FetchError;
pub use fetch::{Downloader, HttpDownloader};
pub use types::{
    version_from_url, CacheConfig, CacheEntry, CacheStats, FetchOptions, ImageSource,
};
