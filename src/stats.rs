//! Cache statistics
//!
//! Process-wide counters shared by every reader and fetcher.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Counters for requests and bytes moved through the cache
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Requests served without touching the origin
    hits: AtomicU64,
    /// Requests that needed a download or a passthrough
    misses: AtomicU64,
    /// Bytes handed to readers from local blocks
    bytes_from_cache: AtomicU64,
    /// Bytes handed to readers straight from the origin
    bytes_from_origin: AtomicU64,
    /// Bytes written into the cache by fetchers
    bytes_downloaded: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub bytes_from_cache: u64,
    pub bytes_from_origin: u64,
    pub bytes_downloaded: u64,
}

impl StatsSnapshot {
    /// Hit rate in percent
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            (self.hits as f64 / total as f64) * 100.0
        } else {
            0.0
        }
    }
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request fully served from local blocks
    pub fn record_hit(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_from_cache.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A request that waited on a download and was then served locally
    pub fn record_demand_miss(&self, bytes: u64) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.bytes_from_cache.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A request served by reading the origin directly
    pub fn record_passthrough(&self, bytes: u64) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.bytes_from_origin.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes a fetcher stored locally
    pub fn record_download(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_from_cache: self.bytes_from_cache.load(Ordering::Relaxed),
            bytes_from_origin: self.bytes_from_origin.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let snap = self.snapshot();
        debug!(
            hits = snap.hits,
            misses = snap.misses,
            hit_rate = format!("{:.1}%", snap.hit_rate()),
            cache_mb = snap.bytes_from_cache / (1024 * 1024),
            origin_mb = snap.bytes_from_origin / (1024 * 1024),
            downloaded_mb = snap.bytes_downloaded / (1024 * 1024),
            "Cache metrics"
        );
    }
}
