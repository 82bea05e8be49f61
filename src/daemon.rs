//! Cache Daemon
//!
//! Owns the registry for the process and runs the long-lived work around
//! it: warming files into the cache, reporting status and purging old
//! entries on a timer. The cache core is synchronous, so every call into
//! it runs on the blocking pool.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::decision::PathsDecision;
use crate::prefetch::PrefetchStatus;
use crate::purge::{self, PurgePolicy, PurgeReport};
use crate::registry::Registry;
use crate::stats::StatsSnapshot;
use crate::store::{FileOrigin, FsStore, HttpSource, LocalStore, Origin};

/// Daemon state reported to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub entries: Vec<PrefetchStatus>,
    pub warming: Vec<String>,
    pub stats: StatsSnapshot,
}

/// Process-wide cache owner
pub struct CacheDaemon {
    config: Config,
    registry: Arc<Registry>,
    http: Arc<HttpSource>,
    /// URLs currently being warmed
    warming: Arc<RwLock<HashSet<String>>>,
}

impl CacheDaemon {
    pub fn new(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir)
            .with_context(|| format!("Failed to create cache directory: {:?}", config.cache_dir))?;

        let store: Arc<dyn LocalStore> = Arc::new(
            FsStore::new(&config.cache_dir).context("Failed to open cache directory")?,
        );
        let mut registry = Registry::new(store, config.prefetch());
        if !config.excludes.is_empty() {
            registry = registry.with_admission(Arc::new(PathsDecision::new(&config.excludes)));
        }
        let http = Arc::new(HttpSource::new());

        info!(
            cache_dir = %config.cache_dir.display(),
            block_size = config.block_size,
            read_ahead = config.read_ahead,
            excludes = config.excludes.len(),
            "Cache daemon initialized"
        );

        Ok(Self {
            config,
            registry: Arc::new(registry),
            http,
            warming: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Origin for a URL: HTTP(S) through the shared client, anything else
    /// as a path on a mounted filesystem
    pub fn open_origin(&self, url: &str) -> Result<Arc<dyn Origin>> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(Arc::new(self.http.open(url)));
        }
        let origin = FileOrigin::open(url).with_context(|| format!("Failed to open origin: {}", url))?;
        Ok(Arc::new(origin))
    }

    /// Pull a whole file through the cache. Returns the bytes read.
    pub async fn warm(&self, url: &str) -> Result<u64> {
        {
            let mut warming = self.warming.write().await;
            if !warming.insert(url.to_string()) {
                return Err(anyhow!("'{}' is already being warmed", url));
            }
        }

        let result = self.warm_inner(url).await;
        self.warming.write().await.remove(url);

        match &result {
            Ok(bytes) => info!(url = url, bytes = bytes, "Warm complete"),
            Err(e) => error!(url = url, error = %e, "Warm failed"),
        }
        result
    }

    async fn warm_inner(&self, url: &str) -> Result<u64> {
        let origin = self.open_origin(url)?;
        let registry = Arc::clone(&self.registry);
        let chunk = self.config.block_size as usize;

        tokio::task::spawn_blocking(move || read_through(&registry, origin, chunk, &mut io::sink()))
            .await
            .context("Warm task panicked")?
    }

    pub async fn status(&self) -> DaemonStatus {
        let registry = Arc::clone(&self.registry);
        let entries = tokio::task::spawn_blocking(move || registry.live())
            .await
            .unwrap_or_default();
        let mut warming: Vec<String> = self.warming.read().await.iter().cloned().collect();
        warming.sort();

        DaemonStatus {
            entries,
            warming,
            stats: self.registry.stats().snapshot(),
        }
    }

    /// Run one purge sweep now
    pub async fn purge(&self) -> Result<PurgeReport> {
        let registry = Arc::clone(&self.registry);
        let root = self.config.cache_dir.clone();
        let policy = PurgePolicy::from(&self.config.purge);

        tokio::task::spawn_blocking(move || purge::sweep(&root, &policy, |p| registry.in_use(p)))
            .await
            .context("Purge task panicked")?
    }

    /// Purge on the configured interval until the task is aborted
    pub fn spawn_purge_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let daemon = Arc::clone(self);
        let period = self.config.purge.interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                debug!("Running scheduled purge");
                if let Err(e) = daemon.purge().await {
                    error!(error = %e, "Scheduled purge failed");
                }
                daemon.registry.stats().log_metrics();
            }
        })
    }

    /// Ask every fetcher to stop. Partial files stay on disk for the next run.
    pub async fn shutdown(&self) {
        let registry = Arc::clone(&self.registry);
        if let Err(e) = tokio::task::spawn_blocking(move || registry.close_all()).await {
            error!(error = %e, "Shutdown task panicked");
        }
        self.registry.stats().log_metrics();
        info!("Cache daemon stopped");
    }
}

/// Read `origin` start to end through the cache in `chunk` sized
/// requests, copying the bytes to `out`
pub fn read_through(
    registry: &Registry,
    origin: Arc<dyn Origin>,
    chunk: usize,
    out: &mut dyn Write,
) -> Result<u64> {
    let len = origin.len().context("Failed to get origin length")?;
    let mut reader = registry.attach(origin);
    let mut buf = vec![0u8; chunk.max(1)];
    let mut offset = 0u64;

    while offset < len {
        let n = reader.read(&mut buf, offset)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("Failed to write output")?;
        offset += n as u64;
    }
    out.flush()?;
    reader.detach();
    Ok(offset)
}
