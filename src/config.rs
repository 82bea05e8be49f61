//! Configuration
//!
//! JSON settings file, every key optional. The file location comes from
//! `BLOCKCACHE_CONFIG`; without it the defaults apply.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::prefetch::{PrefetchConfig, DEFAULT_BLOCK_SIZE, DEFAULT_FLUSH_EVERY_BLOCKS};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "BLOCKCACHE_CONFIG";

/// Default control socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/blockcache.sock";

/// Block sizes must be a multiple of this
const BLOCK_ALIGN: u64 = 4096;

/// Daemon and cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Root of cached data and `.cinfo` files
    pub cache_dir: PathBuf,
    pub block_size: u64,
    pub flush_every_blocks: u32,
    pub read_ahead: bool,
    /// Path prefixes that are never cached
    pub excludes: Vec<String>,
    pub socket_path: PathBuf,
    pub purge: PurgeConfig,
}

/// Space reclaimer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PurgeConfig {
    pub interval_secs: u64,
    /// Remove entries not accessed for this long
    pub max_age_secs: Option<u64>,
    /// Filesystem usage fraction that starts a size-based purge
    pub high_watermark: f64,
    /// Usage fraction a size-based purge stops at
    pub low_watermark: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            block_size: DEFAULT_BLOCK_SIZE,
            flush_every_blocks: DEFAULT_FLUSH_EVERY_BLOCKS,
            read_ahead: true,
            excludes: Vec::new(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            purge: PurgeConfig::default(),
        }
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_age_secs: None,
            high_watermark: 0.95,
            low_watermark: 0.90,
        }
    }
}

impl PurgeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("blockcache")
}

impl Config {
    /// Load from `BLOCKCACHE_CONFIG`, or defaults when it is unset
    pub fn load() -> Result<Self> {
        match env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::from_json(&text)
            .with_context(|| format!("Invalid config file: {:?}", path))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % BLOCK_ALIGN != 0 {
            bail!(
                "blockSize must be a non-zero multiple of {} (got {})",
                BLOCK_ALIGN,
                self.block_size
            );
        }
        if self.flush_every_blocks == 0 {
            bail!("flushEveryBlocks must be at least 1");
        }
        let (low, high) = (self.purge.low_watermark, self.purge.high_watermark);
        if !(low > 0.0 && low <= high && high <= 1.0) {
            bail!(
                "purge watermarks must satisfy 0 < low <= high <= 1 (got low {}, high {})",
                low,
                high
            );
        }
        Ok(())
    }

    pub fn prefetch(&self) -> PrefetchConfig {
        PrefetchConfig {
            block_size: self.block_size,
            flush_every_blocks: self.flush_every_blocks,
            read_ahead: self.read_ahead,
        }
    }
}
