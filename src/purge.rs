//! Space Reclaimer
//!
//! Walks the cache directory and removes cached files (data plus
//! `.cinfo`) that have not been accessed for a configured age, then, if
//! the filesystem is fuller than the high watermark, removes the least
//! recently accessed entries until usage drops below the low watermark.
//! Entries with a live prefetch are never touched.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cinfo::CacheFileInfo;
use crate::config::PurgeConfig;
use crate::store::info_path;

const INFO_SUFFIX: &str = ".cinfo";

/// Limits applied by one sweep
#[derive(Debug, Clone, Copy)]
pub struct PurgePolicy {
    pub max_age: Option<Duration>,
    pub high_watermark: f64,
    pub low_watermark: f64,
}

impl From<&PurgeConfig> for PurgePolicy {
    fn from(config: &PurgeConfig) -> Self {
        Self {
            max_age: config.max_age(),
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
        }
    }
}

/// Filesystem capacity in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
}

impl DiskUsage {
    /// Usage of the filesystem holding `path`
    pub fn of(path: &Path) -> io::Result<Self> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        let frag = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * frag;
        let available = stat.blocks_available() as u64 * frag;
        Ok(Self {
            total,
            used: total.saturating_sub(available),
        })
    }

    fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64
        }
    }
}

/// One cached file found on disk
#[derive(Debug, Clone)]
pub struct PurgeEntry {
    /// Data file path relative to the cache root, with a leading `/`
    pub path: PathBuf,
    pub last_access: SystemTime,
    pub size: u64,
}

/// Result of a sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub scanned: usize,
    pub removed: Vec<String>,
    pub bytes_freed: u64,
}

/// Choose entries to remove, oldest first
pub fn plan(
    mut entries: Vec<PurgeEntry>,
    now: SystemTime,
    policy: &PurgePolicy,
    usage: Option<DiskUsage>,
) -> Vec<PurgeEntry> {
    entries.sort_by_key(|e| e.last_access);

    let mut doomed = Vec::new();
    let mut kept = Vec::new();
    for entry in entries {
        let age = now.duration_since(entry.last_access).unwrap_or_default();
        match policy.max_age {
            Some(max) if age > max => doomed.push(entry),
            _ => kept.push(entry),
        }
    }

    let Some(usage) = usage else {
        return doomed;
    };
    if usage.fraction() <= policy.high_watermark {
        return doomed;
    }

    let target = (policy.low_watermark * usage.total as f64) as u64;
    let freed: u64 = doomed.iter().map(|e| e.size).sum();
    let mut used = usage.used.saturating_sub(freed);
    for entry in kept {
        if used <= target {
            break;
        }
        used = used.saturating_sub(entry.size);
        doomed.push(entry);
    }
    doomed
}

/// Scan `root` for cached files whose prefetch is not live
pub fn scan(root: &Path, in_use: impl Fn(&Path) -> bool) -> Result<Vec<PurgeEntry>> {
    let mut entries = Vec::new();
    let mut dirs = vec![root.to_path_buf()];

    while let Some(dir) = dirs.pop() {
        let read_dir = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read cache directory: {:?}", dir))
            }
        };
        for item in read_dir.flatten() {
            let file_type = match item.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };
            let path = item.path();
            if file_type.is_dir() {
                dirs.push(path);
                continue;
            }
            let Some(data) = data_path_for(&path) else {
                continue;
            };
            let Ok(relative) = data.strip_prefix(root) else {
                continue;
            };
            let relative = Path::new("/").join(relative);
            if in_use(&relative) {
                debug!(path = %relative.display(), "Skipping live cache entry");
                continue;
            }

            let size = fs::metadata(&data).map(|m| m.len()).unwrap_or(0);
            entries.push(PurgeEntry {
                path: relative,
                last_access: last_access(&path),
                size,
            });
        }
    }
    Ok(entries)
}

/// One purge pass over `root`
pub fn sweep(root: &Path, policy: &PurgePolicy, in_use: impl Fn(&Path) -> bool) -> Result<PurgeReport> {
    let entries = scan(root, in_use)?;
    let scanned = entries.len();

    let usage = match DiskUsage::of(root) {
        Ok(usage) => Some(usage),
        Err(e) => {
            warn!(root = %root.display(), error = %e, "Could not stat cache filesystem");
            None
        }
    };

    let mut report = PurgeReport {
        scanned,
        ..PurgeReport::default()
    };
    for entry in plan(entries, SystemTime::now(), policy, usage) {
        let data = root.join(entry.path.strip_prefix("/").unwrap_or(&entry.path));
        let info = info_path(&data);
        remove_if_present(&data);
        remove_if_present(&info);
        debug!(path = %entry.path.display(), size = entry.size, "Purged cache entry");
        report.bytes_freed += entry.size;
        report.removed.push(entry.path.display().to_string());
    }

    info!(
        scanned = report.scanned,
        removed = report.removed.len(),
        freed_mb = report.bytes_freed / (1024 * 1024),
        "Purge complete"
    );
    Ok(report)
}

fn data_path_for(info: &Path) -> Option<PathBuf> {
    let name = info.file_name()?.to_str()?;
    let stem = name.strip_suffix(INFO_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    Some(info.with_file_name(stem))
}

/// Close time of the newest access record, else the metadata file's mtime
fn last_access(info: &Path) -> SystemTime {
    let from_records = fs::File::open(info).ok().and_then(|file| {
        let mut cinfo = CacheFileInfo::new(0);
        match cinfo.read_header(&file) {
            Ok(n) if n > 0 => cinfo.access_stats().iter().map(|s| s.close_time).max(),
            _ => None,
        }
    });
    if let Some(secs) = from_records.filter(|&s| s > 0) {
        return UNIX_EPOCH + Duration::from_secs(secs as u64);
    }
    fs::metadata(info)
        .and_then(|m| m.modified())
        .unwrap_or(UNIX_EPOCH)
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove cache file"),
    }
}
