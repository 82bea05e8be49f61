//! Prefetch Registry
//!
//! Maps each cache path to a weakly held [`Prefetch`], so every reader of
//! the same remote file shares one fetcher and one bitmap. Readers own the
//! strong references; the registry entry never keeps an instance alive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use crate::decision::Admission;
use crate::prefetch::{Prefetch, PrefetchConfig, PrefetchStatus};
use crate::proxy::ProxyIo;
use crate::stats::CacheStats;
use crate::store::{cache_path, LocalStore, Origin};

struct Entry {
    prefetch: Weak<Prefetch>,
    /// Shared by every instance ever created for this path
    gate: Arc<Mutex<()>>,
}

impl Entry {
    /// Some instance for this path still exists or is still winding down
    fn in_use(&self) -> bool {
        self.prefetch.strong_count() > 0 || Arc::strong_count(&self.gate) > 1
    }
}

/// Single-instance-per-path factory for prefetches
pub struct Registry {
    store: Arc<dyn LocalStore>,
    config: PrefetchConfig,
    admission: Vec<Arc<dyn Admission>>,
    entries: Mutex<HashMap<PathBuf, Entry>>,
    stats: Arc<CacheStats>,
}

impl Registry {
    pub fn new(store: Arc<dyn LocalStore>, config: PrefetchConfig) -> Self {
        Self {
            store,
            config,
            admission: Vec::new(),
            entries: Mutex::new(HashMap::new()),
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Add an admission policy; every policy must allow a path
    pub fn with_admission(mut self, admission: Arc<dyn Admission>) -> Self {
        self.admission.push(admission);
        self
    }

    /// Whether `path` may be cached at all
    pub fn admits(&self, path: &str) -> bool {
        if cache_path(path) == Path::new("/") {
            return false;
        }
        self.admission.iter().all(|a| a.allow(path))
    }

    /// Return the live prefetch for `origin`'s path, creating and starting
    /// one if none exists. None means the path is not cached.
    pub fn get_prefetch(&self, origin: &Arc<dyn Origin>) -> Option<Arc<Prefetch>> {
        if !self.admits(origin.path()) {
            debug!(path = origin.path(), "Admission rejected, passing through");
            return None;
        }
        let key = cache_path(origin.path());

        // Declared before the guard so a failed instance is released after
        // the lock; dropping the last reference joins its fetcher.
        let mut failed: Option<Arc<Prefetch>> = None;
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&key).and_then(|e| e.prefetch.upgrade()) {
            if !existing.is_failed() {
                debug!(path = origin.path(), "Reusing live prefetch");
                return Some(existing);
            }
            info!(path = origin.path(), "Replacing failed prefetch");
            failed = Some(existing);
        }

        let gate = entries
            .get(&key)
            .map(|e| Arc::clone(&e.gate))
            .unwrap_or_default();
        let prefetch = Arc::new(Prefetch::with_gate(
            Arc::clone(origin),
            Arc::clone(&self.store),
            self.config.clone(),
            Arc::clone(&self.stats),
            gate.clone(),
        ));
        if let Err(e) = prefetch.spawn() {
            warn!(path = origin.path(), error = %e, "Failed to start prefetch, passing through");
            return None;
        }

        entries.insert(
            key,
            Entry {
                prefetch: Arc::downgrade(&prefetch),
                gate,
            },
        );
        entries.retain(|_, e| e.in_use());

        info!(path = origin.path(), live = entries.len(), "Created prefetch");
        drop(entries);
        drop(failed);
        Some(prefetch)
    }

    /// Attach a reader to `origin`, going through the cache when admitted
    pub fn attach(&self, origin: Arc<dyn Origin>) -> ProxyIo {
        let prefetch = self.get_prefetch(&origin);
        ProxyIo::new(origin, prefetch, Arc::clone(&self.stats))
    }

    /// Whether a prefetch for the cache-relative data path is alive
    pub fn in_use(&self, data_path: &Path) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(data_path)
            .is_some_and(|e| e.in_use())
    }

    fn live_instances(&self) -> Vec<Arc<Prefetch>> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter_map(|e| e.prefetch.upgrade())
            .collect()
    }

    /// Progress of every live prefetch
    pub fn live(&self) -> Vec<PrefetchStatus> {
        // Collected first: dropping the last reference joins the fetcher,
        // which must not happen under the entries lock.
        let live = self.live_instances();
        live.iter().map(|p| p.status()).collect()
    }

    /// Ask every live fetcher to stop at its next task boundary
    pub fn close_all(&self) {
        let live = self.live_instances();
        for prefetch in &live {
            prefetch.close_cleanly();
        }
        if !live.is_empty() {
            info!(count = live.len(), "Requested prefetch shutdown");
        }
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }
}
