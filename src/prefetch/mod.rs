//! Prefetch
//!
//! One instance per cached remote file. Owns the local data and metadata
//! files, the task queue and the background download loop. Readers never
//! block inside [`Prefetch::read`]; they enqueue a demand task and wait on
//! its [`Waiter`] instead.

pub mod task;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

pub use task::{Task, TaskQueue, TaskStatus, Waiter};

use crate::cinfo::{blocks_for, AccessStat, CacheFileInfo};
use crate::error::{is_transient, CacheError, Result};
use crate::stats::CacheStats;
use crate::store::local::{read_full_at, write_all_at};
use crate::store::{cache_path, info_path, LocalFile, LocalStore, Origin};

/// Default block size for newly cached files: 1 MiB
pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;

/// Default number of fetched blocks between bitmap writes
pub const DEFAULT_FLUSH_EVERY_BLOCKS: u32 = 16;

/// How long an idle fetcher sleeps before re-checking for work
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Lifecycle of a prefetch instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrefetchState {
    NotStarted,
    Running,
    Failed,
    Finalized,
}

/// Tunables for one prefetch instance
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Block size used when a file has no cache info yet
    pub block_size: u64,
    /// Persist the bitmap after this many fetched blocks
    pub flush_every_blocks: u32,
    /// Fetch missing blocks while no reader is waiting
    pub read_ahead: bool,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            flush_every_blocks: DEFAULT_FLUSH_EVERY_BLOCKS,
            read_ahead: true,
        }
    }
}

/// Progress report for status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchStatus {
    pub path: String,
    pub state: PrefetchState,
    pub failed: bool,
    pub file_size: u64,
    pub block_size: u64,
    pub blocks_total: u32,
    pub blocks_done: u32,
    pub demand_blocks: u64,
    pub read_ahead_blocks: u64,
}

struct Files {
    data: Box<dyn LocalFile>,
    info: Box<dyn LocalFile>,
    file_size: u64,
    block_size: u64,
}

struct Inner {
    origin: Arc<dyn Origin>,
    store: Arc<dyn LocalStore>,
    config: PrefetchConfig,
    stats: Arc<CacheStats>,
    data_path: PathBuf,
    info_path: PathBuf,
    /// Held by the download loop for its whole run, so a successor for the
    /// same path cannot open the files until this one has finished with them.
    gate: Arc<Mutex<()>>,
    state: Mutex<PrefetchState>,
    state_cond: Condvar,
    failed: AtomicBool,
    cleanup: AtomicBool,
    stop: AtomicBool,
    files: OnceLock<Files>,
    info: Mutex<CacheFileInfo>,
    write_lock: Mutex<()>,
    queue: TaskQueue,
    demand_blocks: AtomicU64,
    read_ahead_blocks: AtomicU64,
}

/// Downloader and local store for one remote file
pub struct Prefetch {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Prefetch {
    /// Create a prefetch for `origin`, caching under `store`
    pub fn new(
        origin: Arc<dyn Origin>,
        store: Arc<dyn LocalStore>,
        config: PrefetchConfig,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self::with_gate(origin, store, config, stats, Arc::new(Mutex::new(())))
    }

    pub(crate) fn with_gate(
        origin: Arc<dyn Origin>,
        store: Arc<dyn LocalStore>,
        config: PrefetchConfig,
        stats: Arc<CacheStats>,
        gate: Arc<Mutex<()>>,
    ) -> Self {
        let data_path = cache_path(origin.path());
        let info_path = info_path(&data_path);
        let block_size = config.block_size;

        let inner = Inner {
            origin,
            store,
            config,
            stats,
            data_path,
            info_path,
            gate,
            state: Mutex::new(PrefetchState::NotStarted),
            state_cond: Condvar::new(),
            failed: AtomicBool::new(false),
            cleanup: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            files: OnceLock::new(),
            info: Mutex::new(CacheFileInfo::new(block_size)),
            write_lock: Mutex::new(()),
            queue: TaskQueue::new(),
            demand_blocks: AtomicU64::new(0),
            read_ahead_blocks: AtomicU64::new(0),
        };

        Self {
            inner: Arc::new(inner),
            worker: Mutex::new(None),
        }
    }

    /// Start the download loop on its own thread
    pub fn spawn(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("prefetch".to_string())
            .spawn(move || inner.run())
            .map_err(|e| {
                self.inner.failed.store(true, Ordering::SeqCst);
                self.inner.finish_state();
                CacheError::Local(e)
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Run the download loop on the calling thread until it finishes
    pub fn run(&self) {
        self.inner.run();
    }

    /// Block until the cache files are open
    ///
    /// Succeeds once the files are open, even if the loop has failed since.
    /// Returns an error if opening failed or the instance finished without
    /// ever opening them.
    pub fn wait_open(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        loop {
            if inner.files.get().is_some() {
                return Ok(());
            }
            if inner.failed.load(Ordering::SeqCst) {
                return Err(CacheError::Failed(inner.origin.path().to_string()));
            }
            if *state == PrefetchState::Finalized {
                return Err(CacheError::NotOpen(inner.origin.path().to_string()));
            }
            state = inner.state_cond.wait(state).unwrap();
        }
    }

    /// Read from the local data file
    ///
    /// Never blocks on downloads: returns `Ok(None)` if any block covering
    /// the range is still missing. Reads past the end of file return
    /// `Ok(Some(0))`.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<Option<usize>> {
        let files = self.inner.files()?;
        if buf.is_empty() || offset >= files.file_size {
            return Ok(Some(0));
        }
        let len = (buf.len() as u64).min(files.file_size - offset) as usize;
        let (first, last) = block_range(files.block_size, offset, len as u64);
        if self
            .inner
            .info
            .lock()
            .unwrap()
            .is_anything_empty_in_range(first, last)
        {
            return Ok(None);
        }
        let n = read_full_at(files.data.as_ref(), &mut buf[..len], offset).map_err(CacheError::Local)?;
        Ok(Some(n))
    }

    /// Inclusive block range covering `len` bytes at `offset`, clipped to
    /// the file. None when the range is empty or past the end.
    pub fn blocks_for_range(&self, offset: u64, len: u64) -> Option<(u32, u32)> {
        let files = self.inner.files.get()?;
        if len == 0 || offset >= files.file_size {
            return None;
        }
        let len = len.min(files.file_size - offset);
        Some(block_range(files.block_size, offset, len))
    }

    /// Number of blocks in `[first, last]` already present
    pub fn present_in_range(&self, first: u32, last: u32) -> u32 {
        let info = self.inner.info.lock().unwrap();
        (first..=last).filter(|&i| info.test_bit(i)).count() as u32
    }

    /// Queue a demand task for `[first, last]` and return its waiter
    pub fn enqueue(&self, first: u32, last: u32) -> Result<Waiter> {
        let (task, waiter) = Task::demand(first, last);
        match self.inner.queue.push(task) {
            Ok(()) => {
                debug!(path = %self.path(), first = first, last = last, "Queued demand task");
                Ok(waiter)
            }
            Err(_) if self.is_failed() => Err(CacheError::Failed(self.path().to_string())),
            Err(_) => Err(CacheError::Closed(self.path().to_string())),
        }
    }

    /// Ask the loop to stop at the next task boundary. Partial files are kept.
    pub fn close_cleanly(&self) {
        self.inner.request_stop();
    }

    /// Mark this instance failed; with `cleanup` the local files are removed
    pub fn fail(&self, cleanup: bool) {
        let inner = &self.inner;
        inner.failed.store(true, Ordering::SeqCst);
        if cleanup {
            inner.cleanup.store(true, Ordering::SeqCst);
        }
        inner.request_stop();

        let mut state = inner.state.lock().unwrap();
        match *state {
            // The loop cleans up on its way out.
            PrefetchState::Running => {}
            PrefetchState::NotStarted | PrefetchState::Failed | PrefetchState::Finalized => {
                *state = PrefetchState::Finalized;
                drop(state);
                inner.abort_pending();
                if cleanup {
                    inner.remove_files();
                }
                inner.state_cond.notify_all();
            }
        }
    }

    /// Append one attachment's statistics to the access log
    pub fn record_access(&self, stat: AccessStat) -> Result<()> {
        if self.inner.cleanup.load(Ordering::SeqCst) {
            return Ok(());
        }
        let files = self.inner.files()?;
        let _write = self.inner.write_lock.lock().unwrap();
        let mut info = self.inner.info.lock().unwrap();
        info.append_access_stat(stat, files.info.as_ref())
    }

    pub fn state(&self) -> PrefetchState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.inner.info.lock().unwrap().is_complete()
    }

    /// Remote identifier this instance caches
    pub fn path(&self) -> &str {
        self.inner.origin.path()
    }

    pub fn origin(&self) -> &Arc<dyn Origin> {
        &self.inner.origin
    }

    /// Data file path relative to the store root
    pub fn data_path(&self) -> &Path {
        &self.inner.data_path
    }

    pub fn info_path(&self) -> &Path {
        &self.inner.info_path
    }

    /// File size, once the files are open
    pub fn file_size(&self) -> Option<u64> {
        self.inner.files.get().map(|f| f.file_size)
    }

    /// Copy of the in-memory cache info
    pub fn cache_info(&self) -> CacheFileInfo {
        self.inner.info.lock().unwrap().clone()
    }

    pub fn status(&self) -> PrefetchStatus {
        let info = self.inner.info.lock().unwrap();
        PrefetchStatus {
            path: self.path().to_string(),
            state: self.state(),
            failed: self.is_failed(),
            file_size: self.file_size().unwrap_or(0),
            block_size: info.block_size(),
            blocks_total: info.block_count(),
            blocks_done: info.downloaded_blocks(),
            demand_blocks: self.inner.demand_blocks.load(Ordering::Relaxed),
            read_ahead_blocks: self.inner.read_ahead_blocks.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Prefetch {
    fn drop(&mut self) {
        self.inner.request_stop();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            if handle.join().is_err() {
                error!(path = %self.path(), "Prefetch worker panicked");
            }
        }
        debug!(path = %self.path(), "Prefetch released");
    }
}

impl Inner {
    fn files(&self) -> Result<&Files> {
        self.files
            .get()
            .ok_or_else(|| CacheError::NotOpen(self.origin.path().to_string()))
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.notify();
    }

    fn run(&self) {
        // A poisoned gate only means a predecessor panicked; its files are
        // re-validated on open anyway.
        let _gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());

        if let Err(e) = self.open() {
            error!(path = %self.origin.path(), error = %e, "Failed to open prefetch");
            self.failed.store(true, Ordering::SeqCst);
            self.finish();
            return;
        }

        {
            let info = self.info.lock().unwrap();
            info!(
                path = %self.origin.path(),
                blocks = info.block_count(),
                downloaded = info.downloaded_blocks(),
                "Beginning prefetch"
            );
        }

        let mut since_flush = 0u32;
        while let Some(task) = self.next_task() {
            match self.process(&task, &mut since_flush) {
                Ok(()) => task.finish(TaskStatus::Completed),
                Err(e) => {
                    error!(
                        path = %self.origin.path(),
                        first = task.first_block,
                        last = task.last_block,
                        error = %e,
                        "Failure prefetching file"
                    );
                    self.failed.store(true, Ordering::SeqCst);
                    task.finish(TaskStatus::Aborted);
                    break;
                }
            }
            if self.stop.load(Ordering::SeqCst) {
                debug!(path = %self.origin.path(), "Stop requested, leaving download loop");
                break;
            }
        }

        self.finish();
    }

    /// NotStarted -> Running, then open the files and load or create the cache info
    fn open(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != PrefetchState::NotStarted {
                return Err(CacheError::Closed(self.origin.path().to_string()));
            }
            *state = PrefetchState::Running;
        }

        let file_size = self.origin.len().map_err(CacheError::Origin)?;
        let data = self
            .store
            .open(&self.data_path, true)
            .map_err(CacheError::Local)?;
        let info_file = self
            .store
            .open(&self.info_path, true)
            .map_err(CacheError::Local)?;

        let mut info = CacheFileInfo::new(self.config.block_size);
        let header_len = info.read_header(info_file.as_ref())?;
        let resumable = header_len > 0
            && blocks_for(info.block_size(), file_size).ok() == Some(info.block_count());
        if resumable {
            debug!(
                path = %self.origin.path(),
                downloaded = info.downloaded_blocks(),
                "Resuming from cache info"
            );
        } else {
            if header_len > 0 {
                warn!(
                    path = %self.origin.path(),
                    blocks = info.block_count(),
                    file_size = file_size,
                    "Cache info does not match origin size, starting fresh"
                );
            }
            info = CacheFileInfo::for_file_size(self.config.block_size, file_size)?;
            info.write_header(info_file.as_ref())?;
        }
        info.check_complete();
        let block_size = info.block_size();
        *self.info.lock().unwrap() = info;

        let files = Files {
            data,
            info: info_file,
            file_size,
            block_size,
        };
        if self.files.set(files).is_err() {
            return Err(CacheError::Closed(self.origin.path().to_string()));
        }

        let _state = self.state.lock().unwrap();
        self.state_cond.notify_all();
        Ok(())
    }

    /// Demand work first; otherwise read ahead from the first missing block
    fn next_task(&self) -> Option<Task> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(task) = self.queue.pop() {
                return Some(task);
            }
            let missing = self.info.lock().unwrap().first_missing();
            match missing {
                None => {
                    if self.queue.close_if_empty() {
                        debug!(path = %self.origin.path(), "File complete, fetcher idle");
                        return None;
                    }
                }
                Some(block) if self.config.read_ahead => return Some(Task::read_ahead(block)),
                Some(_) => self.queue.wait(IDLE_WAIT),
            }
        }
    }

    fn process(&self, task: &Task, since_flush: &mut u32) -> Result<()> {
        let files = self.files()?;
        let n_blocks = self.info.lock().unwrap().block_count();
        let mut buf = Vec::new();

        for block in task.blocks() {
            if block >= n_blocks {
                break;
            }
            if self.info.lock().unwrap().test_bit(block) {
                continue;
            }

            let offset = block as u64 * files.block_size;
            let len = files.block_size.min(files.file_size - offset) as usize;
            buf.resize(len, 0);
            self.fetch(&mut buf, offset)?;
            write_all_at(files.data.as_ref(), &buf, offset).map_err(CacheError::Local)?;

            self.info.lock().unwrap().set_bit(block);
            if task.is_demand() {
                self.demand_blocks.fetch_add(1, Ordering::Relaxed);
            } else {
                self.read_ahead_blocks.fetch_add(1, Ordering::Relaxed);
            }
            self.stats.record_download(len as u64);
            trace!(path = %self.origin.path(), block = block, len = len, "Fetched block");

            *since_flush += 1;
            if *since_flush >= self.config.flush_every_blocks {
                self.persist()?;
                *since_flush = 0;
            }
        }

        // A woken reader should find the bitmap already on disk.
        if task.is_demand() && *since_flush > 0 {
            self.persist()?;
            *since_flush = 0;
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes from the origin, retrying interrupted reads
    fn fetch(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let at = offset + filled as u64;
            match self.origin.read_at(&mut buf[filled..], at) {
                Ok(0) => {
                    return Err(CacheError::Origin(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("origin ended at offset {}", at),
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if is_transient(&e) => {
                    debug!(path = %self.origin.path(), offset = at, "Interrupted origin read, retrying");
                }
                Err(e) => return Err(CacheError::Origin(e)),
            }
        }
        Ok(())
    }

    /// Sync block data, then write the bitmap header
    fn persist(&self) -> Result<()> {
        let files = self.files()?;
        files.data.sync().map_err(CacheError::Local)?;

        let _write = self.write_lock.lock().unwrap();
        let header = self.info.lock().unwrap().header_bytes();
        write_all_at(files.info.as_ref(), &header, 0).map_err(CacheError::Local)?;
        trace!(path = %self.origin.path(), "Persisted cache info");
        Ok(())
    }

    fn abort_pending(&self) {
        for task in self.queue.close() {
            task.finish(TaskStatus::Aborted);
        }
    }

    fn remove_files(&self) {
        for path in [&self.data_path, &self.info_path] {
            if let Err(e) = self.store.unlink(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove partial cache file");
            }
        }
    }

    fn finish(&self) {
        self.abort_pending();

        let (complete, downloaded) = {
            let mut info = self.info.lock().unwrap();
            info.check_complete();
            (info.is_complete(), info.downloaded_blocks())
        };

        let failed = self.failed.load(Ordering::SeqCst);
        if failed && self.cleanup.load(Ordering::SeqCst) {
            self.remove_files();
        } else if self.files.get().is_some() {
            if let Err(e) = self.persist() {
                error!(path = %self.origin.path(), error = %e, "Failed to persist cache info");
            }
            if let Ok(files) = self.files() {
                if let Err(e) = files.info.sync() {
                    warn!(path = %self.origin.path(), error = %e, "Failed to sync cache info");
                }
            }
        }

        if failed {
            let mut state = self.state.lock().unwrap();
            *state = PrefetchState::Failed;
            self.state_cond.notify_all();
        }
        self.finish_state();

        info!(
            path = %self.origin.path(),
            complete = complete,
            downloaded = downloaded,
            failed = failed,
            "Prefetch finished"
        );
    }

    fn finish_state(&self) {
        let mut state = self.state.lock().unwrap();
        *state = PrefetchState::Finalized;
        self.state_cond.notify_all();
    }
}

/// Inclusive block range for a non-empty byte range
fn block_range(block_size: u64, offset: u64, len: u64) -> (u32, u32) {
    let first = offset / block_size;
    let last = (offset + len - 1) / block_size;
    (first as u32, last as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsStore;
    use crate::testutil::MemOrigin;
    use std::collections::HashSet;

    const KIB: usize = 1024;

    fn setup(
        origin: MemOrigin,
        block_size: u64,
        read_ahead: bool,
    ) -> (tempfile::TempDir, Arc<MemOrigin>, Prefetch) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn LocalStore> = Arc::new(FsStore::new(dir.path()).unwrap());
        let origin = Arc::new(origin);
        let config = PrefetchConfig {
            block_size,
            flush_every_blocks: 2,
            read_ahead,
        };
        let prefetch = Prefetch::new(
            origin.clone() as Arc<dyn Origin>,
            store,
            config,
            Arc::new(CacheStats::new()),
        );
        (dir, origin, prefetch)
    }

    #[test]
    fn test_block_range() {
        assert_eq!(block_range(128, 0, 1), (0, 0));
        assert_eq!(block_range(128, 0, 128), (0, 0));
        assert_eq!(block_range(128, 127, 2), (0, 1));
        assert_eq!(block_range(128, 300, 100), (2, 3));
    }

    #[test]
    fn test_full_download_three_blocks() {
        let block = 128 * KIB;
        let (dir, origin, prefetch) =
            setup(MemOrigin::new("root://h//data/f.bin", 300 * KIB), block as u64, true);

        prefetch.run();

        let mut reads = origin.reads();
        reads.sort();
        assert_eq!(
            reads,
            vec![(0, block), (block as u64, block), (2 * block as u64, 44 * KIB)]
        );
        assert!(prefetch.is_complete());
        assert_eq!(prefetch.state(), PrefetchState::Finalized);

        let mut buf = vec![0u8; 300 * KIB];
        assert_eq!(prefetch.read(&mut buf, 0).unwrap(), Some(300 * KIB));
        assert_eq!(buf, origin.expected(0, 300 * KIB));
        assert!(dir.path().join("data/f.bin.cinfo").exists());
    }

    #[test]
    fn test_read_reports_missing_blocks() {
        let (_dir, origin, prefetch) = setup(MemOrigin::new("/f", 4 * 4096).gated(), 4096, false);
        prefetch.spawn().unwrap();
        prefetch.wait_open().unwrap();

        let mut buf = vec![0u8; 100];
        assert_eq!(prefetch.read(&mut buf, 5000).unwrap(), None);
        assert_eq!(prefetch.read(&mut buf, 1 << 20).unwrap(), Some(0));
        assert_eq!(prefetch.blocks_for_range(5000, 100), Some((1, 1)));
        assert_eq!(prefetch.blocks_for_range(4090, 10_000_000), Some((0, 3)));
        assert_eq!(prefetch.present_in_range(0, 3), 0);

        origin.open_gate();
    }

    #[test]
    fn test_demand_task_signals_waiter() {
        let (dir, origin, prefetch) = setup(MemOrigin::new("/f", 10 * 4096), 4096, false);
        prefetch.spawn().unwrap();
        prefetch.wait_open().unwrap();

        let waiter = prefetch.enqueue(2, 4).unwrap();
        assert_eq!(waiter.blocking_recv().unwrap(), TaskStatus::Completed);
        assert_eq!(prefetch.present_in_range(2, 4), 3);

        let offsets: HashSet<u64> = origin.reads().into_iter().map(|(o, _)| o).collect();
        assert_eq!(offsets, [8192, 12288, 16384].into_iter().collect());

        // The bitmap was persisted before the waiter woke.
        let store = FsStore::new(dir.path()).unwrap();
        let file = store.open(prefetch.info_path(), false).unwrap();
        let mut on_disk = CacheFileInfo::new(0);
        on_disk.read_header(file.as_ref()).unwrap();
        assert!(!on_disk.is_anything_empty_in_range(2, 4));
    }

    #[test]
    fn test_stale_info_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn LocalStore> = Arc::new(FsStore::new(dir.path()).unwrap());

        // Left behind by an origin that used to be two blocks long.
        {
            let info_file = store.open(Path::new("/grown.dat.cinfo"), true).unwrap();
            let mut info = CacheFileInfo::for_file_size(4096, 2 * 4096).unwrap();
            info.set_bit(0);
            info.set_bit(1);
            info.write_header(info_file.as_ref()).unwrap();
        }

        let origin = Arc::new(MemOrigin::new("/grown.dat", 5 * 4096));
        let config = PrefetchConfig {
            block_size: 4096,
            flush_every_blocks: 2,
            read_ahead: true,
        };
        let prefetch = Prefetch::new(
            origin.clone() as Arc<dyn Origin>,
            Arc::clone(&store),
            config,
            Arc::new(CacheStats::new()),
        );
        prefetch.run();

        assert!(!prefetch.is_failed());
        assert!(prefetch.is_complete());
        let counts = origin.read_counts();
        for b in 0..5u64 {
            assert_eq!(counts.get(&(b * 4096)), Some(&1), "block {}", b);
        }

        let info_file = store.open(Path::new("/grown.dat.cinfo"), false).unwrap();
        let mut info = CacheFileInfo::new(0);
        assert!(info.read_header(info_file.as_ref()).unwrap() > 0);
        assert_eq!(info.block_count(), 5);
        assert!(info.is_complete());

        let mut buf = vec![0u8; 5 * 4096];
        assert_eq!(prefetch.read(&mut buf, 0).unwrap(), Some(5 * 4096));
        assert_eq!(buf, origin.expected(0, 5 * 4096));
    }

    #[test]
    fn test_stored_block_size_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn LocalStore> = Arc::new(FsStore::new(dir.path()).unwrap());
        let origin = Arc::new(MemOrigin::new("/wide.dat", 4 * 8192));

        // A previous session used 8 KiB blocks and fetched the first two.
        {
            let info_file = store.open(Path::new("/wide.dat.cinfo"), true).unwrap();
            let mut info = CacheFileInfo::for_file_size(8192, 4 * 8192).unwrap();
            info.set_bit(0);
            info.set_bit(1);
            info.write_header(info_file.as_ref()).unwrap();
            let data = store.open(Path::new("/wide.dat"), true).unwrap();
            write_all_at(data.as_ref(), &origin.expected(0, 2 * 8192), 0).unwrap();
        }

        let config = PrefetchConfig {
            block_size: 4096,
            flush_every_blocks: 2,
            read_ahead: true,
        };
        let prefetch = Prefetch::new(
            origin.clone() as Arc<dyn Origin>,
            store,
            config,
            Arc::new(CacheStats::new()),
        );
        prefetch.run();

        assert!(prefetch.is_complete());
        assert_eq!(prefetch.cache_info().block_size(), 8192);
        assert_eq!(prefetch.status().blocks_total, 4);
        let mut reads = origin.reads();
        reads.sort();
        assert_eq!(reads, vec![(2 * 8192, 8192), (3 * 8192, 8192)]);

        let mut buf = vec![0u8; 4 * 8192];
        assert_eq!(prefetch.read(&mut buf, 0).unwrap(), Some(4 * 8192));
        assert_eq!(buf, origin.expected(0, 4 * 8192));
    }

    #[test]
    fn test_resume_fetches_only_missing_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn LocalStore> = Arc::new(FsStore::new(dir.path()).unwrap());
        let n_blocks = 11u32;
        let done: HashSet<u32> = [0, 3, 4, 5, 9].into_iter().collect();

        // Lay down a previous session's metadata and data.
        let first = Arc::new(MemOrigin::new("/store/run.dat", n_blocks as usize * 4096 - 100).gated());
        {
            let info_file = store.open(Path::new("/store/run.dat.cinfo"), true).unwrap();
            let mut info = CacheFileInfo::for_file_size(4096, first.len().unwrap()).unwrap();
            for &b in &done {
                info.set_bit(b);
            }
            info.write_header(info_file.as_ref()).unwrap();
            let data = store.open(Path::new("/store/run.dat"), true).unwrap();
            for &b in &done {
                let offset = b as u64 * 4096;
                let bytes = first.expected(offset, 4096);
                write_all_at(data.as_ref(), &bytes, offset).unwrap();
            }
        }

        let config = PrefetchConfig {
            block_size: 4096,
            flush_every_blocks: 4,
            read_ahead: true,
        };
        let prefetch = Prefetch::new(
            first.clone() as Arc<dyn Origin>,
            store,
            config,
            Arc::new(CacheStats::new()),
        );
        prefetch.spawn().unwrap();
        prefetch.wait_open().unwrap();
        {
            let info = prefetch.cache_info();
            for b in 0..n_blocks {
                assert_eq!(!info.is_anything_empty_in_range(b, b), done.contains(&b));
            }
        }
        first.open_gate();
        while prefetch.state() != PrefetchState::Finalized {
            std::thread::sleep(Duration::from_millis(5));
        }

        let fetched: HashSet<u32> = first
            .reads()
            .into_iter()
            .map(|(o, _)| (o / 4096) as u32)
            .collect();
        let expected: HashSet<u32> = (0..n_blocks).filter(|b| !done.contains(b)).collect();
        assert_eq!(fetched, expected);
        assert!(prefetch.is_complete());

        let mut buf = vec![0u8; n_blocks as usize * 4096];
        let n = prefetch.read(&mut buf, 0).unwrap().unwrap();
        assert_eq!(&buf[..n], &first.expected(0, n)[..]);
    }

    #[test]
    fn test_origin_failure_aborts_waiters() {
        let (_dir, _origin, prefetch) =
            setup(MemOrigin::new("/f", 8 * 4096).failing_at(3 * 4096), 4096, false);
        prefetch.spawn().unwrap();
        prefetch.wait_open().unwrap();

        let waiter = prefetch.enqueue(2, 5).unwrap();
        assert_eq!(waiter.blocking_recv().unwrap(), TaskStatus::Aborted);

        while prefetch.state() != PrefetchState::Finalized {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(prefetch.is_failed());
        assert!(matches!(prefetch.enqueue(6, 6), Err(CacheError::Failed(_))));
        // Block 2 landed before the failure; partial state is kept.
        assert_eq!(prefetch.present_in_range(2, 2), 1);
    }

    #[test]
    fn test_interrupted_origin_read_is_retried() {
        let (_dir, origin, prefetch) =
            setup(MemOrigin::new("/f", 4096).interrupting_once(), 4096, true);
        prefetch.run();

        assert!(!prefetch.is_failed());
        assert!(prefetch.is_complete());
        assert_eq!(origin.reads().len(), 1);
    }

    #[test]
    fn test_close_cleanly_keeps_partial_files() {
        let (dir, origin, prefetch) = setup(MemOrigin::new("/p/f", 6 * 4096), 4096, false);
        prefetch.spawn().unwrap();
        prefetch.wait_open().unwrap();

        let waiter = prefetch.enqueue(0, 1).unwrap();
        assert_eq!(waiter.blocking_recv().unwrap(), TaskStatus::Completed);

        prefetch.close_cleanly();
        while prefetch.state() != PrefetchState::Finalized {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!prefetch.is_failed());
        assert!(!prefetch.is_complete());
        assert!(dir.path().join("p/f").exists());
        assert!(dir.path().join("p/f.cinfo").exists());
        assert_eq!(origin.reads().len(), 2);
        assert!(matches!(prefetch.enqueue(2, 2), Err(CacheError::Closed(_))));
    }

    #[test]
    fn test_fail_with_cleanup_removes_files() {
        let (dir, _origin, prefetch) = setup(MemOrigin::new("/p/g", 4096), 4096, true);
        prefetch.run();
        assert!(dir.path().join("p/g").exists());

        prefetch.fail(true);
        assert!(prefetch.is_failed());
        assert!(!dir.path().join("p/g").exists());
        assert!(!dir.path().join("p/g.cinfo").exists());
    }

    #[test]
    fn test_access_stats_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn LocalStore> = Arc::new(FsStore::new(dir.path()).unwrap());
        let origin: Arc<dyn Origin> = Arc::new(MemOrigin::new("/s", 3 * 4096));
        let config = PrefetchConfig {
            block_size: 4096,
            ..PrefetchConfig::default()
        };

        let stat = AccessStat {
            open_time: 10,
            close_time: 20,
            bytes_transferred: 4096,
            hits: 1,
            misses: 0,
        };
        {
            let prefetch = Prefetch::new(
                origin.clone(),
                store.clone(),
                config.clone(),
                Arc::new(CacheStats::new()),
            );
            prefetch.run();
            prefetch.record_access(stat).unwrap();
        }

        let again = Prefetch::new(origin, store, config, Arc::new(CacheStats::new()));
        again.run();
        let info = again.cache_info();
        assert_eq!(info.access_stats(), &[stat]);
        assert!(info.is_complete());
    }

    #[test]
    fn test_open_failure_marks_failed() {
        struct BrokenOrigin;
        impl Origin for BrokenOrigin {
            fn path(&self) -> &str {
                "/broken"
            }
            fn len(&self) -> std::io::Result<u64> {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
            }
            fn read_at(&self, _buf: &mut [u8], _offset: u64) -> std::io::Result<usize> {
                unreachable!()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn LocalStore> = Arc::new(FsStore::new(dir.path()).unwrap());
        let prefetch = Prefetch::new(
            Arc::new(BrokenOrigin),
            store,
            PrefetchConfig::default(),
            Arc::new(CacheStats::new()),
        );
        prefetch.spawn().unwrap();

        assert!(matches!(prefetch.wait_open(), Err(CacheError::Failed(_))));
        assert!(prefetch.is_failed());
    }
}
