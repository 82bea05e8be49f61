//! Reader attachment
//!
//! A [`ProxyIo`] is one reader's view of a remote file. Reads are served
//! from cached blocks when present; otherwise the reader queues a demand
//! task on the shared [`Prefetch`] and blocks until the fetcher signals it.
//! Files the cache does not handle are read straight from the origin.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, trace, warn};

use crate::cinfo::{unix_seconds, AccessStat};
use crate::error::{is_transient, CacheError, Result};
use crate::prefetch::{Prefetch, TaskStatus, Waiter};
use crate::stats::CacheStats;
use crate::store::Origin;

/// Maximum number of chunks accepted by one vectored read
pub const READV_MAXCHUNKS: usize = 512;

/// One element of a vectored read
#[derive(Debug)]
pub struct IoChunk<'a> {
    pub offset: u64,
    pub buf: &'a mut [u8],
}

impl<'a> IoChunk<'a> {
    pub fn new(offset: u64, buf: &'a mut [u8]) -> Self {
        Self { offset, buf }
    }
}

/// Outcome of the non-blocking first half of a read
enum Step {
    Done(usize),
    Wait(Waiter),
    /// Nothing to wait on; try the cache once more, then the origin
    Retry,
}

/// Per-attachment read dispatcher
pub struct ProxyIo {
    origin: Arc<dyn Origin>,
    prefetch: Option<Arc<Prefetch>>,
    stats: Arc<CacheStats>,
    access: AccessStat,
    bytes_from_origin: u64,
}

impl ProxyIo {
    pub fn new(origin: Arc<dyn Origin>, prefetch: Option<Arc<Prefetch>>, stats: Arc<CacheStats>) -> Self {
        let access = AccessStat {
            open_time: unix_seconds(SystemTime::now()),
            ..AccessStat::default()
        };
        Self {
            origin,
            prefetch,
            stats,
            access,
            bytes_from_origin: 0,
        }
    }

    pub fn path(&self) -> &str {
        self.origin.path()
    }

    /// Whether reads currently go through the cache
    pub fn is_cached(&self) -> bool {
        self.prefetch.is_some()
    }

    pub fn prefetch(&self) -> Option<&Arc<Prefetch>> {
        self.prefetch.as_ref()
    }

    /// Statistics accumulated by this attachment so far
    pub fn access(&self) -> AccessStat {
        self.access
    }

    /// Read up to `buf.len()` bytes at `offset`
    ///
    /// Blocks while the fetcher downloads missing blocks. Returns an error
    /// if the fetcher fails before the range is present.
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let Some(prefetch) = self.usable_prefetch() else {
            return self.passthrough(buf, offset);
        };
        match self.begin(&prefetch, buf, offset)? {
            Step::Done(n) => Ok(n),
            step => self.complete(&prefetch, buf, offset, step),
        }
    }

    /// Read several ranges at once
    ///
    /// Cached chunks are served immediately; demand tasks for every missing
    /// chunk are queued before waiting on any of them. Returns the total
    /// number of bytes read.
    pub fn read_v(&mut self, chunks: &mut [IoChunk<'_>]) -> Result<usize> {
        if chunks.len() > READV_MAXCHUNKS {
            return Err(CacheError::TooManyChunks {
                count: chunks.len(),
                max: READV_MAXCHUNKS,
            });
        }

        let Some(prefetch) = self.usable_prefetch() else {
            let mut total = 0;
            for chunk in chunks.iter_mut() {
                total += self.passthrough(chunk.buf, chunk.offset)?;
            }
            return Ok(total);
        };

        let mut total = 0;
        let mut pending = Vec::new();
        for (idx, chunk) in chunks.iter_mut().enumerate() {
            match self.begin(&prefetch, chunk.buf, chunk.offset)? {
                Step::Done(n) => total += n,
                step => pending.push((idx, step)),
            }
        }
        debug!(
            path = self.path(),
            chunks = chunks.len(),
            pending = pending.len(),
            "Vectored read"
        );

        for (idx, step) in pending {
            let chunk = &mut chunks[idx];
            total += self.complete(&prefetch, chunk.buf, chunk.offset, step)?;
        }
        Ok(total)
    }

    /// Release the prefetch, log this attachment's statistics and hand the
    /// origin back to the caller
    pub fn detach(mut self) -> Arc<dyn Origin> {
        self.release();
        Arc::clone(&self.origin)
    }

    /// The prefetch, once its files are open. An instance that never opened
    /// its files is dropped and this attachment turns into a passthrough.
    fn usable_prefetch(&mut self) -> Option<Arc<Prefetch>> {
        let prefetch = self.prefetch.as_ref()?;
        match prefetch.wait_open() {
            Ok(()) => Some(Arc::clone(prefetch)),
            Err(e) => {
                warn!(path = self.path(), error = %e, "Cache unavailable, reading from origin");
                self.prefetch = None;
                None
            }
        }
    }

    /// Serve from local blocks or queue a demand task, without blocking
    fn begin(&mut self, prefetch: &Prefetch, buf: &mut [u8], offset: u64) -> Result<Step> {
        if offset.checked_add(buf.len() as u64).is_none() {
            return Err(CacheError::InvalidRange {
                offset,
                len: buf.len() as u64,
                size: prefetch.file_size().unwrap_or(0),
            });
        }
        let Some((first, last)) = prefetch.blocks_for_range(offset, buf.len() as u64) else {
            return Ok(Step::Done(0));
        };

        if let Some(n) = prefetch.read(buf, offset)? {
            trace!(path = self.path(), offset = offset, len = n, "Cache hit");
            self.access.hits += 1;
            self.access.bytes_transferred += n as i64;
            self.stats.record_hit(n as u64);
            return Ok(Step::Done(n));
        }
        if prefetch.is_failed() {
            return Err(CacheError::Failed(self.path().to_string()));
        }

        match prefetch.enqueue(first, last) {
            Ok(waiter) => Ok(Step::Wait(waiter)),
            Err(CacheError::Closed(_)) => Ok(Step::Retry),
            Err(e) => Err(e),
        }
    }

    /// Block on a queued task, then serve the range
    fn complete(&mut self, prefetch: &Prefetch, buf: &mut [u8], offset: u64, step: Step) -> Result<usize> {
        let status = match step {
            Step::Done(n) => return Ok(n),
            Step::Wait(waiter) => waiter.blocking_recv().unwrap_or(TaskStatus::Aborted),
            Step::Retry => TaskStatus::Aborted,
        };

        if let Some(n) = prefetch.read(buf, offset)? {
            debug!(path = self.path(), offset = offset, len = n, "Served after download");
            self.access.misses += 1;
            self.access.bytes_transferred += n as i64;
            self.stats.record_demand_miss(n as u64);
            return Ok(n);
        }
        if prefetch.is_failed() {
            return Err(CacheError::Failed(self.path().to_string()));
        }
        if status == TaskStatus::Completed {
            warn!(path = self.path(), offset = offset, "Blocks missing after completed task");
        }
        // Fetcher stopped cleanly before reaching this range.
        self.passthrough(buf, offset)
    }

    fn passthrough(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = loop {
            match self.origin.read_at(buf, offset) {
                Ok(n) => break n,
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(CacheError::Origin(e)),
            }
        };
        trace!(path = self.path(), offset = offset, len = n, "Origin passthrough");
        self.access.misses += 1;
        self.access.bytes_transferred += n as i64;
        self.bytes_from_origin += n as u64;
        self.stats.record_passthrough(n as u64);
        Ok(n)
    }

    fn release(&mut self) {
        let Some(prefetch) = self.prefetch.take() else {
            return;
        };
        self.access.close_time = unix_seconds(SystemTime::now());
        if let Err(e) = prefetch.record_access(self.access) {
            warn!(path = self.path(), error = %e, "Failed to record access statistics");
        }
        debug!(
            path = self.path(),
            hits = self.access.hits,
            misses = self.access.misses,
            bytes = self.access.bytes_transferred,
            origin_bytes = self.bytes_from_origin,
            "Detached reader"
        );
    }
}

impl Drop for ProxyIo {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cinfo::CacheFileInfo;
    use crate::decision::PathsDecision;
    use crate::prefetch::{PrefetchConfig, PrefetchState};
    use crate::registry::Registry;
    use crate::store::{FsStore, LocalStore};
    use crate::testutil::MemOrigin;
    use std::path::Path;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const KIB: usize = 1024;

    fn registry(dir: &Path, block_size: u64, read_ahead: bool) -> Arc<Registry> {
        let store: Arc<dyn LocalStore> = Arc::new(FsStore::new(dir).unwrap());
        Arc::new(Registry::new(
            store,
            PrefetchConfig {
                block_size,
                flush_every_blocks: 8,
                read_ahead,
            },
        ))
    }

    #[test]
    fn test_whole_file_then_second_reader_hits() {
        let dir = tempfile::tempdir().unwrap();
        let block = 128 * KIB;
        let registry = registry(dir.path(), block as u64, false);
        let origin = Arc::new(MemOrigin::new("root://srv//data/f300", 300 * KIB));

        let mut reader = registry.attach(origin.clone());
        let mut buf = vec![0u8; 300 * KIB];
        assert_eq!(reader.read(&mut buf, 0).unwrap(), 300 * KIB);
        assert_eq!(buf, origin.expected(0, 300 * KIB));

        let mut reads = origin.reads();
        reads.sort();
        assert_eq!(
            reads,
            vec![(0, block), (block as u64, block), (2 * block as u64, 44 * KIB)]
        );
        let prefetch = Arc::clone(reader.prefetch().unwrap());
        let info = prefetch.cache_info();
        assert_eq!(info.block_map().as_bytes(), &[0b111]);
        assert!(info.is_complete());
        drop(prefetch);
        reader.detach();

        let mut second = registry.attach(origin.clone());
        let mut again = vec![0u8; 300 * KIB];
        assert_eq!(second.read(&mut again, 0).unwrap(), 300 * KIB);
        assert_eq!(again, buf);
        assert_eq!(origin.reads().len(), 3);
        assert_eq!(second.access().hits, 1);
        assert_eq!(registry.stats().snapshot().hits, 1);
        assert_eq!(registry.stats().snapshot().misses, 1);
    }

    #[test]
    fn test_two_readers_share_one_fetcher() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 4096, false);
        let origin = Arc::new(MemOrigin::new("/shared/file", 3 * 4096).gated());

        let mut a = registry.attach(origin.clone());
        let mut b = registry.attach(origin.clone());
        assert!(Arc::ptr_eq(a.prefetch().unwrap(), b.prefetch().unwrap()));

        let (tx, rx) = mpsc::channel();
        let tx_b = tx.clone();
        let ta = thread::spawn(move || {
            let mut buf = vec![0u8; 4096];
            let n = a.read(&mut buf, 0).unwrap();
            tx.send('a').unwrap();
            (a, buf, n)
        });
        let tb = thread::spawn(move || {
            let mut buf = vec![0u8; 100];
            let n = b.read(&mut buf, 2 * 4096 + 7).unwrap();
            tx_b.send('b').unwrap();
            (b, buf, n)
        });

        // Nothing is present yet, so both readers stay blocked.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        origin.open_gate();

        let (a, buf_a, n_a) = ta.join().unwrap();
        let (b, buf_b, n_b) = tb.join().unwrap();
        assert_eq!((n_a, n_b), (4096, 100));
        assert_eq!(buf_a, origin.expected(0, 4096));
        assert_eq!(buf_b, origin.expected(2 * 4096 + 7, 100));

        let counts = origin.read_counts();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts.get(&0), Some(&1));
        assert_eq!(counts.get(&8192), Some(&1));
        let prefetch = a.prefetch().unwrap();
        assert_eq!(prefetch.present_in_range(1, 1), 0);
        assert_eq!(registry.live().len(), 1);
        drop(b);
    }

    #[test]
    fn test_overlapping_readers_fetch_each_block_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 4096, true);
        let origin = Arc::new(MemOrigin::new("/overlap", 16 * 4096).gated());

        let handles: Vec<_> = (0..6u64)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let origin = origin.clone();
                thread::spawn(move || {
                    let mut reader = registry.attach(origin.clone());
                    let offset = i * 2 * 4096 + 100;
                    let mut buf = vec![0u8; 5 * 4096];
                    let n = reader.read(&mut buf, offset).unwrap();
                    assert_eq!(&buf[..n], &origin.expected(offset, n)[..]);
                    reader
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        origin.open_gate();
        let readers: Vec<ProxyIo> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for (offset, count) in origin.read_counts() {
            assert_eq!(count, 1, "block at {} fetched {} times", offset, count);
        }
        drop(readers);
    }

    #[test]
    fn test_failed_fetch_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 4096, false);
        let origin = Arc::new(MemOrigin::new("/bad", 4 * 4096).failing_at(4096));

        let mut reader = registry.attach(origin.clone());
        let mut buf = vec![0u8; 3 * 4096];
        assert!(matches!(reader.read(&mut buf, 0), Err(CacheError::Failed(_))));

        let prefetch = Arc::clone(reader.prefetch().unwrap());
        while prefetch.state() != PrefetchState::Finalized {
            thread::sleep(Duration::from_millis(5));
        }
        // Later readers are refused rather than left waiting.
        let mut other = vec![0u8; 10];
        assert!(matches!(reader.read(&mut other, 3 * 4096), Err(CacheError::Failed(_))));
        // Block 0 arrived before the failure and is still served.
        assert_eq!(reader.read(&mut other, 0).unwrap(), 10);
    }

    #[test]
    fn test_rejected_path_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn LocalStore> = Arc::new(FsStore::new(dir.path()).unwrap());
        let registry = Registry::new(store, PrefetchConfig::default())
            .with_admission(Arc::new(PathsDecision::new(["/nocache"])));
        let origin = Arc::new(MemOrigin::new("/nocache/f", 5000));

        let mut reader = registry.attach(origin.clone());
        assert!(!reader.is_cached());
        let mut buf = vec![0u8; 1000];
        assert_eq!(reader.read(&mut buf, 4500).unwrap(), 500);
        assert_eq!(&buf[..500], &origin.expected(4500, 500)[..]);
        assert_eq!(origin.reads(), vec![(4500, 1000)]);
        assert_eq!(registry.stats().snapshot().bytes_from_origin, 500);
        assert!(!dir.path().join("nocache").exists());
    }

    #[test]
    fn test_open_failure_falls_back_to_origin() {
        struct NoLength(MemOrigin);
        impl Origin for NoLength {
            fn path(&self) -> &str {
                self.0.path()
            }
            fn len(&self) -> std::io::Result<u64> {
                Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "no stat"))
            }
            fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
                self.0.read_at(buf, offset)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 4096, true);
        let mut reader = registry.attach(Arc::new(NoLength(MemOrigin::new("/nolen", 64))));
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf, 8).unwrap(), 16);
        assert!(!reader.is_cached());
    }

    #[test]
    fn test_read_past_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 4096, true);
        let origin = Arc::new(MemOrigin::new("/short", 100));

        let mut reader = registry.attach(origin.clone());
        let mut buf = [0u8; 64];
        assert_eq!(reader.read(&mut buf, 100).unwrap(), 0);
        assert_eq!(reader.read(&mut buf, 80).unwrap(), 20);
        assert!(matches!(
            reader.read(&mut buf, u64::MAX - 10),
            Err(CacheError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_vectored_read() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 4096, false);
        let origin = Arc::new(MemOrigin::new("/vec", 10 * 4096));

        let mut reader = registry.attach(origin.clone());
        let mut warm = vec![0u8; 4096];
        reader.read(&mut warm, 0).unwrap();

        let mut a = vec![0u8; 50];
        let mut b = vec![0u8; 4096];
        let mut c = vec![0u8; 10];
        let total = {
            let mut chunks = [
                IoChunk::new(10, &mut a),
                IoChunk::new(5 * 4096, &mut b),
                IoChunk::new(9 * 4096 + 2, &mut c),
            ];
            reader.read_v(&mut chunks).unwrap()
        };
        assert_eq!(total, 50 + 4096 + 10);
        assert_eq!(a, origin.expected(10, 50));
        assert_eq!(b, origin.expected(5 * 4096, 4096));
        assert_eq!(c, origin.expected(9 * 4096 + 2, 10));

        let counts = origin.read_counts();
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n == 1));
        // The warm-up read and the two downloads are misses.
        assert_eq!(reader.access().hits, 1);
        assert_eq!(reader.access().misses, 3);
    }

    #[test]
    fn test_vectored_read_chunk_limit() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 4096, false);
        let mut reader = registry.attach(Arc::new(MemOrigin::new("/limit", 4096)));

        let mut bufs: Vec<[u8; 1]> = vec![[0u8; 1]; READV_MAXCHUNKS + 1];
        let mut chunks: Vec<IoChunk<'_>> = bufs
            .iter_mut()
            .enumerate()
            .map(|(i, b)| IoChunk::new(i as u64, b))
            .collect();
        assert!(matches!(
            reader.read_v(&mut chunks),
            Err(CacheError::TooManyChunks { count, max }) if count == READV_MAXCHUNKS + 1 && max == READV_MAXCHUNKS
        ));
    }

    #[test]
    fn test_detach_records_access() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 4096, true);
        let origin = Arc::new(MemOrigin::new("/acc/file", 2 * 4096));

        let mut reader = registry.attach(origin.clone());
        let mut buf = vec![0u8; 2 * 4096];
        reader.read(&mut buf, 0).unwrap();
        let returned = reader.detach();
        assert_eq!(returned.path(), "/acc/file");

        let file = registry.store().open(Path::new("/acc/file.cinfo"), false).unwrap();
        let mut info = CacheFileInfo::new(0);
        assert!(info.read_header(file.as_ref()).unwrap() > 0);
        assert_eq!(info.access_count(), 1);
        let stat = info.access_stats()[0];
        assert_eq!(stat.bytes_transferred, 2 * 4096);
        assert_eq!(stat.hits + stat.misses, 1);
        assert!(stat.close_time >= stat.open_time);
    }
}
