//! Cache file info
//!
//! Per-file metadata persisted next to the cached data:
//!
//! ```text
//! [0]          i64  block size
//! [8]          i32  block count
//! [12]         u8[] bitmap, ceil(block count / 8) bytes
//! [12+bm]      i32  access record count
//! [16+bm]      AccessStat[access record count]
//! ```
//!
//! All integers are little-endian. The header length depends only on the
//! block count, so access records can be appended without rewriting the
//! bitmap.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use super::bitmap::BlockMap;
use crate::error::{CacheError, Result};
use crate::store::local::{read_full_at, write_all_at, LocalFile};

/// Size of the fixed fields preceding the bitmap
const PREFIX_LEN: usize = 12;

/// One attachment's access statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessStat {
    /// Attach time, seconds since the epoch
    pub open_time: i64,
    /// Detach time, seconds since the epoch
    pub close_time: i64,
    /// Bytes handed to the reader
    pub bytes_transferred: i64,
    /// Requests served without touching the origin
    pub hits: i32,
    /// Requests that needed a download or passthrough
    pub misses: i32,
}

impl AccessStat {
    /// Serialized record size
    pub const SIZE: usize = 32;

    fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.open_time.to_le_bytes());
        out[8..16].copy_from_slice(&self.close_time.to_le_bytes());
        out[16..24].copy_from_slice(&self.bytes_transferred.to_le_bytes());
        out[24..28].copy_from_slice(&self.hits.to_le_bytes());
        out[28..32].copy_from_slice(&self.misses.to_le_bytes());
        out
    }

    fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            open_time: i64::from_le_bytes(le8(&buf[0..8])),
            close_time: i64::from_le_bytes(le8(&buf[8..16])),
            bytes_transferred: i64::from_le_bytes(le8(&buf[16..24])),
            hits: i32::from_le_bytes(le4(&buf[24..28])),
            misses: i32::from_le_bytes(le4(&buf[28..32])),
        }
    }
}

/// Seconds since the epoch for a wall-clock time
pub fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Block map plus header metadata and the access log
#[derive(Debug, Clone)]
pub struct CacheFileInfo {
    block_size: u64,
    map: BlockMap,
    access_count: u32,
    stats: Vec<AccessStat>,
    complete: bool,
}

impl CacheFileInfo {
    /// Create an empty info with the given block size and no blocks
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            map: BlockMap::default(),
            access_count: 0,
            stats: Vec::new(),
            complete: false,
        }
    }

    /// Size a fresh, zeroed bitmap for a file of `file_size` bytes
    pub fn for_file_size(block_size: u64, file_size: u64) -> Result<Self> {
        let mut info = Self::new(block_size);
        info.resize(blocks_for(block_size, file_size)?);
        Ok(info)
    }

    /// Allocate a zeroed bitmap of `n_blocks` blocks
    pub fn resize(&mut self, n_blocks: u32) {
        self.map.resize(n_blocks);
        self.complete = n_blocks == 0;
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.map.len()
    }

    pub fn test_bit(&self, i: u32) -> bool {
        self.map.test(i)
    }

    /// Mark block `i` present. Call [`check_complete`](Self::check_complete)
    /// afterwards when the flip may have completed the file.
    pub fn set_bit(&mut self, i: u32) {
        self.map.set(i);
    }

    pub fn is_anything_empty_in_range(&self, lo: u32, hi: u32) -> bool {
        self.map.is_any_empty_in_range(lo, hi)
    }

    /// Recompute and cache the completeness flag
    pub fn check_complete(&mut self) {
        self.complete = self.map.is_full();
    }

    /// Cached completeness flag as of the last [`check_complete`](Self::check_complete)
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn first_missing(&self) -> Option<u32> {
        self.map.first_unset(0)
    }

    pub fn downloaded_blocks(&self) -> u32 {
        self.map.count_set()
    }

    pub fn block_map(&self) -> &BlockMap {
        &self.map
    }

    pub fn access_count(&self) -> u32 {
        self.access_count
    }

    pub fn access_stats(&self) -> &[AccessStat] {
        &self.stats
    }

    /// Header length (fixed fields plus bitmap), excluding the record count
    pub fn header_size(&self) -> u64 {
        (PREFIX_LEN + self.map.byte_len()) as u64
    }

    fn records_offset(&self) -> u64 {
        self.header_size() + 4
    }

    /// Encode the header and the access record count
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PREFIX_LEN + self.map.byte_len() + 4);
        out.extend_from_slice(&(self.block_size as i64).to_le_bytes());
        out.extend_from_slice(&(self.map.len() as i32).to_le_bytes());
        out.extend_from_slice(self.map.as_bytes());
        out.extend_from_slice(&(self.access_count as i32).to_le_bytes());
        out
    }

    /// Load header and access records from `file`
    ///
    /// Returns the header length in bytes, or 0 when the file is empty,
    /// short or inconsistent, in which case `self` is left untouched and
    /// the caller should start from scratch.
    pub fn read_header(&mut self, file: &dyn LocalFile) -> Result<usize> {
        let mut prefix = [0u8; PREFIX_LEN];
        if read_full_at(file, &mut prefix, 0).map_err(CacheError::Local)? < PREFIX_LEN {
            return Ok(0);
        }
        let block_size = i64::from_le_bytes(le8(&prefix[0..8]));
        let n_blocks = i32::from_le_bytes(le4(&prefix[8..12]));
        if block_size <= 0 || n_blocks < 0 {
            warn!(block_size, n_blocks, "Ignoring cache info with invalid header");
            return Ok(0);
        }
        let n_blocks = n_blocks as u32;

        // Size checks against the file length come before any allocation
        // sized by on-disk fields.
        let file_len = file.len().map_err(CacheError::Local)?;
        let records_offset = (PREFIX_LEN + BlockMap::byte_len_for(n_blocks) + 4) as u64;
        if records_offset > file_len {
            warn!(n_blocks, file_len, "Ignoring cache info shorter than its bitmap");
            return Ok(0);
        }

        let mut bits = vec![0u8; BlockMap::byte_len_for(n_blocks) + 4];
        if read_full_at(file, &mut bits, PREFIX_LEN as u64).map_err(CacheError::Local)? < bits.len() {
            return Ok(0);
        }
        let count_bytes = bits.split_off(bits.len() - 4);
        let map = match BlockMap::from_bytes(n_blocks, &bits) {
            Some(map) => map,
            None => return Ok(0),
        };
        let declared = i32::from_le_bytes(le4(&count_bytes)).max(0) as u32;
        let stored = ((file_len - records_offset) / AccessStat::SIZE as u64).min(u32::MAX as u64) as u32;
        if declared > stored {
            warn!(declared, stored, "Access log truncated");
        }
        let declared = declared.min(stored);

        self.block_size = block_size as u64;
        self.map = map;
        self.stats = Vec::with_capacity(declared as usize);
        let mut offset = self.records_offset();
        for _ in 0..declared {
            let mut rec = [0u8; AccessStat::SIZE];
            if read_full_at(file, &mut rec, offset).map_err(CacheError::Local)? < AccessStat::SIZE {
                warn!(declared, read = self.stats.len(), "Access log truncated");
                break;
            }
            self.stats.push(AccessStat::decode(&rec));
            offset += AccessStat::SIZE as u64;
        }
        self.access_count = self.stats.len() as u32;
        self.check_complete();

        debug!(
            block_size = self.block_size,
            blocks = n_blocks,
            downloaded = self.map.count_set(),
            accesses = self.access_count,
            "Loaded cache info"
        );
        Ok(self.header_size() as usize)
    }

    /// Write the header in one pass at offset 0
    pub fn write_header(&self, file: &dyn LocalFile) -> Result<()> {
        write_all_at(file, &self.header_bytes(), 0).map_err(CacheError::Local)
    }

    /// Append one access record and persist the new record count
    pub fn append_access_stat(&mut self, stat: AccessStat, file: &dyn LocalFile) -> Result<()> {
        let offset = self.records_offset() + self.access_count as u64 * AccessStat::SIZE as u64;
        write_all_at(file, &stat.encode(), offset).map_err(CacheError::Local)?;

        self.access_count += 1;
        self.stats.push(stat);
        write_all_at(file, &(self.access_count as i32).to_le_bytes(), self.header_size())
            .map_err(CacheError::Local)
    }
}

/// Number of blocks covering `file_size` bytes
pub fn blocks_for(block_size: u64, file_size: u64) -> Result<u32> {
    if block_size == 0 {
        return Err(CacheError::Metadata("block size must be non-zero".to_string()));
    }
    u32::try_from(file_size.div_ceil(block_size)).map_err(|_| {
        CacheError::Metadata(format!(
            "file of {} bytes needs too many {} byte blocks",
            file_size, block_size
        ))
    })
}

fn le8(b: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(b);
    out
}

fn le4(b: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(b);
    out
}
