//! Block completion bitmap
//!
//! One bit per block, bit `i` set once block `i` is fully present in the
//! local data file. Bits are packed LSB-first within each byte.

/// Fixed-size bit vector tracking downloaded blocks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    bits: Vec<u8>,
    n_blocks: u32,
}

impl BlockMap {
    /// Create a zeroed map for `n_blocks` blocks
    pub fn new(n_blocks: u32) -> Self {
        let mut map = Self::default();
        map.resize(n_blocks);
        map
    }

    /// Rebuild a map from its serialized bytes
    ///
    /// Returns None when `bytes` is not exactly `byte_len(n_blocks)` long.
    pub fn from_bytes(n_blocks: u32, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::byte_len_for(n_blocks) {
            return None;
        }
        let mut map = Self {
            bits: bytes.to_vec(),
            n_blocks,
        };
        // Padding bits past the last block never count as downloaded.
        map.clear_padding();
        Some(map)
    }

    /// Reallocate as a zeroed map of `n_blocks` blocks
    pub fn resize(&mut self, n_blocks: u32) {
        self.n_blocks = n_blocks;
        self.bits = vec![0; Self::byte_len_for(n_blocks)];
    }

    /// Number of bytes needed to hold `n_blocks` bits
    pub fn byte_len_for(n_blocks: u32) -> usize {
        (n_blocks as usize).div_ceil(8)
    }

    /// Number of blocks tracked
    pub fn len(&self) -> u32 {
        self.n_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.n_blocks == 0
    }

    /// Serialized size in bytes
    pub fn byte_len(&self) -> usize {
        self.bits.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Whether block `i` is present
    ///
    /// Panics if `i` is out of range.
    pub fn test(&self, i: u32) -> bool {
        assert!(
            i < self.n_blocks,
            "block index {} out of range ({} blocks)",
            i,
            self.n_blocks
        );
        self.bits[(i / 8) as usize] & (1 << (i % 8)) != 0
    }

    /// Mark block `i` as present
    ///
    /// Panics if `i` is out of range.
    pub fn set(&mut self, i: u32) {
        assert!(
            i < self.n_blocks,
            "block index {} out of range ({} blocks)",
            i,
            self.n_blocks
        );
        self.bits[(i / 8) as usize] |= 1 << (i % 8);
    }

    /// True if any block in the inclusive range `[lo, hi]` is missing
    pub fn is_any_empty_in_range(&self, lo: u32, hi: u32) -> bool {
        (lo..=hi).any(|i| !self.test(i))
    }

    /// True when every block is present (an empty map is complete)
    pub fn is_full(&self) -> bool {
        self.n_blocks == 0 || !self.is_any_empty_in_range(0, self.n_blocks - 1)
    }

    /// Index of the first missing block at or after `from`
    pub fn first_unset(&self, from: u32) -> Option<u32> {
        (from..self.n_blocks).find(|&i| !self.test(i))
    }

    /// Number of present blocks
    pub fn count_set(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    fn clear_padding(&mut self) {
        let used = self.n_blocks % 8;
        if used != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1u8 << used) - 1;
            }
        }
    }
}
