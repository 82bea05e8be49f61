//! Cache Error Types
//!
//! Structured error handling for the block cache.

use std::io;

/// Block cache error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Origin read failed: {0}")]
    Origin(#[source] io::Error),

    #[error("Local disk error: {0}")]
    Local(#[source] io::Error),

    #[error("Prefetch failed for {0}")]
    Failed(String),

    #[error("Prefetch for {0} is no longer accepting work")]
    Closed(String),

    #[error("Prefetch for {0} has no open cache files")]
    NotOpen(String),

    #[error("Invalid range: offset {offset}, length {len}, file size {size}")]
    InvalidRange { offset: u64, len: u64, size: u64 },

    #[error("Too many chunks in vectored read: {count} (max {max})")]
    TooManyChunks { count: usize, max: usize },

    #[error("Corrupt cache metadata: {0}")]
    Metadata(String),
}

/// Interrupted calls are retried in place; everything else is fatal for the task.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

/// Result alias used throughout the cache core
pub type Result<T> = std::result::Result<T, CacheError>;
