//! Block-granular read-through disk cache
//!
//! Readers attach to a remote file through a [`Registry`], which hands every
//! reader of the same file one shared [`Prefetch`]. The prefetch downloads
//! fixed-size blocks from the origin into a local data file, tracks them in
//! a persistent bitmap (`.cinfo`) and wakes readers blocked on missing
//! blocks. Partially downloaded files resume where they left off.

pub mod cinfo;
pub mod config;
pub mod daemon;
pub mod decision;
pub mod error;
pub mod ipc;
pub mod prefetch;
pub mod proxy;
pub mod purge;
pub mod registry;
pub mod stats;
pub mod store;

#[cfg(test)]
mod testutil;

pub use cinfo::{AccessStat, BlockMap, CacheFileInfo};
pub use config::Config;
pub use daemon::CacheDaemon;
pub use decision::{Admission, AllowAll, PathsDecision};
pub use error::{CacheError, Result};
pub use prefetch::{Prefetch, PrefetchConfig, PrefetchState, PrefetchStatus};
pub use proxy::{IoChunk, ProxyIo, READV_MAXCHUNKS};
pub use registry::Registry;
pub use stats::{CacheStats, StatsSnapshot};
pub use store::{FileOrigin, FsStore, HttpOrigin, HttpSource, LocalFile, LocalStore, Origin};
