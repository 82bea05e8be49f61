//! Cache file info
//!
//! Block completion tracking and its persistent format.

pub mod bitmap;
pub mod info;

pub use bitmap::BlockMap;
pub use info::{blocks_for, unix_seconds, AccessStat, CacheFileInfo};
