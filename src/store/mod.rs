//! Storage collaborators
//!
//! The origin the cache reads through and the local disk it caches onto.

pub mod http;
pub mod local;
pub mod origin;

pub use http::{HttpOrigin, HttpSource};
pub use local::{FsStore, LocalFile, LocalStore};
pub use origin::{cache_path, info_path, FileOrigin, Origin};
