//! Origin Store
//!
//! The remote source of truth for file bytes, seen only as a readable
//! byte range. Transport lives behind the [`Origin`] trait.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::trace;

use super::local::LocalFile;

/// A remote file the cache reads through
pub trait Origin: Send + Sync {
    /// Identifier of the remote file (URL or path)
    fn path(&self) -> &str;

    /// Total length in bytes
    fn len(&self) -> io::Result<u64>;

    /// Read bytes at a fixed offset. Returns the number of bytes read, 0 at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

/// Origin reachable as a plain path (network mounts, test fixtures)
pub struct FileOrigin {
    path: String,
    file: File,
}

impl FileOrigin {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            file: File::open(path)?,
            path: path.to_string_lossy().to_string(),
        })
    }
}

impl Origin for FileOrigin {
    fn path(&self) -> &str {
        &self.path
    }

    fn len(&self) -> io::Result<u64> {
        LocalFile::len(&self.file)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        trace!(path = %self.path, offset = offset, len = buf.len(), "Origin read");
        LocalFile::read_at(&self.file, buf, offset)
    }
}

/// Map a remote identifier to its relative path inside the cache directory
///
/// `scheme://host[:port]//dir/file?query` becomes `/dir/file`; plain paths
/// are kept as they are. Percent-escapes are decoded and `..` components
/// are dropped so the result always stays under the cache root.
pub fn cache_path(url: &str) -> PathBuf {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = match without_query.find("://") {
        Some(idx) => {
            let rest = &without_query[idx + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => without_query,
    };
    let decoded = urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string());

    let mut out = PathBuf::from("/");
    for part in decoded.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            continue;
        }
        out.push(part);
    }
    out
}

/// Metadata file path for a data file path
pub fn info_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_os_string();
    name.push(".cinfo");
    PathBuf::from(name)
}
