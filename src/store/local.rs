//! Local Disk Store
//!
//! Byte-range access to the cache directory. The cache core only ever
//! talks to [`LocalStore`] and [`LocalFile`]; [`FsStore`] is the standard
//! filesystem implementation.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(target_family = "unix")]
use std::os::unix::fs::FileExt;
#[cfg(target_family = "windows")]
use std::os::windows::fs::FileExt;

use tracing::debug;

use crate::error::is_transient;

/// An open local file supporting positional reads and writes
///
/// Implementations must allow reads and writes from different threads at
/// the same time.
pub trait LocalFile: Send + Sync {
    /// Read bytes at a fixed offset. Returns the number of bytes read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write bytes at a fixed offset. Returns the number of bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Flush data to stable storage
    fn sync(&self) -> io::Result<()>;

    /// Current file length
    fn len(&self) -> io::Result<u64>;
}

/// Local disk holding cached data and metadata files
pub trait LocalStore: Send + Sync {
    /// Open a file for read/write, creating it (and parent directories) if asked
    fn open(&self, path: &Path, create: bool) -> io::Result<Box<dyn LocalFile>>;

    /// Remove a file
    fn unlink(&self, path: &Path) -> io::Result<()>;

    /// Rename a file
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Root directory the relative cache paths are resolved against
    fn root(&self) -> &Path;
}

/// Standard filesystem-backed store rooted at a cache directory
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.root.join(relative)
    }
}

impl LocalStore for FsStore {
    fn open(&self, path: &Path, create: bool) -> io::Result<Box<dyn LocalFile>> {
        let full = self.resolve(path);
        if create {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&full)?;
        debug!(path = %full.display(), create = create, "Opened local cache file");
        Ok(Box::new(file))
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        let full = self.resolve(path);
        debug!(path = %full.display(), "Removing local cache file");
        fs::remove_file(full)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

impl LocalFile for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        read_file_at(self, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        write_file_at(self, buf, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

#[cfg(target_family = "unix")]
fn read_file_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    FileExt::read_at(file, buf, offset)
}

#[cfg(target_family = "windows")]
fn read_file_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.seek_read(buf, offset)
}

#[cfg(target_family = "unix")]
fn write_file_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    FileExt::write_at(file, buf, offset)
}

#[cfg(target_family = "windows")]
fn write_file_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    file.seek_write(buf, offset)
}

/// Write the whole buffer, retrying interrupted and short writes
pub fn write_all_at(file: &dyn LocalFile, data: &[u8], offset: u64) -> io::Result<()> {
    let mut written = 0usize;
    while written < data.len() {
        match file.write_at(&data[written..], offset + written as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write cache file",
                ))
            }
            Ok(n) => written += n,
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Fill as much of `buf` as the file holds, stopping early only at end of file
pub fn read_full_at(file: &dyn LocalFile, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
