//! Admission policy
//!
//! Decides whether a remote file may be cached at all. Every configured
//! [`Admission`] must allow a path before the registry creates a prefetch
//! for it; a rejected path is read straight from the origin.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::store::cache_path;

/// Predicate consulted once per path before a prefetch is created
pub trait Admission: Send + Sync {
    fn allow(&self, path: &str) -> bool;
}

/// Admits everything
pub struct AllowAll;

impl Admission for AllowAll {
    fn allow(&self, _path: &str) -> bool {
        true
    }
}

/// Rejects files whose cache path lies under one of the excluded prefixes
pub struct PathsDecision {
    excludes: Vec<PathBuf>,
}

impl PathsDecision {
    pub fn new<I, S>(excludes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        // Normalize through the same mapping the cache uses so "/a/b" and
        // "root://host//a/b/" name the same prefix.
        let excludes = excludes
            .into_iter()
            .map(|e| cache_path(e.as_ref()))
            .filter(|p| p != Path::new("/"))
            .collect();
        Self { excludes }
    }

    pub fn is_empty(&self) -> bool {
        self.excludes.is_empty()
    }
}

impl Admission for PathsDecision {
    fn allow(&self, path: &str) -> bool {
        let mapped = cache_path(path);
        match self.excludes.iter().find(|prefix| mapped.starts_with(prefix)) {
            Some(prefix) => {
                debug!(path = path, prefix = %prefix.display(), "Path excluded from cache");
                false
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.allow("/anything"));
    }

    #[test]
    fn test_excluded_prefix() {
        let decision = PathsDecision::new(["/scratch", "root://srv//tmp/"]);
        assert!(!decision.allow("/scratch/run1/file.root"));
        assert!(!decision.allow("http://other:8080//tmp/x?foo=1"));
        assert!(decision.allow("/store/data/file.root"));
    }

    #[test]
    fn test_prefix_matches_whole_components() {
        let decision = PathsDecision::new(["/scratch"]);
        assert!(decision.allow("/scratchpad/file"));
    }

    #[test]
    fn test_root_exclude_is_ignored() {
        let decision = PathsDecision::new(["/", ""]);
        assert!(decision.is_empty());
        assert!(decision.allow("/store/file"));
    }
}
