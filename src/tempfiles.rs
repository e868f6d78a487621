//! Per-run scratch directory for intermediate images (spec §3, §6).
//!
//! Some steps in a run need a real on-disk file that nothing else will
//! read — rasterising a vector input to a temporary raster, for instance
//! (grounded in `vectorreader.py`'s `tempfile.mkstemp(ext, dir=tempdir)`).
//! `TempfileManager` hands out uniquely-named paths under a configured or
//! OS-default directory and removes them all when the run ends.

use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};

/// Owns a scratch directory for the duration of a run; all files handed
/// out through it are removed when the manager is dropped.
pub struct TempfileManager {
    dir: TempDir,
    prefix: String,
}

impl TempfileManager {
    /// Create a manager rooted under `base_dir` (or the OS temp directory
    /// if `None`, matching the driver's `tempdir` option default).
    pub fn new(base_dir: Option<&Path>, prefix: impl Into<String>) -> std::io::Result<Self> {
        let mut builder = Builder::new();
        builder.prefix("riostream-");
        let dir = match base_dir {
            Some(base) => builder.tempdir_in(base)?,
            None => builder.tempdir()?,
        };
        Ok(Self {
            dir,
            prefix: prefix.into(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Reserve a new path with the manager's prefix and the given
    /// extension (e.g. `"tif"`); the file itself is not created.
    pub fn reserve(&self, label: &str, extension: &str) -> PathBuf {
        let filename = format!("{}{}-{}.{}", self.prefix, label, unique_suffix(), extension);
        self.dir.path().join(filename)
    }
}

fn unique_suffix() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_paths_are_unique_and_under_the_scratch_dir() {
        let mgr = TempfileManager::new(None, "vec").unwrap();
        let a = mgr.reserve("rasterized", "tif");
        let b = mgr.reserve("rasterized", "tif");
        assert_ne!(a, b);
        assert!(a.starts_with(mgr.path()));
    }

    #[test]
    fn scratch_dir_is_removed_when_manager_drops() {
        let mgr = TempfileManager::new(None, "t").unwrap();
        let dir_path = mgr.path().to_path_buf();
        assert!(dir_path.exists());
        drop(mgr);
        assert!(!dir_path.exists());
    }
}
