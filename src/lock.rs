//! Advisory per-fixture lock.
//!
//! Two runs perturbing the same fixture would see each other's changes as
//! their own completions, so a scenario holds an exclusive lock on its
//! fixture root for as long as its watch process lives.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = ".watchbench.lock";

#[derive(Debug)]
pub enum LockError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another process holds the lock.
    Busy { path: PathBuf },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {}", path.display(), source)
            }
            LockError::Busy { path } => {
                write!(f, "fixture is in use by another run ({})", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } => Some(source),
            LockError::Busy { .. } => None,
        }
    }
}

/// Held for the lifetime of a scenario run; released on drop.
#[derive(Debug)]
pub struct FixtureLock {
    file: File,
    path: PathBuf,
}

impl FixtureLock {
    /// Take the lock for `root` without blocking.
    pub fn acquire(root: &Path) -> Result<Self, LockError> {
        let path = root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| LockError::Open {
                path: path.clone(),
                source: e,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(lock = %path.display(), "fixture lock acquired");
                Ok(Self { file, path })
            }
            Err(_) => Err(LockError::Busy { path }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FixtureLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
