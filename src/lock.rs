//! Process-exclusion lock: a single-holder advisory lock shared across
//! processes, guarding every mutating operation (backup, restore, DR
//! bundle export).
//!
//! Grounded on the `fs2::FileExt::try_lock_exclusive()` pattern used by
//! `LockFile` in the SpacetimeDB core crate, combined with the
//! acquire-before-anything-else discipline from the daemon lifecycle
//! module in the examples pack: the lock must be the very first side
//! effect attempted, and a failed acquisition must never delete or
//! truncate a file that belongs to the process already holding it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::error::{KopiError, Result};

/// Holds an exclusive, non-blocking advisory lock on a well-known file for
/// the lifetime of the value; the lock and the file are released/unlinked
/// on drop.
pub struct ProcessLock {
    path: PathBuf,
    file: File,
}

impl std::fmt::Debug for ProcessLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLock").field("path", &self.path).finish()
    }
}

impl ProcessLock {
    /// Resolve the preferred lock path: a runtime directory writable by
    /// the user (`/run/kopi-docka.lock`), falling back to the temp
    /// directory (`/tmp/kopi-docka.lock`) if `/run` is not writable.
    pub fn default_path() -> PathBuf {
        let preferred = Path::new("/run/kopi-docka.lock");
        if preferred
            .parent()
            .map(|p| p.metadata().map(|m| !m.permissions().readonly()).unwrap_or(false))
            .unwrap_or(false)
        {
            preferred.to_path_buf()
        } else {
            std::env::temp_dir().join("kopi-docka.lock")
        }
    }

    /// Try to acquire the lock at `path`. Returns `Err(KopiError::LockHeld)`
    /// if another process holds it; never blocks.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Open (not truncate) before we know whether we'll win the lock:
        // truncating first would destroy the PID of a process that
        // currently holds it if acquisition fails.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                // Now safe to truncate and record our own PID.
                file.set_len(0)?;
                let mut f = &file;
                write!(f, "{}", std::process::id())?;
                f.flush()?;
                info!(path = %path.display(), "acquired process-exclusion lock");
                Ok(ProcessLock { path, file })
            }
            Err(_) => {
                debug!(path = %path.display(), "process-exclusion lock is held by another instance");
                Err(KopiError::LockHeld)
            }
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = %e, "failed to release process-exclusion lock");
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove process-exclusion lock file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquires_and_releases_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");
        {
            let _lock = ProcessLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists(), "lock file should be unlinked on drop");
    }

    #[test]
    fn second_acquisition_fails_while_first_holds_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let _first = ProcessLock::acquire(&path).unwrap();
        let second = ProcessLock::acquire(&path);
        assert!(matches!(second, Err(KopiError::LockHeld)));
    }

    #[test]
    fn lock_is_reacquirable_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");
        {
            let _first = ProcessLock::acquire(&path).unwrap();
        }
        let _second = ProcessLock::acquire(&path).unwrap();
    }
}
