//! Cross-process locking for metadata directories.
//!
//! A [`LockFile`] is held while its file exists on disk. The process-wide
//! pump refreshes the mtime of every lock held by this process so other
//! processes never treat a live lock as expired.

mod lockfile;
mod pump;

pub use lockfile::{LockFile, LockGuard, OwnedLockGuard};

use std::path::PathBuf;

/// Release every lock held by this process and stop the pump thread.
///
/// Call before the process exits. Handles that still think they hold a lock
/// simply find the file gone when they release. Returns how many locks were
/// released.
pub fn release_all() -> usize {
    let released = pump::pump().shutdown();
    if released > 0 {
        tracing::debug!("Released {} lock(s) held at exit", released);
    }
    released
}

/// Paths of the locks this process currently holds.
pub fn held_locks() -> Vec<PathBuf> {
    pump::pump().held_paths()
}

/// True if this process holds the lock at `path`.
pub fn is_held(path: &std::path::Path) -> bool {
    pump::pump().is_held(path)
}
