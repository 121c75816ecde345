use super::pump::pump;
use crate::config::LockSettings;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Mutual exclusion based on the existence of a file.
///
/// The lock file is created atomically on acquire and removed on the
/// outermost release. A lock whose mtime is older than
/// [`LockSettings::expiration`] belongs to a dead process and may be stolen.
/// Acquisition is reentrant per handle.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    settings: LockSettings,
    depth: Mutex<usize>,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>, settings: LockSettings) -> Self {
        Self {
            path: path.into(),
            settings,
            depth: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the lock file exists, no matter which process created it.
    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }

    /// True if this handle currently holds the lock.
    pub fn is_acquired(&self) -> bool {
        *self.depth.lock() > 0
    }

    /// Nesting depth of this handle's acquisitions.
    pub fn depth(&self) -> usize {
        *self.depth.lock()
    }

    /// True if the lock file exists and has not been refreshed within the
    /// expiration window.
    pub fn is_expired(&self) -> bool {
        let modified = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age > self.settings.expiration,
            // mtime in the future
            Err(_) => false,
        }
    }

    /// Acquire the lock, polling until `timeout` elapses.
    ///
    /// `None` or a zero timeout blocks until the lock is available.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        let mut depth = self.depth.lock();
        if *depth > 0 {
            *depth += 1;
            tracing::trace!("Reentered lock {} (depth {})", self.path.display(), *depth);
            return Ok(());
        }

        let start = Instant::now();
        loop {
            if self.try_create()? {
                *depth = 1;
                pump().register(&self.path, self.settings.pump_interval);
                tracing::debug!("Acquired lock {}", self.path.display());
                return Ok(());
            }

            if self.is_expired() {
                tracing::debug!("Stealing expired lock {}", self.path.display());
                match fs::remove_file(&self.path) {
                    Ok(()) => continue,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(Error::io(&self.path, e)),
                }
            }

            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(Error::LockTimeout {
                        path: self.path.clone(),
                        timeout,
                    });
                }
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    /// Release one level of acquisition, removing the lock file on the
    /// outermost release.
    pub fn release(&self) -> Result<()> {
        let mut depth = self.depth.lock();
        if *depth == 0 {
            return Err(Error::LockState {
                path: self.path.clone(),
            });
        }
        *depth -= 1;
        if *depth == 0 {
            pump()
                .release(&self.path)
                .map_err(|e| Error::io(&self.path, e))?;
            tracing::debug!("Released lock {}", self.path.display());
        }
        Ok(())
    }

    /// Acquire the lock for the lifetime of the returned guard.
    pub fn guard(&self, timeout: Option<Duration>) -> Result<LockGuard<'_>> {
        self.acquire(timeout)?;
        Ok(LockGuard { lock: self })
    }

    /// Like [`LockFile::guard`] but the guard keeps the lock handle alive
    /// itself instead of borrowing it.
    pub fn guard_owned(self: &Arc<Self>, timeout: Option<Duration>) -> Result<OwnedLockGuard> {
        self.acquire(timeout)?;
        Ok(OwnedLockGuard {
            lock: Arc::clone(self),
        })
    }

    fn try_create(&self) -> Result<bool> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::io(&self.path, e)),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let depth = self.depth.get_mut();
        if *depth > 0 {
            tracing::warn!(
                "Lock {} dropped while held, releasing",
                self.path.display()
            );
            *depth = 0;
            if let Err(e) = pump().release(&self.path) {
                tracing::warn!("Failed to release lock {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Holds a [`LockFile`] acquisition until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a LockFile,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            tracing::warn!("Failed to release lock {}: {}", self.lock.path.display(), e);
        }
    }
}

/// Owned variant of [`LockGuard`].
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct OwnedLockGuard {
    lock: Arc<LockFile>,
}

impl Drop for OwnedLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            tracing::warn!("Failed to release lock {}: {}", self.lock.path.display(), e);
        }
    }
}
