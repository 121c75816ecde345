//! Process-wide keep-alive loop for held lock files.
//!
//! Every lock file this process holds is registered here. A single
//! background thread, started on first registration, bumps the mtime of each
//! registered lock so it never looks expired to other processes. A process
//! that dies stops pumping and its locks expire on their own.

use filetime::FileTime;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const IDLE_INTERVAL: Duration = Duration::from_secs(1);

static PUMP: Lazy<LockPump> = Lazy::new(LockPump::new);

pub(crate) fn pump() -> &'static LockPump {
    &PUMP
}

#[derive(Default)]
struct PumpState {
    running: bool,
    shutdown: bool,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct LockPump {
    /// Held lock path -> requested refresh interval.
    held: Mutex<HashMap<PathBuf, Duration>>,
    state: Mutex<PumpState>,
    wake: Condvar,
}

impl LockPump {
    fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            state: Mutex::new(PumpState::default()),
            wake: Condvar::new(),
        }
    }

    /// Register a freshly acquired lock and make sure the pump is running.
    pub(crate) fn register(&'static self, path: &Path, interval: Duration) {
        self.held.lock().insert(path.to_path_buf(), interval);
        self.ensure_running();
        // Wake the loop so a shorter interval takes effect immediately.
        self.wake.notify_all();
    }

    /// Stop pumping `path` and remove the lock file from disk.
    pub(crate) fn release(&self, path: &Path) -> io::Result<()> {
        let mut held = self.held.lock();
        held.remove(path);
        remove_lock_file(path)
    }

    pub(crate) fn is_held(&self, path: &Path) -> bool {
        self.held.lock().contains_key(path)
    }

    pub(crate) fn held_paths(&self) -> Vec<PathBuf> {
        self.held.lock().keys().cloned().collect()
    }

    fn ensure_running(&'static self) {
        let mut state = self.state.lock();
        if state.running {
            return;
        }
        state.running = true;
        state.shutdown = false;
        let spawned = thread::Builder::new()
            .name("tagdir-lock-pump".to_string())
            .spawn(move || self.run());
        match spawned {
            Ok(handle) => {
                tracing::debug!("Started lock pump thread");
                state.handle = Some(handle);
            }
            Err(e) => {
                state.running = false;
                tracing::warn!("Failed to start lock pump thread: {}", e);
            }
        }
    }

    fn run(&self) {
        loop {
            let interval = self.refresh_all();

            let mut state = self.state.lock();
            if state.shutdown {
                break;
            }
            self.wake.wait_for(&mut state, interval);
            if state.shutdown {
                break;
            }
        }
        tracing::debug!("Lock pump thread stopped");
    }

    /// Touch every held lock and return how long to sleep before the next pass.
    fn refresh_all(&self) -> Duration {
        let held = self.held.lock();
        for path in held.keys() {
            if let Err(e) = filetime::set_file_mtime(path, FileTime::now()) {
                tracing::warn!(
                    "Lock pump failed to update mtime of {}: {}",
                    path.display(),
                    e
                );
            }
        }
        held.values().min().copied().unwrap_or(IDLE_INTERVAL)
    }

    /// Release every lock held by this process and stop the pump thread.
    pub(crate) fn shutdown(&self) -> usize {
        let released = {
            let mut held = self.held.lock();
            let paths: Vec<PathBuf> = held.drain().map(|(path, _)| path).collect();
            for path in &paths {
                if let Err(e) = remove_lock_file(path) {
                    tracing::warn!("Failed to release lock {}: {}", path.display(), e);
                }
            }
            paths.len()
        };

        let handle = {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.running = false;
            state.handle.take()
        };
        self.wake.notify_all();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("Lock pump thread panicked");
            }
        }

        released
    }
}

fn remove_lock_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
