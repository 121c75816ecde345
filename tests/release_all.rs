use std::time::Duration;
use tagdir::lock::{self, LockFile};
use tagdir::LockSettings;
use tempfile::tempdir;

// Runs in its own test binary: release_all stops the process-wide pump.
#[test]
fn test_release_all_removes_held_locks() {
    let temp = tempdir().unwrap();
    let a = LockFile::new(temp.path().join("a.lock"), LockSettings::default());
    let b = LockFile::new(temp.path().join("b.lock"), LockSettings::default());
    a.acquire(None).unwrap();
    b.acquire(Some(Duration::from_secs(1))).unwrap();
    assert!(lock::is_held(a.path()));
    assert_eq!(lock::held_locks().len(), 2);

    assert_eq!(lock::release_all(), 2);
    assert!(!a.path().exists());
    assert!(!b.path().exists());
    assert!(lock::held_locks().is_empty());

    // The pump starts again on the next acquisition.
    let c = LockFile::new(temp.path().join("c.lock"), LockSettings::default());
    c.acquire(None).unwrap();
    assert!(lock::is_held(c.path()));
    c.release().unwrap();
    assert_eq!(lock::release_all(), 0);
}
