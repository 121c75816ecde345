//! Tagged directories and their metadata records.
//!
//! An [`Entry`] is the in-process identity of a directory: its path, its
//! kind and the [`data::EntryData`] record under `<dir>/.data`. Entries are
//! normally obtained from an [`EntryCache`](crate::factory::EntryCache) so
//! that one directory maps to one instance.

mod data;
mod relink;
pub mod tags;

use crate::bus::{topics, EventBus, Payload};
use crate::codec::DataMap;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::factory::Kind;
use crate::util;
use data::EntryData;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

pub use tags::{read_tags, tag_path, validate_key, validate_tag};

/// A directory carrying tags and key/value metadata.
///
/// All methods take `&self`; the record is guarded by an internal mutex and,
/// on disk, by the metadata directory's lock file. Events are published
/// after the internal mutex is released, so handlers may call back into the
/// entry that published them.
pub struct Entry {
    location: Arc<RwLock<PathBuf>>,
    data: Mutex<EntryData>,
    kind: RwLock<Kind>,
    config: Arc<Config>,
    bus: EventBus,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("path", &self.path())
            .field("kind", &self.kind())
            .finish()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

impl Entry {
    /// Entry of the base kind for `path`, made absolute.
    pub fn new(path: impl AsRef<Path>, config: Arc<Config>, bus: EventBus) -> Result<Self> {
        let path = util::absolute(path.as_ref())?;
        Ok(Self::with_kind(path, config, bus, Kind::base()))
    }

    pub(crate) fn with_kind(path: PathBuf, config: Arc<Config>, bus: EventBus, kind: Kind) -> Self {
        let location = Arc::new(RwLock::new(path));
        let data = EntryData::new(Arc::clone(&config), Arc::clone(&location));
        Self {
            location,
            data: Mutex::new(data),
            kind: RwLock::new(kind),
            config,
            bus,
        }
    }

    /// Current directory. Changes when the entry is moved or relinked.
    pub fn path(&self) -> PathBuf {
        self.location.read().clone()
    }

    pub fn name(&self) -> String {
        util::basename(&self.location.read())
    }

    pub fn kind(&self) -> Kind {
        self.kind.read().clone()
    }

    pub(crate) fn set_kind(&self, kind: Kind) {
        *self.kind.write() = kind;
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Metadata directory, `<path>/<data_root>`.
    pub fn data_dir(&self) -> PathBuf {
        self.data.lock().dir().to_path_buf()
    }

    /// True when both the directory and its metadata directory exist.
    pub fn exists(&self) -> bool {
        let path = self.path();
        path.is_dir() && tags::data_dir(&self.config, &path).is_dir()
    }

    /// Stable identifier, assigned on first access.
    pub fn uuid(&self) -> Result<String> {
        self.with_data(|data| data.uuid())
    }

    /// Give the entry a new identity.
    pub fn new_uuid(&self) -> Result<String> {
        self.with_data(|data| data.new_uuid())
    }

    pub fn tags(&self) -> Result<Vec<String>> {
        self.with_data(|data| data.tags())
    }

    pub fn has_tag(&self, tag: &str) -> Result<bool> {
        Ok(self.tags()?.iter().any(|t| t == tag))
    }

    pub fn tag(&self, tags: &[&str]) -> Result<()> {
        self.with_data(|data| data.tag(tags))
    }

    pub fn untag(&self, tags: &[&str]) -> Result<()> {
        self.with_data(|data| data.untag(tags))
    }

    /// The whole mapping. Repeated reads return the same `Arc` until the data
    /// file changes on disk.
    pub fn read(&self) -> Result<Arc<DataMap>> {
        self.with_data(|data| data.read())
    }

    pub fn read_key(&self, key: &str) -> Result<Value> {
        self.read()?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound {
                key: key.to_string(),
            })
    }

    /// Sub-mapping holding exactly `keys`. Every key must be present.
    pub fn read_keys(&self, keys: &[&str]) -> Result<DataMap> {
        let data = self.read()?;
        keys.iter()
            .map(|key| {
                data.get(*key)
                    .map(|value| (key.to_string(), value.clone()))
                    .ok_or_else(|| Error::KeyNotFound {
                        key: key.to_string(),
                    })
            })
            .collect()
    }

    /// Deep-merge `data` into the stored mapping.
    pub fn write(&self, data: DataMap) -> Result<()> {
        self.with_data(|record| record.write(data, false).map(|_| ()))
    }

    /// Replace the stored mapping with `data`.
    pub fn write_replace(&self, data: DataMap) -> Result<()> {
        self.with_data(|record| record.write(data, true).map(|_| ()))
    }

    pub fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<PathBuf> {
        self.with_data(|data| data.write_blob(key, bytes))
    }

    pub fn blob_path(&self, key: &str) -> Result<PathBuf> {
        self.with_data(|data| data.blob_path(key))
    }

    pub fn read_blob(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(key)?;
        fs::read(&path).map_err(|e| Error::io(&path, e))
    }

    /// Copy `source` into the metadata directory under `key`.
    pub fn write_file(&self, key: &str, source: &Path) -> Result<PathBuf> {
        self.with_data(|data| data.write_file(key, source))
    }

    /// Path of the stored copy of the file recorded under `key`.
    pub fn read_file(&self, key: &str) -> Result<PathBuf> {
        self.with_data(|data| data.file_path(key))
    }

    /// Copy the directory, metadata included, to `dest`.
    ///
    /// Identity markers and lock files are stripped from the copy, so every
    /// entry inside it gets a fresh identity on first access.
    pub fn copy_to(&self, dest: impl AsRef<Path>) -> Result<PathBuf> {
        let dest = util::absolute(dest.as_ref())?;
        self.with_data(|data| {
            data.ensure_ready()?;
            let _guard = data.lock()?;
            util::copy_tree(&data.root(), &dest)
        })?;
        strip_identity(&dest, &self.config.data_root)?;
        tracing::debug!("Copied {} to {}", self.path().display(), dest.display());
        Ok(dest)
    }

    /// Move the directory to `dest`, keeping the identity.
    pub fn move_to(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = util::absolute(dest.as_ref())?;
        self.with_data(|data| {
            data.refresh()?;
            let old = data.root();
            util::move_tree(&old, &dest)?;
            data.rebase(&dest);
            tracing::debug!("Moved {} to {}", old.display(), dest.display());
            data.emit(
                topics::MOVED,
                Payload::Moved {
                    old,
                    new: dest.clone(),
                },
            );
            Ok(())
        })
    }

    /// Remove the metadata, and the directory itself when `remove_root`.
    pub fn delete(&self, remove_root: bool) -> Result<()> {
        self.with_data(|data| {
            data.delete()?;
            let root = data.root();
            if remove_root {
                match fs::remove_dir_all(&root) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::io(&root, e)),
                }
            }
            data.emit(topics::DELETED, Payload::None);
            Ok(())
        })
    }

    /// Run `op` on the record, then publish whatever it queued.
    ///
    /// A handler failure is returned only if `op` itself succeeded.
    fn with_data<T>(&self, op: impl FnOnce(&mut EntryData) -> Result<T>) -> Result<T> {
        let (result, events) = {
            let mut data = self.data.lock();
            let result = op(&mut data);
            (result, data.take_events())
        };

        for event in &events {
            if let Err(e) = self.bus.publish_event(event) {
                if result.is_ok() {
                    return Err(e);
                }
                tracing::warn!("{}", e);
            }
        }
        result
    }
}

/// Remove identity markers and stale lock files from every metadata
/// directory under `root`.
fn strip_identity(root: &Path, data_root: &str) -> Result<()> {
    let data_root = OsStr::new(data_root);
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            Error::io(&path, io::Error::from(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let in_data_root = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .map(|name| name == data_root)
            .unwrap_or(false);
        let name = entry.file_name().to_string_lossy();
        if in_data_root && (name.starts_with(tags::UUID_PREFIX) || name == tags::LOCK_NAME) {
            fs::remove_file(entry.path()).map_err(|e| Error::io(entry.path(), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Event;
    use serde_json::json;
    use tempfile::tempdir;

    fn entry_at(path: &Path) -> (Entry, EventBus) {
        let bus = EventBus::new();
        let entry = Entry::new(path, Arc::new(Config::default()), bus.clone()).unwrap();
        (entry, bus)
    }

    fn record_topics(bus: &EventBus) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        bus.subscribe(
            "entry.*",
            move |event: &Event| {
                sink.lock().push(event.topic.clone());
                Ok(Value::Null)
            },
            0,
        );
        log
    }

    fn map(value: Value) -> DataMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_name_and_exists() {
        let temp = tempdir().unwrap();
        let (entry, _bus) = entry_at(&temp.path().join("shot01"));
        assert_eq!(entry.name(), "shot01");
        assert!(!entry.exists());
        entry.tag(&["shot"]).unwrap();
        assert!(entry.exists());
    }

    #[test]
    fn test_events_are_published() {
        let temp = tempdir().unwrap();
        let (entry, bus) = entry_at(temp.path());
        let log = record_topics(&bus);

        entry.tag(&["asset"]).unwrap();
        entry.write(map(json!({"k": 1}))).unwrap();
        entry.untag(&["asset"]).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                topics::CREATED,
                topics::TAGGED,
                topics::DATA_CHANGED,
                topics::UNTAGGED
            ]
        );
    }

    #[test]
    fn test_handler_may_call_back_into_entry() {
        let temp = tempdir().unwrap();
        let bus = EventBus::new();
        let entry = Arc::new(Entry::new(temp.path(), Arc::new(Config::default()), bus.clone()).unwrap());
        let seen = Arc::new(Mutex::new(None));

        let weak = Arc::downgrade(&entry);
        let sink = Arc::clone(&seen);
        bus.subscribe(
            topics::DATA_CHANGED,
            move |_event: &Event| {
                if let Some(entry) = weak.upgrade() {
                    *sink.lock() = Some(entry.read_key("k")?);
                }
                Ok(Value::Null)
            },
            0,
        );

        entry.write(map(json!({"k": "v"}))).unwrap();
        assert_eq!(*seen.lock(), Some(json!("v")));
    }

    #[test]
    fn test_read_keys() {
        let temp = tempdir().unwrap();
        let (entry, _bus) = entry_at(temp.path());
        entry.write(map(json!({"a": 1, "b": 2, "c": 3}))).unwrap();

        assert_eq!(entry.read_key("b").unwrap(), json!(2));
        assert_eq!(
            Value::Object(entry.read_keys(&["a", "c"]).unwrap()),
            json!({"a": 1, "c": 3})
        );
        assert!(entry.read_key("zzz").unwrap_err().is_key_not_found());
        assert!(entry.read_keys(&["a", "zzz"]).unwrap_err().is_key_not_found());
    }

    #[test]
    fn test_write_replace() {
        let temp = tempdir().unwrap();
        let (entry, _bus) = entry_at(temp.path());
        entry.write(map(json!({"a": {"x": 1}}))).unwrap();
        entry.write_replace(map(json!({"a": {"y": 2}}))).unwrap();
        assert_eq!(Value::Object((*entry.read().unwrap()).clone()), json!({"a": {"y": 2}}));
    }

    #[test]
    fn test_read_blob() {
        let temp = tempdir().unwrap();
        let (entry, _bus) = entry_at(temp.path());
        entry.write_blob("payload", b"bytes").unwrap();
        assert_eq!(entry.read_blob("payload").unwrap(), b"bytes");
    }

    #[test]
    fn test_move_to() {
        let temp = tempdir().unwrap();
        let (entry, bus) = entry_at(&temp.path().join("a"));
        entry.tag(&["shot"]).unwrap();
        let uuid = entry.uuid().unwrap();
        let log = record_topics(&bus);

        let dest = temp.path().join("nested/b");
        entry.move_to(&dest).unwrap();

        assert_eq!(entry.path(), dest);
        assert_eq!(entry.uuid().unwrap(), uuid);
        assert_eq!(entry.tags().unwrap(), vec!["shot"]);
        assert_eq!(*log.lock(), vec![topics::MOVED]);
    }

    #[test]
    fn test_copy_gets_fresh_identity() {
        let temp = tempdir().unwrap();
        let (entry, bus) = entry_at(&temp.path().join("src"));
        entry.tag(&["shot"]).unwrap();
        entry.write(map(json!({"frames": 24}))).unwrap();
        let uuid = entry.uuid().unwrap();

        let dest = entry.copy_to(temp.path().join("dst")).unwrap();
        assert!(!dest.join(".data/.lock").exists());
        assert!(!dest.join(format!(".data/uuid_{}", uuid)).exists());

        let copy = Entry::new(&dest, Arc::new(Config::default()), bus).unwrap();
        assert_ne!(copy.uuid().unwrap(), uuid);
        assert_eq!(copy.tags().unwrap(), vec!["shot"]);
        assert_eq!(copy.read_key("frames").unwrap(), json!(24));
        // The original is untouched.
        assert_eq!(entry.uuid().unwrap(), uuid);
    }

    #[test]
    fn test_delete() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("doomed");
        let (entry, bus) = entry_at(&root);
        entry.tag(&["shot"]).unwrap();
        let log = record_topics(&bus);

        entry.delete(false).unwrap();
        assert!(root.is_dir());
        assert!(!entry.exists());
        assert_eq!(*log.lock(), vec![topics::DATA_DELETED, topics::DELETED]);

        entry.delete(true).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_stale_entry_recovers_after_rename() {
        let temp = tempdir().unwrap();
        let old = temp.path().join("shot01");
        let (entry, bus) = entry_at(&old);
        entry.tag(&["shot"]).unwrap();
        entry.write(map(json!({"frames": 24}))).unwrap();
        let log = record_topics(&bus);

        let new = temp.path().join("shot01_final");
        fs::rename(&old, &new).unwrap();

        assert_eq!(entry.read_key("frames").unwrap(), json!(24));
        assert_eq!(entry.path(), new);
        assert_eq!(entry.name(), "shot01_final");
        assert_eq!(*log.lock(), vec![topics::RELINKED]);
    }
}
