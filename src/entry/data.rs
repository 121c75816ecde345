use super::tags::{
    self, data_dir, tag_path, uuid_marker_name, uuid_markers, BLOBS_DIR, BLOBS_KEY, FILES_DIR,
    FILES_KEY, LOCK_NAME,
};
use crate::bus::{topics, Event, Payload};
use crate::codec::DataMap;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lock::{LockFile, OwnedLockGuard};
use crate::util;
use parking_lot::RwLock;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Persistent record of one entry: the metadata directory, its data file,
/// tag markers, identity marker and stored blobs/files.
///
/// Every mutation happens under the metadata directory's [`LockFile`].
/// Events are queued rather than published so the owner can dispatch them
/// after releasing its own locks; see [`EntryData::take_events`].
pub(crate) struct EntryData {
    pub(super) config: Arc<Config>,
    /// Entry directory, shared with the owning entry.
    pub(super) location: Arc<RwLock<PathBuf>>,
    pub(super) dir: PathBuf,
    file: PathBuf,
    lock: Arc<LockFile>,
    pub(super) uuid: Option<String>,
    pub(super) uuid_file: Option<PathBuf>,
    cache: Option<Arc<DataMap>>,
    cache_mtime: Option<SystemTime>,
    outbox: Vec<Event>,
}

impl EntryData {
    pub(crate) fn new(config: Arc<Config>, location: Arc<RwLock<PathBuf>>) -> Self {
        let root = location.read().clone();
        let dir = data_dir(&config, &root);
        let file = dir.join(&config.data_file);
        let lock = Arc::new(LockFile::new(dir.join(LOCK_NAME), config.lock));
        Self {
            config,
            location,
            dir,
            file,
            lock,
            uuid: None,
            uuid_file: None,
            cache: None,
            cache_mtime: None,
            outbox: Vec::new(),
        }
    }

    pub(super) fn root(&self) -> PathBuf {
        self.location.read().clone()
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Events produced since the last call, in order.
    pub(crate) fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.outbox)
    }

    pub(super) fn emit(&mut self, topic: &str, payload: Payload) {
        let path = self.root();
        self.outbox.push(Event {
            topic: topic.to_string(),
            path,
            payload,
        });
    }

    /// Point the entry and every derived path at `root`. The cached mapping
    /// is dropped; the identity is kept.
    pub(super) fn rebase(&mut self, root: &Path) {
        *self.location.write() = root.to_path_buf();
        self.dir = data_dir(&self.config, root);
        self.file = self.dir.join(&self.config.data_file);
        self.lock = Arc::new(LockFile::new(self.dir.join(LOCK_NAME), self.config.lock));
        self.uuid_file = self
            .uuid
            .as_ref()
            .map(|uuid| self.dir.join(uuid_marker_name(uuid)));
        self.cache = None;
        self.cache_mtime = None;
    }

    /// Relink if the identity marker this record knows about has vanished.
    pub(crate) fn refresh(&mut self) -> Result<()> {
        let missing = match (&self.uuid, &self.uuid_file) {
            (Some(_), Some(marker)) => !marker.is_file(),
            _ => false,
        };
        if missing {
            self.relink()?;
        }
        Ok(())
    }

    /// Relink when needed, then create the data file and identity marker if
    /// they don't exist yet.
    pub(crate) fn ensure_ready(&mut self) -> Result<()> {
        self.refresh()?;

        let created = !self.dir.is_dir();
        if !self.file.is_file() {
            util::touch(&self.file)?;
        }

        if self.uuid.is_none() {
            // Another process may be initialising the same directory.
            let _guard = self.lock()?;
            if self.adopt_marker()?.is_none() {
                self.mint_uuid()?;
            }
        }

        if created {
            tracing::debug!("Created entry metadata in {}", self.dir.display());
            self.emit(topics::CREATED, Payload::None);
        }
        Ok(())
    }

    /// Take over the identity marker found on disk, if any. Caller holds the
    /// lock.
    pub(super) fn adopt_marker(&mut self) -> Result<Option<String>> {
        let mut markers = uuid_markers(&self.dir)?.into_iter();
        let Some((uuid, marker)) = markers.next() else {
            return Ok(None);
        };
        if markers.next().is_some() {
            tracing::warn!(
                "Multiple identity markers in {}, using {}",
                self.dir.display(),
                uuid
            );
        }
        self.uuid = Some(uuid.clone());
        self.uuid_file = Some(marker);
        Ok(Some(uuid))
    }

    /// Write a new identity marker. Caller holds the lock.
    pub(super) fn mint_uuid(&mut self) -> Result<String> {
        let uuid = self.config.new_id();
        let marker = self.dir.join(uuid_marker_name(&uuid));
        util::touch(&marker)?;
        self.uuid = Some(uuid.clone());
        self.uuid_file = Some(marker);
        Ok(uuid)
    }

    /// Acquire the metadata lock. A timeout is reported as `entry.missing`
    /// before it is returned.
    pub(super) fn lock(&mut self) -> Result<OwnedLockGuard> {
        let lock = Arc::clone(&self.lock);
        match lock.guard_owned(self.config.lock.timeout) {
            Ok(guard) => Ok(guard),
            Err(e @ Error::LockTimeout { .. }) => {
                self.emit(
                    topics::MISSING,
                    Payload::Missing {
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn data_mtime(&self) -> Result<SystemTime> {
        fs::metadata(&self.file)
            .and_then(|m| m.modified())
            .map_err(|e| Error::io(&self.file, e))
    }

    /// Current mapping, decoded again only when the file changed on disk.
    /// Caller holds the lock.
    fn load(&mut self) -> Result<Arc<DataMap>> {
        let mtime = self.data_mtime()?;
        if let Some(cache) = &self.cache {
            if self.cache_mtime == Some(mtime) {
                return Ok(Arc::clone(cache));
            }
        }

        let raw = fs::read(&self.file).map_err(|e| Error::io(&self.file, e))?;
        let data = Arc::new(self.config.codec.decode(&raw)?);
        tracing::trace!("Decoded {}", self.file.display());
        self.cache = Some(Arc::clone(&data));
        self.cache_mtime = Some(mtime);
        Ok(data)
    }

    /// Encode and persist `data`. Caller holds the lock.
    fn store(&mut self, data: DataMap) -> Result<Arc<DataMap>> {
        let raw = self.config.codec.encode(&data)?;
        fs::write(&self.file, raw).map_err(|e| Error::io(&self.file, e))?;
        let data = Arc::new(data);
        self.cache = Some(Arc::clone(&data));
        self.cache_mtime = Some(self.data_mtime()?);
        Ok(data)
    }

    pub(crate) fn read(&mut self) -> Result<Arc<DataMap>> {
        self.ensure_ready()?;
        let _guard = self.lock()?;
        self.load()
    }

    /// Deep-merge `data` into the stored mapping, or replace it wholesale.
    pub(crate) fn write(&mut self, data: DataMap, replace: bool) -> Result<Arc<DataMap>> {
        self.ensure_ready()?;
        let _guard = self.lock()?;

        let merged = if replace {
            data
        } else {
            let mut current = (*self.load()?).clone();
            util::deep_merge(&mut current, data);
            current
        };
        let stored = self.store(merged)?;
        self.emit(topics::DATA_CHANGED, Payload::Data((*stored).clone()));
        Ok(stored)
    }

    pub(crate) fn uuid(&mut self) -> Result<String> {
        self.ensure_ready()?;
        self.uuid
            .clone()
            .ok_or_else(|| Error::not_found(self.root(), "entry has no identity marker"))
    }

    /// Replace the identity marker with a freshly generated one.
    pub(crate) fn new_uuid(&mut self) -> Result<String> {
        self.ensure_ready()?;
        let _guard = self.lock()?;

        for (_, marker) in uuid_markers(&self.dir)? {
            fs::remove_file(&marker).map_err(|e| Error::io(&marker, e))?;
        }
        let old = self.uuid.take();
        let new = self.mint_uuid()?;
        tracing::debug!("New identity {} for {}", new, self.root().display());
        self.emit(
            topics::UUID_CHANGED,
            Payload::Uuid {
                old,
                new: new.clone(),
            },
        );
        Ok(new)
    }

    pub(crate) fn tags(&mut self) -> Result<Vec<String>> {
        self.refresh()?;
        tags::read_tags(&self.config, &self.root())
    }

    /// Add tag markers. Every tag is validated before anything is touched.
    pub(crate) fn tag(&mut self, tags: &[&str]) -> Result<()> {
        for tag in tags {
            tags::validate_tag(tag)?;
        }
        if tags.is_empty() {
            return Ok(());
        }

        self.ensure_ready()?;
        let _guard = self.lock()?;
        let root = self.root();
        let mut added = Vec::new();
        for tag in tags {
            let marker = tag_path(&self.config, &root, tag);
            if !marker.is_file() {
                util::touch(&marker)?;
                added.push(tag.to_string());
            }
        }
        if !added.is_empty() {
            self.emit(topics::TAGGED, Payload::Tags(added));
        }
        Ok(())
    }

    pub(crate) fn untag(&mut self, tags: &[&str]) -> Result<()> {
        for tag in tags {
            tags::validate_tag(tag)?;
        }
        if tags.is_empty() {
            return Ok(());
        }

        self.refresh()?;
        if !self.dir.is_dir() {
            return Ok(());
        }
        let _guard = self.lock()?;
        let root = self.root();
        let mut removed = Vec::new();
        for tag in tags {
            let marker = tag_path(&self.config, &root, tag);
            match fs::remove_file(&marker) {
                Ok(()) => removed.push(tag.to_string()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(&marker, e)),
            }
        }
        if !removed.is_empty() {
            self.emit(topics::UNTAGGED, Payload::Tags(removed));
        }
        Ok(())
    }

    /// Store `bytes` as `blobs/<key>.blob` and record it under the `blobs` key.
    pub(crate) fn write_blob(&mut self, key: &str, bytes: &[u8]) -> Result<PathBuf> {
        tags::validate_key(key)?;
        self.ensure_ready()?;
        let _guard = self.lock()?;

        let name = format!("{}.blob", key);
        let path = self.dir.join(BLOBS_DIR).join(&name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        fs::write(&path, bytes).map_err(|e| Error::io(&path, e))?;
        self.write(record(BLOBS_KEY, key, name), false)?;
        Ok(path)
    }

    pub(crate) fn blob_path(&mut self, key: &str) -> Result<PathBuf> {
        let name = self.stored_name(BLOBS_KEY, key)?;
        Ok(self.dir.join(BLOBS_DIR).join(name))
    }

    /// Copy `source` into `files/` and record its name under the `files` key.
    pub(crate) fn write_file(&mut self, key: &str, source: &Path) -> Result<PathBuf> {
        tags::validate_key(key)?;
        let name = util::basename(source);
        if name.is_empty() {
            return Err(Error::io(
                source,
                io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"),
            ));
        }
        self.ensure_ready()?;
        let _guard = self.lock()?;

        let path = self.dir.join(FILES_DIR).join(&name);
        util::copy_file(source, &path)?;
        self.write(record(FILES_KEY, key, name), false)?;
        Ok(path)
    }

    pub(crate) fn file_path(&mut self, key: &str) -> Result<PathBuf> {
        let name = self.stored_name(FILES_KEY, key)?;
        Ok(self.dir.join(FILES_DIR).join(name))
    }

    fn stored_name(&mut self, section: &str, key: &str) -> Result<String> {
        let data = self.read()?;
        data.get(section)
            .and_then(Value::as_object)
            .and_then(|stored| stored.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::KeyNotFound {
                key: format!("{}.{}", section, key),
            })
    }

    /// Remove the metadata directory. Missing metadata is not an error.
    pub(crate) fn delete(&mut self) -> Result<()> {
        self.refresh()?;
        if !self.dir.is_dir() {
            return Ok(());
        }

        {
            let _guard = self.lock()?;
            let entries = fs::read_dir(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
                if entry.file_name() == LOCK_NAME {
                    continue;
                }
                let path = entry.path();
                let removed = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                match removed {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::io(&path, e)),
                }
            }
        }
        // The guard removed the lock file, leaving the directory empty.
        match fs::remove_dir(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&self.dir, e)),
        }

        tracing::debug!("Deleted metadata {}", self.dir.display());
        self.uuid = None;
        self.uuid_file = None;
        self.cache = None;
        self.cache_mtime = None;
        self.emit(topics::DATA_DELETED, Payload::None);
        Ok(())
    }
}

/// `{section: {key: name}}`
fn record(section: &str, key: &str, name: String) -> DataMap {
    let mut inner = DataMap::new();
    inner.insert(key.to_string(), Value::String(name));
    let mut outer = DataMap::new();
    outer.insert(section.to_string(), Value::Object(inner));
    outer
}
