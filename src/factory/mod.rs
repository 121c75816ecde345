//! One [`Entry`] instance per directory per process.
//!
//! The cache keeps explicit maps keyed by absolute path and is kept
//! consistent through the event bus: moved and relinked entries are re-keyed,
//! missing and deleted entries are evicted, and tag changes force the kind to
//! be recomputed on the next lookup.

mod kind;

pub use kind::{Kind, KindInit, KindRegistry, BASE_KIND};

use crate::bus::{topics, Event, EventBus, Handler, Payload, SubscriptionId, DEFAULT_PRIORITY};
use crate::config::Config;
use crate::entry::{self, Entry};
use crate::error::Result;
use crate::search::{Direction, Search};
use crate::util;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

/// Modification times of a directory and of its metadata directory.
type Stamp = (Option<SystemTime>, Option<SystemTime>);

#[derive(Default)]
struct CacheState {
    entries: HashMap<PathBuf, Arc<Entry>>,
    kinds: HashMap<PathBuf, Kind>,
    /// `None` forces the kind to be recomputed on the next lookup.
    stamps: HashMap<PathBuf, Option<Stamp>>,
}

impl CacheState {
    fn remove(&mut self, path: &Path) -> Option<Arc<Entry>> {
        self.kinds.remove(path);
        self.stamps.remove(path);
        self.entries.remove(path)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.kinds.clear();
        self.stamps.clear();
    }
}

struct CacheInner {
    config: Arc<Config>,
    bus: EventBus,
    registry: RwLock<KindRegistry>,
    state: Mutex<CacheState>,
    subscriptions: Mutex<Vec<(&'static str, SubscriptionId)>>,
}

/// Path to [`Entry`] cache. Clones share the same cache.
#[derive(Clone)]
pub struct EntryCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for EntryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryCache")
            .field("entries", &self.len())
            .field("kinds", &self.inner.registry.read().kinds().len())
            .finish()
    }
}

impl PartialEq for EntryCache {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl EntryCache {
    /// Create a cache. It does not follow bus events until [`setup`] is
    /// called.
    ///
    /// [`setup`]: EntryCache::setup
    pub fn new(config: Arc<Config>, bus: EventBus, registry: KindRegistry) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                bus,
                registry: RwLock::new(registry),
                state: Mutex::new(CacheState::default()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Register a kind selected by `tag`. Cached entries pick it up on their
    /// next lookup.
    pub fn register_kind(&self, tag: &str) -> Result<Kind> {
        let kind = self.inner.registry.write().register(tag)?;
        self.invalidate_all();
        Ok(kind)
    }

    /// Register a kind whose `init` runs on each entry classified as it.
    pub fn register_kind_with<F>(&self, name: &str, tag: &str, init: F) -> Result<Kind>
    where
        F: Fn(&Entry) -> Result<()> + Send + Sync + 'static,
    {
        let kind = self.inner.registry.write().register_with(name, tag, init)?;
        self.invalidate_all();
        Ok(kind)
    }

    pub fn registry(&self) -> KindRegistry {
        self.inner.registry.read().clone()
    }

    pub fn kind_for_tags<S: AsRef<str>>(&self, tags: &[S]) -> Kind {
        self.inner.registry.read().kind_for_tags(tags)
    }

    /// The entry for `path`, created on first use.
    ///
    /// If the directory changed since the last lookup its kind is recomputed
    /// from the tags on disk; the instance itself is kept. When the entry
    /// gets a new kind, that kind's initialiser runs before returning.
    pub fn get(&self, path: impl AsRef<Path>) -> Result<Arc<Entry>> {
        let path = util::absolute(path.as_ref())?;
        let (entry, assigned) = self.lookup(path)?;
        // Runs without the state lock: initialisers publish events the
        // cache itself handles.
        if let Some(kind) = assigned {
            kind.init(&entry)?;
        }
        Ok(entry)
    }

    /// Cached or new entry, plus its kind when that was just assigned.
    fn lookup(&self, path: PathBuf) -> Result<(Arc<Entry>, Option<Kind>)> {
        let stamp = self.stamp(&path);
        let mut state = self.inner.state.lock();

        if let Some(entry) = state.entries.get(&path).cloned() {
            let known = state.stamps.get(&path).copied().flatten();
            if known == Some(stamp) {
                return Ok((entry, None));
            }

            let kind = self.kind_for_path(&path)?;
            let previous = entry.kind();
            let assigned = if previous != kind {
                tracing::debug!(
                    "Kind of {} changed from {} to {}",
                    path.display(),
                    previous,
                    kind
                );
                entry.set_kind(kind.clone());
                Some(kind.clone())
            } else {
                None
            };
            state.kinds.insert(path.clone(), kind);
            state.stamps.insert(path, Some(stamp));
            return Ok((entry, assigned));
        }

        let kind = self.kind_for_path(&path)?;
        let entry = Arc::new(Entry::with_kind(
            path.clone(),
            Arc::clone(&self.inner.config),
            self.inner.bus.clone(),
            kind.clone(),
        ));
        tracing::trace!("Caching {} as {}", path.display(), kind);
        state.entries.insert(path.clone(), Arc::clone(&entry));
        state.kinds.insert(path.clone(), kind.clone());
        state.stamps.insert(path, Some(stamp));
        Ok((entry, Some(kind)))
    }

    /// Cached entry for `path` without creating one.
    pub fn cached(&self, path: impl AsRef<Path>) -> Option<Arc<Entry>> {
        let path = util::absolute(path.as_ref()).ok()?;
        self.inner.state.lock().entries.get(&path).cloned()
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.cached(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop `path` from the cache.
    pub fn evict(&self, path: impl AsRef<Path>) -> Option<Arc<Entry>> {
        let path = util::absolute(path.as_ref()).ok()?;
        self.inner.state.lock().remove(&path)
    }

    /// Force every cached entry's kind to be recomputed on its next lookup.
    pub fn invalidate_all(&self) {
        let mut state = self.inner.state.lock();
        for stamp in state.stamps.values_mut() {
            *stamp = None;
        }
    }

    /// Search starting at `root`, downward by default.
    pub fn search(&self, root: impl AsRef<Path>) -> Search {
        Search::new(self.clone(), root.as_ref())
    }

    /// Entries below `entry` carrying every tag in `tags`.
    pub fn children(&self, entry: &Entry, tags: &[&str]) -> Result<Search> {
        self.search(entry.path()).skip_root().tags(tags)
    }

    /// Entries above `entry` carrying every tag in `tags`, nearest first.
    pub fn parents(&self, entry: &Entry, tags: &[&str]) -> Result<Search> {
        self.search(entry.path())
            .direction(Direction::Up)
            .skip_root()
            .tags(tags)
    }

    /// Nearest entry above `entry` carrying every tag in `tags`.
    pub fn parent(&self, entry: &Entry, tags: &[&str]) -> Result<Option<Arc<Entry>>> {
        Ok(self.parents(entry, tags)?.one())
    }

    /// Copy `entry` to `dest` and return the copy's entry.
    pub fn copy(&self, entry: &Entry, dest: impl AsRef<Path>) -> Result<Arc<Entry>> {
        let dest = entry.copy_to(dest)?;
        self.get(dest)
    }

    /// Follow the bus events that keep the cache consistent. Calling it
    /// twice has no effect.
    pub fn setup(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let routes: [(&'static str, Handler); 6] = [
            (topics::MOVED, rekey_handler(weak.clone())),
            (topics::RELINKED, rekey_handler(weak.clone())),
            (topics::MISSING, evict_handler(weak.clone())),
            (topics::DELETED, evict_handler(weak.clone())),
            (topics::TAGGED, invalidate_handler(weak.clone())),
            (topics::UNTAGGED, invalidate_handler(weak)),
        ];
        for (topic, handler) in routes {
            let id = self
                .inner
                .bus
                .subscribe_handler(topic, handler, DEFAULT_PRIORITY);
            subscriptions.push((topic, id));
        }
        tracing::debug!("Entry cache subscribed to {} topics", subscriptions.len());
    }

    /// Stop following bus events and forget every cached entry.
    pub fn teardown(&self) {
        let subscriptions: Vec<_> = self.inner.subscriptions.lock().drain(..).collect();
        for (topic, id) in subscriptions {
            self.inner.bus.unsubscribe(topic, id);
        }
        self.inner.state.lock().clear();
        tracing::debug!("Entry cache torn down");
    }

    pub fn is_setup(&self) -> bool {
        !self.inner.subscriptions.lock().is_empty()
    }

    fn kind_for_path(&self, path: &Path) -> Result<Kind> {
        let tags = entry::read_tags(&self.inner.config, path)?;
        Ok(self.kind_for_tags(&tags))
    }

    fn stamp(&self, path: &Path) -> Stamp {
        (
            mtime(path),
            mtime(&entry::tags::data_dir(&self.inner.config, path)),
        )
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn rekey_handler(cache: Weak<CacheInner>) -> Handler {
    Arc::new(move |event: &Event| {
        let Some(inner) = cache.upgrade() else {
            return Ok(Value::Null);
        };
        if let Payload::Moved { old, new } = &event.payload {
            let mut state = inner.state.lock();
            if let Some(entry) = state.remove(old) {
                tracing::debug!("Re-keyed {} -> {}", old.display(), new.display());
                let kind = entry.kind();
                state.entries.insert(new.clone(), entry);
                state.kinds.insert(new.clone(), kind);
                state.stamps.insert(new.clone(), None);
            }
        }
        Ok(Value::Null)
    })
}

fn evict_handler(cache: Weak<CacheInner>) -> Handler {
    Arc::new(move |event: &Event| {
        if let Some(inner) = cache.upgrade() {
            if inner.state.lock().remove(&event.path).is_some() {
                tracing::debug!("Evicted {} ({})", event.path.display(), event.topic);
            }
        }
        Ok(Value::Null)
    })
}

fn invalidate_handler(cache: Weak<CacheInner>) -> Handler {
    Arc::new(move |event: &Event| {
        if let Some(inner) = cache.upgrade() {
            let mut state = inner.state.lock();
            if let Some(stamp) = state.stamps.get_mut(&event.path) {
                *stamp = None;
            }
        }
        Ok(Value::Null)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataMap;
    use crate::config::LockSettings;
    use crate::error::Error;
    use crate::lock::LockFile;
    use std::time::Duration;
    use tempfile::tempdir;

    fn cache_with(registry: KindRegistry) -> EntryCache {
        let cache = EntryCache::new(Arc::new(Config::default()), EventBus::new(), registry);
        cache.setup();
        cache
    }

    fn registry() -> KindRegistry {
        let mut registry = KindRegistry::new();
        registry.register("project").unwrap();
        registry.register("shot").unwrap();
        registry
    }

    #[test]
    fn test_same_instance_for_same_path() {
        let temp = tempdir().unwrap();
        let cache = cache_with(KindRegistry::new());
        let a = cache.get(temp.path()).unwrap();
        let b = cache.get(temp.path().join("x/..")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_kind_follows_tags() {
        let temp = tempdir().unwrap();
        let cache = cache_with(registry());
        let entry = cache.get(temp.path()).unwrap();
        assert!(entry.kind().is_base());

        entry.tag(&["shot"]).unwrap();
        let again = cache.get(temp.path()).unwrap();
        assert!(Arc::ptr_eq(&entry, &again));
        assert_eq!(again.kind().name(), "shot");

        entry.untag(&["shot"]).unwrap();
        assert!(cache.get(temp.path()).unwrap().kind().is_base());
    }

    #[test]
    fn test_kind_detected_from_existing_tags() {
        let temp = tempdir().unwrap();
        crate::util::touch(&temp.path().join(".data/tag_project")).unwrap();
        let cache = cache_with(registry());
        assert_eq!(cache.get(temp.path()).unwrap().kind().name(), "project");
    }

    #[test]
    fn test_register_kind_reclassifies_cached_entries() {
        let temp = tempdir().unwrap();
        let cache = cache_with(KindRegistry::new());
        let entry = cache.get(temp.path()).unwrap();
        entry.tag(&["asset"]).unwrap();
        assert!(cache.get(temp.path()).unwrap().kind().is_base());

        cache.register_kind("asset").unwrap();
        assert_eq!(cache.get(temp.path()).unwrap().kind().name(), "asset");
        assert!(matches!(
            cache.register_kind("asset"),
            Err(Error::Registration { .. })
        ));
    }

    #[test]
    fn test_kind_init_runs_when_classified() {
        let temp = tempdir().unwrap();
        let cache = cache_with(KindRegistry::new());
        cache
            .register_kind_with("shot", "shot", |entry: &Entry| {
                if entry.read()?.contains_key("fps") {
                    return Ok(());
                }
                let mut defaults = DataMap::new();
                defaults.insert("fps".into(), Value::from(24));
                entry.write(defaults)
            })
            .unwrap();

        let entry = cache.get(temp.path().join("plain")).unwrap();
        entry.write(DataMap::new()).unwrap();
        assert!(!entry.read().unwrap().contains_key("fps"));

        entry.tag(&["shot"]).unwrap();
        let shot = cache.get(temp.path().join("plain")).unwrap();
        assert!(Arc::ptr_eq(&entry, &shot));
        assert_eq!(shot.read_key("fps").unwrap(), Value::from(24));

        // Already classified: a later lookup doesn't run it again.
        let mut custom = DataMap::new();
        custom.insert("fps".into(), Value::from(30));
        shot.write(custom).unwrap();
        cache.get(temp.path().join("plain")).unwrap();
        assert_eq!(shot.read_key("fps").unwrap(), Value::from(30));
    }

    #[test]
    fn test_moved_entry_is_rekeyed() {
        let temp = tempdir().unwrap();
        let cache = cache_with(KindRegistry::new());
        let old = temp.path().join("a");
        let new = temp.path().join("b");
        let entry = cache.get(&old).unwrap();
        entry.tag(&["shot"]).unwrap();

        entry.move_to(&new).unwrap();
        assert!(!cache.contains(&old));
        assert!(Arc::ptr_eq(&entry, &cache.get(&new).unwrap()));
    }

    #[test]
    fn test_relinked_entry_is_rekeyed() {
        let temp = tempdir().unwrap();
        let cache = cache_with(KindRegistry::new());
        let old = temp.path().join("shot01");
        let new = temp.path().join("shot01_final");
        let entry = cache.get(&old).unwrap();
        entry.tag(&["shot"]).unwrap();

        fs::rename(&old, &new).unwrap();
        entry.tags().unwrap();

        assert!(!cache.contains(&old));
        assert!(Arc::ptr_eq(&entry, &cache.get(&new).unwrap()));
    }

    #[test]
    fn test_deleted_and_missing_entries_are_evicted() {
        let temp = tempdir().unwrap();
        let cache = cache_with(KindRegistry::new());
        let deleted = cache.get(temp.path().join("deleted")).unwrap();
        deleted.tag(&["x"]).unwrap();
        deleted.delete(true).unwrap();
        assert!(!cache.contains(temp.path().join("deleted")));

        let missing_path = temp.path().join("missing");
        let missing = cache.get(&missing_path).unwrap();
        missing.tag(&["x"]).unwrap();
        fs::remove_dir_all(&missing_path).unwrap();
        assert!(missing.read().unwrap_err().is_entry_not_found());
        assert!(!cache.contains(&missing_path));
    }

    #[test]
    fn test_lock_timeout_reports_missing_and_evicts() {
        let temp = tempdir().unwrap();
        let config = Config::builder()
            .lock_timeout(Some(Duration::from_millis(100)))
            .build();
        let cache = EntryCache::new(Arc::new(config), EventBus::new(), KindRegistry::new());
        cache.setup();
        let path = temp.path().join("busy");
        let entry = cache.get(&path).unwrap();
        entry.tag(&["x"]).unwrap();

        let missing = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&missing);
        cache.bus().subscribe(
            topics::MISSING,
            move |event: &Event| {
                sink.lock().push(event.path.clone());
                Ok(Value::Null)
            },
            DEFAULT_PRIORITY,
        );

        let holder = LockFile::new(path.join(".data/.lock"), LockSettings::default());
        holder.acquire(None).unwrap();

        let mut data = DataMap::new();
        data.insert("frames".into(), Value::from(24));
        let err = entry.write(data).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert_eq!(*missing.lock(), vec![path.clone()]);
        assert!(!cache.contains(&path));

        holder.release().unwrap();
    }

    #[test]
    fn test_teardown_stops_tracking() {
        let temp = tempdir().unwrap();
        let cache = cache_with(KindRegistry::new());
        let entry = cache.get(temp.path().join("a")).unwrap();
        entry.tag(&["x"]).unwrap();
        assert!(cache.is_setup());

        cache.teardown();
        assert!(cache.is_empty());
        assert!(!cache.is_setup());
        assert!(cache.bus().subscribers(topics::DELETED).is_empty());

        cache.setup();
        cache.setup();
        assert_eq!(cache.bus().subscribers(topics::DELETED).len(), 1);
    }

    #[test]
    fn test_copy_returns_new_entry() {
        let temp = tempdir().unwrap();
        let cache = cache_with(registry());
        let entry = cache.get(temp.path().join("src")).unwrap();
        entry.tag(&["shot"]).unwrap();

        let copy = cache.copy(&entry, temp.path().join("dst")).unwrap();
        assert!(!Arc::ptr_eq(&entry, &copy));
        assert_eq!(copy.kind().name(), "shot");
        assert_ne!(copy.uuid().unwrap(), entry.uuid().unwrap());
    }
}
