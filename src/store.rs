//! Top-level handle bundling configuration, the event bus and the entry
//! cache.

use crate::bus::EventBus;
use crate::codec::DataMap;
use crate::config::Config;
use crate::entry::Entry;
use crate::error::Result;
use crate::factory::{EntryCache, Kind, KindRegistry};
use crate::search::Search;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// Owns one bus and the active [`EntryCache`].
///
/// Everything that would otherwise be process-global policy lives here, so
/// two stores with different configurations can coexist.
#[derive(Debug)]
pub struct Store {
    config: Arc<Config>,
    bus: EventBus,
    cache: RwLock<EntryCache>,
}

impl Store {
    pub fn new(config: Config) -> Self {
        Self::with_registry(config, KindRegistry::new())
    }

    pub fn with_registry(config: Config, registry: KindRegistry) -> Self {
        let config = Arc::new(config);
        let bus = EventBus::named("store");
        let cache = EntryCache::new(Arc::clone(&config), bus.clone(), registry);
        cache.setup();
        Self {
            config,
            bus,
            cache: RwLock::new(cache),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cache(&self) -> EntryCache {
        self.cache.read().clone()
    }

    /// Replace the active cache. The previous cache stops following bus
    /// events and forgets its entries.
    pub fn set_cache(&self, cache: EntryCache) {
        let previous = std::mem::replace(&mut *self.cache.write(), cache.clone());
        if previous != cache {
            previous.teardown();
        }
        cache.setup();
    }

    pub fn register_kind(&self, tag: &str) -> Result<Kind> {
        self.cache().register_kind(tag)
    }

    pub fn register_kind_with<F>(&self, name: &str, tag: &str, init: F) -> Result<Kind>
    where
        F: Fn(&Entry) -> Result<()> + Send + Sync + 'static,
    {
        self.cache().register_kind_with(name, tag, init)
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Result<Arc<Entry>> {
        self.cache().get(path)
    }

    pub fn search(&self, root: impl AsRef<Path>) -> Search {
        self.cache().search(root)
    }

    pub fn tag(&self, path: impl AsRef<Path>, tags: &[&str]) -> Result<()> {
        self.get(path)?.tag(tags)
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Result<Arc<DataMap>> {
        self.get(path)?.read()
    }

    pub fn write(&self, path: impl AsRef<Path>, data: DataMap) -> Result<()> {
        self.get(path)?.write(data)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::topics;
    use serde_json::json;
    use std::fs;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_store_round_trip() {
        let temp = tempdir().unwrap();
        let store = Store::default();
        let path = temp.path().join("shot");

        store.tag(&path, &["shot"]).unwrap();
        let mut data = DataMap::new();
        data.insert("frames".into(), json!(24));
        store.write(&path, data).unwrap();

        assert_eq!(store.read(&path).unwrap()["frames"], json!(24));
        assert_eq!(store.get(&path).unwrap().tags().unwrap(), vec!["shot"]);
        assert_eq!(store.search(temp.path()).count(), 1);
    }

    #[test]
    fn test_set_cache_swaps_subscriptions() {
        let store = Store::default();
        let old = store.cache();
        assert!(old.is_setup());

        let new = EntryCache::new(Arc::clone(store.config()), store.bus().clone(), KindRegistry::new());
        store.set_cache(new.clone());

        assert!(!old.is_setup());
        assert!(new.is_setup());
        assert_eq!(store.bus().subscribers(topics::MOVED).len(), 1);
        assert!(store.cache() == new);

        store.set_cache(new.clone());
        assert!(new.is_setup());
    }

    #[test]
    fn test_stores_are_independent() {
        let temp = tempdir().unwrap();
        let a = Store::default();
        let b = Store::new(Config::builder().data_root(".meta").build());

        a.tag(temp.path(), &["a"]).unwrap();
        b.tag(temp.path(), &["b"]).unwrap();

        assert!(temp.path().join(".data/tag_a").is_file());
        assert!(temp.path().join(".meta/tag_b").is_file());
        assert_eq!(a.get(temp.path()).unwrap().tags().unwrap(), vec!["a"]);
        assert_eq!(b.get(temp.path()).unwrap().tags().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_concurrent_stores_agree_on_identity() {
        let temp = tempdir().unwrap();
        for round in 0..25 {
            let path = temp.path().join(format!("fresh{}", round));
            let barrier = &Barrier::new(2);
            let target = &path;
            let ids: Vec<String> = thread::scope(|scope| {
                let handles: Vec<_> = (0..2)
                    .map(|_| {
                        scope.spawn(move || {
                            let store = Store::default();
                            let entry = store.get(target).unwrap();
                            barrier.wait();
                            entry.uuid().unwrap()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(ids[0], ids[1], "round {}", round);
            let markers = fs::read_dir(path.join(".data"))
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("uuid_"))
                .count();
            assert_eq!(markers, 1, "round {}", round);
        }
    }

    #[test]
    fn test_register_kind() {
        let temp = tempdir().unwrap();
        let store = Store::default();
        store.register_kind("shot").unwrap();
        store.tag(temp.path(), &["shot"]).unwrap();
        assert_eq!(store.get(temp.path()).unwrap().kind().name(), "shot");
    }
}
