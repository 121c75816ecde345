//! In-process publish/subscribe used to propagate entry lifecycle events.
//!
//! Subscriptions are keyed by topic. A topic key containing glob
//! metacharacters (`*`, `?`, `[`) also receives every published topic it
//! matches, so a subscription on `entry.*` sees `entry.created`.
//!
//! Handlers are ordered by priority, lowest first. A new subscription is
//! inserted after every existing one with the same priority. Wildcard matches
//! and subscriptions on forwarded buses are merged into the exact-topic list
//! with the same rule. Dispatch is synchronous: `publish` calls every handler
//! in order on the caller's thread and stops at the first failure.

use crate::codec::DataMap;
use crate::error::{Error, HandlerError, Result};
use glob::Pattern;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Well-known topics published by entries.
pub mod topics {
    pub const CREATED: &str = "entry.created";
    pub const MOVED: &str = "entry.moved";
    pub const TAGGED: &str = "entry.data.tagged";
    pub const UNTAGGED: &str = "entry.data.untagged";
    pub const MISSING: &str = "entry.missing";
    pub const RELINKED: &str = "entry.relinked";
    pub const DELETED: &str = "entry.deleted";
    pub const DATA_CHANGED: &str = "entry.data.changed";
    pub const DATA_DELETED: &str = "entry.data.deleted";
    pub const UUID_CHANGED: &str = "entry.uuid.changed";

    pub const ALL: [&str; 10] = [
        CREATED,
        MOVED,
        TAGGED,
        UNTAGGED,
        MISSING,
        RELINKED,
        DELETED,
        DATA_CHANGED,
        DATA_DELETED,
        UUID_CHANGED,
    ];
}

pub const DEFAULT_PRIORITY: i32 = 0;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Event specific data.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    /// Tags added or removed.
    Tags(Vec<String>),
    /// Snapshot of the mapping after a write.
    Data(DataMap),
    /// The entry moved from `old` to `new`.
    Moved { old: PathBuf, new: PathBuf },
    /// The entry's identity changed.
    Uuid { old: Option<String>, new: String },
    /// The entry could not be found.
    Missing { reason: String },
}

/// A published event. `path` is the entry's path at publish time.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub path: PathBuf,
    pub payload: Payload,
}

pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// Shared handler. Subscribing the same `Arc` twice to a topic is a no-op
/// and a handler reached through several routes runs once per publish.
pub type Handler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    priority: i32,
    handler: Handler,
}

struct TopicSubscriptions {
    pattern: Option<Pattern>,
    subscriptions: Vec<Subscription>,
}

impl TopicSubscriptions {
    fn new(topic: &str) -> Self {
        let pattern = if topic.contains(['*', '?', '[']) {
            match Pattern::new(topic) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!("Subscription topic {:?} is not a valid pattern: {}", topic, e);
                    None
                }
            }
        } else {
            None
        };
        Self {
            pattern,
            subscriptions: Vec::new(),
        }
    }

    fn matches(&self, topic: &str) -> bool {
        self.pattern
            .as_ref()
            .map(|pattern| pattern.matches(topic))
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct BusState {
    topics: BTreeMap<String, TopicSubscriptions>,
    forwards: Vec<Weak<BusInner>>,
}

struct BusInner {
    id: u64,
    name: Option<String>,
    state: Mutex<BusState>,
}

/// A synchronous event bus. Clones share the same subscriptions.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for EventBus {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventBus {}

impl EventBus {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::build(Some(name.into()))
    }

    fn build(name: Option<String>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                id: next_id(),
                name,
                state: Mutex::new(BusState::default()),
            }),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Subscribe a closure to `topic`.
    pub fn subscribe<F>(&self, topic: &str, handler: F, priority: i32) -> SubscriptionId
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe_handler(topic, Arc::new(handler), priority)
    }

    /// Subscribe a shared handler to `topic`.
    ///
    /// If the same handler is already subscribed to `topic` its existing id is
    /// returned and its priority is left unchanged.
    pub fn subscribe_handler(&self, topic: &str, handler: Handler, priority: i32) -> SubscriptionId {
        let mut state = self.inner.state.lock();
        let entry = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicSubscriptions::new(topic));

        if let Some(existing) = entry
            .subscriptions
            .iter()
            .find(|s| Arc::ptr_eq(&s.handler, &handler))
        {
            return existing.id;
        }

        let id = SubscriptionId(next_id());
        let index = insertion_index(&entry.subscriptions, priority);
        entry.subscriptions.insert(
            index,
            Subscription {
                id,
                priority,
                handler,
            },
        );
        tracing::trace!("Subscribed {:?} to {} at priority {}", id, topic, priority);
        id
    }

    /// Remove a subscription. Unknown ids are ignored. Returns true if a
    /// subscription was removed.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.topics.get_mut(topic) else {
            return false;
        };
        let before = entry.subscriptions.len();
        entry.subscriptions.retain(|s| s.id != id);
        let removed = entry.subscriptions.len() != before;
        if entry.subscriptions.is_empty() {
            state.topics.remove(topic);
        }
        removed
    }

    /// Remove every subscription on `topic`, or on every topic when `None`.
    pub fn clear(&self, topic: Option<&str>) {
        let mut state = self.inner.state.lock();
        match topic {
            Some(topic) => {
                state.topics.remove(topic);
            }
            None => state.topics.clear(),
        }
    }

    /// Also deliver this bus's publications to `other`'s subscribers.
    pub fn forward(&self, other: &EventBus) {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return;
        }
        let mut state = self.inner.state.lock();
        let already = state
            .forwards
            .iter()
            .filter_map(Weak::upgrade)
            .any(|bus| Arc::ptr_eq(&bus, &other.inner));
        if !already {
            state.forwards.push(Arc::downgrade(&other.inner));
        }
    }

    pub fn unforward(&self, other: &EventBus) {
        let mut state = self.inner.state.lock();
        state.forwards.retain(|weak| match weak.upgrade() {
            Some(bus) => !Arc::ptr_eq(&bus, &other.inner),
            None => false,
        });
    }

    /// Ids of the subscriptions a publish to `topic` would invoke, in order.
    pub fn subscribers(&self, topic: &str) -> Vec<SubscriptionId> {
        self.resolve(topic).into_iter().map(|s| s.id).collect()
    }

    /// Invoke every handler subscribed to `topic`, returning their results in
    /// order. The first handler failure is returned as [`Error::Handler`];
    /// handlers that already ran are not undone.
    pub fn publish(&self, topic: &str, path: &Path, payload: Payload) -> Result<Vec<Value>> {
        let event = Event {
            topic: topic.to_string(),
            path: path.to_path_buf(),
            payload,
        };
        self.publish_event(&event)
    }

    pub fn publish_event(&self, event: &Event) -> Result<Vec<Value>> {
        let subscriptions = self.resolve(&event.topic);
        tracing::trace!(
            "Publishing {} for {} to {} subscriber(s)",
            event.topic,
            event.path.display(),
            subscriptions.len()
        );

        let mut results = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let value = (subscription.handler)(event).map_err(|source| Error::Handler {
                topic: event.topic.clone(),
                source,
            })?;
            results.push(value);
        }
        Ok(results)
    }

    /// Ordered handler list for `topic`, collected without holding any bus
    /// lock while handlers run.
    fn resolve(&self, topic: &str) -> Vec<Subscription> {
        let (mut ordered, mut pending) = {
            let state = self.inner.state.lock();
            let mut ordered = state
                .topics
                .get(topic)
                .map(|entry| entry.subscriptions.clone())
                .unwrap_or_default();

            for (key, entry) in &state.topics {
                if key != topic && entry.matches(topic) {
                    merge(&mut ordered, &entry.subscriptions);
                }
            }

            let forwards: Vec<Arc<BusInner>> =
                state.forwards.iter().filter_map(Weak::upgrade).collect();
            (ordered, forwards)
        };

        // Depth-first over the forwarding graph, each bus visited once.
        let mut visited: HashSet<u64> = HashSet::from([self.inner.id]);
        pending.reverse();
        while let Some(bus) = pending.pop() {
            if !visited.insert(bus.id) {
                continue;
            }
            let state = bus.state.lock();
            for (key, entry) in &state.topics {
                if key == topic || entry.matches(topic) {
                    merge(&mut ordered, &entry.subscriptions);
                }
            }
            let mut next: Vec<Arc<BusInner>> =
                state.forwards.iter().filter_map(Weak::upgrade).collect();
            next.reverse();
            pending.extend(next);
        }

        ordered
    }
}

/// Index after every subscription with priority `<= priority`.
fn insertion_index(subscriptions: &[Subscription], priority: i32) -> usize {
    subscriptions.partition_point(|s| s.priority <= priority)
}

fn merge(ordered: &mut Vec<Subscription>, incoming: &[Subscription]) {
    for subscription in incoming {
        let seen = ordered
            .iter()
            .any(|s| s.id == subscription.id || Arc::ptr_eq(&s.handler, &subscription.handler));
        if seen {
            continue;
        }
        let index = insertion_index(ordered, subscription.priority);
        ordered.insert(index, subscription.clone());
    }
}
