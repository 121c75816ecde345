//! Tagged directories with attached metadata.
//!
//! Any directory on disk can be turned into an [`Entry`] by giving it tags
//! or key/value data. Everything is stored in a hidden metadata directory
//! (`.data` by default) inside the tagged directory:
//!
//! ```text
//! shot01/
//! └── .data/
//!     ├── uuid_3f2a...    identity marker
//!     ├── tag_shot        one empty file per tag
//!     ├── data            YAML mapping
//!     ├── blobs/          raw byte payloads
//!     ├── files/          copied files
//!     └── .lock           present while a process writes
//! ```
//!
//! ## Properties
//!
//! - **Cross-process safety**: mutations happen under a lock file whose
//!   mtime is kept fresh by a background pump. Locks abandoned by a dead
//!   process expire and are stolen.
//! - **Move tolerance**: when a directory is renamed or moved, the entry
//!   finds it again by searching nearby for its identity marker.
//! - **Events**: every lifecycle change is published on an [`EventBus`];
//!   the [`EntryCache`] follows those events so one directory maps to one
//!   instance.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use tagdir::prelude::*;
//! use serde_json::json;
//!
//! fn main() -> tagdir::Result<()> {
//!     let store = Store::default();
//!     store.register_kind("shot")?;
//!
//!     let shot = store.get("/projects/demo/shot01")?;
//!     shot.tag(&["shot"])?;
//!
//!     let mut data = DataMap::new();
//!     data.insert("frames".into(), json!(24));
//!     shot.write(data)?;
//!
//!     for entry in store.search("/projects/demo").tags(&["shot"])? {
//!         println!("{} {}", entry.kind(), entry.path().display());
//!     }
//!
//!     tagdir::lock::release_all();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - [`entry`]: entries, their metadata records and move recovery
//! - [`factory`]: the entry cache and kind registry
//! - [`search`]: lazy directory walks yielding entries
//! - [`bus`]: in-process publish/subscribe
//! - [`lock`]: cross-process lock files and the refresh pump
//! - [`codec`], [`config`], [`util`]: storage format, settings, file helpers

#![warn(rustdoc::missing_crate_level_docs)]

pub mod bus;
pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod factory;
pub mod lock;
pub mod search;
pub mod store;
pub mod util;

pub use bus::{Event, EventBus, Payload};
pub use config::{Config, ConfigBuilder, LockSettings};
pub use entry::Entry;
pub use error::{Error, Result};
pub use factory::{EntryCache, Kind, KindRegistry};
pub use store::Store;

/// Re-exports for convenience.
pub mod prelude {
    pub use crate::bus::{topics, Event, EventBus, Payload, SubscriptionId};
    pub use crate::codec::{Codec, DataMap, DefaultCodec, JsonCodec, YamlCodec};
    pub use crate::config::{Config, ConfigBuilder, LockSettings};
    pub use crate::entry::Entry;
    pub use crate::error::{Error, Result};
    pub use crate::factory::{EntryCache, Kind, KindInit, KindRegistry};
    pub use crate::lock::{LockFile, LockGuard};
    pub use crate::search::{Direction, Search};
    pub use crate::store::Store;
}
