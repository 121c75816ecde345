//! Runtime configuration passed explicitly to every component.

use crate::codec::{Codec, DefaultCodec};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default name of the hidden metadata directory.
pub const DEFAULT_DATA_ROOT: &str = ".data";
/// Default name of the encoded data file inside the metadata directory.
pub const DEFAULT_DATA_FILE: &str = "data";
/// How far relink walks upward looking for a surviving ancestor.
pub const DEFAULT_MAX_RELINK_LEVELS: usize = 10;

/// Generates identifiers for new entries.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Timing parameters for lock files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// A lock whose mtime is older than this may be stolen.
    pub expiration: Duration,
    /// How often the pump refreshes held locks. Must be below `expiration`.
    pub pump_interval: Duration,
    /// Sleep between acquisition attempts.
    pub poll_interval: Duration,
    /// Default acquisition timeout. `None` blocks forever.
    pub timeout: Option<Duration>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(2),
            pump_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            timeout: None,
        }
    }
}

/// Configuration shared by the store, the entry cache and every entry.
#[derive(Clone)]
pub struct Config {
    pub data_root: String,
    pub data_file: String,
    pub codec: Arc<dyn Codec>,
    pub id_generator: IdGenerator,
    pub lock: LockSettings,
    pub max_relink_levels: usize,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Produce a fresh identifier using the configured generator.
    pub fn new_id(&self) -> String {
        (self.id_generator)()
    }
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("data_root", &self.data_root)
            .field("data_file", &self.data_file)
            .field("codec", &self.codec.name())
            .field("lock", &self.lock)
            .field("max_relink_levels", &self.max_relink_levels)
            .finish()
    }
}

/// Random v4 UUID rendered as 32 lowercase hex characters.
pub fn default_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Builder for [`Config`] with sensible defaults.
pub struct ConfigBuilder {
    data_root: String,
    data_file: String,
    codec: Arc<dyn Codec>,
    id_generator: IdGenerator,
    lock: LockSettings,
    max_relink_levels: usize,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            data_root: DEFAULT_DATA_ROOT.to_string(),
            data_file: DEFAULT_DATA_FILE.to_string(),
            codec: Arc::new(DefaultCodec),
            id_generator: Arc::new(default_id),
            lock: LockSettings::default(),
            max_relink_levels: DEFAULT_MAX_RELINK_LEVELS,
        }
    }

    pub fn data_root(mut self, name: impl Into<String>) -> Self {
        self.data_root = name.into();
        self
    }

    pub fn data_file(mut self, name: impl Into<String>) -> Self {
        self.data_file = name.into();
        self
    }

    pub fn codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn id_generator(mut self, generator: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.id_generator = Arc::new(generator);
        self
    }

    pub fn lock_settings(mut self, lock: LockSettings) -> Self {
        self.lock = lock;
        self
    }

    /// Default timeout applied to every lock acquisition.
    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock.timeout = timeout;
        self
    }

    pub fn max_relink_levels(mut self, levels: usize) -> Self {
        self.max_relink_levels = levels;
        self
    }

    pub fn build(self) -> Config {
        let mut lock = self.lock;
        if lock.expiration <= lock.pump_interval {
            // A live process must never see its own lock expire.
            tracing::warn!(
                "Lock expiration {:?} is not greater than pump interval {:?}, using {:?}",
                lock.expiration,
                lock.pump_interval,
                lock.pump_interval * 2
            );
            lock.expiration = lock.pump_interval * 2;
        }

        Config {
            data_root: self.data_root,
            data_file: self.data_file,
            codec: self.codec,
            id_generator: self.id_generator,
            lock,
            max_relink_levels: self.max_relink_levels,
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
