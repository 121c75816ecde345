//! Error types shared by every module of the crate.

use crate::codec::CodecError;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by event bus handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading or mutating entries.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not a valid tag: {tag:?} (tags can only contain letters, numbers and .-_)")]
    InvalidTag { tag: String },

    #[error("Not a valid key: {key:?} (keys can only contain letters, numbers and .-_)")]
    InvalidKey { key: String },

    #[error("Timed out after {timeout:?} while trying to acquire lock {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("Can not release unacquired lock {path}")]
    LockState { path: PathBuf },

    #[error("Entry not found: {path} ({reason})")]
    EntryNotFound { path: PathBuf, reason: String },

    #[error("Key not found: {key}")]
    KeyNotFound { key: String },

    #[error("Destination path already exists: {path}")]
    DestinationExists { path: PathBuf },

    #[error("Kind already registered for tag: {tag}")]
    Registration { tag: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Handler for {topic} failed: {source}")]
    Handler { topic: String, source: HandlerError },

    #[error("I/O error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl Error {
    /// Wrap an I/O error together with the path it happened on.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn not_found(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Error::EntryNotFound {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// True for lookups of keys, blobs or files that are not stored.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Error::KeyNotFound { .. })
    }

    /// True when an entry could not be found or relinked.
    pub fn is_entry_not_found(&self) -> bool {
        matches!(self, Error::EntryNotFound { .. })
    }
}
