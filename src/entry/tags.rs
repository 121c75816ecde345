//! Naming rules and marker files inside a metadata directory.

use crate::config::Config;
use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const TAG_PREFIX: &str = "tag_";
pub const UUID_PREFIX: &str = "uuid_";
pub const LOCK_NAME: &str = ".lock";
pub const BLOBS_DIR: &str = "blobs";
pub const FILES_DIR: &str = "files";
/// Reserved mapping key recording stored blobs.
pub const BLOBS_KEY: &str = "blobs";
/// Reserved mapping key recording stored files.
pub const FILES_KEY: &str = "files";

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Tags may only contain ASCII letters, digits and `.-_`.
pub fn validate_tag(tag: &str) -> Result<()> {
    if valid_name(tag) {
        Ok(())
    } else {
        Err(Error::InvalidTag {
            tag: tag.to_string(),
        })
    }
}

/// Blob and file keys follow the same rules as tags.
pub fn validate_key(key: &str) -> Result<()> {
    if valid_name(key) {
        Ok(())
    } else {
        Err(Error::InvalidKey {
            key: key.to_string(),
        })
    }
}

/// Metadata directory of the entry at `root`.
pub fn data_dir(config: &Config, root: &Path) -> PathBuf {
    root.join(&config.data_root)
}

/// `<root>/<data_root>/tag_<tag>`
pub fn tag_path(config: &Config, root: &Path, tag: &str) -> PathBuf {
    data_dir(config, root).join(format!("{}{}", TAG_PREFIX, tag))
}

/// Sorted tags of the directory at `root`, read straight from disk.
///
/// Empty when `root` has no metadata directory.
pub fn read_tags(config: &Config, root: &Path) -> Result<Vec<String>> {
    let dir = data_dir(config, root);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(&dir, e)),
    };

    let mut tags = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(&dir, e))?;
        let name = entry.file_name();
        if let Some(tag) = name.to_str().and_then(|n| n.strip_prefix(TAG_PREFIX)) {
            tags.push(tag.to_string());
        }
    }
    tags.sort();
    Ok(tags)
}

/// UUID markers found in a metadata directory, sorted by name.
pub(crate) fn uuid_markers(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(dir, e)),
    };

    let mut markers = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let name = entry.file_name();
        if let Some(uuid) = name.to_str().and_then(|n| n.strip_prefix(UUID_PREFIX)) {
            markers.push((uuid.to_string(), entry.path()));
        }
    }
    markers.sort();
    Ok(markers)
}

pub(crate) fn uuid_marker_name(uuid: &str) -> String {
    format!("{}{}", UUID_PREFIX, uuid)
}
