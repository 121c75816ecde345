//! Recovering an entry whose directory was renamed or moved.
//!
//! The identity marker `uuid_<id>` travels with the metadata directory, so a
//! record that lost its marker first checks whether the marker was replaced
//! in place, then looks for its identity in the surrounding tree.

use super::data::EntryData;
use crate::bus::{topics, Payload};
use crate::error::{Error, Result};
use crate::search::{self, DEFAULT_UP_DEPTH};
use std::path::{Path, PathBuf};

impl EntryData {
    pub(super) fn relink(&mut self) -> Result<()> {
        let Some(uuid) = self.uuid.clone() else {
            return Ok(());
        };

        if self.dir.is_dir() {
            return self.recover_in_place(&uuid);
        }

        let old = self.root();
        match self.locate(&old, &uuid) {
            Ok(new) => {
                tracing::debug!("Relinked {} -> {}", old.display(), new.display());
                self.rebase(&new);
                self.emit(topics::RELINKED, Payload::Moved { old, new });
                Ok(())
            }
            Err(reason) => {
                tracing::debug!("Could not relink {}: {}", old.display(), reason);
                self.emit(
                    topics::MISSING,
                    Payload::Missing {
                        reason: reason.clone(),
                    },
                );
                Err(Error::not_found(old, reason))
            }
        }
    }

    /// The metadata directory survived but the marker is gone: adopt whatever
    /// marker is there now, or start a new identity.
    fn recover_in_place(&mut self, lost: &str) -> Result<()> {
        let previous = Some(lost.to_string());
        let _guard = self.lock()?;
        match self.adopt_marker()? {
            Some(found) => {
                if found != lost {
                    tracing::debug!("Adopted identity {} in {}", found, self.dir.display());
                    self.emit(
                        topics::UUID_CHANGED,
                        Payload::Uuid {
                            old: previous,
                            new: found,
                        },
                    );
                }
            }
            None => {
                let new = self.mint_uuid()?;
                tracing::debug!("Identity lost in {}, minted {}", self.dir.display(), new);
                self.emit(topics::UUID_CHANGED, Payload::Uuid { old: previous, new });
            }
        }
        Ok(())
    }

    /// Find the directory now holding `uuid`, searching outward from the
    /// nearest surviving ancestor of `old`.
    fn locate(&self, old: &Path, uuid: &str) -> std::result::Result<PathBuf, String> {
        let (ancestor, levels) = nearest_ancestor(old, self.config.max_relink_levels)?;
        let data_root = &self.config.data_root;

        // The search radius matches how far up we had to walk.
        if let Some(found) = search::find_uuid(ancestor, data_root, uuid, Some(levels)) {
            return Ok(found);
        }

        if let Some(top) = search::top_entry(ancestor, data_root, DEFAULT_UP_DEPTH) {
            tracing::trace!("Searching {} for {} without depth limit", top.display(), uuid);
            if let Some(found) = search::find_uuid(&top, data_root, uuid, None) {
                return Ok(found);
            }
        }

        Err(format!("no directory with identity {} found", uuid))
    }
}

/// Closest existing ancestor of `path` and how many levels above it sits.
fn nearest_ancestor(path: &Path, max_levels: usize) -> std::result::Result<(&Path, usize), String> {
    let mut levels = 0;
    let mut current = path;
    loop {
        current = current
            .parent()
            .ok_or_else(|| "no surviving ancestor directory".to_string())?;
        levels += 1;
        if levels > max_levels {
            return Err(format!(
                "no surviving ancestor within {} levels",
                max_levels
            ));
        }
        if current.is_dir() {
            return Ok((current, levels));
        }
    }
}
