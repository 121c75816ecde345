//! Lazy tree walks yielding entries.
//!
//! A downward search keeps an explicit stack of directories still to visit
//! and yields entries in depth-first, name-sorted order. Depth is counted
//! from the nearest entry above, so a search reaches `depth` levels below
//! every entry it finds. Metadata directories are never descended into and
//! unreadable directories are skipped.

use crate::entry::{validate_tag, Entry};
use crate::error::Result;
use crate::factory::EntryCache;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

pub const DEFAULT_DOWN_DEPTH: usize = 10;
pub const DEFAULT_UP_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Down,
    Up,
}

type Predicate = Box<dyn Fn(&Entry) -> bool + Send + Sync>;

struct Frame {
    dir: PathBuf,
    level: usize,
    at_root: bool,
}

enum Walker {
    Down { stack: Vec<Frame> },
    Up { next: Option<PathBuf>, level: usize },
}

/// Iterator over the entries found from a root directory.
///
/// Built through [`EntryCache::search`]; the builder methods narrow the
/// results. Iteration starts on the first call to `next`.
pub struct Search {
    cache: EntryCache,
    root: PathBuf,
    direction: Direction,
    depth: Option<usize>,
    skip_root: bool,
    predicates: Vec<Predicate>,
    selector: Option<Vec<String>>,
    walker: Option<Walker>,
}

impl fmt::Debug for Search {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Search")
            .field("root", &self.root)
            .field("direction", &self.direction)
            .field("depth", &self.depth)
            .field("skip_root", &self.skip_root)
            .field("predicates", &self.predicates.len())
            .field("selector", &self.selector)
            .finish()
    }
}

impl Search {
    pub fn new(cache: EntryCache, root: &Path) -> Self {
        let root = crate::util::absolute(root).unwrap_or_else(|_| root.to_path_buf());
        Self {
            cache,
            root,
            direction: Direction::Down,
            depth: None,
            skip_root: false,
            predicates: Vec::new(),
            selector: None,
            walker: None,
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn up(self) -> Self {
        self.direction(Direction::Up)
    }

    pub fn down(self) -> Self {
        self.direction(Direction::Down)
    }

    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Don't yield the root directory itself.
    pub fn skip_root(mut self) -> Self {
        self.skip_root = true;
        self
    }

    /// Only entries carrying every one of `tags`.
    pub fn tags(self, tags: &[&str]) -> Result<Self> {
        for tag in tags {
            validate_tag(tag)?;
        }
        if tags.is_empty() {
            return Ok(self);
        }
        let wanted: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        Ok(self.filter(move |entry| match entry.tags() {
            Ok(have) => wanted.iter().all(|tag| have.contains(tag)),
            Err(e) => {
                tracing::debug!("Skipping {}: {}", entry.path().display(), e);
                false
            }
        }))
    }

    /// Only entries whose name contains `name`.
    ///
    /// A name with `/` separators selects by hierarchy: `seq01/shot` matches
    /// an entry whose name contains `shot` below an entry whose name contains
    /// `seq01`.
    pub fn name(mut self, name: &str) -> Self {
        if name.contains('/') {
            let parts: Vec<String> = name
                .trim_matches('/')
                .split('/')
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect();
            self.selector = Some(parts);
            return self;
        }
        let name = name.to_string();
        self.filter(move |entry| entry.name().contains(&name))
    }

    pub fn uuid(self, uuid: &str) -> Self {
        let uuid = uuid.to_string();
        self.filter(move |entry| entry.uuid().map(|id| id == uuid).unwrap_or(false))
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Entry) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Box::new(predicate));
        self
    }

    /// First match, if any.
    pub fn one(mut self) -> Option<Arc<Entry>> {
        self.next()
    }

    fn data_root(&self) -> &str {
        &self.cache.config().data_root
    }

    fn is_entry_dir(&self, dir: &Path) -> bool {
        dir.join(self.data_root()).is_dir()
    }

    fn start(&self) -> Walker {
        match self.direction {
            Direction::Down => Walker::Down {
                stack: vec![Frame {
                    dir: self.root.clone(),
                    level: 0,
                    at_root: true,
                }],
            },
            Direction::Up => Walker::Up {
                next: Some(self.root.clone()),
                level: 0,
            },
        }
    }

    /// Next directory holding metadata, before any filtering.
    fn next_candidate(&mut self) -> Option<PathBuf> {
        let mut walker = match self.walker.take() {
            Some(walker) => walker,
            None => self.start(),
        };
        let found = match &mut walker {
            Walker::Down { stack } => self.step_down(stack),
            Walker::Up { next, level } => self.step_up(next, level),
        };
        self.walker = Some(walker);
        found
    }

    fn step_down(&self, stack: &mut Vec<Frame>) -> Option<PathBuf> {
        let depth = self.depth.unwrap_or(DEFAULT_DOWN_DEPTH);
        while let Some(Frame {
            dir,
            mut level,
            at_root,
        }) = stack.pop()
        {
            let is_entry = self.is_entry_dir(&dir);
            if is_entry {
                level = 0;
            }
            if level < depth {
                let mut children = child_dirs(&dir, self.data_root());
                children.reverse();
                stack.extend(children.into_iter().map(|child| Frame {
                    dir: child,
                    level: level + 1,
                    at_root: false,
                }));
            }
            if is_entry && !(self.skip_root && at_root) {
                return Some(dir);
            }
        }
        None
    }

    fn step_up(&self, next: &mut Option<PathBuf>, level: &mut usize) -> Option<PathBuf> {
        let depth = self.depth.unwrap_or(DEFAULT_UP_DEPTH);
        while let Some(dir) = next.take() {
            if *level > depth {
                return None;
            }
            *next = dir.parent().map(Path::to_path_buf);
            let current = *level;
            *level += 1;
            if self.skip_root && current == 0 {
                continue;
            }
            if self.is_entry_dir(&dir) {
                return Some(dir);
            }
        }
        None
    }

    fn matches(&self, entry: &Entry) -> bool {
        if let Some(parts) = &self.selector {
            if !self.matches_selector(entry, parts) {
                return false;
            }
        }
        self.predicates.iter().all(|predicate| predicate(entry))
    }

    /// The last part must match the entry; the others must match entries
    /// above it, in order.
    fn matches_selector(&self, entry: &Entry, parts: &[String]) -> bool {
        let Some((last, ancestors)) = parts.split_last() else {
            return true;
        };
        if !entry.name().contains(last.as_str()) {
            return false;
        }

        let path = entry.path();
        let boundary = match self.direction {
            Direction::Down => Some(self.root.as_path()),
            Direction::Up => None,
        };
        let mut names: Vec<String> = path
            .ancestors()
            .skip(1)
            .take_while(|dir| boundary.map(|b| dir.starts_with(b)).unwrap_or(true))
            .filter(|dir| self.is_entry_dir(dir))
            .map(crate::util::basename)
            .collect();
        names.reverse();

        let mut remaining = names.iter();
        ancestors
            .iter()
            .all(|part| remaining.any(|name| name.contains(part.as_str())))
    }
}

impl Iterator for Search {
    type Item = Arc<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let dir = self.next_candidate()?;
            let entry = match self.cache.get(&dir) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping {}: {}", dir.display(), e);
                    continue;
                }
            };
            if self.matches(&entry) {
                return Some(entry);
            }
        }
    }
}

/// Sorted subdirectories of `dir`, excluding metadata directories and
/// symlinks. Unreadable directories yield nothing.
fn child_dirs(dir: &Path, data_root: &str) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Skipping unreadable {}: {}", dir.display(), e);
            return Vec::new();
        }
    };
    let mut children: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                && entry.file_name() != OsStr::new(data_root)
        })
        .map(|entry| entry.path())
        .collect();
    children.sort();
    children
}

/// Directory below `root` whose metadata holds the identity marker for
/// `uuid`, looking at most `depth` levels down (`None` for no limit).
pub fn find_uuid(root: &Path, data_root: &str, uuid: &str, depth: Option<usize>) -> Option<PathBuf> {
    let marker = format!("{}{}", crate::entry::tags::UUID_PREFIX, uuid);
    let mut walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
    if let Some(depth) = depth {
        walker = walker.max_depth(depth);
    }
    walker
        .into_iter()
        .filter_entry(|entry| entry.file_type().is_dir() && entry.file_name() != OsStr::new(data_root))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!("Skipping during identity search: {}", e);
                None
            }
        })
        .map(walkdir::DirEntry::into_path)
        .find(|dir| dir.join(data_root).join(&marker).is_file())
}

/// Top-most directory holding metadata among `start` and its ancestors,
/// looking at most `depth` levels up.
pub fn top_entry(start: &Path, data_root: &str, depth: usize) -> Option<PathBuf> {
    start
        .ancestors()
        .take(depth + 1)
        .filter(|dir| dir.join(data_root).is_dir())
        .last()
        .map(Path::to_path_buf)
}
