//! Small filesystem helpers used by entries and the command-line front end.

use crate::codec::DataMap;
use crate::error::{Error, Result};
use filetime::FileTime;
use serde_json::Value;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub const KILOBYTES: usize = 1024;
/// Default read buffer for [`copy_file`].
pub const DEFAULT_BUFFER: usize = 256 * KILOBYTES;
pub const MINIMUM_BUFFER: usize = KILOBYTES;

/// Create an empty file, or update the modification time of an existing one.
///
/// Missing parent directories are created.
pub fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::io(path, e))?;
    filetime::set_file_mtime(path, FileTime::now()).map_err(|e| Error::io(path, e))
}

/// Absolute path with `.` and `..` components resolved lexically.
///
/// Unlike `canonicalize` this works for paths that don't exist yet and does
/// not resolve symlinks.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = std::path::absolute(path).map_err(|e| Error::io(path, e))?;
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Last path component as a string, empty for the filesystem root.
pub fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn optimize_buffer(len: u64, buffer_size: usize) -> usize {
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    buffer_size.min(len).max(MINIMUM_BUFFER)
}

/// Copy a single file through a buffer sized for the file.
///
/// Parent directories of `dest` are created. Permissions are copied.
pub fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    if dest.exists() && same_file(src, dest) {
        return Err(Error::io(
            dest,
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "source and destination can not be the same file",
            ),
        ));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let mut input = fs::File::open(src).map_err(|e| Error::io(src, e))?;
    let metadata = input.metadata().map_err(|e| Error::io(src, e))?;
    let mut output = fs::File::create(dest).map_err(|e| Error::io(dest, e))?;

    let mut buffer = vec![0u8; optimize_buffer(metadata.len(), DEFAULT_BUFFER)];
    loop {
        let read = input.read(&mut buffer).map_err(|e| Error::io(src, e))?;
        if read == 0 {
            break;
        }
        output
            .write_all(&buffer[..read])
            .map_err(|e| Error::io(dest, e))?;
    }

    fs::set_permissions(dest, metadata.permissions()).map_err(|e| Error::io(dest, e))?;
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Recursively copy `src` to `dest`.
///
/// Fails with [`Error::DestinationExists`] if `dest` is present, and refuses
/// a `dest` inside `src`. If the copy
/// fails partway the partially written `dest` is removed; `src` is never
/// touched.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        return Err(Error::DestinationExists {
            path: dest.to_path_buf(),
        });
    }
    if absolute(dest)?.starts_with(absolute(src)?) {
        return Err(Error::io(
            dest,
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "destination is inside the source",
            ),
        ));
    }

    let result = copy_tree_inner(src, dest);
    if result.is_err() {
        if let Err(e) = fs::remove_dir_all(dest) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    "Failed to clean up partial copy at {}: {}",
                    dest.display(),
                    e
                );
            }
        }
    }
    result
}

fn copy_tree_inner(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            Error::io(&path, io::Error::from(e))
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
            let permissions = entry
                .metadata()
                .map_err(|e| Error::io(entry.path(), io::Error::from(e)))?
                .permissions();
            fs::set_permissions(&target, permissions).map_err(|e| Error::io(&target, e))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dest: &Path) -> Result<()> {
    let link = fs::read_link(src).map_err(|e| Error::io(src, e))?;
    std::os::unix::fs::symlink(&link, dest).map_err(|e| Error::io(dest, e))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dest: &Path) -> Result<()> {
    copy_file(src, dest)
}

/// Move `src` to `dest`, renaming when possible and copying otherwise.
pub fn move_tree(src: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        return Err(Error::DestinationExists {
            path: dest.to_path_buf(),
        });
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(
                "Rename {} -> {} failed ({}), falling back to copy",
                src.display(),
                dest.display(),
                e
            );
            copy_tree(src, dest)?;
            fs::remove_dir_all(src).map_err(|e| Error::io(src, e))
        }
    }
}

/// Merge `update` into `target` recursively.
///
/// Nested mappings are merged key by key; any other value replaces what was
/// there before.
pub fn deep_merge(target: &mut DataMap, update: DataMap) {
    for (key, value) in update {
        match value {
            Value::Object(incoming) => {
                if let Some(Value::Object(existing)) = target.get_mut(&key) {
                    deep_merge(existing, incoming);
                    continue;
                }
                target.insert(key, Value::Object(incoming));
            }
            value => {
                target.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn map(value: Value) -> DataMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_deep_merge_nested() {
        let mut target = map(json!({"a": {"x": 1}, "b": 1}));
        deep_merge(&mut target, map(json!({"a": {"y": 2}, "c": 3})));
        assert_eq!(Value::Object(target), json!({"a": {"x": 1, "y": 2}, "b": 1, "c": 3}));
    }

    #[test]
    fn test_deep_merge_non_mapping_overwrites() {
        let mut target = map(json!({"a": {"x": 1}, "b": {"z": 1}}));
        deep_merge(&mut target, map(json!({"a": 5, "b": [1, 2]})));
        assert_eq!(Value::Object(target), json!({"a": 5, "b": [1, 2]}));
    }

    #[test]
    fn test_absolute_normalizes() {
        let path = absolute(Path::new("/tmp/a/./b/../c")).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/a/c"));
    }

    #[test]
    fn test_touch_creates_parents() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("a/b/c.txt");
        touch(&file).unwrap();
        assert!(file.is_file());
        touch(&file).unwrap();
        assert_eq!(fs::metadata(&file).unwrap().len(), 0);
    }

    #[test]
    fn test_copy_file_small_and_large() {
        let temp = tempdir().unwrap();
        let small = temp.path().join("small.bin");
        let large = temp.path().join("large.bin");
        fs::write(&small, b"hello").unwrap();
        let payload: Vec<u8> = (0..(DEFAULT_BUFFER * 2 + 17)).map(|i| i as u8).collect();
        fs::write(&large, &payload).unwrap();

        copy_file(&small, &temp.path().join("out/small.bin")).unwrap();
        copy_file(&large, &temp.path().join("out/large.bin")).unwrap();

        assert_eq!(fs::read(temp.path().join("out/small.bin")).unwrap(), b"hello");
        assert_eq!(fs::read(temp.path().join("out/large.bin")).unwrap(), payload);
    }

    #[test]
    fn test_copy_file_onto_itself_fails() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("f.txt");
        fs::write(&file, b"x").unwrap();
        assert!(copy_file(&file, &file).is_err());
        assert_eq!(fs::read(&file).unwrap(), b"x");
    }

    #[test]
    fn test_copy_tree() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("nested/deeper")).unwrap();
        fs::write(src.join("root.txt"), b"root").unwrap();
        fs::write(src.join("nested/deeper/leaf.txt"), b"leaf").unwrap();

        let dest = temp.path().join("dest");
        copy_tree(&src, &dest).unwrap();

        assert_eq!(fs::read(dest.join("root.txt")).unwrap(), b"root");
        assert_eq!(fs::read(dest.join("nested/deeper/leaf.txt")).unwrap(), b"leaf");
        assert!(src.join("root.txt").exists());
    }

    #[test]
    fn test_copy_tree_refuses_existing_destination() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("dest");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("keep.txt"), b"keep").unwrap();

        let err = copy_tree(&src, &dest).unwrap_err();
        assert!(matches!(err, Error::DestinationExists { .. }));
        assert!(dest.join("keep.txt").exists());
    }

    #[test]
    fn test_copy_tree_refuses_destination_inside_source() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/leaf.txt"), b"leaf").unwrap();

        let err = copy_tree(&src, &src.join("nested/copy")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(!src.join("nested/copy").exists());
        assert!(src.join("nested/leaf.txt").exists());

        let err = copy_tree(&src, &src.join("copy/../copy2")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_copy_tree_missing_source_leaves_no_destination() {
        let temp = tempdir().unwrap();
        let dest = temp.path().join("dest");
        assert!(copy_tree(&temp.path().join("nope"), &dest).is_err());
        assert!(!dest.exists());
    }

    #[test]
    fn test_move_tree() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("inner")).unwrap();
        fs::write(src.join("inner/file.txt"), b"data").unwrap();

        let dest = temp.path().join("elsewhere/dest");
        move_tree(&src, &dest).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(dest.join("inner/file.txt")).unwrap(), b"data");
    }
}
