//! File system helpers for staging, backups and persisted state.
//!
//! All functions are synchronous and operate on `std::fs`; async callers run
//! them through `tokio::task::spawn_blocking`.
//!
//! # Key Features
//!
//! - **Atomic writes**: state files are written to a temp file, synced, then renamed
//! - **Tree copies**: directory snapshots preserve relative layout and permissions
//! - **Sibling paths**: staging/trash directories live next to their target so
//!   the final swap is a same-filesystem rename

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Create a directory and all of its parents.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    if path.exists() && !path.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("Path exists but is not a directory: {}", path.display()),
        ));
    }
    fs::create_dir_all(path)
}

/// Write `content` to `path` atomically.
///
/// The data is written to `<path>.tmp`, flushed to disk, and renamed over the
/// destination so readers never observe a partially written file.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_dir(parent)?;
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)
}

/// Recursively copy `src` into `dst`, returning the number of bytes copied.
///
/// Symlinks are skipped. `dst` is created if missing.
pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<u64> {
    ensure_dir(dst)?;
    let mut copied = 0;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            copied += fs::copy(entry.path(), &target)?;
        }
    }

    Ok(copied)
}

/// List regular files under `root` as sorted `(relative path, size)` pairs.
pub fn list_files(root: &Path) -> io::Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_file() {
            let relative = entry.path().strip_prefix(root).map_err(io::Error::other)?;
            let size = entry.metadata().map_err(io::Error::other)?.len();
            files.push((relative.to_path_buf(), size));
        }
    }

    files.sort();
    Ok(files)
}

/// Total size in bytes of all regular files under `root`.
pub fn dir_size(root: &Path) -> io::Result<u64> {
    Ok(list_files(root)?.iter().map(|(_, size)| size).sum())
}

/// Remove a directory tree if it exists.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove a file if it exists.
pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Hidden sibling of `dir` tagged with `tag`, e.g. `/opt/.app.staging-<id>`.
#[must_use]
pub fn sibling_path(dir: &Path, tag: &str) -> PathBuf {
    let name = dir.file_name().unwrap_or_default().to_string_lossy();
    dir.with_file_name(format!(".{name}.{tag}"))
}
