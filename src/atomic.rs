//! Crash-safe file replacement.
//!
//! Every durable document is written with the write-to-temp-then-rename
//! pattern:
//! 1. Write to `<path>.tmp`
//! 2. fsync the temp file
//! 3. Rename over `<path>`
//! 4. fsync the parent directory
//!
//! A crash before step 3 leaves the previous document untouched; a stale
//! `.tmp` file is simply overwritten by the next save.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Path of the temporary sibling used while replacing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes `bytes` to the temporary sibling of `path` and syncs it.
///
/// The canonical file is not touched; call [`commit`] to publish.
pub fn write_temp(path: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path(path);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    Ok(tmp_path)
}

/// Atomically renames a prepared temp file over `path`.
pub fn commit(tmp_path: &Path, path: &Path) -> io::Result<()> {
    std::fs::rename(tmp_path, path)?;
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// Replaces `path` with `bytes` so readers only ever see the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = write_temp(path, bytes)?;
    commit(&tmp_path, path)
}

/// Syncs a directory so a rename inside it survives power loss.
fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = File::open(dir_path)?;
    dir.sync_all()
}
