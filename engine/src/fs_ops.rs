//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Enumerating candidate files on a drive
//! - Naming, promoting and discarding `.ingest-part` temp files
//! - Creating destination directories recursively

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::warn;

use crate::error::{EngineError, Result};

/// Suffix of in-progress transfer files.
pub const TEMP_SUFFIX: &str = ".ingest-part";

/// A regular file found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
}

/// Enumerate every regular file below `root`.
///
/// Paths under any of `exclusions` and leftover temp files are skipped.
/// Symlinks are not followed. A subdirectory that cannot be read is logged
/// and skipped; only failure to read `root` itself is an error.
pub fn enumerate_candidates(root: &Path, exclusions: &[PathBuf]) -> Result<Vec<Candidate>> {
    let mut items = Vec::new();

    fn recurse(
        path: &Path,
        exclusions: &[PathBuf],
        items: &mut Vec<Candidate>,
    ) -> Result<()> {
        let entries = fs::read_dir(path).map_err(|e| EngineError::EnumerationFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| EngineError::EnumerationFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
            let entry_path = entry.path();
            if exclusions.iter().any(|ex| entry_path.starts_with(ex)) {
                continue;
            }

            let file_type = entry.file_type().map_err(|e| EngineError::EnumerationFailed {
                path: entry_path.clone(),
                source: e,
            })?;

            if file_type.is_dir() {
                if let Err(e) = recurse(&entry_path, exclusions, items) {
                    warn!(path = %entry_path.display(), error = %e, "skipping unreadable directory");
                }
            } else if file_type.is_file() {
                if is_temp_file(&entry_path) {
                    continue;
                }
                let size = entry.metadata().map(|m| m.len()).map_err(|e| {
                    EngineError::EnumerationFailed {
                        path: entry_path.clone(),
                        source: e,
                    }
                })?;
                items.push(Candidate {
                    path: entry_path,
                    size,
                });
            }
        }
        Ok(())
    }

    recurse(root, exclusions, &mut items)?;
    items.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(items)
}

/// Temp sibling of `dest`: `dir/.<name>.ingest-part`.
pub fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(dest.file_name().unwrap_or_default());
    name.push(TEMP_SUFFIX);
    dest.with_file_name(name)
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

/// Atomically move a finished temp file into place and restore `mtime`.
///
/// Restoring the modification time is best-effort.
pub fn promote_temp(temp: &Path, dest: &Path, mtime: Option<SystemTime>) -> Result<()> {
    fs::rename(temp, dest).map_err(|e| EngineError::WriteError {
        path: dest.to_path_buf(),
        source: e,
    })?;
    if let Some(mtime) = mtime {
        if let Err(e) = filetime::set_file_mtime(dest, filetime::FileTime::from_system_time(mtime)) {
            warn!(path = %dest.display(), error = %e, "could not preserve modification time");
        }
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_quiet(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove file"),
    }
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns `DirectoryCreationFailed` if the parent exists as a file or
/// cannot be created.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}
