//! Crash-safe file primitives used by the file-backed store and lock.
//!
//! Records are written to a temporary file in the target directory and then
//! renamed over the destination, so readers never observe a half-written
//! record. Lock files use `create_new` so that creation itself is the atomic
//! test-and-set.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use crate::error::{PersistenceError, Result};

/// Creates `dir` and its parents if missing.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| PersistenceError::DirectoryError {
        path: dir.to_path_buf(),
        source,
    })
}

/// Writes data to a file atomically (temp file + rename).
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    ensure_dir(dir)?;

    let write_err = |source| PersistenceError::WriteError {
        path: path.to_path_buf(),
        source,
    };

    // Same directory, so the rename never crosses filesystems.
    let mut temp_file = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    temp_file.write_all(data).map_err(write_err)?;
    temp_file.flush().map_err(write_err)?;
    temp_file
        .persist(path)
        .map_err(|e| PersistenceError::WriteError {
            path: path.to_path_buf(),
            source: e.error,
        })?;

    Ok(())
}

/// Serializes `value` as JSON and writes it atomically.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &json)
}

/// Creates `path` with `data` only if it does not exist yet.
///
/// Returns `Ok(false)` when the file already exists.
pub fn create_exclusive(path: &Path, data: &[u8]) -> Result<bool> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(source) => {
            return Err(PersistenceError::WriteError {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    file.write_all(data)
        .and_then(|_| file.flush())
        .map_err(|source| PersistenceError::WriteError {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(true)
}

/// Reads a whole file as a string, returning `None` if it does not exist.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PersistenceError::ReadError {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Reads and deserializes JSON, returning `None` if the file does not exist.
pub fn read_json_optional<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match read_optional(path)? {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

/// Removes a file, treating a missing file as success.
///
/// Returns whether a file was actually removed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(PersistenceError::WriteError {
            path: path.to_path_buf(),
            source,
        }),
    }
}
