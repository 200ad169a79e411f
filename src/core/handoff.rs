//! Lock-free single-slot handoff through rename atomicity.
//!
//! Producer side: [`publish_json`] writes a hidden temp file in the slot's
//! directory and renames it over the slot, replacing any unread value.
//!
//! Consumer side: [`claim_json`] renames the slot to a private path first and
//! only then reads it. Whoever wins the rename owns the bytes; a second
//! claimer finds the slot gone and reads nothing.
//!
//! The same primitives carry heartbeats, event records and marker files.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors that can occur while publishing or claiming a slot
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("Slot has no parent directory: {0}")]
    NoParent(PathBuf),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed slot content in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl HandoffError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Atomically replace `slot` with `bytes`
pub fn publish_bytes(slot: &Path, bytes: &[u8]) -> Result<(), HandoffError> {
    let dir = slot
        .parent()
        .ok_or_else(|| HandoffError::NoParent(slot.to_path_buf()))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| HandoffError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| HandoffError::io(tmp.path(), e))?;
    tmp.flush().map_err(|e| HandoffError::io(tmp.path(), e))?;
    tmp.persist(slot).map_err(|e| HandoffError::io(slot, e.error))?;

    Ok(())
}

/// Atomically replace `slot` with the JSON form of `value`
pub fn publish_json<T: Serialize>(slot: &Path, value: &T) -> Result<(), HandoffError> {
    let json = serde_json::to_vec(value)?;
    publish_bytes(slot, &json)
}

/// Take ownership of the slot's current value, if any.
///
/// `Ok(None)` means there was nothing new (or another reader won). A parse
/// failure consumes the bytes anyway; they are never retried.
pub fn claim_json<T: DeserializeOwned>(slot: &Path) -> Result<Option<T>, HandoffError> {
    let Some(private) = claim_path(slot)? else {
        return Ok(None);
    };

    let result = fs::read(&private)
        .map_err(|e| HandoffError::io(&private, e))
        .and_then(|bytes| {
            serde_json::from_slice(&bytes).map_err(|source| HandoffError::Malformed {
                path: slot.to_path_buf(),
                source,
            })
        });

    if let Err(e) = fs::remove_file(&private) {
        debug!(path = %private.display(), "Failed to remove claimed file: {}", e);
    }
    result.map(Some)
}

/// Rename the slot to a private path owned by the caller.
///
/// The caller is responsible for the returned file.
pub fn claim_path(slot: &Path) -> Result<Option<PathBuf>, HandoffError> {
    let private = private_path(slot);
    match fs::rename(slot, &private) {
        Ok(()) => Ok(Some(private)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(HandoffError::io(slot, e)),
    }
}

fn private_path(slot: &Path) -> PathBuf {
    let name = slot
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    slot.with_file_name(format!(".{}.{}.rd.tmp", name, Uuid::new_v4().simple()))
}

/// Read a JSON file without claiming it (descriptors, done markers)
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, HandoffError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| HandoffError::Malformed {
                path: path.to_path_buf(),
                source,
            }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(HandoffError::io(path, e)),
    }
}

// ============================================================================
// Heartbeats
// ============================================================================

pub fn write_heartbeat(path: &Path, tick: u64) -> Result<(), HandoffError> {
    publish_bytes(path, tick.to_string().as_bytes())
}

/// Last tick a worker reported; `None` if absent or unreadable
pub fn read_heartbeat(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

// ============================================================================
// Marker files
// ============================================================================

pub fn marker_present(path: &Path) -> bool {
    path.exists()
}

pub fn set_marker(path: &Path) -> Result<(), HandoffError> {
    if path.exists() {
        return Ok(());
    }
    fs::File::create(path)
        .map(|_| ())
        .map_err(|e| HandoffError::io(path, e))
}

pub fn clear_marker(path: &Path) -> Result<(), HandoffError> {
    remove_if_present(path)
}

/// Remove a file, treating "already gone" as success
pub fn remove_if_present(path: &Path) -> Result<(), HandoffError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HandoffError::io(path, e)),
    }
}

/// Time since the file was last written; `None` if it does not exist
pub fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

/// Delete and recreate a generation directory as a unit
pub fn reset_dir(path: &Path) -> Result<(), HandoffError> {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(HandoffError::io(path, e)),
    }
    fs::create_dir_all(path).map_err(|e| HandoffError::io(path, e))
}

/// Visible subdirectory names (dot-prefixed entries are skipped)
pub fn list_subdirs(path: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| !crate::config::paths::is_hidden(name))
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Slot {
        n: u32,
    }

    #[test]
    fn test_publish_replaces_unread_value() {
        let temp = TempDir::new().unwrap();
        let slot = temp.path().join("image.json");

        publish_json(&slot, &Slot { n: 1 }).unwrap();
        publish_json(&slot, &Slot { n: 2 }).unwrap();

        let claimed: Option<Slot> = claim_json(&slot).unwrap();
        assert_eq!(claimed, Some(Slot { n: 2 }));

        let again: Option<Slot> = claim_json(&slot).unwrap();
        assert_eq!(again, None);
    }

    #[test]
    fn test_claim_leaves_no_scratch_files() {
        let temp = TempDir::new().unwrap();
        let slot = temp.path().join("image.json");

        publish_json(&slot, &Slot { n: 7 }).unwrap();
        let _: Option<Slot> = claim_json(&slot).unwrap();

        let leftovers: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_malformed_slot_is_consumed() {
        let temp = TempDir::new().unwrap();
        let slot = temp.path().join("image.json");
        fs::write(&slot, b"{not json").unwrap();

        let result: Result<Option<Slot>, _> = claim_json(&slot);
        assert!(matches!(result, Err(HandoffError::Malformed { .. })));
        assert!(!slot.exists());

        // The private copy goes too, even when parsing failed
        let leftovers: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let temp = TempDir::new().unwrap();
        let hb = temp.path().join("iteration.txt");

        assert_eq!(read_heartbeat(&hb), None);
        write_heartbeat(&hb, 17).unwrap();
        assert_eq!(read_heartbeat(&hb), Some(17));
    }

    #[test]
    fn test_markers_are_idempotent() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("alert.off");

        set_marker(&marker).unwrap();
        set_marker(&marker).unwrap();
        assert!(marker_present(&marker));

        clear_marker(&marker).unwrap();
        clear_marker(&marker).unwrap();
        assert!(!marker_present(&marker));
    }

    #[test]
    fn test_list_subdirs_skips_hidden_and_files() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("porch")).unwrap();
        fs::create_dir(temp.path().join(".scratch")).unwrap();
        fs::write(temp.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(list_subdirs(temp.path()), vec!["porch".to_string()]);
    }
}
