//! Persistent storage
//!
//! Data-directory resolution and crash-safe JSON persistence for the
//! usage ledger, the request queue and the performance log. Every store
//! treats a missing file as an empty store, never an error.

pub mod ledger;
pub mod perf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Could not determine data directory")]
    NoDataDir,
}

/// Get the application data directory, creating it if needed.
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    let dirs = directories::ProjectDirs::from("dev", "fleetrs", "fleetrs")
        .ok_or(StorageError::NoDataDir)?;
    let dir = dirs.data_dir().to_path_buf();
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Write a value as pretty JSON with write-new-then-rename semantics, so a
/// crash mid-write leaves the previous file intact.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a JSON file, returning the type's default when the file is absent.
pub fn load_json_or_default<T>(path: &Path) -> Result<T, StorageError>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
        name: String,
    }

    #[test]
    fn test_atomic_write_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");

        let value = Sample {
            count: 3,
            name: "a".into(),
        };
        write_json_atomic(&path, &value).unwrap();

        let loaded: Sample = load_json_or_default(&path).unwrap();
        assert_eq!(loaded, value);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Sample = load_json_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, Sample::default());
    }
}
