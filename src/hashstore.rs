//! # Change Detection
//!
//! Persistent content-hash store: one JSON document mapping absolute output
//! path to the hash of the last deployed content. Loaded once at run start,
//! mutated in memory, saved once at run end.
//!
//! Detection is content-only. Files that were touched externally but not
//! modified hash identically and are reported unchanged; a missing record
//! means first deployment and is reported changed. Records are never
//! deleted here - stale entries for removed secrets are tolerated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::DeployError;

/// Last-deployed state for one output path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashRecord {
    pub path: PathBuf,
    pub hash: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    hashes: HashMap<PathBuf, HashRecord>,
}

/// The only state that survives between runs.
#[derive(Debug)]
pub struct HashStore {
    document: StoreDocument,
    file_path: PathBuf,
}

impl HashStore {
    /// Load the store from disk. Missing or corrupt files mean "no prior
    /// deployments" - everything will read as changed - never a fatal error.
    pub fn load(file_path: impl Into<PathBuf>) -> Self {
        let file_path = file_path.into();
        let document = match std::fs::read_to_string(&file_path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(document) => document,
                Err(e) => {
                    warn!(
                        path = %file_path.display(),
                        error = %e,
                        "hash store is corrupt, treating all secrets as changed"
                    );
                    StoreDocument::default()
                }
            },
            Err(e) => {
                // Absent just means first run; anything else deserves a trace
                // because it turns into a full redeployment.
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        path = %file_path.display(),
                        error = %e,
                        "hash store is unreadable, treating all secrets as changed"
                    );
                }
                StoreDocument::default()
            }
        };

        Self {
            document,
            file_path,
        }
    }

    /// In-memory store for tests and dry runs; `save` still writes to the
    /// given path.
    #[must_use]
    pub fn empty(file_path: impl Into<PathBuf>) -> Self {
        Self {
            document: StoreDocument::default(),
            file_path: file_path.into(),
        }
    }

    /// Whether the file at `path` differs from its last recorded deployment.
    ///
    /// Updates the in-memory record on change; call [`HashStore::save`]
    /// to persist.
    pub fn has_changed(&mut self, path: &Path) -> Result<bool, DeployError> {
        let current = hash_file(path)?;

        match self.document.hashes.get(path) {
            Some(record) if record.hash == current => Ok(false),
            _ => {
                self.document.hashes.insert(
                    path.to_path_buf(),
                    HashRecord {
                        path: path.to_path_buf(),
                        hash: current,
                        last_modified: Utc::now(),
                    },
                );
                Ok(true)
            }
        }
    }

    /// Persist the store as a single pretty-printed JSON document.
    pub fn save(&self) -> Result<(), DeployError> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DeployError::file_system_with_source(
                    "Creating hash store directory",
                    parent,
                    "Failed to create directory for hash store",
                    e,
                )
            })?;
        }

        let data = serde_json::to_string_pretty(&self.document).map_err(|e| {
            DeployError::configuration_with(
                "Serializing hash store",
                format!("Failed to serialize hash store: {e}"),
                Vec::new(),
            )
        })?;

        std::fs::write(&self.file_path, data).map_err(|e| {
            DeployError::file_system_with_source(
                "Saving hash store",
                &self.file_path,
                "Failed to write hash store file",
                e,
            )
        })
    }

    /// Number of tracked paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.document.hashes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document.hashes.is_empty()
    }
}

fn hash_file(path: &Path) -> Result<String, DeployError> {
    let content = std::fs::read(path).map_err(|e| {
        DeployError::file_system_with_source(
            "Hashing secret file",
            path,
            "Failed to read file content for hashing",
            e,
        )
    })?;

    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_first_sight_is_changed_then_stable() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("secret");
        fs::write(&secret, "value").unwrap();

        let mut store = HashStore::empty(dir.path().join("hashes.json"));
        assert!(store.has_changed(&secret).unwrap());
        assert!(!store.has_changed(&secret).unwrap());
    }

    #[test]
    fn test_content_change_detected() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("secret");
        fs::write(&secret, "v1").unwrap();

        let mut store = HashStore::empty(dir.path().join("hashes.json"));
        assert!(store.has_changed(&secret).unwrap());

        fs::write(&secret, "v2").unwrap();
        assert!(store.has_changed(&secret).unwrap());
        assert!(!store.has_changed(&secret).unwrap());
    }

    #[test]
    fn test_touch_without_modification_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("secret");
        fs::write(&secret, "same").unwrap();

        let mut store = HashStore::empty(dir.path().join("hashes.json"));
        assert!(store.has_changed(&secret).unwrap());

        // Rewrite identical content; mtime moves, hash does not.
        fs::write(&secret, "same").unwrap();
        assert!(!store.has_changed(&secret).unwrap());
    }

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("secret");
        let store_path = dir.path().join("state/hashes.json");
        fs::write(&secret, "value").unwrap();

        let mut store = HashStore::load(&store_path);
        assert!(store.has_changed(&secret).unwrap());
        store.save().unwrap();

        let mut reloaded = HashStore::load(&store_path);
        assert_eq!(reloaded.len(), 1);
        assert!(!reloaded.has_changed(&secret).unwrap());
    }

    #[test]
    fn test_corrupt_store_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("hashes.json");
        fs::write(&store_path, "{ not json").unwrap();

        let store = HashStore::load(&store_path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unreadable_store_treated_as_empty() {
        // A directory at the store path fails the read with something other
        // than NotFound; the store must still come up empty, not panic.
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("hashes.json");
        fs::create_dir(&store_path).unwrap();

        let store = HashStore::load(&store_path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HashStore::empty(dir.path().join("hashes.json"));
        let err = store.has_changed(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, DeployError::FileSystem(_)));
    }
}
