// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Whole-file atomic snapshots with a rotating backup.
//!
//! Every write goes `<name>.tmp` (fsync) → copy current to `<name>.bak` →
//! rename `<name>.tmp` over `<name>`. A crash at any point leaves either the
//! previous snapshot or the new one in place, never a torn file. A leftover
//! `.tmp` from an interrupted write is discarded on the next load.
//!
//! On disk each file is an envelope:
//!
//! ```text
//! { "schema_version": 1, "saved_at": <millis>, "checksum": "<sha256 of data>", "data": ... }
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use crate::error::RepositoryError;

/// A type persisted as a snapshot file.
pub trait Versioned: Serialize + DeserializeOwned {
    /// Schema written by this build
    const SCHEMA_VERSION: u32;

    /// Upgrade `data` written with an older schema.
    fn migrate(from_version: u32, _data: Value) -> Result<Value, String> {
        Err(format!(
            "no migration from schema v{} to v{}",
            from_version,
            Self::SCHEMA_VERSION
        ))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    schema_version: u32,
    saved_at: i64,
    checksum: String,
    data: Value,
}

/// What a load found on disk.
#[derive(Debug)]
pub enum LoadOutcome<T> {
    /// Neither the file nor a backup exists
    Missing,
    Loaded(T),
    /// Primary was unusable; the backup was put back in its place
    Restored(T),
    /// Primary and backup are both unusable
    Corrupt(String),
}

/// Held for the duration of a read-modify-write cycle.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = ?self.path, error = %e, "Failed to release snapshot lock");
        }
    }
}

/// One snapshot file and its companions in the state directory.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    name: &'static str,
    path: PathBuf,
    backup_path: PathBuf,
    staging_path: PathBuf,
    lock_path: PathBuf,
}

impl SnapshotFile {
    pub fn new(dir: &Path, name: &'static str) -> Self {
        Self {
            name,
            path: dir.join(name),
            backup_path: dir.join(format!("{}.bak", name)),
            staging_path: dir.join(format!("{}.tmp", name)),
            lock_path: dir.join(format!("{}.lock", name)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the exclusive advisory lock (blocks until available).
    pub fn lock(&self) -> Result<FileLock, RepositoryError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| RepositoryError::Lock { path: self.lock_path.clone(), source: e })?;
        file.lock_exclusive()
            .map_err(|e| RepositoryError::Lock { path: self.lock_path.clone(), source: e })?;
        Ok(FileLock { file, path: self.lock_path.clone() })
    }

    /// Load, falling back to the backup when the primary is unusable.
    pub fn load<T: Versioned>(&self) -> Result<LoadOutcome<T>, RepositoryError> {
        self.discard_stale_staging();

        match fs::read(&self.path) {
            Ok(bytes) => match decode::<T>(&bytes) {
                Ok(value) => Ok(LoadOutcome::Loaded(value)),
                Err(reason) => {
                    warn!(file = self.name, %reason, "Snapshot unreadable, trying backup");
                    crate::metrics::record_corruption(self.name);
                    self.restore_from_backup(reason)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.backup_path.exists() {
                    self.restore_from_backup("primary snapshot missing".to_string())
                } else {
                    Ok(LoadOutcome::Missing)
                }
            }
            Err(e) => Err(RepositoryError::io(&self.path, e)),
        }
    }

    /// Stage and commit `value`. Caller holds [`lock`](Self::lock).
    pub fn write<T: Versioned>(&self, value: &T) -> Result<(), RepositoryError> {
        self.stage(value)?;
        self.commit()
    }

    /// Write the new snapshot next to the live one without publishing it.
    pub(crate) fn stage<T: Versioned>(&self, value: &T) -> Result<(), RepositoryError> {
        let bytes = encode(self.name, value)?;
        write_synced(&self.staging_path, &bytes)
    }

    /// Rotate the live snapshot into the backup slot and publish the staged one.
    pub(crate) fn commit(&self) -> Result<(), RepositoryError> {
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path)
                .map_err(|e| RepositoryError::io(&self.backup_path, e))?;
        }
        fs::rename(&self.staging_path, &self.path)
            .map_err(|e| RepositoryError::io(&self.path, e))?;
        sync_parent(&self.path);
        debug!(file = self.name, "Snapshot committed");
        Ok(())
    }

    /// Move an unusable primary aside so a fresh snapshot can be written.
    pub fn quarantine(&self, now_ms: i64) -> Result<Option<PathBuf>, RepositoryError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let target = self.path.with_file_name(format!("{}.corrupt-{}", self.name, now_ms));
        fs::rename(&self.path, &target).map_err(|e| RepositoryError::io(&self.path, e))?;
        warn!(file = self.name, moved_to = ?target, "Quarantined corrupt snapshot");
        Ok(Some(target))
    }

    fn restore_from_backup<T: Versioned>(&self, reason: String) -> Result<LoadOutcome<T>, RepositoryError> {
        let bytes = match fs::read(&self.backup_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                error!(file = self.name, %reason, "Snapshot corrupt and no backup exists");
                return Ok(LoadOutcome::Corrupt(format!("{}; no backup", reason)));
            }
            Err(e) => return Err(RepositoryError::io(&self.backup_path, e)),
        };

        match decode::<T>(&bytes) {
            Ok(value) => {
                // Publish the backup bytes as-is; no rotation, the backup slot
                // must keep the good copy.
                write_synced(&self.staging_path, &bytes)?;
                fs::rename(&self.staging_path, &self.path)
                    .map_err(|e| RepositoryError::io(&self.path, e))?;
                sync_parent(&self.path);
                warn!(file = self.name, %reason, "Snapshot restored from backup");
                Ok(LoadOutcome::Restored(value))
            }
            Err(backup_reason) => {
                error!(file = self.name, %reason, %backup_reason, "Snapshot and backup both unusable");
                Ok(LoadOutcome::Corrupt(format!(
                    "{}; backup also unusable: {}",
                    reason, backup_reason
                )))
            }
        }
    }

    fn discard_stale_staging(&self) {
        if self.staging_path.exists() {
            warn!(file = self.name, "Discarding staged write from an interrupted save");
            if let Err(e) = fs::remove_file(&self.staging_path) {
                warn!(file = self.name, error = %e, "Failed to remove stale staging file");
            }
        }
    }
}

fn checksum_of(data: &Value) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(data)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn encode<T: Versioned>(name: &str, value: &T) -> Result<Vec<u8>, RepositoryError> {
    let serialization = |source| RepositoryError::Serialization { file: name.to_string(), source };
    let data = serde_json::to_value(value).map_err(serialization)?;
    let envelope = Envelope {
        schema_version: T::SCHEMA_VERSION,
        saved_at: crate::now_millis(),
        checksum: checksum_of(&data).map_err(serialization)?,
        data,
    };
    serde_json::to_vec_pretty(&envelope).map_err(serialization)
}

fn decode<T: Versioned>(bytes: &[u8]) -> Result<T, String> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| format!("unreadable envelope: {}", e))?;

    let actual = checksum_of(&envelope.data).map_err(|e| format!("checksum failed: {}", e))?;
    if actual != envelope.checksum {
        return Err(format!(
            "checksum mismatch (expected {}, got {})",
            envelope.checksum, actual
        ));
    }

    let data = match envelope.schema_version {
        v if v > T::SCHEMA_VERSION => {
            return Err(format!(
                "written by schema v{}, this build reads up to v{}",
                v,
                T::SCHEMA_VERSION
            ));
        }
        v if v < T::SCHEMA_VERSION => T::migrate(v, envelope.data)?,
        _ => envelope.data,
    };

    serde_json::from_value(data).map_err(|e| format!("unexpected shape: {}", e))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), RepositoryError> {
    let mut file = File::create(path).map_err(|e| RepositoryError::io(path, e))?;
    file.write_all(bytes).map_err(|e| RepositoryError::io(path, e))?;
    file.sync_all().map_err(|e| RepositoryError::io(path, e))
}

/// Best effort: not every platform lets you fsync a directory.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u64,
    }

    impl Versioned for Counter {
        const SCHEMA_VERSION: u32 = 2;

        fn migrate(from_version: u32, data: Value) -> Result<Value, String> {
            match from_version {
                // v1 called the field "count"
                1 => Ok(serde_json::json!({ "value": data["count"] })),
                v => Err(format!("unknown schema v{}", v)),
            }
        }
    }

    fn write_envelope(path: &Path, version: u32, data: Value) {
        let envelope = Envelope {
            schema_version: version,
            saved_at: 0,
            checksum: checksum_of(&data).unwrap(),
            data,
        };
        fs::write(path, serde_json::to_vec(&envelope).unwrap()).unwrap();
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path(), "counter.json");
        assert!(matches!(file.load::<Counter>().unwrap(), LoadOutcome::Missing));
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path(), "counter.json");
        let _lock = file.lock().unwrap();
        file.write(&Counter { value: 7 }).unwrap();

        match file.load::<Counter>().unwrap() {
            LoadOutcome::Loaded(c) => assert_eq!(c.value, 7),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_second_write_rotates_backup() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path(), "counter.json");
        file.write(&Counter { value: 1 }).unwrap();
        file.write(&Counter { value: 2 }).unwrap();

        let backup = fs::read(dir.path().join("counter.json.bak")).unwrap();
        assert_eq!(decode::<Counter>(&backup).unwrap().value, 1);
    }

    #[test]
    fn test_crash_before_rename_keeps_previous_snapshot() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path(), "counter.json");
        file.write(&Counter { value: 1 }).unwrap();

        // Staged but never committed: the process died before the rename
        file.stage(&Counter { value: 2 }).unwrap();
        assert!(dir.path().join("counter.json.tmp").exists());

        let reopened = SnapshotFile::new(dir.path(), "counter.json");
        match reopened.load::<Counter>().unwrap() {
            LoadOutcome::Loaded(c) => assert_eq!(c.value, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!dir.path().join("counter.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_primary_restores_backup() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path(), "counter.json");
        file.write(&Counter { value: 1 }).unwrap();
        file.write(&Counter { value: 2 }).unwrap();

        fs::write(dir.path().join("counter.json"), b"{ not json").unwrap();

        match file.load::<Counter>().unwrap() {
            LoadOutcome::Restored(c) => assert_eq!(c.value, 1),
            other => panic!("unexpected {:?}", other),
        }
        // The restored copy is live again
        match file.load::<Counter>().unwrap() {
            LoadOutcome::Loaded(c) => assert_eq!(c.value, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counter.json");
        let envelope = serde_json::json!({
            "schema_version": 2,
            "saved_at": 0,
            "checksum": "deadbeef",
            "data": { "value": 3 }
        });
        fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

        let file = SnapshotFile::new(dir.path(), "counter.json");
        match file.load::<Counter>().unwrap() {
            LoadOutcome::Corrupt(reason) => assert!(reason.contains("checksum mismatch")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_old_schema_is_migrated() {
        let dir = tempdir().unwrap();
        write_envelope(&dir.path().join("counter.json"), 1, serde_json::json!({ "count": 9 }));

        let file = SnapshotFile::new(dir.path(), "counter.json");
        match file.load::<Counter>().unwrap() {
            LoadOutcome::Loaded(c) => assert_eq!(c.value, 9),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let dir = tempdir().unwrap();
        write_envelope(&dir.path().join("counter.json"), 3, serde_json::json!({ "value": 1 }));

        let file = SnapshotFile::new(dir.path(), "counter.json");
        assert!(matches!(file.load::<Counter>().unwrap(), LoadOutcome::Corrupt(_)));
    }

    #[test]
    fn test_quarantine_moves_file_aside() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path(), "counter.json");
        file.write(&Counter { value: 1 }).unwrap();

        let moved = file.quarantine(42).unwrap().unwrap();
        assert!(moved.ends_with("counter.json.corrupt-42"));
        assert!(!file.path().exists());
        assert!(file.quarantine(43).unwrap().is_none());
    }
}
