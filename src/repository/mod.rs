// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisted repository: the single source of truth for what is cached.
//!
//! # State directory
//!
//! ```text
//! state_dir/
//! ├── index.json      cache entries, keyed by source path
//! ├── queue.json      command snapshot (pending, running, recent finished)
//! ├── config.json     last applied configuration
//! ├── history.jsonl   append-only command history
//! └── *.bak / *.lock  backup of the previous snapshot, advisory locks
//! ```
//!
//! Writers serialize on an in-process mutex plus an exclusive file lock and
//! publish through [`SnapshotFile`]. Readers grab the current
//! `Arc<CacheIndex>` and never block a writer.
//!
//! When a snapshot and its backup are both unusable the repository comes up
//! **halted**: reads return defaults, every write is refused with
//! [`RepositoryError::Halted`] until [`Repository::repair`] quarantines the
//! damaged files.

pub mod history;
pub mod snapshot;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::cache_entry::CacheIndex;
use crate::command::Command;
use crate::config::CacheEngineConfig;
use crate::error::RepositoryError;

pub use history::{HistoryEvent, HistoryLog, HistoryPage, HistoryRecord};
pub use snapshot::{LoadOutcome, SnapshotFile, Versioned};

pub const INDEX_FILE: &str = "index.json";
pub const QUEUE_FILE: &str = "queue.json";
pub const CONFIG_FILE: &str = "config.json";
pub const HISTORY_FILE: &str = "history.jsonl";

/// Everything the queue needs to come back after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Next id to hand out
    pub next_id: u64,
    pub commands: Vec<Command>,
}

impl Versioned for CacheIndex {
    const SCHEMA_VERSION: u32 = 1;
}

impl Versioned for QueueSnapshot {
    const SCHEMA_VERSION: u32 = 1;
}

impl Versioned for CacheEngineConfig {
    const SCHEMA_VERSION: u32 = 2;

    /// v1 kept the pool sizes as flat `max_*` fields.
    fn migrate(from_version: u32, data: Value) -> Result<Value, String> {
        if from_version != 1 {
            return Err(format!("no migration from config schema v{}", from_version));
        }
        let Value::Object(mut fields) = data else {
            return Err("config v1 is not an object".to_string());
        };

        let mut concurrency = serde_json::Map::new();
        for (old, new) in [
            ("max_cache_moves", "cache_bound"),
            ("max_array_moves", "array_bound"),
            ("max_local_transfers", "local"),
            ("max_network_transfers", "network"),
        ] {
            if let Some(value) = fields.remove(old) {
                concurrency.insert(new.to_string(), value);
            }
        }
        if !concurrency.is_empty() {
            fields.insert("concurrency".to_string(), Value::Object(concurrency));
        }
        Ok(Value::Object(fields))
    }
}

/// A snapshot that could not be loaded from either copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptFile {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "files", rename_all = "snake_case")]
pub enum RepositoryHealth {
    Healthy,
    /// Came up from backups for these files
    Restored(Vec<String>),
    /// Writes refused until repaired
    Halted(Vec<CorruptFile>),
}

impl RepositoryHealth {
    #[must_use]
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Halted(_))
    }
}

/// What [`Repository::reconcile`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    /// Rows dropped because their cache file is gone
    pub removed: Vec<PathBuf>,
    /// Rows whose size was corrected from the file on disk
    pub resized: Vec<PathBuf>,
    /// Rows left alone because a command holds the path
    pub skipped: usize,
}

pub struct Repository {
    dir: PathBuf,
    index_file: SnapshotFile,
    queue_file: SnapshotFile,
    config_file: SnapshotFile,
    index: RwLock<Arc<CacheIndex>>,
    loaded_queue: Mutex<Option<QueueSnapshot>>,
    stored_config: RwLock<Option<CacheEngineConfig>>,
    writer: Mutex<()>,
    history: HistoryLog,
    health: RwLock<RepositoryHealth>,
}

impl Repository {
    /// Open (creating if needed) the repository in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| RepositoryError::io(&dir, e))?;

        let index_file = SnapshotFile::new(&dir, INDEX_FILE);
        let queue_file = SnapshotFile::new(&dir, QUEUE_FILE);
        let config_file = SnapshotFile::new(&dir, CONFIG_FILE);

        let mut restored = Vec::new();
        let mut corrupt = Vec::new();
        let index = load_tracked::<CacheIndex>(&index_file, &mut restored, &mut corrupt)?;
        let queue = load_tracked::<QueueSnapshot>(&queue_file, &mut restored, &mut corrupt)?;
        let config = load_tracked::<CacheEngineConfig>(&config_file, &mut restored, &mut corrupt)?;

        let health = if !corrupt.is_empty() {
            error!(files = ?corrupt, "Repository halted: snapshots unusable");
            crate::metrics::set_halted(true);
            RepositoryHealth::Halted(corrupt)
        } else if !restored.is_empty() {
            warn!(files = ?restored, "Repository restored from backups");
            RepositoryHealth::Restored(restored)
        } else {
            RepositoryHealth::Healthy
        };

        let history = HistoryLog::open(dir.join(HISTORY_FILE))?;
        let index = index.unwrap_or_default();
        info!(
            dir = ?dir,
            entries = index.len(),
            queued = queue.as_ref().map(|q| q.commands.len()).unwrap_or(0),
            "Repository opened"
        );

        Ok(Self {
            dir,
            index_file,
            queue_file,
            config_file,
            index: RwLock::new(Arc::new(index)),
            loaded_queue: Mutex::new(queue),
            stored_config: RwLock::new(config),
            writer: Mutex::new(()),
            history,
            health: RwLock::new(health),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn health(&self) -> RepositoryHealth {
        self.health.read().clone()
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.health.read().is_halted()
    }

    /// Fails with [`RepositoryError::Halted`] while the repository is halted.
    pub fn ensure_writable(&self) -> Result<(), RepositoryError> {
        match &*self.health.read() {
            RepositoryHealth::Halted(files) => Err(RepositoryError::Halted(
                files.iter().map(|f| f.file.as_str()).collect::<Vec<_>>().join(", "),
            )),
            _ => Ok(()),
        }
    }

    /// Lock-free snapshot of the cache index.
    #[must_use]
    pub fn index(&self) -> Arc<CacheIndex> {
        self.index.read().clone()
    }

    /// Read-modify-write the index; the new version is on disk before
    /// readers can see it.
    pub fn update_index<R>(&self, f: impl FnOnce(&mut CacheIndex) -> R) -> Result<R, RepositoryError> {
        self.ensure_writable()?;
        let _writer = self.writer.lock();
        let _lock = self.index_file.lock()?;

        let mut next = (*self.index()).clone();
        let out = f(&mut next);
        self.index_file.write(&next)?;
        crate::metrics::set_cache_usage(next.total_bytes(), next.len());
        *self.index.write() = Arc::new(next);
        Ok(out)
    }

    /// Queue snapshot found at open; handed out once.
    pub fn take_queue_snapshot(&self) -> Option<QueueSnapshot> {
        self.loaded_queue.lock().take()
    }

    pub fn store_queue(&self, snapshot: &QueueSnapshot) -> Result<(), RepositoryError> {
        self.ensure_writable()?;
        let _writer = self.writer.lock();
        let _lock = self.queue_file.lock()?;
        self.queue_file.write(snapshot)
    }

    /// Configuration last written by [`store_config`](Self::store_config).
    #[must_use]
    pub fn stored_config(&self) -> Option<CacheEngineConfig> {
        self.stored_config.read().clone()
    }

    pub fn store_config(&self, config: &CacheEngineConfig) -> Result<(), RepositoryError> {
        self.ensure_writable()?;
        if self.stored_config.read().as_ref() == Some(config) {
            return Ok(());
        }
        let _writer = self.writer.lock();
        let _lock = self.config_file.lock()?;
        self.config_file.write(config)?;
        *self.stored_config.write() = Some(config.clone());
        Ok(())
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    /// Drop rows whose cache file is missing and fix sizes that drifted.
    /// Paths in `busy` belong to active commands and are left alone.
    pub fn reconcile(&self, busy: &HashSet<PathBuf>) -> Result<ReconcileReport, RepositoryError> {
        let report = self.update_index(|index| {
            let mut report = ReconcileReport::default();
            index.retain(|source, entry| {
                if busy.contains(source) {
                    report.skipped += 1;
                    return true;
                }
                report.checked += 1;
                match fs::metadata(&entry.cache_path) {
                    Ok(meta) if meta.is_file() => {
                        if meta.len() != entry.size_bytes {
                            entry.size_bytes = meta.len();
                            report.resized.push(source.clone());
                        }
                        true
                    }
                    _ => {
                        report.removed.push(source.clone());
                        false
                    }
                }
            });
            report
        })?;

        if !report.removed.is_empty() || !report.resized.is_empty() {
            warn!(
                removed = report.removed.len(),
                resized = report.resized.len(),
                "Cache index reconciled against the cache tier"
            );
        }
        Ok(report)
    }

    /// Quarantine every unusable snapshot and start those files afresh.
    ///
    /// Returns where the damaged files were moved. A no-op unless halted.
    pub fn repair(&self) -> Result<Vec<PathBuf>, RepositoryError> {
        let corrupt = match &*self.health.read() {
            RepositoryHealth::Halted(files) => files.clone(),
            _ => return Ok(Vec::new()),
        };

        let _writer = self.writer.lock();
        let now = crate::now_millis();
        let mut quarantined = Vec::new();

        for damaged in &corrupt {
            let file = match damaged.file.as_str() {
                INDEX_FILE => &self.index_file,
                QUEUE_FILE => &self.queue_file,
                _ => &self.config_file,
            };
            let _lock = file.lock()?;
            if let Some(moved) = file.quarantine(now)? {
                quarantined.push(moved);
            }
            match file.name() {
                INDEX_FILE => {
                    file.write(&CacheIndex::default())?;
                    *self.index.write() = Arc::new(CacheIndex::default());
                }
                QUEUE_FILE => {
                    file.write(&QueueSnapshot::default())?;
                    *self.loaded_queue.lock() = None;
                }
                _ => *self.stored_config.write() = None,
            }
        }

        *self.health.write() = RepositoryHealth::Healthy;
        crate::metrics::set_halted(false);
        warn!(files = ?quarantined, "Repository repaired; damaged snapshots quarantined");
        Ok(quarantined)
    }
}

/// Load one snapshot, sorting restored and unusable files into the buckets.
fn load_tracked<T: Versioned>(
    file: &SnapshotFile,
    restored: &mut Vec<String>,
    corrupt: &mut Vec<CorruptFile>,
) -> Result<Option<T>, RepositoryError> {
    Ok(match file.load::<T>()? {
        LoadOutcome::Missing => None,
        LoadOutcome::Loaded(value) => Some(value),
        LoadOutcome::Restored(value) => {
            restored.push(file.name().to_string());
            Some(value)
        }
        LoadOutcome::Corrupt(reason) => {
            corrupt.push(CorruptFile { file: file.name().to_string(), reason });
            None
        }
    })
}
