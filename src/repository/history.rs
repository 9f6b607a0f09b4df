// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Append-only command history (`history.jsonl`).
//!
//! One JSON record per line, fsynced on append. Records are written *before*
//! the state change they describe becomes visible, so after a crash the log
//! may mention a transition the snapshots never saw, never the reverse.
//! A torn final line is terminated on open and skipped when reading.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command::{
    Command, CommandError, CommandId, CommandKind, CommandResult, CommandStatus, TransferCategory,
};
use crate::error::RepositoryError;
use crate::priority::Priority;

/// What happened to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEvent {
    Enqueued,
    /// Merged into an existing command instead of creating a new one
    Coalesced,
    Started,
    Completed,
    Failed,
    RetryScheduled,
    Cancelled,
    CancelRequested,
    /// Displaced by higher-priority work while the queue was saturated
    Preempted,
    UndoStarted,
    Undone,
    UndoFailed,
    /// Found running after a restart and re-queued
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Monotonic within one log file
    pub seq: u64,
    /// Epoch millis
    pub at: i64,
    pub command_id: CommandId,
    pub event: HistoryEvent,
    pub kind: CommandKind,
    /// Status the command has once this event is applied
    pub status: CommandStatus,
    pub priority: Priority,
    pub category: TransferCategory,
    pub target_paths: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HistoryRecord {
    /// Record for `command` as it will look after `event`.
    pub fn new(command: &Command, event: HistoryEvent, status: CommandStatus, at: i64) -> Self {
        Self {
            seq: 0,
            at,
            command_id: command.id,
            event,
            kind: command.kind,
            status,
            priority: command.priority,
            category: command.category,
            target_paths: command.target_paths.clone(),
            error: None,
            result: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: CommandError) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub fn with_result(mut self, result: CommandResult) -> Self {
        self.result = Some(result);
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One page of history, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecord>,
    /// Readable records in the whole log
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

pub struct HistoryLog {
    path: PathBuf,
    file: Mutex<File>,
    next_seq: AtomicU64,
}

impl HistoryLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| RepositoryError::io(&path, e))?;

        terminate_torn_line(&mut file).map_err(|e| RepositoryError::io(&path, e))?;

        let records = read_records(&path)?;
        let next_seq = records.last().map(|r| r.seq + 1).unwrap_or(1);
        debug!(?path, records = records.len(), next_seq, "History log opened");

        Ok(Self {
            path,
            file: Mutex::new(file),
            next_seq: AtomicU64::new(next_seq),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append and fsync one record; returns its sequence number.
    pub fn append(&self, mut record: HistoryRecord) -> Result<u64, RepositoryError> {
        let mut file = self.file.lock();
        record.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let mut line = serde_json::to_vec(&record).map_err(|source| RepositoryError::Serialization {
            file: "history.jsonl".to_string(),
            source,
        })?;
        line.push(b'\n');

        file.lock_exclusive()
            .map_err(|e| RepositoryError::Lock { path: self.path.clone(), source: e })?;
        let written = file
            .write_all(&line)
            .and_then(|_| file.sync_data())
            .map_err(|e| RepositoryError::io(&self.path, e));
        if let Err(e) = FileExt::unlock(&*file) {
            warn!(path = ?self.path, error = %e, "Failed to release history lock");
        }
        written?;

        Ok(record.seq)
    }

    /// Newest-first page of the log.
    pub fn page(&self, offset: usize, limit: usize) -> Result<HistoryPage, RepositoryError> {
        let _guard = self.file.lock();
        let records = read_records(&self.path)?;
        let total = records.len();
        let records = records.into_iter().rev().skip(offset).take(limit).collect();
        Ok(HistoryPage { records, total, offset, limit })
    }

    /// Every record for one command, oldest first.
    pub fn for_command(&self, id: CommandId) -> Result<Vec<HistoryRecord>, RepositoryError> {
        let _guard = self.file.lock();
        Ok(read_records(&self.path)?
            .into_iter()
            .filter(|r| r.command_id == id)
            .collect())
    }
}

/// A crash mid-append can leave a line without its newline; close it off so
/// the next record starts on a fresh line.
fn terminate_torn_line(file: &mut File) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        warn!("History log ends with a torn record");
        file.write_all(b"\n")?;
        file.sync_data()?;
    }
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<HistoryRecord>, RepositoryError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RepositoryError::io(path, e)),
    };

    let mut skipped = 0usize;
    let records: Vec<HistoryRecord> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(_) => {
                skipped += 1;
                None
            }
        })
        .collect();

    if skipped > 0 {
        warn!(?path, skipped, "Skipped unreadable history lines");
    }
    Ok(records)
}
