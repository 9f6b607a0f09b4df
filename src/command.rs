// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Commands: the unit of queued, possibly undoable, transfer work.
//!
//! A [`Command`] is created by a producer (watch monitor, import list,
//! eviction, manual trigger), ordered and tracked by the
//! [`CommandQueue`](crate::queue::CommandQueue), and executed as a list of
//! [`TransferStep`]s. Once completed it is immutable apart from a single undo,
//! which replays the [`UndoPayload`] recorded at execution time.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache_entry::CacheEntry;
use crate::error::TransferError;
use crate::priority::Priority;

/// Queue-assigned command identifier (monotonic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd-{}", self.0)
    }
}

/// How a file is placed into the cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// The array copy is removed once the cache copy is verified
    Move,
    /// Both copies remain
    Copy,
}

/// Which tier a command moves data towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToCache,
    ToArray,
}

/// What a command does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    /// Bring target files into the cache tier
    Cache,
    /// Release target files from the cache tier
    Evict,
    /// Several files in one direction, executed and undone as a unit
    Batch { direction: Direction },
}

impl CommandKind {
    #[must_use]
    pub fn direction(&self) -> Direction {
        match self {
            Self::Cache => Direction::ToCache,
            Self::Evict => Direction::ToArray,
            Self::Batch { direction } => *direction,
        }
    }

    /// Every kind records an inverse: cache undoes by moving back, evict by
    /// re-caching from the array copy (eviction never deletes it).
    #[must_use]
    pub fn supports_undo(&self) -> bool {
        true
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Evict => "evict",
            Self::Batch { .. } => "batch",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Batch { direction } => write!(f, "batch({:?})", direction),
            other => f.write_str(other.label()),
        }
    }
}

/// Lifecycle of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Undone,
    /// Removed before dispatch (cancelled or pre-empted)
    Cancelled,
}

impl CommandStatus {
    /// Still holds its target paths in the queue.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Undone => "undone",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Worker pool a command runs in. Assigned once, at enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferCategory {
    CacheBound,
    ArrayBound,
    Local,
    Network,
}

impl TransferCategory {
    pub const ALL: [TransferCategory; 4] = [
        Self::CacheBound,
        Self::ArrayBound,
        Self::Local,
        Self::Network,
    ];

    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::CacheBound => 0,
            Self::ArrayBound => 1,
            Self::Local => 2,
            Self::Network => 3,
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::CacheBound => "cache_bound",
            Self::ArrayBound => "array_bound",
            Self::Local => "local",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for TransferCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Who asked for the work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Producer {
    Manual,
    Watch,
    ImportList(String),
    Eviction,
    Scheduler,
}

impl Producer {
    /// May displace lower-priority pending work when the queue is saturated.
    #[must_use]
    pub fn preempts(&self) -> bool {
        matches!(self, Self::Watch | Self::Eviction)
    }

    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Manual => "manual",
            Self::Watch => "watch",
            Self::ImportList(_) => "import_list",
            Self::Eviction => "eviction",
            Self::Scheduler => "scheduler",
        }
    }
}

/// What a single step does with its two paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOperation {
    /// Copy source to destination, then remove source
    Move,
    /// Copy source to destination
    Copy,
    /// Remove source; destination must already hold an identical copy
    Release,
}

/// One file transfer inside a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStep {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub operation: StepOperation,
}

impl TransferStep {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, operation: StepOperation) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            operation,
        }
    }

    /// The step that puts both paths back the way they were.
    #[must_use]
    pub fn inverse(&self) -> Self {
        match self.operation {
            StepOperation::Move => Self::new(&self.destination, &self.source, StepOperation::Move),
            StepOperation::Copy => Self::new(&self.destination, &self.source, StepOperation::Release),
            StepOperation::Release => Self::new(&self.destination, &self.source, StepOperation::Copy),
        }
    }
}

/// Inverse of a completed command, recorded at execution time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UndoPayload {
    /// Steps to run, in order
    pub steps: Vec<TransferStep>,
    /// Index rows to put back (undoing an eviction)
    #[serde(default)]
    pub restore_entries: Vec<CacheEntry>,
    /// Index rows to drop (undoing a cache), keyed by source path
    #[serde(default)]
    pub remove_entries: Vec<PathBuf>,
}

impl UndoPayload {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.restore_entries.is_empty() && self.remove_entries.is_empty()
    }
}

/// Outcome of a successful execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub bytes_transferred: u64,
    pub duration_ms: u64,
    pub verified: bool,
}

/// Classification of a command failure, as shown in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandErrorKind {
    InsufficientSpace,
    SourceUnavailable,
    PermissionDenied,
    Io,
    Repository,
    Preempted,
    Cancelled,
}

/// A typed failure attached to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    pub kind: CommandErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: CommandErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Only plain I/O failures are worth another attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == CommandErrorKind::Io
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<&TransferError> for CommandError {
    fn from(err: &TransferError) -> Self {
        let kind = match err {
            TransferError::InsufficientSpace { .. } => CommandErrorKind::InsufficientSpace,
            TransferError::SourceUnavailable(_) => CommandErrorKind::SourceUnavailable,
            TransferError::PermissionDenied { .. } => CommandErrorKind::PermissionDenied,
            TransferError::Io { .. } => CommandErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

/// Producer-side description of work; the queue turns it into a [`Command`].
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub kind: CommandKind,
    pub target_paths: Vec<PathBuf>,
    pub priority: Priority,
    pub producer: Producer,
    pub operation: OperationType,
    pub media_id: Option<String>,
    /// Merge into an overlapping command of the same kind instead of failing
    pub coalesce: bool,
}

impl CommandRequest {
    pub fn new(kind: CommandKind, target_paths: Vec<PathBuf>, priority: Priority, producer: Producer) -> Self {
        Self {
            kind,
            target_paths,
            priority,
            producer,
            operation: OperationType::Move,
            media_id: None,
            coalesce: false,
        }
    }

    pub fn cache(path: impl Into<PathBuf>, priority: Priority, producer: Producer) -> Self {
        Self::new(CommandKind::Cache, vec![path.into()], priority, producer)
    }

    pub fn evict(path: impl Into<PathBuf>, priority: Priority, producer: Producer) -> Self {
        Self::new(CommandKind::Evict, vec![path.into()], priority, producer)
    }

    #[must_use]
    pub fn with_operation(mut self, operation: OperationType) -> Self {
        self.operation = operation;
        self
    }

    #[must_use]
    pub fn with_media_id(mut self, media_id: impl Into<String>) -> Self {
        self.media_id = Some(media_id.into());
        self
    }

    #[must_use]
    pub fn coalescing(mut self) -> Self {
        self.coalesce = true;
        self
    }
}

/// A unit of queued transfer work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub kind: CommandKind,
    /// Array-tier source paths (the cache index key)
    pub target_paths: Vec<PathBuf>,
    pub priority: Priority,
    /// Epoch millis
    pub created_at: i64,
    pub status: CommandStatus,
    pub category: TransferCategory,
    pub producer: Producer,
    pub operation: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    /// Executions started so far
    #[serde(default)]
    pub attempts: u32,
    /// Not dispatchable before this instant (retry backoff)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<i64>,
    /// Cancel arrived while running; undo right after completion
    #[serde(default)]
    pub cancel_requested: bool,
    /// Found running after a restart and put back in the queue
    #[serde(default)]
    pub recovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_payload: Option<UndoPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

impl Command {
    /// Whether a retry is still allowed after `max_attempts` total attempts.
    #[must_use]
    pub fn can_retry(&self, max_attempts: u32) -> bool {
        self.attempts < max_attempts
    }
}
