// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy.
//!
//! | Error | Recovery |
//! |-------|----------|
//! | [`QueueError::DuplicateTarget`], [`QueueError::QueueSaturated`] | caller retries later |
//! | [`TransferError::Io`] | retried with backoff, then terminal |
//! | other [`TransferError`] kinds | terminal for the command |
//! | [`RepositoryError::Corruption`] | restore from backup, else engine halts |
//! | [`ProviderError`] | logged, skipped for this cycle |

use std::path::PathBuf;

use thiserror::Error;

use crate::command::{CommandError, CommandId, CommandStatus};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("insufficient space for {path:?}: need {needed} bytes, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },
    #[error("source unavailable: {0:?}")]
    SourceUnavailable(PathBuf),
    #[error("permission denied: {path:?}")]
    PermissionDenied { path: PathBuf },
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `ENOSPC` on Linux and macOS
const NO_SPACE_OS_ERROR: i32 = 28;

impl TransferError {
    /// Classify a raw I/O error that happened while touching `path`.
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ if err.raw_os_error() == Some(NO_SPACE_OS_ERROR) => Self::InsufficientSpace {
                path,
                needed: 0,
                available: 0,
            },
            _ => Self::Io { path, source: err },
        }
    }

    /// Verification mismatch; treated like any other transient I/O failure.
    pub fn verification(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, reason.into()),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("{file} is corrupt: {reason}")]
    Corruption { file: String, reason: String },
    #[error("repository I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize {file}: {source}")]
    Serialization {
        file: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not lock {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("repository halted ({0}); manual repair required")]
    Halted(String),
}

impl RepositoryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("{path:?} is already targeted by active command {existing}")]
    DuplicateTarget { path: PathBuf, existing: CommandId },
    #[error("queue saturated: {depth} pending (max {max})")]
    QueueSaturated { depth: usize, max: usize },
    #[error("command {0} not found")]
    NotFound(CommandId),
    #[error("command {id} cannot be undone: {reason}")]
    NotUndoable { id: CommandId, reason: String },
    #[error("command {0} was already undone")]
    AlreadyUndone(CommandId),
    #[error("invalid target {path:?}: {reason}")]
    InvalidTarget { path: PathBuf, reason: String },
    #[error("command {id} is {actual}, expected {expected}")]
    InvalidState {
        id: CommandId,
        actual: CommandStatus,
        expected: CommandStatus,
    },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl QueueError {
    /// Worth retrying later without changing the request.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::DuplicateTarget { .. } | Self::QueueSaturated { .. })
    }
}

#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("list provider error: {0}")]
    ListProvider(String),
    #[error("session provider error: {0}")]
    SessionProvider(String),
    #[error("library lookup error: {0}")]
    Library(String),
}

/// Anything the engine's public interface can fail with.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("engine halted: {0}")]
    Halted(String),
    #[error("engine not started")]
    NotStarted,
    #[error("undo of {id} failed: {error}")]
    UndoFailed { id: CommandId, error: CommandError },
}
