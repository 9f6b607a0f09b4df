// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the cache engine coordinator.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::backpressure::QueuePressure;
use crate::command::{CommandId, TransferCategory};

/// Engine lifecycle state.
///
/// Use [`super::CacheEngine::state()`] to check the current state or
/// [`super::CacheEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Just created, repository not opened yet
    Created,
    /// Repository and queue loaded, background loop not running
    Ready,
    /// Dispatching and polling
    Running,
    /// Persisted state is unusable; nothing is dispatched until repaired
    Halted,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::Halted => write!(f, "Halted"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Queue and pool state for one transfer category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryStatus {
    pub category: TransferCategory,
    pub pending: usize,
    pub limit: usize,
    pub in_use: usize,
}

/// Snapshot returned by [`super::CacheEngine::queue_status()`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Pending commands across categories
    pub depth: usize,
    pub max_depth: usize,
    pub pressure: QueuePressure,
    pub running: usize,
    pub categories: Vec<CategoryStatus>,
}

/// Counters and sizes returned by [`super::CacheEngine::stats()`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub bytes_used: u64,
    pub capacity_bytes: u64,
    pub entry_count: usize,
    /// Watch-triggered requests for files already cached
    pub hits: u64,
    /// Watch-triggered requests that needed a transfer
    pub misses: u64,
    pub completed: u64,
    pub failed: u64,
    pub undone: u64,
    pub bytes_transferred: u64,
    pub pending: usize,
    pub running: usize,
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionResult {
    /// Bytes the pass tried to free
    pub requested_bytes: u64,
    /// Source paths selected, in eviction order
    pub victims: Vec<PathBuf>,
    pub bytes_selected: u64,
    /// Requested bytes no candidate could cover
    pub shortfall_bytes: u64,
    pub expired: usize,
    pub excluded_active: usize,
    pub excluded_busy: usize,
    /// Evict commands created for the victims
    pub enqueued: Vec<CommandId>,
    /// Victims whose evict could not be queued
    pub rejected: usize,
}

impl EvictionResult {
    #[must_use]
    pub fn has_shortfall(&self) -> bool {
        self.shortfall_bytes > 0
    }
}

/// Last refresh of one import list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListStatus {
    pub list_id: String,
    pub last_refresh_at: Option<i64>,
    pub next_refresh_at: i64,
    pub examined: usize,
    pub matched: usize,
    pub enqueued: usize,
    pub filtered: usize,
    pub last_error: Option<String>,
}

impl ListStatus {
    pub(super) fn new(list_id: impl Into<String>) -> Self {
        Self {
            list_id: list_id.into(),
            ..Default::default()
        }
    }
}

/// Running totals shared with worker threads.
#[derive(Debug, Default)]
pub(super) struct EngineCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub undone: AtomicU64,
    pub bytes_transferred: AtomicU64,
}

impl EngineCounters {
    pub fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Halted), "Halted");
        assert_eq!(format!("{}", EngineState::ShuttingDown), "ShuttingDown");
    }

    #[test]
    fn test_eviction_result_shortfall() {
        let mut result = EvictionResult::default();
        assert!(!result.has_shortfall());
        result.shortfall_bytes = 1;
        assert!(result.has_shortfall());
    }
}
