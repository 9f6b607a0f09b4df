// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Trigger and status interface.
//!
//! Triggers:
//! - `enqueue_manual()` - Queue a cache/evict/batch command
//! - `cancel()` / `undo()` - Cancel or reverse a command
//! - `run_eviction()` - On-demand eviction pass
//! - `refresh_import_lists()` - Refresh every enabled list now
//! - `reconcile()` / `repair_repository()` - Index maintenance
//!
//! Status:
//! - `queue_status()`, `cache_entries()`, `stats()`
//! - `history()`, `command()`, `commands()`
//! - `list_status()`, `watch_states()`

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use tracing::{info, warn};

use crate::cache_entry::CacheEntry;
use crate::command::{Command, CommandId, CommandKind, CommandRequest, CommandResult, Producer, TransferCategory};
use crate::eviction::SpaceBudget;
use crate::error::EngineError;
use crate::priority::Priority;
use crate::queue::EnqueueOutcome;
use crate::repository::{HistoryPage, ReconcileReport};
use crate::watch::WatchState;

use super::types::EngineCounters;
use super::{CacheEngine, CategoryStatus, EngineState, EngineStats, EvictionResult, ListStatus, QueueStatus};

impl CacheEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Triggers
    // ═══════════════════════════════════════════════════════════════════════════

    /// Queue a command on behalf of an operator.
    ///
    /// `priority` defaults to the configured `default_priority`. With
    /// `coalesce`, a request whose targets are all held by one pending
    /// command of the same kind merges into it instead of being rejected.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use cache_engine::{CacheEngine, CommandKind};
    /// # fn example(engine: &CacheEngine) -> Result<(), cache_engine::EngineError> {
    /// let outcome = engine.enqueue_manual(
    ///     CommandKind::Cache,
    ///     vec!["/mnt/array/movies/heat.mkv".into()],
    ///     None,
    ///     false,
    /// )?;
    /// println!("queued {}", outcome.id);
    /// # Ok(())
    /// # }
    /// ```
    pub fn enqueue_manual(
        &self,
        kind: CommandKind,
        paths: Vec<PathBuf>,
        priority: Option<Priority>,
        coalesce: bool,
    ) -> Result<EnqueueOutcome, EngineError> {
        let core = self.core()?;
        let (default_priority, operation) = {
            let config = self.config.read();
            (config.default_priority, config.cache_operation)
        };
        let mut request = CommandRequest::new(kind, paths, priority.unwrap_or(default_priority), Producer::Manual)
            .with_operation(operation);
        if coalesce {
            request = request.coalescing();
        }
        let outcome = core.queue.enqueue(request, crate::now_millis())?;
        info!(id = %outcome.id, coalesced = outcome.coalesced, "Manual command queued");
        Ok(outcome)
    }

    /// Cancel a pending command, or flag a running one for undo on
    /// completion. Returns false when the command is already finished.
    pub fn cancel(&self, id: CommandId) -> Result<bool, EngineError> {
        let core = self.core()?;
        Ok(core.queue.cancel(id, crate::now_millis())?)
    }

    /// Reverse a completed command.
    ///
    /// Fails with `NotUndoable` for commands that never completed and with
    /// `AlreadyUndone` for a second attempt.
    pub async fn undo(&self, id: CommandId) -> Result<CommandResult, EngineError> {
        self.run_undo(id).await
    }

    /// Queue evictions until `target_free_bytes` of the cache is free.
    ///
    /// Expired entries are always included. A target beyond what the
    /// candidates can cover is reported as `shortfall_bytes`.
    pub fn run_eviction(&self, target_free_bytes: u64) -> Result<EvictionResult, EngineError> {
        let core = self.core()?;
        let budget = SpaceBudget::from_config(&self.config.read());
        let used = self.bytes_after_pending_evictions(&core, &core.repository.index());
        self.eviction_pass(budget.bytes_to_free(used, target_free_bytes))
    }

    /// Refresh every enabled import list now, regardless of schedule.
    pub async fn refresh_import_lists(&self) -> Result<Vec<ListStatus>, EngineError> {
        self.core()?;
        Ok(self.refresh_lists(true).await)
    }

    /// Drop index rows whose cache file is gone and correct sizes.
    ///
    /// Paths held by an active command are left alone. Command outcomes that
    /// could not be written to the queue snapshot are written first.
    pub fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        let core = self.core()?;
        if core.queue.flush()? {
            info!("Queue snapshot caught up with recorded outcomes");
        }
        let report = core.repository.reconcile(&core.queue.active_paths())?;
        if !report.removed.is_empty() || !report.resized.is_empty() {
            warn!(
                removed = report.removed.len(),
                resized = report.resized.len(),
                "Reconcile corrected the cache index"
            );
        }
        let index = core.repository.index();
        crate::metrics::set_cache_usage(index.total_bytes(), index.len());
        Ok(report)
    }

    /// Quarantine corrupt state files and leave the halted state.
    ///
    /// Returns the quarantined file paths. The repository starts over from
    /// defaults for those files; the rest of the state is kept.
    pub fn repair_repository(&self) -> Result<Vec<PathBuf>, EngineError> {
        let repository = self.repository()?.clone();
        let quarantined = repository.repair()?;
        if repository.is_halted() {
            return Err(EngineError::Halted("repository still halted after repair".to_string()));
        }

        let config = self.config();
        repository.store_config(&config)?;
        self.open_queue(&repository, &config)?;
        crate::metrics::set_halted(false);

        let next = if self.looping.load(Ordering::SeqCst) {
            EngineState::Running
        } else {
            EngineState::Ready
        };
        self.set_state(next);
        info!(files = ?quarantined, state = %next, "Repository repaired");
        Ok(quarantined)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Status
    // ═══════════════════════════════════════════════════════════════════════════

    /// Depth, pressure level and per-category utilization.
    pub fn queue_status(&self) -> Result<QueueStatus, EngineError> {
        let core = self.core()?;
        let depths = core.queue.depth_by_category();
        let categories = self
            .pools
            .utilization()
            .into_iter()
            .map(|pool| CategoryStatus {
                category: pool.category,
                pending: depths[pool.category.index()],
                limit: pool.limit,
                in_use: pool.in_use,
            })
            .collect();

        Ok(QueueStatus {
            depth: core.queue.depth(),
            max_depth: self.config.read().max_queue_depth,
            pressure: core.queue.pressure(),
            running: core.queue.running_count(),
            categories,
        })
    }

    /// Pending commands in one category, in dispatch order.
    pub fn pending(&self, category: TransferCategory) -> Result<Vec<Command>, EngineError> {
        Ok(self.core()?.queue.pending(category))
    }

    /// Everything currently cached, ordered by source path.
    pub fn cache_entries(&self) -> Result<Vec<CacheEntry>, EngineError> {
        let index = self.repository()?.index();
        Ok(index.entries().cloned().collect())
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let repository = self.repository()?;
        let index = repository.index();
        let (pending, running) = self
            .queue
            .get()
            .map_or((0, 0), |q| (q.depth(), q.running_count()));
        let counters = &self.counters;

        Ok(EngineStats {
            bytes_used: index.total_bytes(),
            capacity_bytes: self.config.read().cache_capacity_bytes,
            entry_count: index.len(),
            hits: EngineCounters::read(&counters.hits),
            misses: EngineCounters::read(&counters.misses),
            completed: EngineCounters::read(&counters.completed),
            failed: EngineCounters::read(&counters.failed),
            undone: EngineCounters::read(&counters.undone),
            bytes_transferred: EngineCounters::read(&counters.bytes_transferred),
            pending,
            running,
        })
    }

    /// One page of command history, newest first.
    pub fn history(&self, offset: usize, limit: usize) -> Result<HistoryPage, EngineError> {
        Ok(self.repository()?.history().page(offset, limit)?)
    }

    #[must_use]
    pub fn command(&self, id: CommandId) -> Option<Command> {
        self.queue.get().and_then(|q| q.get(id))
    }

    /// Active and retained finished commands.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        self.queue.get().map(|q| q.commands()).unwrap_or_default()
    }

    /// Last refresh of every list refreshed so far, ordered by list id.
    #[must_use]
    pub fn list_status(&self) -> Vec<ListStatus> {
        let mut statuses: Vec<ListStatus> = self.lists.iter().map(|s| s.value().clone()).collect();
        statuses.sort_by(|a, b| a.list_id.cmp(&b.list_id));
        statuses
    }

    #[must_use]
    pub fn watch_states(&self) -> Vec<WatchState> {
        self.monitor.lock().states()
    }
}
