// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatch: queue heads → worker pools → blocking executor.
//!
//! The coordinator only checks capacity and dequeues; everything that
//! touches the disk (the transfer, the index update, the queue's history
//! and snapshot writes) runs on a blocking thread that holds the pool slot
//! until the command's outcome is recorded.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::cache_entry::{CacheEntry, CacheIndex};
use crate::command::{
    Command, CommandError, CommandErrorKind, CommandId, CommandResult, CommandStatus, Direction,
    OperationType, StepOperation, TransferStep, UndoPayload,
};
use crate::concurrency::PoolSlot;
use crate::config::CacheEngineConfig;
use crate::error::TransferError;
use crate::paths::PathMapper;
use crate::queue::Completion;
use crate::resilience::retry::RetryPolicy;
use crate::transfer::{TransferExecutor, TransferPlan, TransferResult};

use super::types::EngineCounters;
use super::{CacheEngine, Core};

/// Steps for `command` against the current index.
///
/// To-cache targets already in the index are skipped unless the command is
/// being resumed after a restart. To-array targets that aren't cached are
/// skipped; copy entries are released instead of moved back.
pub(crate) fn plan_for(command: &Command, index: &CacheIndex, mapper: &PathMapper) -> Result<TransferPlan, CommandError> {
    let mut steps = Vec::with_capacity(command.target_paths.len());
    for target in &command.target_paths {
        match command.kind.direction() {
            Direction::ToCache => {
                if index.contains(target) && !command.recovered {
                    debug!(path = ?target, "Already cached; nothing to transfer");
                    continue;
                }
                let destination = mapper
                    .cache_path_for(target)
                    .map_err(|e| CommandError::new(CommandErrorKind::SourceUnavailable, e.to_string()))?;
                let operation = match command.operation {
                    OperationType::Move => StepOperation::Move,
                    OperationType::Copy => StepOperation::Copy,
                };
                steps.push(TransferStep::new(target, destination, operation));
            }
            Direction::ToArray => {
                let Some(entry) = index.get(target) else {
                    debug!(path = ?target, "Not cached; nothing to evict");
                    continue;
                };
                let operation = match entry.operation_type {
                    OperationType::Move => StepOperation::Move,
                    OperationType::Copy => StepOperation::Release,
                };
                steps.push(TransferStep::new(&entry.cache_path, &entry.source_path, operation));
            }
        }
    }
    Ok(TransferPlan::new(steps))
}

/// Inverse of a plan: inverse steps, newest first.
pub(crate) fn inverse_steps(plan: &TransferPlan) -> Vec<TransferStep> {
    plan.steps.iter().rev().map(TransferStep::inverse).collect()
}

fn command_result(result: &TransferResult) -> CommandResult {
    CommandResult {
        bytes_transferred: result.bytes_transferred,
        duration_ms: result.duration.as_millis() as u64,
        verified: result.verified,
    }
}

fn error_label(err: &TransferError) -> &'static str {
    match err {
        TransferError::InsufficientSpace { .. } => "insufficient_space",
        TransferError::SourceUnavailable(_) => "source_unavailable",
        TransferError::PermissionDenied { .. } => "permission_denied",
        TransferError::Io { .. } => "io",
    }
}

/// Executes one command on a blocking thread.
pub(super) struct Worker {
    core: Core,
    executor: TransferExecutor,
    mapper: PathMapper,
    retry: RetryPolicy,
    config: CacheEngineConfig,
    counters: Arc<EngineCounters>,
    pressure_check: Arc<AtomicBool>,
}

impl Worker {
    pub(super) fn new(
        core: Core,
        config: &CacheEngineConfig,
        counters: Arc<EngineCounters>,
        pressure_check: Arc<AtomicBool>,
    ) -> Self {
        Self {
            core,
            executor: TransferExecutor::new(config.verify_hash),
            mapper: PathMapper::from_config(config),
            retry: config.retry_policy(),
            config: config.clone(),
            counters,
            pressure_check,
        }
    }

    /// Execute `command` and record the outcome. The slot is released last.
    pub(super) fn run(self, command: Command, slot: PoolSlot) {
        debug!(id = %command.id, kind = %command.kind, category = %slot.category(), "Command started");
        match self.execute(&command) {
            Ok((result, undo)) => self.record_success(&command, result, undo),
            Err(error) => self.record_failure(&command, error),
        }
        drop(slot);
    }

    fn execute(&self, command: &Command) -> Result<(CommandResult, UndoPayload), CommandError> {
        let index = self.core.repository.index();
        let plan = plan_for(command, &index, &self.mapper)?;

        let result = self.executor.execute(&plan).map_err(|e| {
            crate::metrics::record_transfer_error(command.category, error_label(&e));
            CommandError::from(&e)
        })?;

        let now = crate::now_millis();
        let undo = match self.apply_to_index(command, &result, now) {
            Ok(undo) => undo,
            Err(e) => {
                // Put the files back so the index stays the truth
                error!(id = %command.id, error = %e, "Index update failed after transfer; reverting files");
                if let Err(revert) = self.executor.execute(&TransferPlan::new(inverse_steps(&plan))) {
                    error!(id = %command.id, error = %revert, "Revert failed; run reconcile()");
                }
                return Err(CommandError::new(CommandErrorKind::Repository, e.to_string()));
            }
        };

        crate::metrics::record_transfer(
            command.category,
            command.kind.label(),
            result.bytes_transferred,
            result.duration,
        );
        let undo = UndoPayload {
            steps: inverse_steps(&plan),
            ..undo
        };
        Ok((command_result(&result), undo))
    }

    /// Index rows for the finished steps; returns the entry side of the undo.
    fn apply_to_index(
        &self,
        command: &Command,
        result: &TransferResult,
        now: i64,
    ) -> Result<UndoPayload, crate::error::RepositoryError> {
        if result.steps.is_empty() {
            return Ok(UndoPayload::default());
        }
        let expiry_at = self.config.expiry_for(now);
        self.core.repository.update_index(|index| {
            let mut undo = UndoPayload::default();
            match command.kind.direction() {
                Direction::ToCache => {
                    for outcome in &result.steps {
                        let entry = CacheEntry {
                            source_path: outcome.step.source.clone(),
                            cache_path: outcome.step.destination.clone(),
                            size_bytes: outcome.bytes,
                            cached_at: now,
                            operation_type: command.operation,
                            content_hash: outcome.content_hash.clone(),
                            priority: command.priority,
                            last_accessed: now,
                            expiry_at,
                            media_id: command.media_id.clone(),
                        };
                        index.insert(entry);
                        undo.remove_entries.push(outcome.step.source.clone());
                    }
                }
                Direction::ToArray => {
                    for outcome in &result.steps {
                        // Evict steps run cache → array, so the array path is the destination
                        if let Some(previous) = index.remove(&outcome.step.destination) {
                            undo.restore_entries.push(previous);
                        }
                    }
                }
            }
            undo
        })
    }

    fn record_success(&self, command: &Command, result: CommandResult, undo: UndoPayload) {
        let now = crate::now_millis();
        match self.core.queue.complete(command.id, result, undo, now) {
            Ok(completion) => {
                EngineCounters::bump(&self.counters.completed, 1);
                EngineCounters::bump(&self.counters.bytes_transferred, result.bytes_transferred);
                info!(
                    id = %command.id,
                    kind = %command.kind,
                    bytes = result.bytes_transferred,
                    duration_ms = result.duration_ms,
                    "Command completed"
                );
                if command.kind.direction() == Direction::ToCache {
                    self.pressure_check.store(true, Ordering::SeqCst);
                }
                if let Completion::UndoRequired(payload) = completion {
                    info!(id = %command.id, "Command was cancelled while running; applying its inverse");
                    let _ = self.finish_undo(command.id, &payload);
                }
            }
            Err(e) => error!(id = %command.id, error = %e, "Could not record command completion"),
        }
    }

    fn record_failure(&self, command: &Command, error: CommandError) {
        let now = crate::now_millis();
        let retry_at = (error.is_transient() && command.can_retry(self.retry.max_attempts)).then(|| {
            let delay = self.retry.delay_for_attempt(command.attempts);
            now.saturating_add(delay.as_millis() as i64)
        });

        match self.core.queue.fail(command.id, error.clone(), retry_at, now) {
            Ok(CommandStatus::Pending) => warn!(
                id = %command.id,
                attempt = command.attempts,
                max_attempts = self.retry.max_attempts,
                error = %error,
                "Command failed; retry scheduled"
            ),
            Ok(CommandStatus::Failed) => {
                EngineCounters::bump(&self.counters.failed, 1);
                error!(id = %command.id, kind = %command.kind, error = %error, "Command failed");
            }
            Ok(status) => info!(id = %command.id, %status, error = %error, "Cancelled command ended without completing"),
            Err(e) => error!(id = %command.id, error = %e, "Could not record command failure"),
        }
    }

    /// Run an inverse handed out by the queue and record the outcome.
    pub(super) fn finish_undo(&self, id: CommandId, payload: &UndoPayload) -> Result<CommandResult, CommandError> {
        let outcome = self.apply_undo(payload);
        let now = crate::now_millis();
        match self.core.queue.finish_undo(id, outcome.clone(), now) {
            Ok(CommandStatus::Undone) => {
                EngineCounters::bump(&self.counters.undone, 1);
                info!(%id, "Command undone");
            }
            Ok(status) => warn!(%id, %status, "Undo failed; command keeps its status"),
            Err(e) => error!(%id, error = %e, "Could not record undo outcome"),
        }
        outcome
    }

    fn apply_undo(&self, payload: &UndoPayload) -> Result<CommandResult, CommandError> {
        let result = self
            .executor
            .execute(&TransferPlan::new(payload.steps.clone()))
            .map_err(|e| CommandError::from(&e))?;

        if !payload.remove_entries.is_empty() || !payload.restore_entries.is_empty() {
            self.core
                .repository
                .update_index(|index| {
                    for path in &payload.remove_entries {
                        index.remove(path);
                    }
                    for entry in &payload.restore_entries {
                        index.insert(entry.clone());
                    }
                })
                .map_err(|e| CommandError::new(CommandErrorKind::Repository, e.to_string()))?;
        }
        Ok(command_result(&result))
    }
}

impl CacheEngine {
    fn worker(&self, core: Core, config: &CacheEngineConfig) -> Worker {
        Worker::new(core, config, self.counters.clone(), self.pressure_check.clone())
    }

    /// Fill free pool slots from the queue heads. Returns how many commands
    /// were handed to workers.
    pub(super) fn dispatch_once(&self) -> usize {
        let Ok(core) = self.core() else {
            return 0;
        };
        let config = self.config();
        let now = crate::now_millis();
        let mut started = 0;

        for category in crate::command::TransferCategory::ALL {
            while let Some(slot) = self.pools.try_acquire(category) {
                match core.queue.dequeue_next(category, now) {
                    Ok(Some(command)) => {
                        let worker = self.worker(core.clone(), &config);
                        tokio::task::spawn_blocking(move || worker.run(command, slot));
                        started += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(%category, error = %e, "Dequeue failed");
                        if core.repository.is_halted() {
                            self.enter_halted();
                        }
                        return started;
                    }
                }
            }
        }
        started
    }

    /// Claim a completed command for undo and run its inverse.
    pub(super) async fn run_undo(&self, id: CommandId) -> Result<CommandResult, crate::error::EngineError> {
        let core = self.core()?;
        let now = crate::now_millis();
        let payload = core.queue.begin_undo(id, now)?;
        let worker = self.worker(core, &self.config());
        let outcome = tokio::task::spawn_blocking(move || worker.finish_undo(id, &payload))
            .await
            .map_err(|e| crate::error::EngineError::UndoFailed {
                id,
                error: CommandError::new(CommandErrorKind::Io, e.to_string()),
            })?;
        outcome.map_err(|error| crate::error::EngineError::UndoFailed { id, error })
    }

    /// Undo commands cancelled mid-flight whose inverse never ran (the
    /// process stopped in between).
    pub(super) async fn resume_interrupted_undos(&self) {
        let Ok(core) = self.core() else { return };
        for id in core.queue.interrupted_cancellations() {
            match self.run_undo(id).await {
                Ok(_) => info!(%id, "Resumed undo of cancelled command"),
                Err(e) => warn!(%id, error = %e, "Could not resume undo of cancelled command"),
            }
        }
    }

    /// Dispatch until nothing is pending or running, or `timeout` passes.
    ///
    /// Runs the post-completion pressure check between rounds. Returns
    /// whether the engine went idle in time. Handy for embedders that don't
    /// run the background loop, and for tests.
    pub async fn run_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let idle = Duration::from_millis(self.config.read().dispatch_idle_ms.clamp(1, 20));
        loop {
            self.check_pressure();
            self.dispatch_once();
            let Some(queue) = self.queue.get() else { return true };
            if queue.depth() == 0 && self.pools.is_idle() && !self.pressure_check.load(Ordering::SeqCst) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(idle).await;
        }
    }

    /// Cached bytes once every pending or running evict has finished.
    pub(super) fn bytes_after_pending_evictions(&self, core: &Core, index: &CacheIndex) -> u64 {
        let leaving: u64 = core
            .queue
            .commands()
            .iter()
            .filter(|c| c.status.is_active() && c.kind.direction() == Direction::ToArray)
            .flat_map(|c| c.target_paths.iter())
            .filter_map(|p: &PathBuf| index.get(p))
            .map(|e| e.size_bytes)
            .sum();
        index.total_bytes().saturating_sub(leaving)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandKind, Producer, TransferCategory};

    fn mapper() -> PathMapper {
        PathMapper::new("/array", "/cache")
    }

    fn command(kind: CommandKind, targets: &[&str]) -> Command {
        Command {
            id: CommandId(1),
            kind,
            target_paths: targets.iter().map(PathBuf::from).collect(),
            priority: 50,
            created_at: 0,
            status: CommandStatus::Running,
            category: TransferCategory::CacheBound,
            producer: Producer::Manual,
            operation: OperationType::Move,
            media_id: None,
            attempts: 1,
            not_before: None,
            cancel_requested: false,
            recovered: false,
            result: None,
            error: None,
            undo_payload: None,
            finished_at: None,
        }
    }

    fn entry(source: &str, cache: &str, operation_type: OperationType) -> CacheEntry {
        CacheEntry {
            source_path: source.into(),
            cache_path: cache.into(),
            size_bytes: 10,
            cached_at: 0,
            operation_type,
            content_hash: None,
            priority: 50,
            last_accessed: 0,
            expiry_at: None,
            media_id: None,
        }
    }

    #[test]
    fn test_cache_plan_maps_into_cache_root() {
        let cmd = command(CommandKind::Cache, &["/array/movies/a.mkv"]);
        let plan = plan_for(&cmd, &CacheIndex::default(), &mapper()).unwrap();
        assert_eq!(
            plan.steps,
            vec![TransferStep::new("/array/movies/a.mkv", "/cache/movies/a.mkv", StepOperation::Move)]
        );

        let mut copy = cmd.clone();
        copy.operation = OperationType::Copy;
        let plan = plan_for(&copy, &CacheIndex::default(), &mapper()).unwrap();
        assert_eq!(plan.steps[0].operation, StepOperation::Copy);
    }

    #[test]
    fn test_cache_plan_skips_cached_unless_recovered() {
        let mut index = CacheIndex::default();
        index.insert(entry("/array/a", "/cache/a", OperationType::Move));
        let mut cmd = command(CommandKind::Cache, &["/array/a", "/array/b"]);

        let plan = plan_for(&cmd, &index, &mapper()).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].source, PathBuf::from("/array/b"));

        cmd.recovered = true;
        assert_eq!(plan_for(&cmd, &index, &mapper()).unwrap().steps.len(), 2);
    }

    #[test]
    fn test_evict_plan_moves_back_or_releases() {
        let mut index = CacheIndex::default();
        index.insert(entry("/array/moved", "/cache/moved", OperationType::Move));
        index.insert(entry("/array/copied", "/cache/copied", OperationType::Copy));
        let cmd = command(CommandKind::Evict, &["/array/moved", "/array/copied", "/array/absent"]);

        let plan = plan_for(&cmd, &index, &mapper()).unwrap();
        assert_eq!(
            plan.steps,
            vec![
                TransferStep::new("/cache/moved", "/array/moved", StepOperation::Move),
                TransferStep::new("/cache/copied", "/array/copied", StepOperation::Release),
            ]
        );
    }

    #[test]
    fn test_batch_follows_direction() {
        let cmd = command(CommandKind::Batch { direction: Direction::ToCache }, &["/array/x", "/array/y"]);
        let plan = plan_for(&cmd, &CacheIndex::default(), &mapper()).unwrap();
        assert_eq!(plan.steps.len(), 2);

        let back = command(CommandKind::Batch { direction: Direction::ToArray }, &["/array/x"]);
        assert!(plan_for(&back, &CacheIndex::default(), &mapper()).unwrap().is_empty());
    }

    #[test]
    fn test_inverse_steps_reversed() {
        let plan = TransferPlan::new(vec![
            TransferStep::new("/array/1", "/cache/1", StepOperation::Move),
            TransferStep::new("/array/2", "/cache/2", StepOperation::Copy),
        ]);
        assert_eq!(
            inverse_steps(&plan),
            vec![
                TransferStep::new("/cache/2", "/array/2", StepOperation::Release),
                TransferStep::new("/cache/1", "/array/1", StepOperation::Move),
            ]
        );
    }
}
