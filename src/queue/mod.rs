// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priority-ordered, persisted command queue.
//!
//! # Ordering
//!
//! Per category, pending commands sit in a `BTreeSet` keyed by
//! `(Reverse(priority), created_at, id)`: highest priority first, FIFO within
//! a priority band, ids break ties. Commands waiting out a retry backoff are
//! skipped until their `not_before` passes.
//!
//! # Admission
//!
//! A source path belongs to at most one active command (pending, running, or
//! completed-and-being-undone). Overlap is rejected with
//! [`QueueError::DuplicateTarget`] unless the request asks to coalesce into a
//! compatible command.
//!
//! # Durability
//!
//! Every mutation:
//! 1. appends its history records,
//! 2. applies the change in memory,
//! 3. persists the queue snapshot; on failure the in-memory change is rolled
//!    back and the error returned.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::backpressure::QueuePressure;
use crate::command::{
    Command, CommandError, CommandErrorKind, CommandId, CommandRequest, CommandResult,
    CommandStatus, TransferCategory, UndoPayload,
};
use crate::config::CacheEngineConfig;
use crate::error::QueueError;
use crate::paths::PathMapper;
use crate::priority::Priority;
use crate::repository::{HistoryEvent, HistoryRecord, QueueSnapshot, Repository};

/// Depth and retention knobs, taken from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_depth: usize,
    /// Finished commands kept around (for undo and status)
    pub retention: usize,
}

impl QueueLimits {
    #[must_use]
    pub fn from_config(config: &CacheEngineConfig) -> Self {
        Self {
            max_depth: config.max_queue_depth,
            retention: config.command_retention,
        }
    }
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_depth: 1000,
            retention: 500,
        }
    }
}

/// What happened to an enqueue request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub id: CommandId,
    /// Merged into an existing command (`id` is that command)
    pub coalesced: bool,
    /// Pending command displaced to make room
    pub preempted: Option<CommandId>,
}

/// What the dispatcher does after a command completes.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Done,
    /// A cancel arrived mid-flight: run this inverse now. The targets stay
    /// held until [`CommandQueue::finish_undo`].
    UndoRequired(UndoPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    rank: Reverse<Priority>,
    created_at: i64,
    id: CommandId,
}

impl OrderKey {
    fn of(command: &Command) -> Self {
        Self {
            rank: Reverse(command.priority),
            created_at: command.created_at,
            id: command.id,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct QueueState {
    next_id: u64,
    commands: HashMap<CommandId, Command>,
    pending: [BTreeSet<OrderKey>; 4],
    /// Source path → command holding it
    active_paths: HashMap<PathBuf, CommandId>,
    /// Completed commands whose inverse is executing
    undoing: HashSet<CommandId>,
    /// Terminal commands, oldest first
    finished: VecDeque<CommandId>,
    /// Memory is ahead of the last snapshot written
    dirty: bool,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.pending.iter().map(BTreeSet::len).sum()
    }

    fn hold_paths(&mut self, command: &Command) {
        for path in &command.target_paths {
            self.active_paths.insert(path.clone(), command.id);
        }
    }

    fn release_paths(&mut self, id: CommandId) {
        self.active_paths.retain(|_, holder| *holder != id);
    }

    /// Move a command out of the active set into the finished ring.
    fn finish(&mut self, id: CommandId) {
        self.release_paths(id);
        self.finished.push_back(id);
    }

    /// Cancel a pending command to make room for higher-priority work.
    fn preempt(&mut self, key: OrderKey, category: TransferCategory, now: i64) {
        self.pending[category.index()].remove(&key);
        if let Some(command) = self.commands.get_mut(&key.id) {
            command.status = CommandStatus::Cancelled;
            command.error = Some(CommandError::new(
                CommandErrorKind::Preempted,
                "displaced by higher-priority work",
            ));
            command.finished_at = Some(now);
        }
        self.finish(key.id);
    }

    fn prune(&mut self, retention: usize) {
        while self.finished.len() > retention {
            let Some(oldest) = self.finished.pop_front() else { break };
            if self.undoing.contains(&oldest) {
                // Keep it until the inverse has finished
                self.finished.push_back(oldest);
                if self.finished.iter().all(|id| self.undoing.contains(id)) {
                    break;
                }
                continue;
            }
            self.commands.remove(&oldest);
        }
    }

    fn first_due(&self, category: TransferCategory, now: i64) -> Option<OrderKey> {
        self.pending[category.index()]
            .iter()
            .find(|key| {
                self.commands
                    .get(&key.id)
                    .is_some_and(|c| c.not_before.map_or(true, |at| at <= now))
            })
            .copied()
    }

    fn snapshot(&self) -> QueueSnapshot {
        let mut commands: Vec<Command> = self.commands.values().cloned().collect();
        commands.sort_by_key(|c| c.id);
        QueueSnapshot {
            next_id: self.next_id,
            commands,
        }
    }
}

pub struct CommandQueue {
    repository: Arc<Repository>,
    mapper: RwLock<PathMapper>,
    limits: RwLock<QueueLimits>,
    state: Mutex<QueueState>,
    work: Notify,
}

impl CommandQueue {
    /// Rebuild the queue from the repository's snapshot.
    ///
    /// Commands found `running` were interrupted by a crash; they go back to
    /// `pending` with a `recovered` history record.
    pub fn open(
        repository: Arc<Repository>,
        mapper: PathMapper,
        limits: QueueLimits,
        now: i64,
    ) -> Result<Self, QueueError> {
        let snapshot = repository.take_queue_snapshot().unwrap_or_default();
        let mut state = QueueState {
            next_id: snapshot.next_id.max(1),
            ..Default::default()
        };

        let mut recovered = Vec::new();
        let mut finished = Vec::new();
        for mut command in snapshot.commands {
            state.next_id = state.next_id.max(command.id.0 + 1);
            match command.status {
                CommandStatus::Running => {
                    command.status = CommandStatus::Pending;
                    command.recovered = true;
                    recovered.push(command.id);
                    state.pending[command.category.index()].insert(OrderKey::of(&command));
                    state.hold_paths(&command);
                }
                CommandStatus::Pending => {
                    state.pending[command.category.index()].insert(OrderKey::of(&command));
                    state.hold_paths(&command);
                }
                _ => finished.push((command.finished_at.unwrap_or(command.created_at), command.id)),
            }
            state.commands.insert(command.id, command);
        }
        finished.sort();
        state.finished = finished.into_iter().map(|(_, id)| id).collect();

        let queue = Self {
            repository,
            mapper: RwLock::new(mapper),
            limits: RwLock::new(limits),
            state: Mutex::new(state),
            work: Notify::new(),
        };

        if !recovered.is_empty() {
            let state = queue.state.lock();
            for id in &recovered {
                if let Some(command) = state.commands.get(id) {
                    queue.repository.history().append(
                        HistoryRecord::new(command, HistoryEvent::Recovered, CommandStatus::Pending, now)
                            .with_detail("interrupted by restart"),
                    )?;
                }
            }
            queue.repository.store_queue(&state.snapshot())?;
            warn!(count = recovered.len(), "Recovered interrupted commands");
        }

        let depth = queue.depth();
        info!(depth, "Command queue opened");
        crate::metrics::set_queue_depth(depth, queue.pressure());
        Ok(queue)
    }

    pub fn set_limits(&self, limits: QueueLimits) {
        *self.limits.write() = limits;
    }

    pub fn set_mapper(&self, mapper: PathMapper) {
        *self.mapper.write() = mapper;
    }

    /// Admit a request, coalescing or pre-empting as allowed.
    pub fn enqueue(&self, request: CommandRequest, now: i64) -> Result<EnqueueOutcome, QueueError> {
        let targets = self.validate_targets(&request.target_paths)?;
        let category = self.mapper.read().classify(request.kind.direction(), &targets);
        let limits = *self.limits.read();

        let mut state = self.state.lock();

        // Overlap with active work
        let mut overlapping: Vec<(PathBuf, CommandId)> = targets
            .iter()
            .filter_map(|p| state.active_paths.get(p).map(|id| (p.clone(), *id)))
            .collect();
        if !overlapping.is_empty() {
            overlapping.dedup_by_key(|(_, id)| *id);
            let (path, existing) = overlapping[0].clone();
            let single = overlapping.iter().all(|(_, id)| *id == existing);
            if request.coalesce && single && !state.undoing.contains(&existing) {
                if let Some(outcome) = self.coalesce_into(&mut state, existing, &request, &targets, now)? {
                    return Ok(outcome);
                }
            }
            return Err(QueueError::DuplicateTarget { path, existing });
        }

        // Backpressure
        let depth = state.depth();
        let mut records = Vec::with_capacity(2);
        let mut victim = None;
        if !QueuePressure::from_depth(depth, limits.max_depth).accepts_ordinary() {
            let head = request
                .producer
                .preempts()
                .then(|| state.pending[category.index()].iter().next_back().copied())
                .flatten()
                .filter(|key| key.rank.0 < request.priority);
            let Some(key) = head.filter(|key| state.commands.contains_key(&key.id)) else {
                crate::metrics::record_rejected("saturated");
                return Err(QueueError::QueueSaturated { depth, max: limits.max_depth });
            };
            if let Some(displaced) = state.commands.get(&key.id) {
                records.push(
                    HistoryRecord::new(displaced, HistoryEvent::Preempted, CommandStatus::Cancelled, now)
                        .with_detail(format!("displaced by {} while saturated", request.producer.label())),
                );
            }
            victim = Some(key);
        }

        let id = CommandId(state.next_id);
        let command = Command {
            id,
            kind: request.kind,
            target_paths: targets,
            priority: request.priority,
            created_at: now,
            status: CommandStatus::Pending,
            category,
            producer: request.producer,
            operation: request.operation,
            media_id: request.media_id,
            attempts: 0,
            not_before: None,
            cancel_requested: false,
            recovered: false,
            result: None,
            error: None,
            undo_payload: None,
            finished_at: None,
        };
        records.push(
            HistoryRecord::new(&command, HistoryEvent::Enqueued, CommandStatus::Pending, now)
                .with_detail(format!("producer={}", command.producer.label())),
        );
        let producer = command.producer.label().to_owned();

        // The displaced command and its replacement land in one snapshot
        self.apply(&mut state, records, limits.retention, move |state| {
            if let Some(key) = victim {
                state.preempt(key, category, now);
            }
            state.next_id += 1;
            state.pending[category.index()].insert(OrderKey::of(&command));
            state.hold_paths(&command);
            state.commands.insert(command.id, command);
        })?;

        let preempted = victim.map(|key| key.id);
        if let Some(victim) = preempted {
            warn!(%victim, producer, "Pending command pre-empted");
            crate::metrics::record_command_finished(category, "preempted");
        }
        debug!(%id, %category, "Command enqueued");
        crate::metrics::record_enqueued(category, "enqueued");
        self.publish_depth(&state, limits);
        drop(state);
        self.work.notify_one();
        Ok(EnqueueOutcome { id, coalesced: false, preempted })
    }

    /// Head of `category` that is due at `now`, marked running.
    pub fn dequeue_next(&self, category: TransferCategory, now: i64) -> Result<Option<Command>, QueueError> {
        let mut state = self.state.lock();
        match state.first_due(category, now) {
            Some(key) => self.start(&mut state, key, now).map(Some),
            None => Ok(None),
        }
    }

    /// Global head across categories, marked running.
    pub fn dequeue_next_any(&self, now: i64) -> Result<Option<Command>, QueueError> {
        let mut state = self.state.lock();
        let head = TransferCategory::ALL
            .iter()
            .filter_map(|c| state.first_due(*c, now))
            .min();
        match head {
            Some(key) => self.start(&mut state, key, now).map(Some),
            None => Ok(None),
        }
    }

    /// Record a successful execution.
    pub fn complete(
        &self,
        id: CommandId,
        result: CommandResult,
        undo_payload: UndoPayload,
        now: i64,
    ) -> Result<Completion, QueueError> {
        let limits = *self.limits.read();
        let mut state = self.state.lock();
        let command = running(&state, id)?;
        let cancel_requested = command.cancel_requested;

        let mut records = vec![
            HistoryRecord::new(command, HistoryEvent::Completed, CommandStatus::Completed, now).with_result(result),
        ];
        if cancel_requested {
            records.push(
                HistoryRecord::new(command, HistoryEvent::UndoStarted, CommandStatus::Completed, now)
                    .with_detail("cancelled while running"),
            );
        }
        let payload = undo_payload.clone();
        let category = command.category;

        self.apply_outcome(&mut state, records, limits.retention, move |state| {
            if let Some(command) = state.commands.get_mut(&id) {
                command.status = CommandStatus::Completed;
                command.result = Some(result);
                command.error = None;
                command.undo_payload = Some(undo_payload);
                command.finished_at = Some(now);
            }
            if cancel_requested {
                // Paths stay held for the inverse
                state.undoing.insert(id);
                state.finished.push_back(id);
            } else {
                state.finish(id);
            }
        });

        crate::metrics::record_command_finished(category, "completed");
        self.publish_depth(&state, limits);
        drop(state);
        self.work.notify_one();

        Ok(if cancel_requested {
            Completion::UndoRequired(payload)
        } else {
            Completion::Done
        })
    }

    /// Record a failed execution. With `retry_at` the command goes back to
    /// pending until that instant; otherwise it is terminal.
    pub fn fail(
        &self,
        id: CommandId,
        error: CommandError,
        retry_at: Option<i64>,
        now: i64,
    ) -> Result<CommandStatus, QueueError> {
        let limits = *self.limits.read();
        let mut state = self.state.lock();
        let command = running(&state, id)?;
        let category = command.category;

        // A cancelled command is not worth another attempt
        let retry_at = retry_at.filter(|_| !command.cancel_requested);
        let (status, record) = match retry_at {
            Some(at) => (
                CommandStatus::Pending,
                HistoryRecord::new(command, HistoryEvent::RetryScheduled, CommandStatus::Pending, now)
                    .with_error(error.clone())
                    .with_detail(format!("attempt {} failed, retry at {}", command.attempts, at)),
            ),
            None if command.cancel_requested => (
                CommandStatus::Cancelled,
                HistoryRecord::new(command, HistoryEvent::Cancelled, CommandStatus::Cancelled, now)
                    .with_error(error.clone()),
            ),
            None => (
                CommandStatus::Failed,
                HistoryRecord::new(command, HistoryEvent::Failed, CommandStatus::Failed, now)
                    .with_error(error.clone()),
            ),
        };

        self.apply_outcome(&mut state, vec![record], limits.retention, move |state| {
            let Some(command) = state.commands.get_mut(&id) else { return };
            command.status = status;
            command.error = Some(error);
            if status == CommandStatus::Pending {
                command.not_before = retry_at;
                let key = OrderKey::of(command);
                state.pending[category.index()].insert(key);
            } else {
                command.finished_at = Some(now);
                state.finish(id);
            }
        });

        match status {
            CommandStatus::Pending => crate::metrics::record_retry(category),
            other => crate::metrics::record_command_finished(category, other.label()),
        }
        self.publish_depth(&state, limits);
        drop(state);
        self.work.notify_one();
        Ok(status)
    }

    /// Cancel a command.
    ///
    /// Pending commands are removed at once. Running ones are flagged and
    /// undone right after they complete. Returns false for terminal or
    /// unknown ids.
    pub fn cancel(&self, id: CommandId, now: i64) -> Result<bool, QueueError> {
        let limits = *self.limits.read();
        let mut state = self.state.lock();
        let Some(command) = state.commands.get(&id) else {
            return Ok(false);
        };

        match command.status {
            CommandStatus::Pending => {
                let key = OrderKey::of(command);
                let category = command.category;
                let record = HistoryRecord::new(command, HistoryEvent::Cancelled, CommandStatus::Cancelled, now);
                self.apply(&mut state, vec![record], limits.retention, move |state| {
                    state.pending[category.index()].remove(&key);
                    if let Some(command) = state.commands.get_mut(&id) {
                        command.status = CommandStatus::Cancelled;
                        command.error = Some(CommandError::new(CommandErrorKind::Cancelled, "cancelled before dispatch"));
                        command.finished_at = Some(now);
                    }
                    state.finish(id);
                })?;
                crate::metrics::record_command_finished(category, "cancelled");
                self.publish_depth(&state, limits);
                info!(%id, "Pending command cancelled");
                Ok(true)
            }
            CommandStatus::Running => {
                if command.cancel_requested {
                    return Ok(true);
                }
                let record =
                    HistoryRecord::new(command, HistoryEvent::CancelRequested, CommandStatus::Running, now);
                self.apply(&mut state, vec![record], limits.retention, move |state| {
                    if let Some(command) = state.commands.get_mut(&id) {
                        command.cancel_requested = true;
                    }
                })?;
                info!(%id, "Cancel requested for running command; will undo on completion");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Claim a completed command for undo and hand out its inverse.
    pub fn begin_undo(&self, id: CommandId, now: i64) -> Result<UndoPayload, QueueError> {
        let limits = *self.limits.read();
        let mut state = self.state.lock();
        let command = state.commands.get(&id).ok_or(QueueError::NotFound(id))?;

        let not_undoable = |reason: String| QueueError::NotUndoable { id, reason };
        match command.status {
            CommandStatus::Undone => return Err(QueueError::AlreadyUndone(id)),
            CommandStatus::Completed => {}
            other => return Err(not_undoable(format!("status is {}", other))),
        }
        if state.undoing.contains(&id) {
            return Err(not_undoable("undo already in progress".to_string()));
        }
        if !command.kind.supports_undo() {
            return Err(not_undoable(format!("{} commands cannot be undone", command.kind)));
        }
        let payload = command
            .undo_payload
            .clone()
            .ok_or_else(|| not_undoable("no undo payload recorded".to_string()))?;
        if let Some((path, existing)) = command
            .target_paths
            .iter()
            .find_map(|p| state.active_paths.get(p).map(|holder| (p.clone(), *holder)))
        {
            return Err(QueueError::DuplicateTarget { path, existing });
        }

        let record = HistoryRecord::new(command, HistoryEvent::UndoStarted, CommandStatus::Completed, now);
        self.apply(&mut state, vec![record], limits.retention, move |state| {
            state.undoing.insert(id);
            if let Some(command) = state.commands.get(&id).cloned() {
                state.hold_paths(&command);
            }
        })?;
        Ok(payload)
    }

    /// Record the outcome of an inverse started by [`begin_undo`](Self::begin_undo)
    /// or handed out by [`complete`](Self::complete).
    pub fn finish_undo(
        &self,
        id: CommandId,
        outcome: Result<CommandResult, CommandError>,
        now: i64,
    ) -> Result<CommandStatus, QueueError> {
        let limits = *self.limits.read();
        let mut state = self.state.lock();
        if !state.undoing.contains(&id) {
            return Err(QueueError::NotUndoable {
                id,
                reason: "no undo in progress".to_string(),
            });
        }
        let command = state.commands.get(&id).ok_or(QueueError::NotFound(id))?;
        let category = command.category;

        let (status, record) = match &outcome {
            Ok(result) => (
                CommandStatus::Undone,
                HistoryRecord::new(command, HistoryEvent::Undone, CommandStatus::Undone, now).with_result(*result),
            ),
            Err(error) => (
                CommandStatus::Completed,
                HistoryRecord::new(command, HistoryEvent::UndoFailed, CommandStatus::Completed, now)
                    .with_error(error.clone()),
            ),
        };

        self.apply_outcome(&mut state, vec![record], limits.retention, move |state| {
            state.undoing.remove(&id);
            state.release_paths(id);
            if let Some(command) = state.commands.get_mut(&id) {
                command.status = status;
                if status == CommandStatus::Undone {
                    command.finished_at = Some(now);
                }
                if let Err(error) = outcome {
                    command.error = Some(error);
                }
            }
            if !state.finished.contains(&id) {
                state.finished.push_back(id);
            }
        });

        crate::metrics::record_command_finished(category, if status == CommandStatus::Undone { "undone" } else { "undo_failed" });
        drop(state);
        self.work.notify_one();
        Ok(status)
    }

    /// Wait until something may have become dispatchable.
    pub async fn wait_for_work(&self) {
        self.work.notified().await;
    }

    pub fn get(&self, id: CommandId) -> Option<Command> {
        self.state.lock().commands.get(&id).cloned()
    }

    /// All retained commands, by id.
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().snapshot().commands
    }

    /// Pending commands in dispatch order for one category.
    pub fn pending(&self, category: TransferCategory) -> Vec<Command> {
        let state = self.state.lock();
        state.pending[category.index()]
            .iter()
            .filter_map(|key| state.commands.get(&key.id).cloned())
            .collect()
    }

    /// Pending commands.
    pub fn depth(&self) -> usize {
        self.state.lock().depth()
    }

    pub fn depth_by_category(&self) -> [usize; 4] {
        let state = self.state.lock();
        [0, 1, 2, 3].map(|i| state.pending[i].len())
    }

    pub fn running_count(&self) -> usize {
        self.state
            .lock()
            .commands
            .values()
            .filter(|c| c.status == CommandStatus::Running)
            .count()
    }

    pub fn pressure(&self) -> QueuePressure {
        QueuePressure::from_depth(self.depth(), self.limits.read().max_depth)
    }

    /// Source paths held by active commands.
    pub fn active_paths(&self) -> HashSet<PathBuf> {
        self.state.lock().active_paths.keys().cloned().collect()
    }

    /// Completed commands that were cancelled mid-flight but never undone
    /// (the process died in between).
    pub fn interrupted_cancellations(&self) -> Vec<CommandId> {
        let state = self.state.lock();
        let mut ids: Vec<CommandId> = state
            .commands
            .values()
            .filter(|c| c.status == CommandStatus::Completed && c.cancel_requested && !state.undoing.contains(&c.id))
            .map(|c| c.id)
            .collect();
        ids.sort();
        ids
    }

    fn validate_targets(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>, QueueError> {
        if paths.is_empty() {
            return Err(QueueError::InvalidTarget {
                path: PathBuf::new(),
                reason: "command has no target paths".to_string(),
            });
        }
        let mapper = self.mapper.read();
        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(paths.len());
        for path in paths {
            mapper.validate_source(path)?;
            if seen.insert(path.clone()) {
                targets.push(path.clone());
            }
        }
        Ok(targets)
    }

    fn coalesce_into(
        &self,
        state: &mut QueueState,
        existing: CommandId,
        request: &CommandRequest,
        targets: &[PathBuf],
        now: i64,
    ) -> Result<Option<EnqueueOutcome>, QueueError> {
        let retention = self.limits.read().retention;
        let Some(command) = state.commands.get(&existing) else {
            return Ok(None);
        };
        let covers = targets.iter().all(|t| command.target_paths.contains(t));
        if command.kind != request.kind || !covers || !command.status.is_active() {
            return Ok(None);
        }

        let priority = command.priority.max(request.priority);
        let old_key = OrderKey::of(command);
        let status = command.status;
        let category = command.category;
        let record = HistoryRecord::new(command, HistoryEvent::Coalesced, status, now).with_detail(format!(
            "producer={} priority {} -> {}",
            request.producer.label(),
            command.priority,
            priority
        ));

        self.apply(state, vec![record], retention, move |state| {
            let Some(command) = state.commands.get_mut(&existing) else { return };
            command.priority = priority;
            if status == CommandStatus::Pending {
                let new_key = OrderKey::of(command);
                state.pending[category.index()].remove(&old_key);
                state.pending[category.index()].insert(new_key);
            }
        })?;

        crate::metrics::record_enqueued(category, "coalesced");
        Ok(Some(EnqueueOutcome {
            id: existing,
            coalesced: true,
            preempted: None,
        }))
    }

    fn start(&self, state: &mut QueueState, key: OrderKey, now: i64) -> Result<Command, QueueError> {
        let retention = self.limits.read().retention;
        let command = state.commands.get(&key.id).ok_or(QueueError::NotFound(key.id))?;
        let category = command.category;
        let record = HistoryRecord::new(command, HistoryEvent::Started, CommandStatus::Running, now)
            .with_detail(format!("attempt {}", command.attempts + 1));

        self.apply(state, vec![record], retention, move |state| {
            state.pending[category.index()].remove(&key);
            if let Some(command) = state.commands.get_mut(&key.id) {
                command.status = CommandStatus::Running;
                command.attempts += 1;
                command.not_before = None;
            }
        })?;

        let limits = *self.limits.read();
        self.publish_depth(state, limits);
        state.commands.get(&key.id).cloned().ok_or(QueueError::NotFound(key.id))
    }

    /// History first, then memory, then the snapshot (rolled back on failure).
    fn apply<R>(
        &self,
        state: &mut QueueState,
        records: Vec<HistoryRecord>,
        retention: usize,
        mutate: impl FnOnce(&mut QueueState) -> R,
    ) -> Result<R, QueueError> {
        self.repository.ensure_writable()?;
        for record in records {
            self.repository.history().append(record)?;
        }

        let before = state.clone();
        let out = mutate(state);
        state.prune(retention);

        if let Err(e) = self.repository.store_queue(&state.snapshot()) {
            warn!(error = %e, "Queue snapshot write failed; rolling back");
            *state = before;
            return Err(e.into());
        }
        state.dirty = false;
        Ok(out)
    }

    /// Record the outcome of work that already changed the disk.
    ///
    /// Unlike [`apply`](Self::apply) the memory change always sticks, so the
    /// command never stays `running` holding its paths. A failed write marks
    /// the queue dirty; the next successful write or [`flush`](Self::flush)
    /// persists it, and a restart before that resumes the command
    /// idempotently.
    fn apply_outcome<R>(
        &self,
        state: &mut QueueState,
        records: Vec<HistoryRecord>,
        retention: usize,
        mutate: impl FnOnce(&mut QueueState) -> R,
    ) -> R {
        let logged = self
            .repository
            .ensure_writable()
            .and_then(|()| records.into_iter().try_for_each(|r| self.repository.history().append(r).map(|_| ())));

        let out = mutate(state);
        state.prune(retention);

        match logged.and_then(|()| self.repository.store_queue(&state.snapshot())) {
            Ok(()) => state.dirty = false,
            Err(e) => {
                state.dirty = true;
                crate::metrics::record_unpersisted_outcome();
                error!(error = %e, "Command outcome kept in memory only; snapshot write failed");
            }
        }
        out
    }

    /// Write the snapshot if an outcome is still unpersisted. Returns
    /// whether a write was needed.
    pub fn flush(&self) -> Result<bool, QueueError> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(false);
        }
        self.repository.store_queue(&state.snapshot())?;
        state.dirty = false;
        info!("Unpersisted command outcomes written");
        Ok(true)
    }

    /// An outcome is in memory but not yet in the snapshot.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    fn publish_depth(&self, state: &QueueState, limits: QueueLimits) {
        let depth = state.depth();
        crate::metrics::set_queue_depth(depth, QueuePressure::from_depth(depth, limits.max_depth));
    }
}

fn running(state: &QueueState, id: CommandId) -> Result<&Command, QueueError> {
    let command = state.commands.get(&id).ok_or(QueueError::NotFound(id))?;
    if command.status != CommandStatus::Running {
        return Err(QueueError::InvalidState {
            id,
            actual: command.status,
            expected: CommandStatus::Running,
        });
    }
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandKind, Producer};
    use crate::priority;
    use tempfile::{tempdir, TempDir};

    fn open_queue(limits: QueueLimits) -> (TempDir, Arc<Repository>, CommandQueue) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(Repository::open(dir.path()).unwrap());
        let queue = CommandQueue::open(repo.clone(), PathMapper::new("/array", "/cache"), limits, 0).unwrap();
        (dir, repo, queue)
    }

    fn cache(path: &str, priority: Priority) -> CommandRequest {
        CommandRequest::cache(format!("/array/{}", path), priority, Producer::Manual)
    }

    #[test]
    fn test_dequeue_by_priority_then_fifo() {
        let (_dir, _repo, queue) = open_queue(QueueLimits::default());
        let low = queue.enqueue(cache("low.mkv", priority::LOW), 1).unwrap().id;
        let first = queue.enqueue(cache("a.mkv", priority::HIGH), 2).unwrap().id;
        let second = queue.enqueue(cache("b.mkv", priority::HIGH), 3).unwrap().id;

        let order: Vec<CommandId> = std::iter::from_fn(|| {
            queue.dequeue_next(TransferCategory::CacheBound, 10).unwrap().map(|c| c.id)
        })
        .collect();
        assert_eq!(order, vec![first, second, low]);
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let (_dir, _repo, queue) = open_queue(QueueLimits::default());
        let first = queue.enqueue(cache("a.mkv", 50), 0).unwrap().id;
        match queue.enqueue(cache("a.mkv", 50), 1) {
            Err(QueueError::DuplicateTarget { existing, .. }) => assert_eq!(existing, first),
            other => panic!("unexpected {:?}", other),
        }
        // Still rejected while running
        queue.dequeue_next_any(2).unwrap().unwrap();
        assert!(queue.enqueue(cache("a.mkv", 50), 3).is_err());
    }

    #[test]
    fn test_coalesce_raises_priority_and_reorders() {
        let (_dir, _repo, queue) = open_queue(QueueLimits::default());
        let a = queue.enqueue(cache("a.mkv", priority::LOW), 0).unwrap().id;
        let b = queue.enqueue(cache("b.mkv", priority::NORMAL), 1).unwrap().id;

        let outcome = queue.enqueue(cache("a.mkv", priority::HIGH).coalescing(), 2).unwrap();
        assert!(outcome.coalesced);
        assert_eq!(outcome.id, a);
        assert_eq!(queue.get(a).unwrap().priority, priority::HIGH);

        let head = queue.dequeue_next(TransferCategory::CacheBound, 3).unwrap().unwrap();
        assert_eq!(head.id, a);
        assert_eq!(queue.dequeue_next(TransferCategory::CacheBound, 3).unwrap().unwrap().id, b);
    }

    #[test]
    fn test_coalesce_refuses_different_kind() {
        let (_dir, _repo, queue) = open_queue(QueueLimits::default());
        queue.enqueue(cache("a.mkv", 50), 0).unwrap();
        let evict = CommandRequest::evict("/array/a.mkv", 100, Producer::Eviction).coalescing();
        assert!(matches!(queue.enqueue(evict, 1), Err(QueueError::DuplicateTarget { .. })));
    }

    #[test]
    fn test_saturation_rejects_ordinary_and_preempts_for_watch() {
        let limits = QueueLimits { max_depth: 2, retention: 10 };
        let (_dir, _repo, queue) = open_queue(limits);
        let low = queue.enqueue(cache("a.mkv", priority::LOW), 0).unwrap().id;
        queue.enqueue(cache("b.mkv", priority::NORMAL), 1).unwrap();

        assert!(matches!(
            queue.enqueue(cache("c.mkv", priority::HIGH), 2),
            Err(QueueError::QueueSaturated { depth: 2, max: 2 })
        ));

        let watch = CommandRequest::cache("/array/c.mkv", priority::HIGH, Producer::Watch);
        let outcome = queue.enqueue(watch, 3).unwrap();
        assert_eq!(outcome.preempted, Some(low));
        let victim = queue.get(low).unwrap();
        assert_eq!(victim.status, CommandStatus::Cancelled);
        assert_eq!(victim.error.unwrap().kind, CommandErrorKind::Preempted);
        assert_eq!(queue.depth(), 2);

        // No strictly lower victim left for an equal-priority watch request
        let watch = CommandRequest::cache("/array/d.mkv", priority::NORMAL, Producer::Watch);
        assert!(matches!(queue.enqueue(watch, 4), Err(QueueError::QueueSaturated { .. })));
    }

    #[test]
    fn test_cancel_pending_and_running() {
        let (_dir, _repo, queue) = open_queue(QueueLimits::default());
        let a = queue.enqueue(cache("a.mkv", 50), 0).unwrap().id;
        let b = queue.enqueue(cache("b.mkv", 40), 1).unwrap().id;

        assert!(queue.cancel(b, 2).unwrap());
        assert_eq!(queue.get(b).unwrap().status, CommandStatus::Cancelled);
        // Path is free again
        queue.enqueue(cache("b.mkv", 40), 3).unwrap();

        let running = queue.dequeue_next_any(4).unwrap().unwrap();
        assert_eq!(running.id, a);
        assert!(queue.cancel(a, 5).unwrap());
        assert!(queue.get(a).unwrap().cancel_requested);

        let payload = UndoPayload::default();
        let completion = queue.complete(a, CommandResult::default(), payload.clone(), 6).unwrap();
        assert_eq!(completion, Completion::UndoRequired(payload));
        // Target still held while the inverse runs
        assert!(queue.enqueue(cache("a.mkv", 50), 7).is_err());
        assert_eq!(queue.finish_undo(a, Ok(CommandResult::default()), 8).unwrap(), CommandStatus::Undone);
        queue.enqueue(cache("a.mkv", 50), 9).unwrap();

        assert!(!queue.cancel(a, 10).unwrap());
        assert!(!queue.cancel(CommandId(999), 10).unwrap());
    }

    #[test]
    fn test_retry_backoff_is_respected() {
        let (_dir, _repo, queue) = open_queue(QueueLimits::default());
        let id = queue.enqueue(cache("a.mkv", 50), 0).unwrap().id;
        queue.dequeue_next_any(0).unwrap().unwrap();

        let err = CommandError::new(CommandErrorKind::Io, "flaky");
        assert_eq!(queue.fail(id, err.clone(), Some(1_000), 10).unwrap(), CommandStatus::Pending);
        assert!(queue.dequeue_next_any(999).unwrap().is_none());

        let again = queue.dequeue_next_any(1_000).unwrap().unwrap();
        assert_eq!(again.attempts, 2);
        assert_eq!(queue.fail(id, err, None, 1_001).unwrap(), CommandStatus::Failed);
        assert!(queue.active_paths().is_empty());
    }

    #[test]
    fn test_undo_rules() {
        let (_dir, _repo, queue) = open_queue(QueueLimits::default());
        let id = queue.enqueue(cache("a.mkv", 50), 0).unwrap().id;

        assert!(matches!(queue.begin_undo(id, 1), Err(QueueError::NotUndoable { .. })));
        assert!(matches!(queue.begin_undo(CommandId(77), 1), Err(QueueError::NotFound(_))));

        queue.dequeue_next_any(1).unwrap().unwrap();
        queue.complete(id, CommandResult::default(), UndoPayload::default(), 2).unwrap();

        // Another command holds the path
        let other = queue.enqueue(CommandRequest::evict("/array/a.mkv", 100, Producer::Eviction), 3).unwrap().id;
        assert!(matches!(queue.begin_undo(id, 4), Err(QueueError::DuplicateTarget { .. })));
        queue.cancel(other, 5).unwrap();

        queue.begin_undo(id, 6).unwrap();
        assert!(matches!(queue.begin_undo(id, 6), Err(QueueError::NotUndoable { .. })));
        queue.finish_undo(id, Ok(CommandResult::default()), 7).unwrap();
        assert!(matches!(queue.begin_undo(id, 8), Err(QueueError::AlreadyUndone(_))));
    }

    #[test]
    fn test_failed_undo_leaves_command_completed() {
        let (_dir, _repo, queue) = open_queue(QueueLimits::default());
        let id = queue.enqueue(cache("a.mkv", 50), 0).unwrap().id;
        queue.dequeue_next_any(1).unwrap().unwrap();
        queue.complete(id, CommandResult::default(), UndoPayload::default(), 2).unwrap();

        queue.begin_undo(id, 3).unwrap();
        let err = CommandError::new(CommandErrorKind::SourceUnavailable, "cache copy gone");
        assert_eq!(queue.finish_undo(id, Err(err), 4).unwrap(), CommandStatus::Completed);
        assert!(queue.active_paths().is_empty());
        queue.begin_undo(id, 5).unwrap();
    }

    #[test]
    fn test_recovery_requeues_running_commands() {
        let dir = tempdir().unwrap();
        let running_id;
        {
            let repo = Arc::new(Repository::open(dir.path()).unwrap());
            let queue = CommandQueue::open(repo, PathMapper::new("/array", "/cache"), QueueLimits::default(), 0).unwrap();
            running_id = queue.enqueue(cache("a.mkv", 50), 0).unwrap().id;
            queue.enqueue(cache("b.mkv", 10), 1).unwrap();
            queue.dequeue_next_any(2).unwrap().unwrap();
        }

        let repo = Arc::new(Repository::open(dir.path()).unwrap());
        let queue = CommandQueue::open(repo.clone(), PathMapper::new("/array", "/cache"), QueueLimits::default(), 5).unwrap();
        let recovered = queue.get(running_id).unwrap();
        assert_eq!(recovered.status, CommandStatus::Pending);
        assert!(recovered.recovered);
        assert_eq!(queue.depth(), 2);

        let events: Vec<HistoryEvent> = repo.history().for_command(running_id).unwrap().iter().map(|r| r.event).collect();
        assert_eq!(events, vec![HistoryEvent::Enqueued, HistoryEvent::Started, HistoryEvent::Recovered]);

        // Ids keep counting from where they left off
        let next = queue.enqueue(cache("c.mkv", 10), 6).unwrap().id;
        assert_eq!(next, CommandId(3));
    }

    #[test]
    fn test_retention_prunes_oldest_finished() {
        let limits = QueueLimits { max_depth: 100, retention: 2 };
        let (_dir, _repo, queue) = open_queue(limits);
        let ids: Vec<CommandId> = (0..4)
            .map(|i| queue.enqueue(cache(&format!("{}.mkv", i), 50), i).unwrap().id)
            .collect();
        for (i, id) in ids.iter().enumerate() {
            queue.cancel(*id, 10 + i as i64).unwrap();
        }
        assert!(queue.get(ids[0]).is_none());
        assert!(queue.get(ids[1]).is_none());
        assert!(queue.get(ids[3]).is_some());
    }

    #[test]
    fn test_halted_repository_refuses_mutations() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("index.json"), b"junk").unwrap();
        let repo = Arc::new(Repository::open(dir.path()).unwrap());
        let queue = CommandQueue::open(repo, PathMapper::new("/array", "/cache"), QueueLimits::default(), 0).unwrap();
        assert!(matches!(queue.enqueue(cache("a.mkv", 50), 0), Err(QueueError::Repository(_))));
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_invalid_targets() {
        let (_dir, _repo, queue) = open_queue(QueueLimits::default());
        let empty = CommandRequest::new(CommandKind::Cache, vec![], 50, Producer::Manual);
        assert!(matches!(queue.enqueue(empty, 0), Err(QueueError::InvalidTarget { .. })));
        let outside = CommandRequest::cache("/etc/passwd", 50, Producer::Manual);
        assert!(matches!(queue.enqueue(outside, 0), Err(QueueError::InvalidTarget { .. })));
    }

    /// A directory squatting on the staging path makes queue snapshot
    /// writes fail, even for root.
    fn block_queue_snapshot(dir: &std::path::Path) -> PathBuf {
        let staging = dir.join(format!("{}.tmp", crate::repository::QUEUE_FILE));
        std::fs::create_dir_all(staging.join("occupied")).unwrap();
        staging
    }

    #[test]
    fn test_outcome_kept_when_snapshot_write_fails() {
        let dir = tempdir().unwrap();
        let (done, failed);
        {
            let repo = Arc::new(Repository::open(dir.path()).unwrap());
            let queue = CommandQueue::open(repo, PathMapper::new("/array", "/cache"), QueueLimits::default(), 0).unwrap();
            done = queue.enqueue(cache("a.mkv", 50), 0).unwrap().id;
            failed = queue.enqueue(cache("b.mkv", 40), 1).unwrap().id;
            queue.dequeue_next_any(2).unwrap().unwrap();
            queue.dequeue_next_any(2).unwrap().unwrap();

            let staging = block_queue_snapshot(dir.path());
            let completion = queue.complete(done, CommandResult::default(), UndoPayload::default(), 3).unwrap();
            assert_eq!(completion, Completion::Done);
            let err = CommandError::new(CommandErrorKind::Io, "disk gone");
            assert_eq!(queue.fail(failed, err, None, 4).unwrap(), CommandStatus::Failed);

            // Outcomes stick in memory and the paths are free again
            assert_eq!(queue.get(done).unwrap().status, CommandStatus::Completed);
            assert_eq!(queue.running_count(), 0);
            assert!(queue.active_paths().is_empty());
            assert!(queue.is_dirty());

            // Ordinary mutations still refuse to run ahead of the snapshot
            assert!(queue.enqueue(cache("c.mkv", 50), 5).is_err());
            assert!(queue.flush().is_err());

            std::fs::remove_dir_all(&staging).unwrap();
            assert!(queue.flush().unwrap());
            assert!(!queue.is_dirty());
            assert!(!queue.flush().unwrap());
        }

        let repo = Arc::new(Repository::open(dir.path()).unwrap());
        let queue = CommandQueue::open(repo, PathMapper::new("/array", "/cache"), QueueLimits::default(), 6).unwrap();
        assert_eq!(queue.get(done).unwrap().status, CommandStatus::Completed);
        assert_eq!(queue.get(failed).unwrap().status, CommandStatus::Failed);
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_preemption_undone_when_enqueue_write_fails() {
        let limits = QueueLimits { max_depth: 2, retention: 500 };
        let (dir, _repo, queue) = open_queue(limits);
        let low = queue.enqueue(cache("a.mkv", priority::LOW), 0).unwrap().id;
        queue.enqueue(cache("b.mkv", priority::NORMAL), 1).unwrap();

        let staging = block_queue_snapshot(dir.path());
        let watch = CommandRequest::cache("/array/c.mkv", priority::HIGH, Producer::Watch);
        assert!(matches!(queue.enqueue(watch.clone(), 2), Err(QueueError::Repository(_))));
        assert_eq!(queue.get(low).unwrap().status, CommandStatus::Pending);
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.pending(TransferCategory::CacheBound).len(), 2);

        std::fs::remove_dir_all(&staging).unwrap();
        let outcome = queue.enqueue(watch, 3).unwrap();
        assert_eq!(outcome.preempted, Some(low));
        assert_eq!(queue.get(low).unwrap().status, CommandStatus::Cancelled);
        assert_eq!(queue.depth(), 2);
    }
}
