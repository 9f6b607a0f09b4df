// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Producers: watch triggers, import lists and eviction passes turned into
//! queued commands.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::command::{CommandKind, CommandRequest, Producer};
use crate::config::ImportListConfig;
use crate::error::{EngineError, QueueError};
use crate::eviction::{EvictionPolicy, Exclusions, SpaceBudget};
use crate::import_list::ImportListCandidate;
use crate::priority;
use crate::watch::{Observation, WatchTrigger};

use super::types::{EngineCounters, EvictionResult, ListStatus};
use super::{CacheEngine, Core};

impl CacheEngine {
    /// Poll the session provider once and act on what changed.
    ///
    /// Provider failures are logged and counted; the next poll tries again.
    pub async fn poll_sessions(&self) -> Result<Observation, EngineError> {
        let core = self.core()?;
        let sessions = match self.providers.sessions.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                crate::metrics::record_provider_error("session");
                warn!(error = %e, "Session poll failed; retrying next cycle");
                return Err(e.into());
            }
        };

        let now = crate::now_millis();
        let observation = {
            let mut monitor = self.monitor.lock();
            let observation = monitor.observe(&sessions, now);
            let states = monitor.states();
            let watching = states.iter().filter(|s| s.session_state.is_watching()).count();
            crate::metrics::set_watch_states(watching, states.len());
            let active = monitor.active_media();
            self.watched_files.retain(|media_id, _| active.contains(media_id));
            observation
        };

        for trigger in &observation.triggers {
            match trigger {
                WatchTrigger::Cache { user_id, media_id } => {
                    debug!(%user_id, %media_id, "Playback started");
                    self.cache_for_watch(&core, media_id).await;
                }
                WatchTrigger::Completed { user_id, media_id, evict_at } => {
                    info!(%user_id, %media_id, evict_at = ?evict_at, "Playback completed");
                }
                WatchTrigger::EvictCancelled { media_id } => {
                    info!(%media_id, "Media active again; scheduled evict dropped");
                }
            }
        }

        self.enqueue_due_evictions(&core, now).await;
        Ok(observation)
    }

    /// Cache `media_id` and the episodes after it at watch priority.
    async fn cache_for_watch(&self, core: &Core, media_id: &str) {
        let config = self.config();
        let mut media = vec![media_id.to_string()];
        if config.next_episodes > 0 {
            match self.providers.library.next_episodes(media_id, config.next_episodes).await {
                Ok(next) => media.extend(next),
                Err(e) => {
                    crate::metrics::record_provider_error("library");
                    warn!(%media_id, error = %e, "Next-episode lookup failed");
                }
            }
        }

        for id in media {
            let files = match self.providers.library.media_files(&id).await {
                Ok(files) => files,
                Err(e) => {
                    crate::metrics::record_provider_error("library");
                    warn!(media_id = %id, error = %e, "Media file lookup failed");
                    continue;
                }
            };
            if files.is_empty() {
                debug!(media_id = %id, "No library files for media");
                continue;
            }
            if id == media_id {
                self.watched_files.insert(id.clone(), files.clone());
            }

            let index = core.repository.index();
            let (cached, missing): (Vec<PathBuf>, Vec<PathBuf>) =
                files.into_iter().partition(|p| index.contains(p));

            if !cached.is_empty() {
                let now = crate::now_millis();
                match core.repository.update_index(|index| {
                    for path in &cached {
                        index.touch_for_media(path, &id, now);
                    }
                }) {
                    Ok(()) => {
                        EngineCounters::bump(&self.counters.hits, cached.len() as u64);
                        for _ in &cached {
                            crate::metrics::record_cache_lookup(true);
                        }
                    }
                    Err(e) => warn!(media_id = %id, error = %e, "Could not refresh last access"),
                }
            }

            if missing.is_empty() {
                continue;
            }
            let count = missing.len() as u64;
            let request = CommandRequest::new(CommandKind::Cache, missing, config.watch_priority, Producer::Watch)
                .with_operation(config.cache_operation)
                .with_media_id(&id)
                .coalescing();
            match core.queue.enqueue(request, crate::now_millis()) {
                Ok(outcome) => {
                    EngineCounters::bump(&self.counters.misses, count);
                    for _ in 0..count {
                        crate::metrics::record_cache_lookup(false);
                    }
                    debug!(media_id = %id, command = %outcome.id, coalesced = outcome.coalesced, "Watch caching queued");
                }
                Err(e) if e.is_recoverable() => debug!(media_id = %id, error = %e, "Watch caching skipped"),
                Err(e) => warn!(media_id = %id, error = %e, "Watch caching failed"),
            }
        }
    }

    /// Turn due post-completion evictions into evict commands.
    async fn enqueue_due_evictions(&self, core: &Core, now: i64) {
        let due = self.monitor.lock().due_evictions(now);
        let retry_at = now + (self.config.read().poll_interval_secs.max(1) as i64) * 1000;

        for media_id in due {
            let files = match self.providers.library.media_files(&media_id).await {
                Ok(files) => files,
                Err(e) => {
                    crate::metrics::record_provider_error("library");
                    warn!(%media_id, error = %e, "Media file lookup failed; evict rescheduled");
                    self.monitor.lock().reschedule(&media_id, retry_at);
                    continue;
                }
            };
            let index = core.repository.index();
            let cached: Vec<PathBuf> = files.into_iter().filter(|p| index.contains(p)).collect();
            if cached.is_empty() {
                continue;
            }

            let request = CommandRequest::new(CommandKind::Evict, cached, priority::EVICTION, Producer::Scheduler)
                .with_media_id(&media_id);
            match core.queue.enqueue(request, now) {
                Ok(outcome) => info!(%media_id, command = %outcome.id, "Post-completion evict queued"),
                Err(QueueError::QueueSaturated { .. }) => {
                    debug!(%media_id, "Queue saturated; evict rescheduled");
                    self.monitor.lock().reschedule(&media_id, retry_at);
                }
                Err(e) => debug!(%media_id, error = %e, "Post-completion evict skipped"),
            }
        }
    }

    /// Refresh every enabled list that is due (or all of them with `force`).
    pub(super) async fn refresh_lists(&self, force: bool) -> Vec<ListStatus> {
        let lists: Vec<ImportListConfig> = self
            .config
            .read()
            .import_lists
            .iter()
            .filter(|l| l.enabled)
            .cloned()
            .collect();
        let now = crate::now_millis();
        let mut refreshed = Vec::new();

        for list in &lists {
            let due = force || self.lists.get(&list.id).map_or(true, |s| s.next_refresh_at <= now);
            if !due {
                continue;
            }
            let status = self.refresh_list(list, now).await;
            self.lists.insert(list.id.clone(), status.clone());
            refreshed.push(status);
        }
        refreshed
    }

    async fn refresh_list(&self, list: &ImportListConfig, now: i64) -> ListStatus {
        let mut status = self
            .lists
            .get(&list.id)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| ListStatus::new(&list.id));
        status.last_refresh_at = Some(now);
        status.next_refresh_at = now.saturating_add((list.refresh_interval_secs as i64).saturating_mul(1000));

        let outcome = match self.core() {
            Ok(core) => match self.resolver.resolve(list, now).await {
                Ok(resolution) => {
                    status.examined = resolution.examined;
                    status.filtered = resolution.filtered;
                    status.matched = resolution.candidates.len();
                    status.enqueued = self.enqueue_candidates(&core, list, &resolution.candidates);
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => {
                status.last_error = None;
                info!(
                    list = %list.id,
                    examined = status.examined,
                    matched = status.matched,
                    enqueued = status.enqueued,
                    "Import list refreshed"
                );
            }
            Err(e) => {
                warn!(list = %list.id, error = %e, "Import list refresh failed");
                status.last_error = Some(e);
            }
        }
        crate::metrics::record_list_refresh(&list.id, status.matched, status.enqueued, status.last_error.is_none());
        status
    }

    /// One cache command per candidate for its files not yet cached.
    fn enqueue_candidates(&self, core: &Core, list: &ImportListConfig, candidates: &[ImportListCandidate]) -> usize {
        let operation = self.config.read().cache_operation;
        let index = core.repository.index();
        let mut enqueued = 0;

        for candidate in candidates {
            let missing: Vec<PathBuf> = candidate
                .matched_paths
                .iter()
                .filter(|p| !index.contains(p))
                .cloned()
                .collect();
            if missing.is_empty() {
                continue;
            }
            let mut request = CommandRequest::new(
                CommandKind::Cache,
                missing,
                list.priority,
                Producer::ImportList(list.id.clone()),
            )
            .with_operation(operation);
            if let Some(media_id) = &candidate.media_id {
                request = request.with_media_id(media_id);
            }
            match core.queue.enqueue(request, crate::now_millis()) {
                Ok(_) => enqueued += 1,
                Err(e) if e.is_recoverable() => {
                    debug!(list = %list.id, rank = candidate.rank_position, error = %e, "List candidate skipped")
                }
                Err(e) => warn!(list = %list.id, rank = candidate.rank_position, error = %e, "List candidate rejected"),
            }
        }
        enqueued
    }

    /// Select victims for `bytes_to_free` and queue an evict for each.
    pub(super) fn eviction_pass(&self, bytes_to_free: u64) -> Result<EvictionResult, EngineError> {
        let core = self.core()?;
        let _timer = crate::metrics::LatencyTimer::new("eviction_pass");
        let now = crate::now_millis();
        let index = core.repository.index();
        let active_media = self.monitor.lock().active_media();
        let watched_paths = active_media
            .iter()
            .filter_map(|media_id| self.watched_files.get(media_id).map(|files| files.value().clone()))
            .flatten()
            .collect();
        let exclusions = Exclusions {
            active_media,
            busy_paths: core.queue.active_paths(),
            watched_paths,
        };

        let plan = EvictionPolicy.select_victims(index.entries(), &exclusions, bytes_to_free, now);
        let mut result = EvictionResult {
            requested_bytes: bytes_to_free,
            victims: plan.victims.iter().map(|e| e.source_path.clone()).collect(),
            bytes_selected: plan.bytes_selected,
            shortfall_bytes: plan.shortfall_bytes,
            expired: plan.expired,
            excluded_active: plan.excluded_active,
            excluded_busy: plan.excluded_busy,
            ..Default::default()
        };

        for victim in &plan.victims {
            let mut request = CommandRequest::evict(&victim.source_path, priority::EVICTION, Producer::Eviction)
                .with_operation(victim.operation_type);
            if let Some(media_id) = &victim.media_id {
                request = request.with_media_id(media_id);
            }
            match core.queue.enqueue(request, now) {
                Ok(outcome) => result.enqueued.push(outcome.id),
                Err(e) => {
                    result.rejected += 1;
                    debug!(path = ?victim.source_path, error = %e, "Evict not queued");
                }
            }
        }

        crate::metrics::record_eviction(plan.victims.len(), plan.bytes_selected, plan.shortfall_bytes);
        if result.has_shortfall() {
            warn!(
                requested = bytes_to_free,
                selected = result.bytes_selected,
                shortfall = result.shortfall_bytes,
                excluded_active = result.excluded_active,
                excluded_busy = result.excluded_busy,
                "Eviction could not free the requested space"
            );
        } else if !result.victims.is_empty() {
            info!(victims = result.victims.len(), bytes = result.bytes_selected, expired = result.expired, "Eviction queued");
        }
        Ok(result)
    }

    /// Periodic pass: expired entries, plus pressure below the watermark.
    pub(super) fn periodic_eviction(&self) {
        let Ok(core) = self.core() else { return };
        let budget = SpaceBudget::from_config(&self.config.read());
        let used = self.bytes_after_pending_evictions(&core, &core.repository.index());
        if let Err(e) = self.eviction_pass(budget.pressure_need(used)) {
            warn!(error = %e, "Periodic eviction failed");
        }
    }

    /// Pressure check requested by a completed cache command.
    pub(super) fn check_pressure(&self) {
        if !self.pressure_check.swap(false, Ordering::SeqCst) {
            return;
        }
        let Ok(core) = self.core() else { return };
        let budget = SpaceBudget::from_config(&self.config.read());
        let used = self.bytes_after_pending_evictions(&core, &core.repository.index());
        let need = budget.pressure_need(used);
        if need == 0 {
            return;
        }
        debug!(used, need, "Cache below free-space watermark");
        if let Err(e) = self.eviction_pass(need) {
            warn!(error = %e, "Pressure eviction failed");
        }
    }
}
