// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: start, shutdown, run loop.
//!
//! This module contains the startup sequence, main run loop, and shutdown logic.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CacheEngineConfig;
use crate::error::EngineError;
use crate::paths::PathMapper;
use crate::queue::{CommandQueue, QueueLimits};
use crate::repository::{Repository, RepositoryHealth};
use crate::watch::WatchSettings;

use super::{CacheEngine, EngineState};

/// How often enabled import lists are checked for a due refresh.
const LIST_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// How long shutdown waits for running transfers to finish.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

impl CacheEngine {
    /// Start the engine: open the repository and rebuild the queue.
    ///
    /// Startup flow:
    /// 1. Open the repository (index, queue snapshot, config snapshot, history).
    ///    Corrupt files fall back to `.bak`; if that fails too the engine
    ///    comes up `Halted` and `start()` still returns `Ok`.
    /// 2. Persist the active config.
    /// 3. Rebuild the queue. Commands left `running` by a crash go back to
    ///    `pending` and resume idempotently.
    /// 4. Finish undos of commands cancelled mid-flight.
    /// 5. Ready!
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), EngineError> {
        let startup_start = Instant::now();
        let config = self.config();
        info!(state_dir = ?config.state_dir, "Starting cache engine...");

        // ========== PHASE 1: Repository ==========
        let phase_start = Instant::now();
        let repository = match self.repository.get() {
            Some(repository) => repository.clone(),
            None => {
                let dir = config.state_dir.clone();
                let opened = tokio::task::spawn_blocking(move || Repository::open(dir))
                    .await
                    .map_err(|e| EngineError::Halted(format!("repository open panicked: {e}")))??;
                let repository = Arc::new(opened);
                let _ = self.repository.set(repository.clone());
                repository
            }
        };
        crate::metrics::record_startup_phase("repository", phase_start.elapsed());

        match repository.health() {
            RepositoryHealth::Healthy => debug!("Repository healthy"),
            RepositoryHealth::Restored(files) => {
                warn!(files = ?files, "Repository restored from backups");
            }
            RepositoryHealth::Halted(_) => {
                crate::metrics::set_halted(true);
                self.enter_halted();
                return Ok(());
            }
        }

        if let Some(stored) = repository.stored_config() {
            if stored != config {
                info!("Config differs from last run; persisting new snapshot");
            }
        }
        repository.store_config(&config)?;

        // ========== PHASE 2: Queue ==========
        let phase_start = Instant::now();
        self.open_queue(&repository, &config)?;
        crate::metrics::record_startup_phase("queue", phase_start.elapsed());

        // ========== PHASE 3: Interrupted undos ==========
        self.resume_interrupted_undos().await;

        let index = repository.index();
        crate::metrics::set_cache_capacity(config.cache_capacity_bytes);
        crate::metrics::set_cache_usage(index.total_bytes(), index.len());
        crate::metrics::set_halted(false);

        self.set_state(EngineState::Ready);
        crate::metrics::record_startup_phase("total", startup_start.elapsed());
        info!(
            entries = index.len(),
            bytes = index.total_bytes(),
            pending = self.queue.get().map_or(0, |q| q.depth()),
            "Cache engine ready"
        );
        Ok(())
    }

    /// Open the queue once; later calls are no-ops.
    pub(super) fn open_queue(&self, repository: &Arc<Repository>, config: &CacheEngineConfig) -> Result<(), EngineError> {
        if self.queue.get().is_some() {
            return Ok(());
        }
        let queue = CommandQueue::open(
            repository.clone(),
            PathMapper::from_config(config),
            QueueLimits::from_config(config),
            crate::now_millis(),
        )?;
        let _ = self.queue.set(Arc::new(queue));
        Ok(())
    }

    /// Run the main event loop until [`shutdown()`](Self::shutdown).
    ///
    /// Session polls and list refreshes run as their own tasks, at most one
    /// of each at a time, so a slow provider never holds up dispatch.
    #[tracing::instrument(skip(self))]
    pub async fn run(self: Arc<Self>) {
        self.looping.store(true, Ordering::SeqCst);
        if self.state() != EngineState::Halted {
            self.set_state(EngineState::Running);
        }
        info!("Cache engine running");

        let (poll_secs, eviction_secs, idle_ms) = {
            let config = self.config.read();
            (
                config.poll_interval_secs.max(1),
                config.eviction_interval_secs.max(1),
                config.dispatch_idle_ms.max(1),
            )
        };
        let mut poll_interval = tokio::time::interval(Duration::from_secs(poll_secs));
        let mut list_interval = tokio::time::interval(LIST_CHECK_INTERVAL);
        let mut eviction_interval = tokio::time::interval(Duration::from_secs(eviction_secs));
        let mut config_rx = self.config_rx.lock().await;
        let mut config_open = true;
        let queue = self.queue.get().cloned();
        let mut poll_task: Option<JoinHandle<()>> = None;
        let mut list_task: Option<JoinHandle<()>> = None;

        loop {
            if self.state() == EngineState::ShuttingDown {
                break;
            }

            tokio::select! {
                changed = config_rx.changed(), if config_open => {
                    match changed {
                        Ok(()) => {
                            let new_config = config_rx.borrow_and_update().clone();
                            self.apply_config(new_config);
                        }
                        Err(_) => {
                            debug!("Config channel closed; keeping current config");
                            config_open = false;
                        }
                    }
                }

                _ = async {
                    match &queue {
                        Some(queue) => queue.wait_for_work().await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}

                _ = tokio::time::sleep(Duration::from_millis(idle_ms)) => {}

                _ = poll_interval.tick() => {
                    if in_flight(&poll_task) {
                        debug!("Previous session poll still running; tick skipped");
                    } else {
                        let engine = Arc::clone(&self);
                        poll_task = Some(tokio::spawn(async move {
                            if let Err(e) = engine.poll_sessions().await {
                                debug!(error = %e, "Session poll skipped");
                            }
                        }));
                    }
                }

                _ = list_interval.tick() => {
                    if in_flight(&list_task) {
                        debug!("Previous list refresh still running; tick skipped");
                    } else {
                        let engine = Arc::clone(&self);
                        list_task = Some(tokio::spawn(async move {
                            engine.refresh_lists(false).await;
                        }));
                    }
                }

                _ = eviction_interval.tick() => {
                    self.periodic_eviction();
                }

                _ = self.stop.notified() => {
                    debug!("Run loop stop requested");
                }
            }

            self.check_pressure();
            self.dispatch_once();
            self.publish_gauges();
        }

        for task in [poll_task, list_task].into_iter().flatten() {
            task.abort();
        }
        self.looping.store(false, Ordering::SeqCst);
        info!("Cache engine run loop exited");
    }

    /// Apply a runtime config update.
    ///
    /// Pool limits, queue limits, path roots and watch timing take effect
    /// immediately. Running commands keep the settings they started with.
    pub(super) fn apply_config(&self, config: CacheEngineConfig) {
        info!(
            capacity = config.cache_capacity_bytes,
            max_queue_depth = config.max_queue_depth,
            lists = config.import_lists.len(),
            "Config updated"
        );

        self.pools.resize(&config.concurrency);
        if let Some(queue) = self.queue.get() {
            queue.set_limits(QueueLimits::from_config(&config));
            queue.set_mapper(PathMapper::from_config(&config));
        }
        self.monitor.lock().set_settings(WatchSettings::from_config(&config));

        if let Some(repository) = self.repository.get() {
            if let Err(e) = repository.store_config(&config) {
                warn!(error = %e, "Could not persist config snapshot");
            }
        }

        self.lists
            .retain(|id, _| config.import_lists.iter().any(|l| l.enabled && &l.id == id));
        crate::metrics::set_cache_capacity(config.cache_capacity_bytes);
        *self.config.write() = config;
        self.pressure_check.store(true, Ordering::SeqCst);
    }

    fn publish_gauges(&self) {
        if let Some(queue) = self.queue.get() {
            crate::metrics::set_queue_depth(queue.depth(), queue.pressure());
        }
        for pool in self.pools.utilization() {
            crate::metrics::set_pool_in_use(pool.category, pool.in_use, pool.limit);
        }
    }

    /// Initiate graceful shutdown.
    ///
    /// Stops the run loop and waits for running transfers to finish. Pending
    /// commands stay in the queue snapshot and resume on the next start.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = Instant::now();
        info!("Initiating cache engine shutdown...");
        self.set_state(EngineState::ShuttingDown);
        self.stop.notify_one();

        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while !self.pools.is_idle() {
            if Instant::now() >= deadline {
                error!("Transfers still running at shutdown timeout; they resume on restart");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!(
            pending = self.queue.get().map_or(0, |q| q.depth()),
            "Cache engine shutdown complete"
        );
    }
}

fn in_flight(task: &Option<JoinHandle<()>>) -> bool {
    task.as_ref().is_some_and(|t| !t.is_finished())
}
