// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache engine coordinator.
//!
//! The [`CacheEngine`] ties together all components:
//! - persisted repository (index, queue snapshot, config snapshot, history)
//! - command queue with per-path admission and pre-emption
//! - per-category worker pools feeding the blocking transfer executor
//! - eviction, watch-state and import-list producers
//!
//! # Lifecycle
//!
//! ```text
//! Created → Ready → Running → ShuttingDown
//!              ╲       │
//!               ╲      ▼
//!                ╰─▶ Halted ──(repair_repository)──▶ Ready
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cache_engine::{CacheEngine, CacheEngineConfig, EngineState, Providers};
//! use cache_engine::providers::{InMemoryLibrary, StaticLists, StaticSessions};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = CacheEngineConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let providers = Providers::new(
//!     Arc::new(InMemoryLibrary::new()),
//!     Arc::new(StaticSessions::new()),
//!     Arc::new(StaticLists::new()),
//! );
//! let engine = Arc::new(CacheEngine::new(config, rx, providers));
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await.expect("start failed");
//! let runner = engine.clone();
//! tokio::spawn(async move { runner.run().await });
//! # }
//! ```

mod api;
mod dispatch;
mod lifecycle;
mod producers;
mod types;

pub use types::{CategoryStatus, EngineState, EngineStats, EvictionResult, ListStatus, QueueStatus};

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};

use crate::concurrency::WorkerPools;
use crate::config::CacheEngineConfig;
use crate::error::EngineError;
use crate::import_list::ImportListResolver;
use crate::providers::Providers;
use crate::queue::CommandQueue;
use crate::repository::Repository;
use crate::watch::{WatchMonitor, WatchSettings};

use types::EngineCounters;

/// Repository and queue, shared with worker threads.
#[derive(Clone)]
pub(crate) struct Core {
    pub repository: Arc<Repository>,
    pub queue: Arc<CommandQueue>,
}

/// Main cache engine coordinator.
///
/// All methods take `&self`; wrap the engine in an `Arc` to run the
/// background loop and call the trigger/status interface concurrently.
pub struct CacheEngine {
    /// Configuration (updated at runtime via the watch channel)
    pub(super) config: RwLock<CacheEngineConfig>,

    /// Runtime config updates
    pub(super) config_rx: tokio::sync::Mutex<watch::Receiver<CacheEngineConfig>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) providers: Providers,

    pub(super) resolver: ImportListResolver,

    pub(super) pools: WorkerPools,

    pub(super) monitor: Mutex<WatchMonitor>,

    /// Library files of media with an active watch state, keyed by media id
    pub(super) watched_files: DashMap<String, Vec<PathBuf>>,

    /// Per import list refresh status, keyed by list id
    pub(super) lists: DashMap<String, ListStatus>,

    pub(super) counters: Arc<EngineCounters>,

    /// Opened by `start()`
    pub(super) repository: OnceLock<Arc<Repository>>,

    /// Opened by `start()`, or by `repair_repository()` when start found the
    /// repository halted
    pub(super) queue: OnceLock<Arc<CommandQueue>>,

    /// The background loop is active
    pub(super) looping: AtomicBool,

    /// A cache command completed; check space pressure on the next cycle
    pub(super) pressure_check: Arc<AtomicBool>,

    /// Wakes the run loop for shutdown
    pub(super) stop: Notify,
}

impl CacheEngine {
    /// Create a new cache engine.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to open the repository and transition to `Ready`.
    pub fn new(
        config: CacheEngineConfig,
        config_rx: watch::Receiver<CacheEngineConfig>,
        providers: Providers,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let resolver = ImportListResolver::new(providers.lists.clone(), providers.library.clone());

        Self {
            pools: WorkerPools::new(&config.concurrency),
            monitor: Mutex::new(WatchMonitor::new(WatchSettings::from_config(&config))),
            watched_files: DashMap::new(),
            config: RwLock::new(config),
            config_rx: tokio::sync::Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            providers,
            resolver,
            lists: DashMap::new(),
            counters: Arc::new(EngineCounters::default()),
            repository: OnceLock::new(),
            queue: OnceLock::new(),
            looping: AtomicBool::new(false),
            pressure_check: Arc::new(AtomicBool::new(false)),
            stop: Notify::new(),
        }
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> CacheEngineConfig {
        self.config.read().clone()
    }

    pub(super) fn repository(&self) -> Result<&Arc<Repository>, EngineError> {
        self.repository.get().ok_or(EngineError::NotStarted)
    }

    /// Repository and queue; refuses work while the repository is halted.
    pub(super) fn core(&self) -> Result<Core, EngineError> {
        let repository = self.repository()?;
        if repository.is_halted() {
            self.enter_halted();
            return Err(EngineError::Halted(
                "persisted state is corrupt; run repair_repository()".to_string(),
            ));
        }
        let queue = self.queue.get().ok_or(EngineError::NotStarted)?;
        Ok(Core {
            repository: repository.clone(),
            queue: queue.clone(),
        })
    }

    pub(super) fn set_state(&self, next: EngineState) {
        if *self.state_rx.borrow() != next {
            crate::metrics::set_engine_state(&next.to_string());
            let _ = self.state.send(next);
        }
    }

    pub(super) fn enter_halted(&self) {
        if self.state() != EngineState::Halted {
            tracing::error!("Repository halted; dispatching suspended until repair");
            self.set_state(EngineState::Halted);
        }
    }
}
