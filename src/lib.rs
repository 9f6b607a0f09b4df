// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Cache Engine
//!
//! A two-tier media caching engine: frequently watched or upcoming media is
//! moved (or copied) from a slow array tier to a fast cache tier, and evicted
//! back when space runs low or the media is no longer wanted.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Producers                            │
//! │  • Watch-state monitor (playback sessions)                  │
//! │  • Import list resolver (ranked external lists)             │
//! │  • Eviction engine (watermark, timer, on demand)            │
//! │  • Manual triggers                                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  CommandRequest
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Command Queue                          │
//! │  • Priority order per transfer category                     │
//! │  • At most one active command per path                      │
//! │  • Pre-emption and backpressure at max depth                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  dispatch (per-category pools)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Transfer Executor                        │
//! │  • .partial temp files, size/hash verification              │
//! │  • Cross-filesystem fallback, rollback on failure           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Persisted Repository                      │
//! │  • index.json / queue.json / config.json (checksummed)      │
//! │  • history.jsonl (append-only)                              │
//! │  • .bak restore, quarantine and halt on corruption          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cache_engine::{CacheEngine, CacheEngineConfig, CommandKind, Providers};
//! use cache_engine::providers::{InMemoryLibrary, StaticLists, StaticSessions};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CacheEngineConfig {
//!         array_root: "/mnt/array".into(),
//!         cache_root: "/mnt/cache".into(),
//!         state_dir: "/var/lib/cache-engine".into(),
//!         ..Default::default()
//!     };
//!
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let providers = Providers::new(
//!         Arc::new(InMemoryLibrary::new()),
//!         Arc::new(StaticSessions::new()),
//!         Arc::new(StaticLists::new()),
//!     );
//!     let engine = Arc::new(CacheEngine::new(config, rx, providers));
//!     engine.start().await.expect("Failed to start");
//!
//!     engine
//!         .enqueue_manual(CommandKind::Cache, vec!["/mnt/array/movies/heat.mkv".into()], None, false)
//!         .expect("Failed to enqueue");
//!     engine.run_until_idle(Duration::from_secs(60)).await;
//!
//!     println!("{:?}", engine.stats());
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The main [`CacheEngine`] orchestrating all components
//! - [`queue`]: Persisted priority queue with per-path admission
//! - [`transfer`]: Verified move/copy executor with undo steps
//! - [`eviction`]: Victim selection and space budget
//! - [`watch`]: Playback state machine
//! - [`import_list`]: Ranked list resolution (strict/fill)
//! - [`repository`]: Checksummed snapshots and history log
//! - [`providers`]: Injected library, session and list collaborators
//! - [`concurrency`]: Per-category worker pools
//! - [`resilience`]: Retry with exponential backoff

pub mod backpressure;
pub mod cache_entry;
pub mod command;
pub mod concurrency;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod eviction;
pub mod import_list;
pub mod metrics;
pub mod paths;
pub mod priority;
pub mod providers;
pub mod queue;
pub mod repository;
pub mod resilience;
pub mod transfer;
pub mod watch;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use backpressure::QueuePressure;
pub use cache_entry::{CacheEntry, CacheIndex};
pub use command::{
    Command, CommandError, CommandErrorKind, CommandId, CommandKind, CommandRequest, CommandResult,
    CommandStatus, Direction, OperationType, Producer, TransferCategory,
};
pub use config::{CacheEngineConfig, ConcurrencyLimits, FillMode, ImportListConfig, MediaType};
pub use coordinator::{
    CacheEngine, CategoryStatus, EngineState, EngineStats, EvictionResult, ListStatus, QueueStatus,
};
pub use error::{EngineError, ProviderError, QueueError, RepositoryError, TransferError};
pub use import_list::{ImportListCandidate, ImportListResolver};
pub use metrics::LatencyTimer;
pub use providers::Providers;
pub use queue::EnqueueOutcome;
pub use repository::{HistoryPage, HistoryRecord};
pub use resilience::retry::RetryPolicy;
pub use watch::{SessionState, WatchState};

/// Current time as epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
