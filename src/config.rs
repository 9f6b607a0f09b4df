// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the cache engine.
//!
//! # Example
//!
//! ```
//! use cache_engine::CacheEngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = CacheEngineConfig::default();
//! assert_eq!(config.max_queue_depth, 1000);
//! assert_eq!(config.concurrency.cache_bound, 2);
//!
//! // Full config
//! let config = CacheEngineConfig {
//!     array_root: "/mnt/user".into(),
//!     cache_root: "/mnt/cache".into(),
//!     cache_capacity_bytes: 2 * 1024 * 1024 * 1024 * 1024, // 2 TiB
//!     remove_after_completion: true,
//!     ..Default::default()
//! };
//! assert!(config.remove_after_completion);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{OperationType, TransferCategory};
use crate::priority::{self, Priority};
use crate::resilience::retry::RetryPolicy;

/// Per-category worker pool sizes.
///
/// Values outside `MIN..=MAX` are clamped when the pools are built, so a
/// typo in an admin form cannot spawn a hundred parallel disk copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    /// Moves into the cache tier
    #[serde(default = "default_cache_bound")]
    pub cache_bound: usize,
    /// Moves back to the array tier
    #[serde(default = "default_array_bound")]
    pub array_bound: usize,
    /// Transfers where both tiers share one filesystem
    #[serde(default = "default_local")]
    pub local: usize,
    /// Transfers touching a network mount
    #[serde(default = "default_network")]
    pub network: usize,
}

impl ConcurrencyLimits {
    pub const MIN: usize = 1;
    pub const MAX: usize = 10;

    /// Limit for one category, clamped to `MIN..=MAX`.
    #[must_use]
    pub fn for_category(&self, category: TransferCategory) -> usize {
        let raw = match category {
            TransferCategory::CacheBound => self.cache_bound,
            TransferCategory::ArrayBound => self.array_bound,
            TransferCategory::Local => self.local,
            TransferCategory::Network => self.network,
        };
        raw.clamp(Self::MIN, Self::MAX)
    }

    /// Copy with every field clamped.
    #[must_use]
    pub fn clamped(&self) -> Self {
        Self {
            cache_bound: self.for_category(TransferCategory::CacheBound),
            array_bound: self.for_category(TransferCategory::ArrayBound),
            local: self.for_category(TransferCategory::Local),
            network: self.for_category(TransferCategory::Network),
        }
    }
}

fn default_cache_bound() -> usize { 2 }
fn default_array_bound() -> usize { 2 }
fn default_local() -> usize { 4 }
fn default_network() -> usize { 1 }

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            cache_bound: default_cache_bound(),
            array_bound: default_array_bound(),
            local: default_local(),
            network: default_network(),
        }
    }
}

/// How deep an import list is searched for library matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    /// Only the first `count` ranked positions are examined
    Strict,
    /// Keep scanning past unmatched items until `count` matches or `fill_limit`
    Fill,
}

/// What an import list contains; decides which external id is tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Movie,
    Series,
}

/// One externally ranked list (trending, watchlist export, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportListConfig {
    /// Stable identifier used in status reports and metrics
    pub id: String,
    /// Provider-specific source (URL, list slug, ...)
    pub source: String,
    #[serde(default = "default_media_type")]
    pub media_type: MediaType,
    /// Number of matches wanted
    #[serde(default = "default_list_count")]
    pub count: usize,
    #[serde(default = "default_fill_mode")]
    pub fill_mode: FillMode,
    /// Maximum ranked positions examined in `fill` mode
    #[serde(default = "default_fill_limit")]
    pub fill_limit: usize,
    /// Drop items whose latest relevant date is older than this (0 = disabled)
    #[serde(default)]
    pub air_date_within_days: u32,
    #[serde(default = "default_list_refresh_secs")]
    pub refresh_interval_secs: u64,
    /// Priority attached to every command this list produces
    #[serde(default = "default_list_priority")]
    pub priority: Priority,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_media_type() -> MediaType { MediaType::Movie }
fn default_list_count() -> usize { 10 }
fn default_fill_mode() -> FillMode { FillMode::Fill }
fn default_fill_limit() -> usize { 100 }
fn default_list_refresh_secs() -> u64 { 6 * 60 * 60 }
fn default_list_priority() -> Priority { priority::NORMAL }
fn default_true() -> bool { true }

impl ImportListConfig {
    /// A list with default knobs for the given id and source.
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            media_type: default_media_type(),
            count: default_list_count(),
            fill_mode: default_fill_mode(),
            fill_limit: default_fill_limit(),
            air_date_within_days: 0,
            refresh_interval_secs: default_list_refresh_secs(),
            priority: default_list_priority(),
            enabled: true,
        }
    }
}

/// Configuration for the cache engine.
///
/// All fields have defaults. At minimum set `array_root`, `cache_root`,
/// `state_dir` and `cache_capacity_bytes` for a real deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEngineConfig {
    /// Root of the slow, high-capacity tier
    #[serde(default = "default_array_root")]
    pub array_root: PathBuf,

    /// Root of the fast cache tier (mirrors the array layout)
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    /// Paths under these roots are transferred by the network pool
    #[serde(default)]
    pub network_roots: Vec<PathBuf>,

    /// Both tiers live on one filesystem (transfers use the local pool)
    #[serde(default)]
    pub tiers_share_filesystem: bool,

    /// Where the index, queue snapshot, config snapshot and history live
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Cache tier capacity managed by the engine
    #[serde(default = "default_cache_capacity_bytes")]
    pub cache_capacity_bytes: u64,

    /// Evict when free space falls below this fraction of capacity
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,

    /// Eviction frees space until this fraction of capacity is free
    #[serde(default = "default_eviction_target_free")]
    pub eviction_target_free: f64,

    /// Worker pool sizes
    #[serde(default)]
    pub concurrency: ConcurrencyLimits,

    /// Pending commands beyond which ordinary enqueues are rejected
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Finished commands kept in the queue snapshot (for undo)
    #[serde(default = "default_command_retention")]
    pub command_retention: usize,

    /// Transfer retry (I/O errors only)
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Compare SHA-256 of source and destination after each transfer
    #[serde(default)]
    pub verify_hash: bool,

    /// Move or copy files into the cache
    #[serde(default = "default_cache_operation")]
    pub cache_operation: OperationType,

    /// Priority for manual commands that don't name one
    #[serde(default = "default_priority")]
    pub default_priority: Priority,

    /// Cached entries expire after this many hours (0 = never)
    #[serde(default)]
    pub default_expiry_hours: u64,

    /// Evict media once a viewer finishes it
    #[serde(default)]
    pub remove_after_completion: bool,

    /// Delay between completion and the post-completion evict
    #[serde(default = "default_completion_evict_delay_secs")]
    pub completion_evict_delay_secs: u64,

    /// Periodic eviction pass (expiry and pressure)
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,

    /// Session polling
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_state_purge_secs")]
    pub state_purge_secs: u64,
    #[serde(default = "default_completion_threshold")]
    pub completion_threshold: f64,

    /// Episodes after the one being watched that are cached too
    #[serde(default = "default_next_episodes")]
    pub next_episodes: usize,

    /// Priority of watch-triggered caching
    #[serde(default = "default_watch_priority")]
    pub watch_priority: Priority,

    /// Coordinator sleep between empty dispatch cycles
    #[serde(default = "default_dispatch_idle_ms")]
    pub dispatch_idle_ms: u64,

    /// Externally ranked lists to import
    #[serde(default)]
    pub import_lists: Vec<ImportListConfig>,
}

fn default_array_root() -> PathBuf { PathBuf::from("/mnt/user") }
fn default_cache_root() -> PathBuf { PathBuf::from("/mnt/cache") }
fn default_state_dir() -> PathBuf { PathBuf::from("./cache_engine_state") }
fn default_cache_capacity_bytes() -> u64 { 500 * 1024 * 1024 * 1024 } // 500 GiB
fn default_low_watermark() -> f64 { 0.10 }
fn default_eviction_target_free() -> f64 { 0.20 }
fn default_max_queue_depth() -> usize { 1000 }
fn default_command_retention() -> usize { 500 }
fn default_retry_max_attempts() -> u32 { 3 }
fn default_retry_initial_delay_ms() -> u64 { 1000 }
fn default_retry_max_delay_ms() -> u64 { 30_000 }
fn default_cache_operation() -> OperationType { OperationType::Move }
fn default_priority() -> Priority { priority::NORMAL }
fn default_completion_evict_delay_secs() -> u64 { 60 * 60 }
fn default_eviction_interval_secs() -> u64 { 5 * 60 }
fn default_poll_interval_secs() -> u64 { 15 }
fn default_heartbeat_timeout_secs() -> u64 { 120 }
fn default_cooldown_secs() -> u64 { 10 * 60 }
fn default_state_purge_secs() -> u64 { 24 * 60 * 60 }
fn default_completion_threshold() -> f64 { 0.90 }
fn default_next_episodes() -> usize { 2 }
fn default_watch_priority() -> Priority { priority::HIGH }
fn default_dispatch_idle_ms() -> u64 { 250 }

impl Default for CacheEngineConfig {
    fn default() -> Self {
        Self {
            array_root: default_array_root(),
            cache_root: default_cache_root(),
            network_roots: Vec::new(),
            tiers_share_filesystem: false,
            state_dir: default_state_dir(),
            cache_capacity_bytes: default_cache_capacity_bytes(),
            low_watermark: default_low_watermark(),
            eviction_target_free: default_eviction_target_free(),
            concurrency: ConcurrencyLimits::default(),
            max_queue_depth: default_max_queue_depth(),
            command_retention: default_command_retention(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            verify_hash: false,
            cache_operation: default_cache_operation(),
            default_priority: default_priority(),
            default_expiry_hours: 0,
            remove_after_completion: false,
            completion_evict_delay_secs: default_completion_evict_delay_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            cooldown_secs: default_cooldown_secs(),
            state_purge_secs: default_state_purge_secs(),
            completion_threshold: default_completion_threshold(),
            next_episodes: default_next_episodes(),
            watch_priority: default_watch_priority(),
            dispatch_idle_ms: default_dispatch_idle_ms(),
            import_lists: Vec::new(),
        }
    }
}

impl CacheEngineConfig {
    /// Retry policy for transient transfer failures.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_initial_delay_ms)),
            factor: 2.0,
        }
    }

    /// Free bytes below which eviction kicks in.
    #[must_use]
    pub fn watermark_free_bytes(&self) -> u64 {
        fraction_of(self.cache_capacity_bytes, self.low_watermark)
    }

    /// Free bytes an eviction pass aims to restore.
    #[must_use]
    pub fn target_free_bytes(&self) -> u64 {
        fraction_of(self.cache_capacity_bytes, self.eviction_target_free.max(self.low_watermark))
    }

    /// Expiry timestamp for an entry cached at `now_ms`, if expiry is on.
    #[must_use]
    pub fn expiry_for(&self, now_ms: i64) -> Option<i64> {
        (self.default_expiry_hours > 0).then(|| {
            let ttl_ms = i64::try_from(self.default_expiry_hours.saturating_mul(3_600_000)).unwrap_or(i64::MAX);
            now_ms.saturating_add(ttl_ms)
        })
    }
}

fn fraction_of(total: u64, fraction: f64) -> u64 {
    (total as f64 * fraction.clamp(0.0, 1.0)) as u64
}
