// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for cache-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `cache_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for sizes
//!
//! # Labels
//! - `category`: cache_bound, array_bound, local, network
//! - `kind`: cache, evict, batch
//! - `status`: completed, failed, cancelled, undone, ...
//! - `provider`: list, session, library

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::backpressure::QueuePressure;
use crate::command::TransferCategory;

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE
// ═══════════════════════════════════════════════════════════════════════════

/// Set pending depth and pressure level
pub fn set_queue_depth(depth: usize, pressure: QueuePressure) {
    gauge!("cache_engine_queue_depth").set(depth as f64);
    gauge!("cache_engine_queue_pressure").set(pressure.as_gauge());
}

/// Record an accepted enqueue (`enqueued` or `coalesced`)
pub fn record_enqueued(category: TransferCategory, outcome: &str) {
    counter!(
        "cache_engine_commands_enqueued_total",
        "category" => category.label(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a refused enqueue
pub fn record_rejected(reason: &str) {
    counter!(
        "cache_engine_commands_rejected_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a command reaching a final (or undo) status
pub fn record_command_finished(category: TransferCategory, status: &str) {
    counter!(
        "cache_engine_commands_finished_total",
        "category" => category.label(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a transient failure rescheduled with backoff
pub fn record_retry(category: TransferCategory) {
    counter!(
        "cache_engine_command_retries_total",
        "category" => category.label()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// WORKER POOLS & TRANSFERS
// ═══════════════════════════════════════════════════════════════════════════

/// Set slots in use and the current limit for one pool
pub fn set_pool_in_use(category: TransferCategory, in_use: usize, limit: usize) {
    gauge!("cache_engine_pool_in_use", "category" => category.label()).set(in_use as f64);
    gauge!("cache_engine_pool_limit", "category" => category.label()).set(limit as f64);
}

/// Record a finished transfer
pub fn record_transfer(category: TransferCategory, kind: &str, bytes: u64, duration: Duration) {
    counter!(
        "cache_engine_transferred_bytes_total",
        "category" => category.label(),
        "kind" => kind.to_string()
    )
    .increment(bytes);
    histogram!(
        "cache_engine_transfer_seconds",
        "category" => category.label(),
        "kind" => kind.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a failed transfer by error kind
pub fn record_transfer_error(category: TransferCategory, error_kind: &str) {
    counter!(
        "cache_engine_transfer_errors_total",
        "category" => category.label(),
        "error" => error_kind.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE INDEX & EVICTION
// ═══════════════════════════════════════════════════════════════════════════

/// Set indexed bytes and entry count
pub fn set_cache_usage(bytes: u64, entries: usize) {
    gauge!("cache_engine_cache_used_bytes").set(bytes as f64);
    gauge!("cache_engine_cache_entries").set(entries as f64);
}

/// Set configured capacity
pub fn set_cache_capacity(bytes: u64) {
    gauge!("cache_engine_cache_capacity_bytes").set(bytes as f64);
}

/// Record a watch-triggered lookup against the index
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("cache_engine_cache_lookups_total", "result" => result).increment(1);
}

/// Record an eviction pass
pub fn record_eviction(victims: usize, bytes: u64, shortfall: u64) {
    counter!("cache_engine_evictions_total").increment(victims as u64);
    counter!("cache_engine_evicted_bytes_total").increment(bytes);
    if shortfall > 0 {
        counter!("cache_engine_eviction_shortfalls_total").increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PROVIDERS & WATCH STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a failed provider call (`list`, `session`, `library`)
pub fn record_provider_error(provider: &str) {
    counter!(
        "cache_engine_provider_errors_total",
        "provider" => provider.to_string()
    )
    .increment(1);
}

/// Set tracked watch states and how many are playing or paused
pub fn set_watch_states(watching: usize, total: usize) {
    gauge!("cache_engine_watch_states_active").set(watching as f64);
    gauge!("cache_engine_watch_states").set(total as f64);
}

/// Record one import list refresh
pub fn record_list_refresh(list_id: &str, matched: usize, enqueued: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "cache_engine_list_refreshes_total",
        "list" => list_id.to_string(),
        "status" => status
    )
    .increment(1);
    gauge!("cache_engine_list_matched", "list" => list_id.to_string()).set(matched as f64);
    gauge!("cache_engine_list_enqueued", "list" => list_id.to_string()).set(enqueued as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// REPOSITORY & LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record data corruption detection
pub fn record_corruption(file: &str) {
    counter!(
        "cache_engine_corruption_detected_total",
        "file" => file.to_string()
    )
    .increment(1);
}

/// Record a command outcome that reached memory but not the queue snapshot
pub fn record_unpersisted_outcome() {
    counter!("cache_engine_unpersisted_outcomes_total").increment(1);
}

/// 1 while the repository refuses writes
pub fn set_halted(halted: bool) {
    gauge!("cache_engine_repository_halted").set(if halted { 1.0 } else { 0.0 });
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "cache_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "cache_engine_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record latency of a named engine operation
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "cache_engine_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these only check that the calls are
    // well-formed and never panic.

    #[test]
    fn test_queue_metrics() {
        set_queue_depth(10, QueuePressure::Normal);
        set_queue_depth(1000, QueuePressure::Saturated);
        record_enqueued(TransferCategory::CacheBound, "enqueued");
        record_rejected("saturated");
        record_command_finished(TransferCategory::ArrayBound, "completed");
        record_retry(TransferCategory::Network);
        record_unpersisted_outcome();
    }

    #[test]
    fn test_transfer_metrics() {
        set_pool_in_use(TransferCategory::Local, 2, 4);
        record_transfer(TransferCategory::CacheBound, "cache", 1024, Duration::from_millis(5));
        record_transfer_error(TransferCategory::CacheBound, "io");
    }

    #[test]
    fn test_cache_metrics() {
        set_cache_usage(1024 * 1024, 3);
        set_cache_capacity(1024 * 1024 * 1024);
        record_cache_lookup(true);
        record_cache_lookup(false);
        record_eviction(2, 4096, 0);
        record_eviction(0, 0, 100);
    }

    #[test]
    fn test_provider_and_lifecycle_metrics() {
        record_provider_error("session");
        set_watch_states(1, 4);
        record_list_refresh("trending", 3, 2, true);
        record_corruption("index.json");
        set_halted(true);
        set_halted(false);
        set_engine_state("Running");
        record_startup_phase("repository", Duration::from_millis(3));
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("run_eviction");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }
}
