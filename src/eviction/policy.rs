// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::cache_entry::CacheEntry;
use crate::config::CacheEngineConfig;

/// Capacity bookkeeping for the cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceBudget {
    pub capacity: u64,
    /// Evict when free space drops below this
    pub watermark_free: u64,
    /// Free space an eviction pass restores
    pub target_free: u64,
}

impl SpaceBudget {
    #[must_use]
    pub fn from_config(config: &CacheEngineConfig) -> Self {
        Self {
            capacity: config.cache_capacity_bytes,
            watermark_free: config.watermark_free_bytes(),
            target_free: config.target_free_bytes(),
        }
    }

    #[must_use]
    pub fn free(&self, used: u64) -> u64 {
        self.capacity.saturating_sub(used)
    }

    #[must_use]
    pub fn below_watermark(&self, used: u64) -> bool {
        self.free(used) < self.watermark_free
    }

    /// Bytes to release so that `target_free` bytes are free.
    #[must_use]
    pub fn bytes_to_free(&self, used: u64, target_free: u64) -> u64 {
        target_free.saturating_sub(self.free(used))
    }

    /// Pressure-driven need: zero unless below the watermark.
    #[must_use]
    pub fn pressure_need(&self, used: u64) -> u64 {
        if self.below_watermark(used) {
            self.bytes_to_free(used, self.target_free)
        } else {
            0
        }
    }
}

/// Entries that must not be evicted right now.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    /// Media with a non-idle watch state
    pub active_media: HashSet<String>,
    /// Source paths held by an active command
    pub busy_paths: HashSet<PathBuf>,
    /// Library files of the active media, for entries cached without a
    /// media id
    pub watched_paths: HashSet<PathBuf>,
}

impl Exclusions {
    fn excludes_media(&self, entry: &CacheEntry) -> bool {
        self.watched_paths.contains(&entry.source_path)
            || entry
                .media_id
                .as_ref()
                .is_some_and(|m| self.active_media.contains(m))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionPlan {
    /// In selection order: expired first, then by rank
    pub victims: Vec<CacheEntry>,
    pub bytes_selected: u64,
    /// Requested bytes the candidates could not cover
    pub shortfall_bytes: u64,
    /// Victims chosen because they expired
    pub expired: usize,
    /// Candidates skipped for an active watch state
    pub excluded_active: usize,
    /// Candidates skipped because a command holds them
    pub excluded_busy: usize,
}

/// Ranks cache entries for eviction.
///
/// Lowest priority goes first, then least recently accessed, then largest.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionPolicy;

impl EvictionPolicy {
    /// Eviction order; `Less` means `a` goes first.
    #[must_use]
    pub fn compare(a: &CacheEntry, b: &CacheEntry) -> Ordering {
        a.priority
            .cmp(&b.priority)
            .then(a.last_accessed.cmp(&b.last_accessed))
            .then(b.size_bytes.cmp(&a.size_bytes))
            .then_with(|| a.source_path.cmp(&b.source_path))
    }

    /// Pick victims to release `bytes_to_free` bytes.
    ///
    /// Expired entries are always taken. Excluded entries are never taken.
    /// A shortfall is reported in the plan rather than raised.
    pub fn select_victims<'a>(
        &self,
        entries: impl IntoIterator<Item = &'a CacheEntry>,
        exclusions: &Exclusions,
        bytes_to_free: u64,
        now_ms: i64,
    ) -> EvictionPlan {
        let mut plan = EvictionPlan::default();
        let mut expired = Vec::new();
        let mut candidates = Vec::new();

        for entry in entries {
            if exclusions.busy_paths.contains(&entry.source_path) {
                plan.excluded_busy += 1;
            } else if exclusions.excludes_media(entry) {
                plan.excluded_active += 1;
            } else if entry.is_expired(now_ms) {
                expired.push(entry);
            } else {
                candidates.push(entry);
            }
        }

        expired.sort_by(|a, b| Self::compare(a, b));
        candidates.sort_by(|a, b| Self::compare(a, b));

        plan.expired = expired.len();
        for entry in expired {
            plan.bytes_selected += entry.size_bytes;
            plan.victims.push(entry.clone());
        }
        for entry in candidates {
            if plan.bytes_selected >= bytes_to_free {
                break;
            }
            plan.bytes_selected += entry.size_bytes;
            plan.victims.push(entry.clone());
        }

        plan.shortfall_bytes = bytes_to_free.saturating_sub(plan.bytes_selected);
        plan
    }
}
