// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache index rows.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::command::OperationType;
use crate::priority::Priority;

/// A file currently held in the cache tier.
///
/// Keyed by `source_path` (its array-tier location). Created when a cache
/// command completes, touched on access, removed when an evict completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub source_path: PathBuf,
    pub cache_path: PathBuf,
    pub size_bytes: u64,
    /// Epoch millis
    pub cached_at: i64,
    pub operation_type: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub priority: Priority,
    /// Epoch millis
    pub last_accessed: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_at: Option<i64>,
    /// Library media item this file belongs to (for watch-state exclusion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
}

impl CacheEntry {
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_at.is_some_and(|at| at <= now_ms)
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.last_accessed = self.last_accessed.max(now_ms);
    }
}

/// The persisted set of cache entries.
///
/// Serialized as a plain list of rows; the map is rebuilt on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<CacheEntry>", into = "Vec<CacheEntry>")]
pub struct CacheIndex {
    entries: BTreeMap<PathBuf, CacheEntry>,
}

impl From<Vec<CacheEntry>> for CacheIndex {
    fn from(rows: Vec<CacheEntry>) -> Self {
        Self {
            entries: rows.into_iter().map(|e| (e.source_path.clone(), e)).collect(),
        }
    }
}

impl From<CacheIndex> for Vec<CacheEntry> {
    fn from(index: CacheIndex) -> Self {
        index.entries.into_values().collect()
    }
}

impl CacheIndex {
    #[must_use]
    pub fn get(&self, source_path: &Path) -> Option<&CacheEntry> {
        self.entries.get(source_path)
    }

    #[must_use]
    pub fn contains(&self, source_path: &Path) -> bool {
        self.entries.contains_key(source_path)
    }

    /// Insert or replace the row for `entry.source_path`.
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(entry.source_path.clone(), entry)
    }

    pub fn remove(&mut self, source_path: &Path) -> Option<CacheEntry> {
        self.entries.remove(source_path)
    }

    /// Refresh `last_accessed`; returns false when the path isn't cached.
    pub fn touch(&mut self, source_path: &Path, now_ms: i64) -> bool {
        match self.entries.get_mut(source_path) {
            Some(entry) => {
                entry.touch(now_ms);
                true
            }
            None => false,
        }
    }

    /// Touch an entry a watch session is using and link it to that media
    /// when it was cached without one.
    pub fn touch_for_media(&mut self, source_path: &Path, media_id: &str, now_ms: i64) -> bool {
        match self.entries.get_mut(source_path) {
            Some(entry) => {
                entry.touch(now_ms);
                if entry.media_id.is_none() {
                    entry.media_id = Some(media_id.to_string());
                }
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    pub(crate) fn retain(&mut self, keep: impl FnMut(&PathBuf, &mut CacheEntry) -> bool) {
        self.entries.retain(keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64) -> CacheEntry {
        CacheEntry {
            source_path: PathBuf::from(format!("/array/{}", path)),
            cache_path: PathBuf::from(format!("/cache/{}", path)),
            size_bytes: size,
            cached_at: 0,
            operation_type: OperationType::Move,
            content_hash: None,
            priority: 50,
            last_accessed: 0,
            expiry_at: None,
            media_id: None,
        }
    }

    #[test]
    fn test_index_totals() {
        let mut index = CacheIndex::default();
        index.insert(entry("a.mkv", 100));
        index.insert(entry("b.mkv", 250));
        assert_eq!(index.len(), 2);
        assert_eq!(index.total_bytes(), 350);

        // Re-insert replaces, keyed by source path
        index.insert(entry("a.mkv", 10));
        assert_eq!(index.len(), 2);
        assert_eq!(index.total_bytes(), 260);
    }

    #[test]
    fn test_touch_only_moves_forward() {
        let mut index = CacheIndex::default();
        index.insert(entry("a.mkv", 1));
        let key = PathBuf::from("/array/a.mkv");

        assert!(index.touch(&key, 500));
        assert!(index.touch(&key, 100));
        assert_eq!(index.get(&key).unwrap().last_accessed, 500);
        assert!(!index.touch(Path::new("/array/missing"), 1));
    }

    #[test]
    fn test_touch_for_media_links_unowned_entries() {
        let mut index = CacheIndex::default();
        index.insert(entry("a.mkv", 1));
        let mut owned = entry("b.mkv", 1);
        owned.media_id = Some("ep-b".into());
        index.insert(owned);

        let a = PathBuf::from("/array/a.mkv");
        let b = PathBuf::from("/array/b.mkv");
        assert!(index.touch_for_media(&a, "movie-a", 700));
        assert!(index.touch_for_media(&b, "other", 700));
        assert_eq!(index.get(&a).unwrap().media_id.as_deref(), Some("movie-a"));
        assert_eq!(index.get(&a).unwrap().last_accessed, 700);
        assert_eq!(index.get(&b).unwrap().media_id.as_deref(), Some("ep-b"));
        assert!(!index.touch_for_media(Path::new("/array/missing"), "x", 1));
    }

    #[test]
    fn test_expiry() {
        let mut e = entry("a.mkv", 1);
        assert!(!e.is_expired(i64::MAX));
        e.expiry_at = Some(1000);
        assert!(!e.is_expired(999));
        assert!(e.is_expired(1000));
    }
}
