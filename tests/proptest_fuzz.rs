// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests (fuzzing) for cache engine invariants.
//!
//! Uses proptest to generate random entry sets, request sequences and
//! malformed state files, and checks the invariants the engine relies on.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;

use cache_engine::command::{CommandKind, CommandRequest, OperationType, Producer, TransferCategory};
use cache_engine::eviction::{EvictionPolicy, Exclusions};
use cache_engine::paths::PathMapper;
use cache_engine::queue::{CommandQueue, QueueLimits};
use cache_engine::repository::Repository;
use cache_engine::{CacheEngineConfig, CacheEntry};

const NOW: i64 = 1_000_000;

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Entries with distinct paths, a few media ids and some already expired
fn entries_strategy() -> impl Strategy<Value = Vec<CacheEntry>> {
    prop::collection::vec(
        (
            0u8..=100,                    // priority
            0i64..NOW,                    // last_accessed
            1u64..10_000,                 // size
            prop::option::of(0usize..4),  // media id index
            prop::bool::weighted(0.2),    // expired
        ),
        0..40,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .enumerate()
            .map(|(i, (priority, last_accessed, size, media, expired))| CacheEntry {
                source_path: PathBuf::from(format!("/array/f{i}.mkv")),
                cache_path: PathBuf::from(format!("/cache/f{i}.mkv")),
                size_bytes: size,
                cached_at: 0,
                operation_type: OperationType::Move,
                content_hash: None,
                priority,
                last_accessed,
                expiry_at: expired.then_some(NOW - 1),
                media_id: media.map(|m| format!("media{m}")),
            })
            .collect()
    })
}

fn exclusions_strategy() -> impl Strategy<Value = Exclusions> {
    (
        prop::collection::hash_set(0usize..4, 0..3),
        prop::collection::hash_set(0usize..40, 0..5),
    )
        .prop_map(|(media, busy)| Exclusions {
            active_media: media.into_iter().map(|m| format!("media{m}")).collect(),
            busy_paths: busy
                .into_iter()
                .map(|i| PathBuf::from(format!("/array/f{i}.mkv")))
                .collect(),
            ..Default::default()
        })
}

/// (kind is evict, target file indexes, priority)
fn requests_strategy() -> impl Strategy<Value = Vec<(bool, Vec<usize>, u8)>> {
    prop::collection::vec(
        (any::<bool>(), prop::collection::vec(0usize..6, 1..3), 0u8..=100),
        1..30,
    )
}

fn is_excluded(entry: &CacheEntry, exclusions: &Exclusions) -> bool {
    exclusions.busy_paths.contains(&entry.source_path)
        || entry
            .media_id
            .as_ref()
            .is_some_and(|m| exclusions.active_media.contains(m))
}

struct QueueFixture {
    _dir: TempDir,
    array: PathBuf,
    queue: CommandQueue,
}

fn queue_fixture() -> QueueFixture {
    let dir = TempDir::new().unwrap();
    let array = dir.path().join("array");
    let cache = dir.path().join("cache");
    let repository = Arc::new(Repository::open(dir.path().join("state")).unwrap());
    let queue = CommandQueue::open(repository, PathMapper::new(&array, &cache), QueueLimits::default(), 0).unwrap();
    QueueFixture { _dir: dir, array, queue }
}

// =============================================================================
// Eviction selection
// =============================================================================

proptest! {
    /// Excluded entries are never chosen; expired ones always are
    #[test]
    fn prop_eviction_respects_exclusions_and_expiry(
        entries in entries_strategy(),
        exclusions in exclusions_strategy(),
        bytes_to_free in 0u64..100_000,
    ) {
        let plan = EvictionPolicy.select_victims(&entries, &exclusions, bytes_to_free, NOW);
        let chosen: HashSet<&PathBuf> = plan.victims.iter().map(|v| &v.source_path).collect();

        for victim in &plan.victims {
            prop_assert!(!is_excluded(victim, &exclusions));
        }
        for entry in entries.iter().filter(|e| e.is_expired(NOW) && !is_excluded(e, &exclusions)) {
            prop_assert!(chosen.contains(&entry.source_path));
        }
        prop_assert_eq!(chosen.len(), plan.victims.len());
    }

    /// Either enough bytes are selected or every eligible entry is taken
    #[test]
    fn prop_eviction_shortfall_is_exact(
        entries in entries_strategy(),
        exclusions in exclusions_strategy(),
        bytes_to_free in 0u64..100_000,
    ) {
        let plan = EvictionPolicy.select_victims(&entries, &exclusions, bytes_to_free, NOW);
        let selected: u64 = plan.victims.iter().map(|v| v.size_bytes).sum();
        prop_assert_eq!(selected, plan.bytes_selected);

        if plan.shortfall_bytes == 0 {
            prop_assert!(plan.bytes_selected >= bytes_to_free);
        } else {
            let eligible = entries.iter().filter(|e| !is_excluded(e, &exclusions)).count();
            prop_assert_eq!(plan.victims.len(), eligible);
            prop_assert_eq!(plan.shortfall_bytes, bytes_to_free - plan.bytes_selected);
        }
    }

    /// Non-expired victims are a prefix of the ranking
    #[test]
    fn prop_eviction_takes_lowest_ranked_first(
        entries in entries_strategy(),
        bytes_to_free in 0u64..100_000,
    ) {
        let plan = EvictionPolicy.select_victims(&entries, &Exclusions::default(), bytes_to_free, NOW);

        let mut ranked: Vec<&CacheEntry> = entries.iter().filter(|e| !e.is_expired(NOW)).collect();
        ranked.sort_by(|a, b| EvictionPolicy::compare(a, b));
        let taken: Vec<&PathBuf> = plan.victims[plan.expired..].iter().map(|v| &v.source_path).collect();
        let prefix: Vec<&PathBuf> = ranked.iter().take(taken.len()).map(|e| &e.source_path).collect();
        prop_assert_eq!(taken, prefix);
    }
}

// =============================================================================
// Command queue
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// No two active commands ever hold the same path
    #[test]
    fn prop_queue_one_active_command_per_path(
        requests in requests_strategy(),
        dequeue_every in 1usize..5,
    ) {
        let fixture = queue_fixture();

        for (i, (evict, files, priority)) in requests.into_iter().enumerate() {
            let kind = if evict { CommandKind::Evict } else { CommandKind::Cache };
            let paths = files.iter().map(|f| fixture.array.join(format!("f{f}.mkv"))).collect();
            let request = CommandRequest::new(kind, paths, priority, Producer::Manual);
            if let Err(e) = fixture.queue.enqueue(request, i as i64) {
                prop_assert!(e.is_recoverable(), "unexpected error: {}", e);
            }
            if i % dequeue_every == 0 {
                for category in TransferCategory::ALL {
                    fixture.queue.dequeue_next(category, i as i64).unwrap();
                }
            }

            let mut holders: HashMap<PathBuf, u64> = HashMap::new();
            for command in fixture.queue.commands().iter().filter(|c| c.status.is_active()) {
                for path in &command.target_paths {
                    let previous = holders.insert(path.clone(), command.id.0);
                    prop_assert!(previous.is_none(), "{:?} held twice", path);
                }
            }
        }
    }

    /// Within a category, commands start in priority order
    #[test]
    fn prop_queue_dequeues_by_priority(priorities in prop::collection::vec(0u8..=100, 1..25)) {
        let fixture = queue_fixture();
        for (i, priority) in priorities.iter().enumerate() {
            let path = fixture.array.join(format!("movie{i}.mkv"));
            fixture
                .queue
                .enqueue(CommandRequest::cache(path, *priority, Producer::Manual), i as i64)
                .unwrap();
        }

        let mut started = Vec::new();
        while let Some(command) = fixture.queue.dequeue_next(TransferCategory::CacheBound, 1_000).unwrap() {
            started.push(command.priority);
        }
        prop_assert_eq!(started.len(), priorities.len());
        prop_assert!(started.windows(2).all(|w| w[0] >= w[1]));
    }
}

// =============================================================================
// Malformed state files
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Garbage in a snapshot halts the repository instead of panicking
    #[test]
    fn fuzz_repository_open_with_garbage_index(bytes in prop::collection::vec(any::<u8>(), 0..2000)) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.json"), &bytes).unwrap();

        let repository = Repository::open(dir.path()).unwrap();
        prop_assert!(repository.is_halted());
        prop_assert!(repository.index().is_empty());

        repository.repair().unwrap();
        prop_assert!(!repository.is_halted());
    }

    /// Config deserialization never panics on arbitrary JSON
    #[test]
    fn fuzz_config_from_random_json(text in ".{0,200}") {
        let _ = serde_json::from_str::<CacheEngineConfig>(&text);
    }
}
