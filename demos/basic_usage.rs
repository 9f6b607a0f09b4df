// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic cache-engine usage.
//!
//! Demonstrates:
//! 1. Starting the engine on throwaway array/cache directories
//! 2. A playback session pulling an episode (and the next one) into the cache
//! 3. An import list caching its top matches
//! 4. Undoing a command and running an eviction pass
//! 5. Dumping the captured metrics
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use cache_engine::providers::{
    ExternalIds, InMemoryLibrary, LibraryItem, PlaybackState, RankedItem, SessionSnapshot, StaticLists,
    StaticSessions,
};
use cache_engine::{CacheEngine, CacheEngineConfig, CommandKind, ImportListConfig, MediaType, Providers};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt().with_target(false).compact().init();

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Tiers and library
    // ─────────────────────────────────────────────────────────────────────────
    let root = tempfile::tempdir()?;
    let array = root.path().join("array");
    let cache = root.path().join("cache");

    let library = Arc::new(InMemoryLibrary::new());
    let mut episodes = Vec::new();
    for n in 1..=3 {
        let path = array.join(format!("shows/dark/s01e0{n}.mkv"));
        std::fs::create_dir_all(path.parent().ok_or("no parent")?)?;
        std::fs::write(&path, vec![0u8; 64 * 1024])?;
        episodes.push(path);
    }
    for (n, path) in episodes.iter().enumerate() {
        let next = if n + 2 <= episodes.len() { vec![format!("dark-e{}", n + 2)] } else { Vec::new() };
        library.insert(
            LibraryItem::new(format!("dark-e{}", n + 1), MediaType::Series, "Dark")
                .with_path(path)
                .with_next(next),
        );
    }

    let film = array.join("movies/heat.mkv");
    std::fs::create_dir_all(film.parent().ok_or("no parent")?)?;
    std::fs::write(&film, vec![0u8; 128 * 1024])?;
    library.insert(
        LibraryItem::new("heat", MediaType::Movie, "Heat")
            .with_year(1995)
            .with_ids(ExternalIds { tmdb: Some(949), ..Default::default() })
            .with_path(&film),
    );

    let lists = Arc::new(StaticLists::new());
    lists.insert(
        "popular-movies",
        vec![
            RankedItem::new("Unknown Film", ExternalIds { tmdb: Some(1), ..Default::default() }),
            RankedItem::new("Heat", ExternalIds { tmdb: Some(949), ..Default::default() }),
        ],
    );
    let sessions = Arc::new(StaticSessions::new());

    let mut list = ImportListConfig::new("popular", "popular-movies");
    list.count = 1;
    let config = CacheEngineConfig {
        array_root: array.clone(),
        cache_root: cache.clone(),
        state_dir: root.path().join("state"),
        cache_capacity_bytes: 10 * 1024 * 1024,
        next_episodes: 1,
        dispatch_idle_ms: 10,
        import_lists: vec![list],
        ..Default::default()
    };

    let (_config_tx, config_rx) = watch::channel(config.clone());
    let providers = Providers::new(library.clone(), sessions.clone(), lists.clone());
    let engine = Arc::new(CacheEngine::new(config, config_rx, providers));
    engine.start().await?;
    println!("Engine state: {}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Someone presses play
    // ─────────────────────────────────────────────────────────────────────────
    sessions.set(vec![SessionSnapshot::new("alice", "dark-e1", PlaybackState::Playing, 0.01)]);
    let observation = engine.poll_sessions().await?;
    println!("Watch triggers: {:?}", observation.triggers);
    engine.run_until_idle(Duration::from_secs(30)).await;

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Import list
    // ─────────────────────────────────────────────────────────────────────────
    for status in engine.refresh_import_lists().await? {
        println!(
            "List {}: examined {}, matched {}, queued {}",
            status.list_id, status.examined, status.matched, status.enqueued
        );
    }
    engine.run_until_idle(Duration::from_secs(30)).await;

    for entry in engine.cache_entries()? {
        println!("Cached: {} ({} bytes)", entry.cache_path.display(), entry.size_bytes);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Undo and eviction
    // ─────────────────────────────────────────────────────────────────────────
    let third = engine.enqueue_manual(CommandKind::Cache, vec![episodes[2].clone()], None, false)?;
    engine.run_until_idle(Duration::from_secs(30)).await;
    engine.undo(third.id).await?;
    println!("Undid {}: source back at {}", third.id, episodes[2].display());

    sessions.clear();
    engine.poll_sessions().await?;
    let result = engine.run_eviction(10 * 1024 * 1024)?;
    println!(
        "Eviction: {} victims, {} bytes, shortfall {}",
        result.victims.len(),
        result.bytes_selected,
        result.shortfall_bytes
    );
    engine.run_until_idle(Duration::from_secs(30)).await;

    let stats = engine.stats()?;
    println!("Stats: {stats:?}");
    for record in engine.history(0, 5)?.records {
        println!("History: #{} {} {:?} -> {}", record.seq, record.command_id, record.event, record.status);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    dump_metrics(&snapshotter);

    engine.shutdown().await;
    println!("Engine state: {}", engine.state());
    Ok(())
}

/// Print every captured metric, sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<String> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let name = if labels.is_empty() {
                key.name().to_string()
            } else {
                format!("{}{{{}}}", key.name(), labels.join(","))
            };
            match value {
                DebugValue::Counter(v) => format!("{name} = {v}"),
                DebugValue::Gauge(v) => format!("{name} = {:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|s| s.into_inner()).sum();
                    format!("{name} count={} sum={sum:.4}", samples.len())
                }
            }
        })
        .collect();
    lines.sort();
    println!("Metrics:");
    for line in lines {
        println!("  {line}");
    }
}
