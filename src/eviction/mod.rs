// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Eviction policy for the cache tier.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Eviction Module                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  policy.rs   - Victim selection                              │
//! │  └─ SpaceBudget: capacity / watermark → bytes to free        │
//! │  └─ EvictionPolicy: expired first, then priority, LRU, size  │
//! │  └─ Exclusions: media being watched, paths with commands     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Selection is pure. The coordinator snapshots the index, builds the
//! exclusions from the watch monitor and the queue, and turns each victim
//! into an `evict` command at eviction priority.

pub mod policy;

pub use policy::{EvictionPlan, EvictionPolicy, Exclusions, SpaceBudget};
