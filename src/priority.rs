// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Command priority bands.
//!
//! Higher values are dispatched first and evicted last. Import lists and
//! manual triggers pick any value; the named bands below are what the
//! engine's own producers use.

/// Priority of a command or cache entry (higher = more important).
pub type Priority = u8;

/// Background work nobody is waiting for.
pub const LOW: Priority = 10;

/// Default for manual and import-list caching.
pub const NORMAL: Priority = 50;

/// Watch-triggered caching (someone just pressed play).
pub const HIGH: Priority = 80;

/// Eviction always runs ahead of caching work.
pub const EVICTION: Priority = 100;
