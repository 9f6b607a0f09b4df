// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Import lists: externally ranked lists turned into caching candidates.
//!
//! A list is fetched through the [`ListProvider`](crate::providers::ListProvider),
//! filtered by air date, and each surviving item is matched against the
//! library:
//!
//! 1. primary id (tmdb for movies, tvdb for series)
//! 2. imdb
//! 3. the other numeric id
//! 4. title + year
//!
//! `strict` lists look at positions `1..=count` only. `fill` lists keep
//! scanning past unmatched items until `count` matches or `fill_limit`
//! positions were examined.

pub mod resolver;

pub use resolver::{ImportListCandidate, ImportListResolver, Resolution};
