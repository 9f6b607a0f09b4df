// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborators the engine consumes.
//!
//! The media server (sessions, library) and list sources are injected as
//! trait objects. `memory` holds map-backed implementations for tests and
//! for embedders that feed the engine themselves.

pub mod memory;
pub mod traits;

use std::sync::Arc;

pub use memory::{InMemoryLibrary, LibraryItem, StaticLists, StaticSessions};
pub use traits::{
    ExternalId, ExternalIds, LibraryLookup, LibraryMatch, LibraryQuery, ListProvider, PlaybackState,
    RankedItem, SessionProvider, SessionSnapshot,
};

/// The injected collaborators, handed to [`crate::CacheEngine::new`].
#[derive(Clone)]
pub struct Providers {
    pub library: Arc<dyn LibraryLookup>,
    pub sessions: Arc<dyn SessionProvider>,
    pub lists: Arc<dyn ListProvider>,
}

impl Providers {
    pub fn new(
        library: Arc<dyn LibraryLookup>,
        sessions: Arc<dyn SessionProvider>,
        lists: Arc<dyn ListProvider>,
    ) -> Self {
        Self { library, sessions, lists }
    }
}
