// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::traits::{
    ExternalId, ExternalIds, LibraryLookup, LibraryMatch, LibraryQuery, ListProvider, RankedItem,
    SessionProvider, SessionSnapshot,
};
use crate::config::MediaType;
use crate::error::ProviderError;

/// A library item held by [`InMemoryLibrary`].
#[derive(Debug, Clone)]
pub struct LibraryItem {
    pub media_id: String,
    pub media_type: MediaType,
    pub ids: ExternalIds,
    pub title: String,
    pub year: Option<u16>,
    pub paths: Vec<PathBuf>,
    /// Following episodes, in order
    pub next: Vec<String>,
}

impl LibraryItem {
    pub fn new(media_id: impl Into<String>, media_type: MediaType, title: impl Into<String>) -> Self {
        Self {
            media_id: media_id.into(),
            media_type,
            ids: ExternalIds::default(),
            title: title.into(),
            year: None,
            paths: Vec::new(),
            next: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_ids(mut self, ids: ExternalIds) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn with_year(mut self, year: u16) -> Self {
        self.year = Some(year);
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    #[must_use]
    pub fn with_next(mut self, next: Vec<String>) -> Self {
        self.next = next;
        self
    }

    fn has_id(&self, id: &ExternalId) -> bool {
        match id {
            ExternalId::Imdb(v) => self.ids.imdb.as_ref() == Some(v),
            ExternalId::Tmdb(v) => self.ids.tmdb == Some(*v),
            ExternalId::Tvdb(v) => self.ids.tvdb == Some(*v),
        }
    }

    fn matches(&self, query: &LibraryQuery) -> bool {
        match query {
            LibraryQuery::External { media_type, id } => self.media_type == *media_type && self.has_id(id),
            LibraryQuery::TitleYear { media_type, title, year } => {
                self.media_type == *media_type
                    && self.title.eq_ignore_ascii_case(title)
                    && (year.is_none() || self.year == *year)
            }
        }
    }
}

/// Library backed by a map; used by tests and embedders without a media server.
pub struct InMemoryLibrary {
    items: DashMap<String, LibraryItem>,
    lookups: AtomicUsize,
}

impl InMemoryLibrary {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, item: LibraryItem) {
        self.items.insert(item.media_id.clone(), item);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// `find` calls served so far
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryLibrary {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LibraryLookup for InMemoryLibrary {
    async fn find(&self, query: &LibraryQuery) -> Result<Option<LibraryMatch>, ProviderError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        // Lowest media id wins so results don't depend on map iteration order
        let found = self
            .items
            .iter()
            .filter(|r| r.value().matches(query))
            .min_by(|a, b| a.key().cmp(b.key()))
            .map(|r| LibraryMatch {
                media_id: r.media_id.clone(),
                paths: r.paths.clone(),
            });
        Ok(found)
    }

    async fn media_files(&self, media_id: &str) -> Result<Vec<PathBuf>, ProviderError> {
        Ok(self.items.get(media_id).map(|r| r.paths.clone()).unwrap_or_default())
    }

    async fn next_episodes(&self, media_id: &str, count: usize) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .items
            .get(media_id)
            .map(|r| r.next.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }
}

/// Session provider returning whatever was last set.
#[derive(Default)]
pub struct StaticSessions {
    sessions: RwLock<Vec<SessionSnapshot>>,
    failing: AtomicBool,
}

impl StaticSessions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, sessions: Vec<SessionSnapshot>) {
        *self.sessions.write() = sessions;
    }

    pub fn clear(&self) {
        self.sessions.write().clear();
    }

    /// Make every poll fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl SessionProvider for StaticSessions {
    async fn list_sessions(&self) -> Result<Vec<SessionSnapshot>, ProviderError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ProviderError::SessionProvider("session provider unavailable".into()));
        }
        Ok(self.sessions.read().clone())
    }
}

/// List provider serving fixed lists keyed by source.
#[derive(Default)]
pub struct StaticLists {
    lists: DashMap<String, Vec<RankedItem>>,
    fetches: AtomicUsize,
    failures_left: AtomicUsize,
}

impl StaticLists {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: impl Into<String>, items: Vec<RankedItem>) {
        self.lists.insert(source.into(), items);
    }

    /// Fail the next `count` fetches.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ListProvider for StaticLists {
    async fn fetch(&self, source: &str, limit: usize) -> Result<Vec<RankedItem>, ProviderError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let failing = self
            .failures_left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProviderError::ListProvider(format!("{} unavailable", source)));
        }
        match self.lists.get(source) {
            Some(items) => Ok(items.iter().take(limit).cloned().collect()),
            None => Err(ProviderError::ListProvider(format!("unknown list {}", source))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::PlaybackState;

    fn library() -> InMemoryLibrary {
        let lib = InMemoryLibrary::new();
        lib.insert(
            LibraryItem::new("movie-1", MediaType::Movie, "Heat")
                .with_ids(ExternalIds { imdb: Some("tt0113277".into()), tmdb: Some(949), tvdb: None })
                .with_year(1995)
                .with_path("/array/movies/heat.mkv"),
        );
        lib.insert(
            LibraryItem::new("ep-1", MediaType::Series, "Pilot")
                .with_path("/array/tv/s01e01.mkv")
                .with_next(vec!["ep-2".into(), "ep-3".into(), "ep-4".into()]),
        );
        lib
    }

    #[tokio::test]
    async fn test_find_by_external_id() {
        let lib = library();
        let hit = lib
            .find(&LibraryQuery::External { media_type: MediaType::Movie, id: ExternalId::Tmdb(949) })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.media_id, "movie-1");
        assert_eq!(hit.paths, vec![PathBuf::from("/array/movies/heat.mkv")]);

        // Right id, wrong media type
        let miss = lib
            .find(&LibraryQuery::External { media_type: MediaType::Series, id: ExternalId::Tmdb(949) })
            .await
            .unwrap();
        assert!(miss.is_none());
        assert_eq!(lib.lookups(), 2);
    }

    #[tokio::test]
    async fn test_find_by_title_year() {
        let lib = library();
        let query = |year| LibraryQuery::TitleYear {
            media_type: MediaType::Movie,
            title: "heat".into(),
            year,
        };
        assert!(lib.find(&query(Some(1995))).await.unwrap().is_some());
        assert!(lib.find(&query(None)).await.unwrap().is_some());
        assert!(lib.find(&query(Some(2020))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_episodes_and_files() {
        let lib = library();
        assert_eq!(lib.next_episodes("ep-1", 2).await.unwrap(), vec!["ep-2", "ep-3"]);
        assert!(lib.next_episodes("movie-1", 2).await.unwrap().is_empty());
        assert!(lib.media_files("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_sessions_failing() {
        let sessions = StaticSessions::new();
        sessions.set(vec![SessionSnapshot::new("u", "m", PlaybackState::Playing, 0.1)]);
        assert_eq!(sessions.list_sessions().await.unwrap().len(), 1);

        sessions.set_failing(true);
        assert!(sessions.list_sessions().await.is_err());
    }

    #[tokio::test]
    async fn test_static_lists_limit_and_failures() {
        let lists = StaticLists::new();
        let items = (0..10)
            .map(|i| RankedItem::new(format!("item {}", i), ExternalIds::default()))
            .collect();
        lists.insert("trending", items);

        assert_eq!(lists.fetch("trending", 3).await.unwrap().len(), 3);

        lists.fail_next(1);
        assert!(lists.fetch("trending", 3).await.is_err());
        assert!(lists.fetch("trending", 3).await.is_ok());
        assert!(lists.fetch("missing", 3).await.is_err());
        assert_eq!(lists.fetches(), 4);
    }

    #[test]
    fn test_lookup_order() {
        let ids = ExternalIds { imdb: Some("tt1".into()), tmdb: Some(1), tvdb: Some(2) };
        assert_eq!(
            ids.lookup_order(MediaType::Movie),
            vec![ExternalId::Tmdb(1), ExternalId::Imdb("tt1".into()), ExternalId::Tvdb(2)]
        );
        assert_eq!(
            ids.lookup_order(MediaType::Series),
            vec![ExternalId::Tvdb(2), ExternalId::Imdb("tt1".into()), ExternalId::Tmdb(1)]
        );
        let partial = ExternalIds { imdb: Some("tt1".into()), ..Default::default() };
        assert_eq!(partial.preferred(MediaType::Series), Some(ExternalId::Imdb("tt1".into())));
    }
}
