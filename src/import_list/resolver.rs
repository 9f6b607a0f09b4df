// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{FillMode, ImportListConfig, MediaType};
use crate::error::ProviderError;
use crate::metrics;
use crate::providers::{ExternalId, LibraryLookup, LibraryMatch, LibraryQuery, ListProvider, RankedItem};
use crate::resilience::retry::{retry, RetryPolicy};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// A ranked list item matched to a local library item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportListCandidate {
    pub external_id: Option<ExternalId>,
    pub title: String,
    pub year: Option<u16>,
    pub list_id: String,
    /// 1-based position in the ranked list
    pub rank_position: usize,
    /// First file of the match
    pub matched_local_path: Option<PathBuf>,
    pub media_id: Option<String>,
    /// Every file of the match
    pub matched_paths: Vec<PathBuf>,
}

/// Outcome of resolving one list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    /// Matched candidates in rank order
    pub candidates: Vec<ImportListCandidate>,
    /// Ranked positions looked at
    pub examined: usize,
    /// Positions dropped by the air-date filter
    pub filtered: usize,
    /// Items the provider returned
    pub fetched: usize,
}

/// Turns ranked external lists into local caching candidates.
pub struct ImportListResolver {
    lists: Arc<dyn ListProvider>,
    library: Arc<dyn LibraryLookup>,
    retry_policy: RetryPolicy,
}

impl ImportListResolver {
    pub fn new(lists: Arc<dyn ListProvider>, library: Arc<dyn LibraryLookup>) -> Self {
        Self {
            lists,
            library,
            retry_policy: RetryPolicy::provider(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Items `list` wants fetched.
    fn fetch_limit(list: &ImportListConfig) -> usize {
        match list.fill_mode {
            FillMode::Strict => list.count.min(list.fill_limit),
            FillMode::Fill => list.fill_limit,
        }
    }

    /// Fetch `list`, filter it and match it against the library.
    ///
    /// Exhausting the list or `fill_limit` before `count` matches is a valid
    /// partial result. A library error aborts the pass.
    pub async fn resolve(&self, list: &ImportListConfig, now_ms: i64) -> Result<Resolution, ProviderError> {
        let limit = Self::fetch_limit(list);
        let mut resolution = Resolution::default();
        if limit == 0 || list.count == 0 {
            return Ok(resolution);
        }

        let op = format!("fetch list {}", list.id);
        let items = retry(&op, &self.retry_policy, || self.lists.fetch(&list.source, limit))
            .await
            .inspect_err(|_| metrics::record_provider_error("list"))?;
        resolution.fetched = items.len();

        let cutoff = (list.air_date_within_days > 0)
            .then(|| now_ms.saturating_sub(i64::from(list.air_date_within_days) * DAY_MS));

        for (index, item) in items.into_iter().take(limit).enumerate() {
            let position = index + 1;
            if resolution.candidates.len() >= list.count {
                break;
            }
            resolution.examined += 1;

            if let (Some(cutoff), Some(released)) = (cutoff, item.released_at) {
                if released < cutoff {
                    resolution.filtered += 1;
                    continue;
                }
            }

            match self.match_item(list.media_type, &item).await? {
                Some(found) => {
                    debug!(list = %list.id, position, media_id = %found.media_id, "List item matched");
                    resolution.candidates.push(candidate(list, position, item, found));
                }
                None => debug!(list = %list.id, position, title = %item.title, "List item not in library"),
            }
        }

        if resolution.candidates.len() < list.count {
            debug!(
                list = %list.id,
                matched = resolution.candidates.len(),
                wanted = list.count,
                examined = resolution.examined,
                "Import list partially filled"
            );
        }
        Ok(resolution)
    }

    /// External ids in lookup order, then title+year. First hit wins.
    async fn match_item(&self, media_type: MediaType, item: &RankedItem) -> Result<Option<LibraryMatch>, ProviderError> {
        let mut queries: Vec<LibraryQuery> = item
            .ids
            .lookup_order(media_type)
            .into_iter()
            .map(|id| LibraryQuery::External { media_type, id })
            .collect();
        if !item.title.is_empty() {
            queries.push(LibraryQuery::TitleYear {
                media_type,
                title: item.title.clone(),
                year: item.year,
            });
        }

        for query in &queries {
            let found = self.library.find(query).await.inspect_err(|e| {
                metrics::record_provider_error("library");
                warn!(error = %e, "Library lookup failed");
            })?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }
}

fn candidate(list: &ImportListConfig, position: usize, item: RankedItem, found: LibraryMatch) -> ImportListCandidate {
    ImportListCandidate {
        external_id: item.ids.preferred(list.media_type),
        title: item.title,
        year: item.year,
        list_id: list.id.clone(),
        rank_position: position,
        matched_local_path: found.paths.first().cloned(),
        media_id: Some(found.media_id),
        matched_paths: found.paths,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ExternalIds, InMemoryLibrary, LibraryItem, StaticLists};

    /// 25 ranked movies; the library holds the ones at `matched` positions.
    fn fixture(matched: &[usize]) -> (Arc<StaticLists>, Arc<InMemoryLibrary>) {
        let lists = Arc::new(StaticLists::new());
        let library = Arc::new(InMemoryLibrary::new());
        let items = (1..=25u64)
            .map(|pos| {
                RankedItem::new(format!("Movie {}", pos), ExternalIds { tmdb: Some(pos), ..Default::default() })
            })
            .collect();
        lists.insert("trending", items);
        for &pos in matched {
            library.insert(
                LibraryItem::new(format!("movie-{}", pos), MediaType::Movie, format!("Movie {}", pos))
                    .with_ids(ExternalIds { tmdb: Some(pos as u64), ..Default::default() })
                    .with_path(format!("/array/movies/{}.mkv", pos)),
            );
        }
        (lists, library)
    }

    fn resolver(lists: Arc<StaticLists>, library: Arc<InMemoryLibrary>) -> ImportListResolver {
        ImportListResolver::new(lists, library).with_retry_policy(RetryPolicy::test())
    }

    fn list(mode: FillMode) -> ImportListConfig {
        let mut list = ImportListConfig::new("trending", "trending");
        list.count = 5;
        list.fill_limit = 100;
        list.fill_mode = mode;
        list
    }

    fn positions(resolution: &Resolution) -> Vec<usize> {
        resolution.candidates.iter().map(|c| c.rank_position).collect()
    }

    #[tokio::test]
    async fn test_fill_mode_scans_past_misses() {
        let (lists, library) = fixture(&[2, 7, 19]);
        let resolution = resolver(lists, library).resolve(&list(FillMode::Fill), 0).await.unwrap();

        assert_eq!(positions(&resolution), vec![2, 7, 19]);
        assert_eq!(resolution.examined, 25);
        let first = &resolution.candidates[0];
        assert_eq!(first.external_id, Some(ExternalId::Tmdb(2)));
        assert_eq!(first.matched_local_path, Some(PathBuf::from("/array/movies/2.mkv")));
        assert_eq!(first.list_id, "trending");
    }

    #[tokio::test]
    async fn test_strict_mode_examines_first_count_positions() {
        let (lists, library) = fixture(&[2, 7, 19]);
        let resolution = resolver(lists, library).resolve(&list(FillMode::Strict), 0).await.unwrap();

        assert_eq!(positions(&resolution), vec![2]);
        assert_eq!(resolution.examined, 5);
    }

    #[tokio::test]
    async fn test_fill_stops_at_count_and_fill_limit() {
        let (lists, library) = fixture(&[1, 2, 3, 4, 5, 6, 7]);
        let resolution = resolver(lists.clone(), library.clone())
            .resolve(&list(FillMode::Fill), 0)
            .await
            .unwrap();
        assert_eq!(positions(&resolution), vec![1, 2, 3, 4, 5]);
        assert_eq!(resolution.examined, 5);

        let (lists, library) = fixture(&[2, 7, 19]);
        let mut limited = list(FillMode::Fill);
        limited.fill_limit = 10;
        let resolution = resolver(lists, library).resolve(&limited, 0).await.unwrap();
        assert_eq!(positions(&resolution), vec![2, 7]);
        assert_eq!(resolution.examined, 10);
    }

    #[tokio::test]
    async fn test_air_date_filter_keeps_unknown_dates() {
        let lists = Arc::new(StaticLists::new());
        let library = Arc::new(InMemoryLibrary::new());
        let now = 400 * DAY_MS;
        let mut old = RankedItem::new("Old", ExternalIds { tmdb: Some(1), ..Default::default() });
        old.released_at = Some(now - 60 * DAY_MS);
        let mut fresh = RankedItem::new("Fresh", ExternalIds { tmdb: Some(2), ..Default::default() });
        fresh.released_at = Some(now - 5 * DAY_MS);
        let undated = RankedItem::new("Undated", ExternalIds { tmdb: Some(3), ..Default::default() });
        lists.insert("new", vec![old, fresh, undated]);
        for id in 1..=3u64 {
            library.insert(
                LibraryItem::new(format!("m{}", id), MediaType::Movie, format!("t{}", id))
                    .with_ids(ExternalIds { tmdb: Some(id), ..Default::default() })
                    .with_path(format!("/array/{}.mkv", id)),
            );
        }

        let mut config = ImportListConfig::new("new", "new");
        config.air_date_within_days = 30;
        let resolution = resolver(lists, library).resolve(&config, now).await.unwrap();

        assert_eq!(positions(&resolution), vec![2, 3]);
        assert_eq!(resolution.filtered, 1);
    }

    #[tokio::test]
    async fn test_match_falls_back_to_imdb_then_title() {
        let lists = Arc::new(StaticLists::new());
        let library = Arc::new(InMemoryLibrary::new());
        library.insert(
            LibraryItem::new("by-imdb", MediaType::Movie, "Something")
                .with_ids(ExternalIds { imdb: Some("tt42".into()), ..Default::default() })
                .with_path("/array/a.mkv"),
        );
        library.insert(
            LibraryItem::new("by-title", MediaType::Movie, "Alien")
                .with_year(1979)
                .with_path("/array/b.mkv"),
        );
        let mut by_title = RankedItem::new("ALIEN", ExternalIds { tmdb: Some(348), ..Default::default() });
        by_title.year = Some(1979);
        lists.insert(
            "mixed",
            vec![
                RankedItem::new("x", ExternalIds { tmdb: Some(9), imdb: Some("tt42".into()), tvdb: None }),
                by_title,
            ],
        );

        let config = ImportListConfig::new("mixed", "mixed");
        let resolution = resolver(lists, library).resolve(&config, 0).await.unwrap();
        let media: Vec<_> = resolution.candidates.iter().map(|c| c.media_id.clone().unwrap()).collect();
        assert_eq!(media, vec!["by-imdb", "by-title"]);
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_is_retried() {
        let (lists, library) = fixture(&[2]);
        lists.fail_next(1);
        let resolution = resolver(lists.clone(), library).resolve(&list(FillMode::Fill), 0).await.unwrap();
        assert_eq!(positions(&resolution), vec![2]);
        assert_eq!(lists.fetches(), 2);
    }

    #[tokio::test]
    async fn test_persistent_fetch_failure_is_reported() {
        let (lists, library) = fixture(&[2]);
        lists.fail_next(10);
        let err = resolver(lists, library).resolve(&list(FillMode::Fill), 0).await.unwrap_err();
        assert!(matches!(err, ProviderError::ListProvider(_)));
    }
}
