// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::MediaType;
use crate::error::ProviderError;

/// One identifier from an external catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", content = "id", rename_all = "snake_case")]
pub enum ExternalId {
    Imdb(String),
    Tmdb(u64),
    Tvdb(u64),
}

/// Every id a list item carries; providers fill in what they know.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imdb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmdb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tvdb: Option<u64>,
}

impl ExternalIds {
    /// Ids in lookup order for `media_type`: primary, imdb, then the other numeric id.
    #[must_use]
    pub fn lookup_order(&self, media_type: MediaType) -> Vec<ExternalId> {
        let tmdb = self.tmdb.map(ExternalId::Tmdb);
        let tvdb = self.tvdb.map(ExternalId::Tvdb);
        let imdb = self.imdb.clone().map(ExternalId::Imdb);
        let ordered = match media_type {
            MediaType::Movie => [tmdb, imdb, tvdb],
            MediaType::Series => [tvdb, imdb, tmdb],
        };
        ordered.into_iter().flatten().collect()
    }

    /// The id shown for a candidate (primary if known).
    #[must_use]
    pub fn preferred(&self, media_type: MediaType) -> Option<ExternalId> {
        self.lookup_order(media_type).into_iter().next()
    }
}

/// An entry of an externally ranked list, in rank order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedItem {
    pub ids: ExternalIds,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    /// Most recent relevant date (release or last air date), epoch millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<i64>,
}

impl RankedItem {
    pub fn new(title: impl Into<String>, ids: ExternalIds) -> Self {
        Self {
            ids,
            title: title.into(),
            year: None,
            released_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryQuery {
    External { media_type: MediaType, id: ExternalId },
    TitleYear { media_type: MediaType, title: String, year: Option<u16> },
}

/// A library item found for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryMatch {
    pub media_id: String,
    /// Array-tier files belonging to the item
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    Completed,
}

/// One live playback session as reported by the media server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub user_id: String,
    pub media_id: String,
    pub state: PlaybackState,
    /// 0.0 ..= 1.0
    pub progress_fraction: f64,
}

impl SessionSnapshot {
    pub fn new(user_id: impl Into<String>, media_id: impl Into<String>, state: PlaybackState, progress_fraction: f64) -> Self {
        Self {
            user_id: user_id.into(),
            media_id: media_id.into(),
            state,
            progress_fraction,
        }
    }
}

/// The media library: which local files belong to which item.
#[async_trait]
pub trait LibraryLookup: Send + Sync {
    /// Resolve an external id or a title+year to a local item.
    async fn find(&self, query: &LibraryQuery) -> Result<Option<LibraryMatch>, ProviderError>;

    /// Files belonging to a library item; empty when unknown.
    async fn media_files(&self, media_id: &str) -> Result<Vec<PathBuf>, ProviderError>;

    /// Media ids of the `count` episodes following `media_id`.
    /// Default: the library has no episode ordering.
    async fn next_episodes(&self, media_id: &str, count: usize) -> Result<Vec<String>, ProviderError> {
        let _ = (media_id, count);
        Ok(Vec::new())
    }
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<SessionSnapshot>, ProviderError>;
}

#[async_trait]
pub trait ListProvider: Send + Sync {
    /// At most `limit` items of `source`, best rank first.
    async fn fetch(&self, source: &str, limit: usize) -> Result<Vec<RankedItem>, ProviderError>;
}
