// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a (user, media) pair is in its viewing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Playing,
    Paused,
    Completed,
}

impl SessionState {
    /// Playing or paused.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        matches!(self, Self::Playing | Self::Paused)
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchKey {
    pub user_id: String,
    pub media_id: String,
}

impl WatchKey {
    pub fn new(user_id: impl Into<String>, media_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            media_id: media_id.into(),
        }
    }
}

/// Tracked state for one (user, media) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchState {
    pub user_id: String,
    pub media_id: String,
    pub session_state: SessionState,
    pub progress_fraction: f64,
    /// Last time state or progress changed (epoch millis)
    pub last_event_at: i64,
    /// Last poll that reported this session
    pub last_seen_at: i64,
    /// When `session_state` was entered
    pub state_since: i64,
}

impl WatchState {
    pub(crate) fn new(key: &WatchKey, now: i64) -> Self {
        Self {
            user_id: key.user_id.clone(),
            media_id: key.media_id.clone(),
            session_state: SessionState::Idle,
            progress_fraction: 0.0,
            last_event_at: now,
            last_seen_at: now,
            state_since: now,
        }
    }

    pub(crate) fn enter(&mut self, to: SessionState, now: i64) -> Option<Transition> {
        if self.session_state == to {
            return None;
        }
        let transition = Transition {
            user_id: self.user_id.clone(),
            media_id: self.media_id.clone(),
            from: self.session_state,
            to,
            at: now,
        };
        self.session_state = to;
        self.state_since = now;
        self.last_event_at = now;
        Some(transition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub user_id: String,
    pub media_id: String,
    pub from: SessionState,
    pub to: SessionState,
    pub at: i64,
}
