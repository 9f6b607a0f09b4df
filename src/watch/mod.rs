// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Watch-state monitor.
//!
//! Each poll of the session provider is diffed against the stored state per
//! (user, media):
//!
//! ```text
//!   idle ──▶ playing ◀──▶ paused
//!    ▲          │            │
//!    │          ▼            ▼
//!    └──── completed ◀───────┘     (progress ≥ threshold or reported)
//!       (after cooldown)
//! ```
//!
//! Leaving idle asks for the media to be cached. Reaching completed can
//! schedule a delayed evict, dropped again if the media becomes active before
//! it is due. Sessions that stop appearing time out after the heartbeat
//! window. The monitor is synchronous and clock-free: callers pass `now`.

mod state;

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, info};

use crate::config::CacheEngineConfig;
use crate::providers::{PlaybackState, SessionSnapshot};

pub use state::{SessionState, Transition, WatchKey, WatchState};

/// Timing and behaviour knobs, in millis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchSettings {
    pub heartbeat_timeout_ms: i64,
    pub cooldown_ms: i64,
    pub purge_after_ms: i64,
    pub completion_threshold: f64,
    pub remove_after_completion: bool,
    pub completion_evict_delay_ms: i64,
}

impl WatchSettings {
    #[must_use]
    pub fn from_config(config: &CacheEngineConfig) -> Self {
        let ms = |secs: u64| (secs as i64).saturating_mul(1000);
        Self {
            heartbeat_timeout_ms: ms(config.heartbeat_timeout_secs),
            cooldown_ms: ms(config.cooldown_secs),
            purge_after_ms: ms(config.state_purge_secs),
            completion_threshold: config.completion_threshold.clamp(0.0, 1.0),
            remove_after_completion: config.remove_after_completion,
            completion_evict_delay_ms: ms(config.completion_evict_delay_secs),
        }
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self::from_config(&CacheEngineConfig::default())
    }
}

/// Something the engine should act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTrigger {
    /// Media became active: cache it (and the next episodes)
    Cache { user_id: String, media_id: String },
    /// Viewing finished; `evict_at` is set when a delayed evict was scheduled
    Completed {
        user_id: String,
        media_id: String,
        evict_at: Option<i64>,
    },
    /// A scheduled evict was dropped because the media is active again
    EvictCancelled { media_id: String },
}

/// Result of one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub transitions: Vec<Transition>,
    pub triggers: Vec<WatchTrigger>,
    /// States dropped after the purge window
    pub purged: usize,
}

pub struct WatchMonitor {
    settings: WatchSettings,
    states: BTreeMap<WatchKey, WatchState>,
    /// media id → evict due at
    scheduled_evictions: HashMap<String, i64>,
}

impl WatchMonitor {
    #[must_use]
    pub fn new(settings: WatchSettings) -> Self {
        Self {
            settings,
            states: BTreeMap::new(),
            scheduled_evictions: HashMap::new(),
        }
    }

    pub fn set_settings(&mut self, settings: WatchSettings) {
        self.settings = settings;
    }

    /// Diff one poll against the stored states.
    pub fn observe(&mut self, sessions: &[SessionSnapshot], now: i64) -> Observation {
        let mut observation = Observation::default();
        let mut seen = HashSet::new();

        for session in sessions {
            let key = WatchKey::new(&session.user_id, &session.media_id);
            if !seen.insert(key.clone()) {
                // Two sessions for the same pair: first one wins this poll
                continue;
            }
            self.apply_session(key, session, now, &mut observation);
        }

        self.expire(&seen, now, &mut observation);

        if !observation.transitions.is_empty() {
            debug!(
                transitions = observation.transitions.len(),
                triggers = observation.triggers.len(),
                "Watch states updated"
            );
        }
        crate::metrics::set_watch_states(self.watching_count(), self.states.len());
        observation
    }

    /// Scheduled evictions that are due and whose media nobody is watching.
    pub fn due_evictions(&mut self, now: i64) -> Vec<String> {
        let active = self.active_media();
        let mut due: Vec<String> = self
            .scheduled_evictions
            .iter()
            .filter(|(media, at)| **at <= now && !active.contains(*media))
            .map(|(media, _)| media.clone())
            .collect();
        due.sort();
        for media in &due {
            self.scheduled_evictions.remove(media);
        }
        due
    }

    /// Put a due eviction back (the enqueue was refused).
    pub fn reschedule(&mut self, media_id: impl Into<String>, at: i64) {
        self.scheduled_evictions.insert(media_id.into(), at);
    }

    /// Media with a non-idle state for any user.
    #[must_use]
    pub fn active_media(&self) -> HashSet<String> {
        self.states
            .values()
            .filter(|s| s.session_state != SessionState::Idle)
            .map(|s| s.media_id.clone())
            .collect()
    }

    #[must_use]
    pub fn states(&self) -> Vec<WatchState> {
        self.states.values().cloned().collect()
    }

    #[must_use]
    pub fn get(&self, user_id: &str, media_id: &str) -> Option<&WatchState> {
        self.states.get(&WatchKey::new(user_id, media_id))
    }

    #[must_use]
    pub fn scheduled_eviction(&self, media_id: &str) -> Option<i64> {
        self.scheduled_evictions.get(media_id).copied()
    }

    fn watching_count(&self) -> usize {
        self.states.values().filter(|s| s.session_state.is_watching()).count()
    }

    fn apply_session(&mut self, key: WatchKey, session: &SessionSnapshot, now: i64, obs: &mut Observation) {
        let settings = self.settings;
        let progress = session.progress_fraction.clamp(0.0, 1.0);
        let reached = progress >= settings.completion_threshold;
        let desired = match session.state {
            PlaybackState::Completed => SessionState::Completed,
            _ if reached => SessionState::Completed,
            PlaybackState::Playing => SessionState::Playing,
            PlaybackState::Paused => SessionState::Paused,
            PlaybackState::Stopped => SessionState::Idle,
        };

        let state = self
            .states
            .entry(key.clone())
            .or_insert_with(|| WatchState::new(&key, now));
        state.last_seen_at = now;
        if (state.progress_fraction - progress).abs() > f64::EPSILON {
            state.progress_fraction = progress;
            state.last_event_at = now;
        }

        let from = state.session_state;
        let Some(transition) = state.enter(desired, now) else {
            return;
        };
        obs.transitions.push(transition);

        match (from, desired) {
            (SessionState::Idle | SessionState::Completed, SessionState::Playing | SessionState::Paused) => {
                info!(user = %key.user_id, media = %key.media_id, "Playback started");
                if self.scheduled_evictions.remove(&key.media_id).is_some() {
                    info!(media = %key.media_id, "Scheduled eviction dropped, media active again");
                    obs.triggers.push(WatchTrigger::EvictCancelled { media_id: key.media_id.clone() });
                }
                obs.triggers.push(WatchTrigger::Cache {
                    user_id: key.user_id,
                    media_id: key.media_id,
                });
            }
            (_, SessionState::Completed) => {
                let evict_at = self.schedule_completion_evict(&key.media_id, now);
                info!(user = %key.user_id, media = %key.media_id, ?evict_at, "Playback completed");
                obs.triggers.push(WatchTrigger::Completed {
                    user_id: key.user_id,
                    media_id: key.media_id,
                    evict_at,
                });
            }
            _ => {}
        }
    }

    fn schedule_completion_evict(&mut self, media_id: &str, now: i64) -> Option<i64> {
        if !self.settings.remove_after_completion {
            return None;
        }
        let at = now.saturating_add(self.settings.completion_evict_delay_ms);
        let due = self.scheduled_evictions.entry(media_id.to_string()).or_insert(at);
        Some(*due)
    }

    /// Timeouts for sessions this poll did not report.
    fn expire(&mut self, seen: &HashSet<WatchKey>, now: i64, obs: &mut Observation) {
        let settings = self.settings;
        let mut completed = Vec::new();

        for (key, state) in self.states.iter_mut() {
            if seen.contains(key) {
                continue;
            }
            match state.session_state {
                SessionState::Playing | SessionState::Paused
                    if now - state.last_seen_at > settings.heartbeat_timeout_ms =>
                {
                    let to = if state.progress_fraction >= settings.completion_threshold {
                        completed.push(key.clone());
                        SessionState::Completed
                    } else {
                        SessionState::Idle
                    };
                    debug!(user = %key.user_id, media = %key.media_id, %to, "Session heartbeat timed out");
                    obs.transitions.extend(state.enter(to, now));
                }
                SessionState::Completed if now - state.state_since >= settings.cooldown_ms => {
                    obs.transitions.extend(state.enter(SessionState::Idle, now));
                }
                _ => {}
            }
        }

        for key in completed {
            let evict_at = self.schedule_completion_evict(&key.media_id, now);
            obs.triggers.push(WatchTrigger::Completed {
                user_id: key.user_id,
                media_id: key.media_id,
                evict_at,
            });
        }

        let before = self.states.len();
        self.states.retain(|key, state| {
            seen.contains(key)
                || state.session_state != SessionState::Idle
                || now - state.last_event_at < settings.purge_after_ms
        });
        obs.purged = before - self.states.len();
    }
}
