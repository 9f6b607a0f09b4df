// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue backpressure.
//!
//! Depth is compared against `max_queue_depth`. At saturation ordinary
//! producers are turned away with
//! [`QueueError::QueueSaturated`](crate::error::QueueError::QueueSaturated);
//! watch and eviction producers may displace lower-priority pending work.
//!
//! # Example
//!
//! ```
//! use cache_engine::QueuePressure;
//!
//! let level = QueuePressure::from_depth(10, 100);
//! assert_eq!(level, QueuePressure::Normal);
//! assert!(level.accepts_ordinary());
//!
//! let level = QueuePressure::from_depth(75, 100);
//! assert_eq!(level, QueuePressure::Elevated);
//! assert!(level.accepts_ordinary()); // still accepts, but worth a warning
//!
//! let level = QueuePressure::from_depth(100, 100);
//! assert_eq!(level, QueuePressure::Saturated);
//! assert!(!level.accepts_ordinary());
//! ```

use serde::Serialize;

/// Queue pressure level.
///
/// - **Normal** (< 70%): accept everything
/// - **Elevated** (70-100%): accept, log and export the level
/// - **Saturated** (≥ 100%): reject ordinary producers, pre-empt for watch and eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePressure {
    Normal = 0,
    Elevated = 1,
    Saturated = 2,
}

impl QueuePressure {
    /// Fraction of `max_queue_depth` where the level turns elevated
    pub const ELEVATED_AT: f64 = 0.70;

    #[must_use]
    pub fn from_depth(depth: usize, max_depth: usize) -> Self {
        if max_depth == 0 || depth >= max_depth {
            return Self::Saturated;
        }
        match depth as f64 / max_depth as f64 {
            p if p < Self::ELEVATED_AT => Self::Normal,
            _ => Self::Elevated,
        }
    }

    /// Whether producers without pre-emption rights are admitted
    #[must_use]
    pub fn accepts_ordinary(&self) -> bool {
        !matches!(self, Self::Saturated)
    }

    /// Gauge value for the metrics exporter
    #[must_use]
    pub fn as_gauge(&self) -> f64 {
        *self as u8 as f64
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Elevated => "Elevated - queue filling up",
            Self::Saturated => "Saturated - ordinary enqueues rejected",
        }
    }
}

impl std::fmt::Display for QueuePressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
