// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Two uses in the engine:
//! - transfer commands failing with a plain I/O error are re-queued with a
//!   `not_before` computed by [`RetryPolicy::delay_for_attempt`], so the worker
//!   slot is free while the command waits;
//! - provider calls (list fetches) are wrapped in [`retry`] for a few quick
//!   attempts before the cycle gives up.
//!
//! # Example
//!
//! ```
//! use cache_engine::RetryPolicy;
//! use std::time::Duration;
//!
//! let transfer = RetryPolicy::transfer();
//! assert_eq!(transfer.max_attempts, 3);
//! assert_eq!(transfer.delay_for_attempt(1), Duration::from_secs(1));
//! assert_eq!(transfer.delay_for_attempt(2), Duration::from_secs(2));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Exponential backoff with a cap on total attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transfer()
    }
}

impl RetryPolicy {
    /// File transfers: 3 attempts, 1s then 2s backoff.
    #[must_use]
    pub fn transfer() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    /// Provider calls inside one cycle: fail fast, the next cycle retries anyway.
    #[must_use]
    pub fn provider() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[must_use]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay before attempt `failed_attempts + 1`, after `failed_attempts` failures.
    #[must_use]
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
        let nanos = self.initial_delay.as_nanos() as f64 * self.factor.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts` so far.
    #[must_use]
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Run `operation` until it succeeds or the policy's attempts run out.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if !policy.allows_another(attempts) {
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempts);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, policy.max_attempts, err, delay
                );
                sleep(delay).await;
            }
        }
    }
}
