// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-category bounded worker pools.
//!
//! One semaphore per [`TransferCategory`]. A command holds one [`PoolSlot`]
//! for its whole execution. Shrinking a pool never interrupts running work:
//! permits that are checked out when the limit drops are retired as their
//! slots are released.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use crate::command::TransferCategory;
use crate::config::ConcurrencyLimits;

/// Snapshot of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolUtilization {
    pub category: TransferCategory,
    pub limit: usize,
    pub in_use: usize,
}

struct Pools {
    semaphores: [Arc<Semaphore>; 4],
    limits: Mutex<[usize; 4]>,
    /// Permits still to retire after a shrink
    debt: [AtomicUsize; 4],
    in_use: [AtomicUsize; 4],
}

#[derive(Clone)]
pub struct WorkerPools {
    pools: Arc<Pools>,
}

/// A checked-out worker slot; released on drop.
pub struct PoolSlot {
    category: TransferCategory,
    permit: Option<OwnedSemaphorePermit>,
    pools: Arc<Pools>,
}

impl PoolSlot {
    pub fn category(&self) -> TransferCategory {
        self.category
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        let i = self.category.index();
        let in_use = self.pools.in_use[i].fetch_sub(1, Ordering::SeqCst) - 1;

        let retire = self.pools.debt[i]
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
            .is_ok();
        if let Some(permit) = self.permit.take() {
            if retire {
                permit.forget();
            }
        }
        crate::metrics::set_pool_in_use(self.category, in_use, self.pools.limits.lock()[i]);
    }
}

impl WorkerPools {
    #[must_use]
    pub fn new(limits: &ConcurrencyLimits) -> Self {
        let sizes = TransferCategory::ALL.map(|c| limits.for_category(c));
        Self {
            pools: Arc::new(Pools {
                semaphores: sizes.map(|n| Arc::new(Semaphore::new(n))),
                limits: Mutex::new(sizes),
                debt: Default::default(),
                in_use: Default::default(),
            }),
        }
    }

    /// Take a slot if the pool has one free. Never waits.
    pub fn try_acquire(&self, category: TransferCategory) -> Option<PoolSlot> {
        let i = category.index();
        let permit = self.pools.semaphores[i].clone().try_acquire_owned().ok()?;
        let in_use = self.pools.in_use[i].fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::set_pool_in_use(category, in_use, self.pools.limits.lock()[i]);
        Some(PoolSlot {
            category,
            permit: Some(permit),
            pools: self.pools.clone(),
        })
    }

    #[must_use]
    pub fn has_capacity(&self, category: TransferCategory) -> bool {
        self.pools.semaphores[category.index()].available_permits() > 0
    }

    /// Apply new limits (clamped to `1..=10`) without touching running work.
    pub fn resize(&self, limits: &ConcurrencyLimits) {
        let mut current = self.pools.limits.lock();
        for category in TransferCategory::ALL {
            let i = category.index();
            let old = current[i];
            let new = limits.for_category(category);
            if new == old {
                continue;
            }

            let semaphore = &self.pools.semaphores[i];
            if new > old {
                let mut grow = new - old;
                // Cancel outstanding retirements first
                let owed = self.pools.debt[i]
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(grow)))
                    .unwrap_or(0);
                grow -= owed.min(grow);
                if grow > 0 {
                    semaphore.add_permits(grow);
                }
            } else {
                let shrink = old - new;
                let forgotten = semaphore.forget_permits(shrink);
                self.pools.debt[i].fetch_add(shrink - forgotten, Ordering::SeqCst);
            }

            info!(%category, old, new, "Worker pool resized");
            current[i] = new;
        }
    }

    #[must_use]
    pub fn limit(&self, category: TransferCategory) -> usize {
        self.pools.limits.lock()[category.index()]
    }

    #[must_use]
    pub fn in_use(&self, category: TransferCategory) -> usize {
        self.pools.in_use[category.index()].load(Ordering::SeqCst)
    }

    /// No slot checked out in any pool.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pools.in_use.iter().all(|n| n.load(Ordering::SeqCst) == 0)
    }

    #[must_use]
    pub fn utilization(&self) -> Vec<PoolUtilization> {
        TransferCategory::ALL
            .iter()
            .map(|&category| PoolUtilization {
                category,
                limit: self.limit(category),
                in_use: self.in_use(category),
            })
            .collect()
    }
}
