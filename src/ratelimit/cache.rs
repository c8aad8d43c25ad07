//! Cached store-wide count of qualifying orders.
//!
//! The cached value expires at the end of the window it was computed in.
//! Concurrent refreshes are not coordinated; the last write wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, TimeDelta};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::counter::OrderCounter;
use super::interval::Window;
use crate::error::OrderGuardError;

/// A count together with the instant it stops being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedCount {
    pub value: u64,
    pub computed_at: DateTime<FixedOffset>,
    pub valid_until: DateTime<FixedOffset>,
}

impl CachedCount {
    pub fn is_valid_at(&self, now: DateTime<FixedOffset>) -> bool {
        now < self.valid_until
    }
}

/// Time-bounded cache of the qualifying-orders count.
pub struct CountCache {
    counter: Arc<OrderCounter>,
    entry: RwLock<Option<CachedCount>>,
    /// Set when a refresh could not run because no order types were known
    retry_pending: AtomicBool,
}

impl CountCache {
    pub fn new(counter: Arc<OrderCounter>) -> Self {
        Self {
            counter,
            entry: RwLock::new(None),
            retry_pending: AtomicBool::new(false),
        }
    }

    /// The cached count, if one exists and has not expired at `now`.
    pub fn cached(&self, now: DateTime<FixedOffset>) -> Option<u64> {
        let entry = *self.entry.read();
        entry
            .filter(|entry| entry.is_valid_at(now))
            .map(|entry| entry.value)
    }

    /// The raw entry, expired or not.
    pub fn entry(&self) -> Option<CachedCount> {
        *self.entry.read()
    }

    /// Return the cached count, recomputing it first if it has expired.
    pub async fn get_or_refresh(&self, window: &Window, now: DateTime<FixedOffset>, limit: i64) -> u64 {
        if let Some(count) = self.cached(now) {
            return count;
        }
        self.refresh(window, now, limit).await
    }

    /// Recompute the count and store it until the end of `window`.
    ///
    /// When counting fails the previous unexpired value (or 0) is returned and
    /// the entry is left alone. An empty order-type registry additionally
    /// marks a retry as pending.
    pub async fn refresh(&self, window: &Window, now: DateTime<FixedOffset>, limit: i64) -> u64 {
        match self.counter.count_qualifying_orders(window, limit).await {
            Ok(count) => {
                let ttl = window.seconds_until_end(now);
                let entry = CachedCount {
                    value: count,
                    computed_at: now,
                    valid_until: now + TimeDelta::seconds(ttl),
                };
                *self.entry.write() = Some(entry);
                self.retry_pending.store(false, Ordering::SeqCst);

                debug!(count = count, ttl_secs = ttl, "Refreshed qualifying order count");
                count
            }
            Err(OrderGuardError::EmptyOrderTypes) => {
                warn!("No order types registered yet, deferring order count refresh");
                self.retry_pending.store(true, Ordering::SeqCst);
                self.cached(now).unwrap_or(0)
            }
            Err(e) => {
                warn!(error = %e, "Failed to refresh qualifying order count");
                self.cached(now).unwrap_or(0)
            }
        }
    }

    /// Drop the cached value.
    pub fn invalidate(&self) {
        if self.entry.write().take().is_some() {
            info!("Cached order count cleared");
        }
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending.load(Ordering::SeqCst)
    }

    /// Clear the pending-retry flag, returning whether it was set.
    pub fn take_retry(&self) -> bool {
        self.retry_pending.swap(false, Ordering::SeqCst)
    }
}
