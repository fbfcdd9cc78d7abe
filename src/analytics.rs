//! Throughput analytics.
//!
//! Tracks a running total of completed units of work plus a two-bucket
//! sliding window of per-second counts:
//! - `RateWindow`: owned, single-threaded counter (`&mut self`)
//! - `RateCounter`: the same window behind a read/write lock, shareable
//!   between concurrent workers
//!
//! The reported rate is the count of the *oldest* bucket. That bucket
//! belongs to a second that has fully elapsed, so its count no longer
//! changes, while the newest bucket is still accumulating. For the first
//! second or two of a run the oldest bucket is a zeroed placeholder and the
//! rate reads 0.

use std::sync::{PoisonError, RwLock};

/// Number of per-second buckets tracked.
pub const WINDOW_LEN: usize = 2;

/// A Unix timestamp (seconds) and the units counted during it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bucket {
    pub ts: i64,
    pub count: u64,
}

/// Running total plus per-second window, for single-threaded use.
#[derive(Debug, Clone, Default)]
pub struct RateWindow {
    total: u64,
    buckets: [Bucket; WINDOW_LEN],
}

impl RateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one unit of work completed at `unix_time`.
    ///
    /// Returns the new total and the per-second rate.
    pub fn incr_for_time(&mut self, unix_time: i64) -> (u64, u64) {
        self.total += 1;

        let newest = WINDOW_LEN - 1;
        if self.buckets[newest].ts != unix_time {
            // Drop the oldest, open a bucket for the new second
            self.buckets.rotate_left(1);
            self.buckets[newest] = Bucket {
                ts: unix_time,
                count: 0,
            };
        }
        self.buckets[newest].count += 1;

        (self.total, self.rate())
    }

    /// Total units counted so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Last complete per-second rate.
    pub fn rate(&self) -> u64 {
        self.buckets[0].count
    }

    /// Window contents, oldest first.
    #[cfg(test)]
    pub fn buckets(&self) -> &[Bucket; WINDOW_LEN] {
        &self.buckets
    }
}

/// Thread-safe [`RateWindow`].
#[derive(Debug, Default)]
pub struct RateCounter {
    window: RwLock<RateWindow>,
}

impl RateCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_for_time(&self, unix_time: i64) -> (u64, u64) {
        self.window
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .incr_for_time(unix_time)
    }

    pub fn total(&self) -> u64 {
        self.window
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .total()
    }

    pub fn rate(&self) -> u64 {
        self.window
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rate()
    }
}

/// Current Unix time in whole seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
