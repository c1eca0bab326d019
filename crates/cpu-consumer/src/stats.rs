//! Lock/unlock counters for a single consumer.
//!
//! Counters are bumped with relaxed atomics outside any ordering guarantees;
//! a [`ConsumerStatsSnapshot`] is a best-effort view, not a consistent cut.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ConsumerStats {
    flex_locks: AtomicU64,
    converted_locks: AtomicU64,
    plain_locks: AtomicU64,
    unlocks: AtomicU64,
    exhausted: AtomicU64,
    empty: AtomicU64,
    failed_locks: AtomicU64,
    peak_locked: AtomicU64,
}

/// How a successful lock produced its CPU view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockPath {
    Flex,
    Converted,
    Plain,
}

impl ConsumerStats {
    pub(crate) fn record_lock(&self, path: LockPath, locked_now: usize) {
        let counter = match path {
            LockPath::Flex => &self.flex_locks,
            LockPath::Converted => &self.converted_locks,
            LockPath::Plain => &self.plain_locks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.peak_locked
            .fetch_max(locked_now as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_unlock(&self) {
        self.unlocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_empty(&self) {
        self.empty.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_lock(&self) {
        self.failed_locks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            flex_locks: self.flex_locks.load(Ordering::Relaxed),
            converted_locks: self.converted_locks.load(Ordering::Relaxed),
            plain_locks: self.plain_locks.load(Ordering::Relaxed),
            unlocks: self.unlocks.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            failed_locks: self.failed_locks.load(Ordering::Relaxed),
            peak_locked: self.peak_locked.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    /// Locks served by a flexible-YUV mapping
    pub flex_locks: u64,
    /// Locks served through GPU readback
    pub converted_locks: u64,
    /// Locks served by a single-plane mapping
    pub plain_locks: u64,
    pub unlocks: u64,
    /// Lock attempts rejected at the bound
    pub exhausted: u64,
    /// Lock attempts that found the queue empty
    pub empty: u64,
    /// Lock attempts that acquired a buffer but could not map it
    pub failed_locks: u64,
    /// Highest number of simultaneously locked buffers seen
    pub peak_locked: u64,
}

impl ConsumerStatsSnapshot {
    /// Successful locks on any path.
    pub fn total_locks(&self) -> u64 {
        self.flex_locks + self.converted_locks + self.plain_locks
    }
}
