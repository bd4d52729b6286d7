//! Dispatch counters shared between the drain task and observers

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the drain loop
#[derive(Debug, Default)]
pub struct EngineStats {
    dispatched: AtomicU64,
    handler_faults: AtomicU64,
    unrouted: AtomicU64,
    malformed: AtomicU64,
    bag_generations: AtomicU64,
    bag_overflow: AtomicU64,
    ticks: AtomicU64,
}

impl EngineStats {
    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) {
        self.handler_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unrouted(&self) {
        self.unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_generation(&self) {
        self.bag_generations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bag_overflow(&self) {
        self.bag_overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            handler_faults: self.handler_faults.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            bag_generations: self.bag_generations.load(Ordering::Relaxed),
            bag_overflow: self.bag_overflow.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`EngineStats`] at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    /// Frames handed to a handler or a bag slot
    pub dispatched: u64,
    /// Handler invocations that panicked
    pub handler_faults: u64,
    /// Frames on channels with no registration
    pub unrouted: u64,
    /// Records that failed frame validation
    pub malformed: u64,
    /// Completed join-all generations
    pub bag_generations: u64,
    /// Frames a full join-all slot dropped to admit a newer one
    pub bag_overflow: u64,
    pub ticks: u64,
}
