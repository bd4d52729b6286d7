//! Engine tuning parameters

use std::time::Duration;

/// Runtime settings for one [`SerialEngine`](crate::SerialEngine)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Ring buffer size in bytes; must be a power of two
    pub ring_capacity: usize,
    /// Interval between drain passes
    ///
    /// Tokio timers have millisecond granularity, so sub-millisecond ticks
    /// fire at most once per millisecond in practice.
    pub tick: Duration,
    /// Ticks an unsubscribe request may wait for the drain task
    pub unsubscribe_timeout_ticks: u32,
    /// Depth of the control request queue
    pub control_queue_depth: usize,
    /// Ticks to wait for in-flight producer writes before the final drain
    pub shutdown_settle_ticks: u32,
    /// Delay before the dispatcher and its handlers are released
    pub release_grace: Duration,
    /// Frames each join-all slot holds before dropping its oldest
    pub bag_slot_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1 << 20,
            tick: Duration::from_micros(10),
            unsubscribe_timeout_ticks: 10_000,
            control_queue_depth: 64,
            shutdown_settle_ticks: 10,
            release_grace: Duration::from_secs(300),
            bag_slot_depth: crate::bag::DEFAULT_SLOT_DEPTH,
        }
    }
}

impl EngineConfig {
    /// Wall-clock budget for `ticks` drain intervals
    pub fn ticks(&self, ticks: u32) -> Duration {
        self.tick.saturating_mul(ticks)
    }
}
