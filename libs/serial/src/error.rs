//! Ring Buffer and Engine Error Types
//!
//! Capacity problems are returned to the producer immediately so it can decide
//! whether to retry, drop or propagate. Engine lifecycle misuse is reported
//! to the caller; handler faults never surface here, they are logged at the
//! dispatch boundary.

use codec::Channel;
use thiserror::Error;

/// Errors returned by ring buffer producers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    /// Reserving the record would overtake the consumer's released region
    #[error("Ring buffer overflow: {requested} bytes requested, {in_flight}/{capacity} bytes in flight")]
    Overflow {
        requested: usize,
        in_flight: usize,
        capacity: usize,
    },

    /// The buffer has been shut down to producers
    #[error("Ring buffer closed")]
    Closed,

    /// Data does not start with its own little-endian u32 length
    #[error("Invalid ring record: declared length {declared:?}, actual {actual} bytes")]
    InvalidRecord {
        declared: Option<usize>,
        actual: usize,
    },

    /// Capacity must be a power of two large enough to hold a length prefix
    #[error("Invalid ring capacity {capacity}: must be a power of two >= {minimum}")]
    InvalidCapacity { capacity: usize, minimum: usize },
}

impl RingError {
    pub fn overflow(requested: usize, in_flight: u64, capacity: usize) -> Self {
        Self::Overflow {
            requested,
            in_flight: in_flight as usize,
            capacity,
        }
    }

    /// Whether retrying the same write later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }
}

/// Errors returned by the dispatch engine's control surface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Registration attempted after the engine started draining
    #[error("Cannot subscribe channel {channel}: engine is already working")]
    AlreadyWorking { channel: Channel },

    /// Subscription requested with no channels
    #[error("Channel set for {operation} must not be empty")]
    EmptyChannelSet { operation: &'static str },

    /// A join-all set listed the same channel twice
    #[error("Channel {channel} appears more than once in a join-all set")]
    DuplicateChannel { channel: Channel },

    /// The drain task did not acknowledge a control request in time
    #[error("{operation} not acknowledged within {ticks} ticks")]
    Timeout {
        operation: &'static str,
        ticks: u32,
    },

    /// Operation not valid in the engine's current state
    #[error("Invalid engine state for {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Engine has shut down
    #[error("Engine closed")]
    Closed,

    #[error(transparent)]
    Ring(#[from] RingError),
}

pub type RingResult<T> = std::result::Result<T, RingError>;
pub type EngineResult<T> = std::result::Result<T, EngineError>;
