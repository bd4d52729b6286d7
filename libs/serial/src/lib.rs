//! # Serial - Buffered Single-Consumer Dispatch
//!
//! ## Purpose
//!
//! The in-process half of the bus: producers on any thread append encoded
//! frames to a lock-free ring buffer, and one consumer task per engine drains
//! it on a fixed tick, routing each frame by channel to its handler.
//!
//! ## Architecture Role
//!
//! ```text
//! network sessions ─┐
//! local patterns   ─┼─> RingProducer ──> [ring] ──> Dispatcher ──> handlers
//! other threads    ─┘     (clone)                 (drain task)    (by channel)
//! ```
//!
//! ## Components
//!
//! - [`ring`]: many-producer, single-consumer byte ring with submission flags
//! - [`registry`] / [`bag`]: per-engine channel routes and join-all bags
//! - [`dispatcher`]: synchronous drain with per-handler fault isolation
//! - [`engine`]: the `Paused → Working → Draining → Closed` lifecycle

pub mod bag;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod registry;
pub mod ring;
pub mod stats;

pub use bag::{BagHandler, BagId, DEFAULT_SLOT_DEPTH};
pub use config::EngineConfig;
pub use dispatcher::Dispatcher;
pub use engine::{EngineState, SerialEngine};
pub use error::{EngineError, EngineResult, RingError, RingResult};
pub use registry::Handler;
pub use ring::{ring_buffer, RingConsumer, RingProducer, RingRecord};
pub use stats::{EngineStats, EngineStatsSnapshot};
