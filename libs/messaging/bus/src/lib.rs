//! # Bus - Addressing Patterns and Node Runtime
//!
//! ## Purpose
//!
//! Ties the serial engine, the cluster routing table and the TCP transport
//! into one node, and gives application code six ways to address a frame.
//!
//! ## Architecture Role
//!
//! ```text
//!                    ┌────────────── Node ──────────────┐
//! handler ──> Bus ──>│ ChannelDirectory                  │
//!                    │   Local ──────> ring ──> engine ──┼──> handlers
//!                    │   Group/Identity ──> RoutingTable ┼──> peer sessions
//!                    └───────────────────────────────────┘
//!                       peer sessions ──> RingSink ──> ring
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use bus::{Collaborators, Node, NodeConfig};
//!
//! # async fn run() -> bus::BusResult<()> {
//! let node = Node::new(NodeConfig::local(1, "workers"), Collaborators::standalone([]))?;
//! let bus = node.bus();
//! node.subscribe(71, move |frame| {
//!     let _ = bus.reply(frame, b"pong");
//! })?;
//! node.start().await?;
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod channels;
pub mod config;
pub mod error;
pub mod node;
pub mod patterns;
pub mod sink;
pub mod telemetry;

pub use channels::{ChannelDirectory, ChannelOwner};
pub use config::NodeConfig;
pub use error::{BusError, BusResult};
pub use node::{Collaborators, Node, NodeState};
pub use patterns::{Bus, Delivery, OccupancyGuard};
pub use sink::RingSink;
