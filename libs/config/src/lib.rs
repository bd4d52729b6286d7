//! # Serial Bus Configuration
//!
//! Layered configuration for bus nodes: a TOML file, an optional
//! environment overlay and `SBUS_` environment variables.
//!
//! ## Sections
//!
//! - **node**: machine id, group, listen address, static peers, retry budgets
//! - **serial**: ring capacity and drain tick of the dispatch engine
//! - **cluster**: routing table size, death policy, admission gate
//! - **transport**: socket deadlines, heartbeat, queue depth, frame limit
//! - **logging**: filter directives and output format
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bus_config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Some(Path::new("config/bus.toml")), Some("staging"))?;
//! println!("node {} in group {}", config.node.machine_id, config.node.group);
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! This crate does not depend on the runtime crates; the node maps these
//! plain settings onto its engine, transport and routing structs.

pub mod bus_config;
pub mod defaults;

pub use bus_config::{
    load_config, BusConfig, ClusterSettings, DeathPolicySetting, LogFormat, LoggingConfig,
    NodeSettings, SerialSettings, StaticPeer, TransportSettings,
};
