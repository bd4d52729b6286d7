//! # Cluster Collaborators
//!
//! ## Purpose
//!
//! The bus does not run its own membership service. It consumes four narrow
//! interfaces and ships an in-process implementation of each, good for tests
//! and single-host deployments:
//!
//! | interface | default | used for |
//! |---|---|---|
//! | [`PeerDirectory`] | [`StaticDirectory`] | identity registration, peer list, change stream |
//! | [`DistributedLock`] | [`InMemoryLock`] | serializing identity claims across nodes |
//! | [`IdGenerator`] | [`SequentialIdGenerator`] | session ids |
//! | [`AdmissionGate`] | [`CircuitBreakerGate`] | fail-fast for remote sends |
//!
//! ## Architecture Role
//!
//! ```text
//! PeerDirectory::watch_changes ──> cluster::follow_directory ──> RoutingTable
//! DistributedLock ──> Node startup (claim machine id)
//! IdGenerator ──> transports (session ids)
//! AdmissionGate ──> bus patterns (before remote sends)
//! ```

pub mod directory;
pub mod gate;
pub mod ids;
pub mod lock;

pub use directory::{PeerDirectory, PeerEvent, PeerInfo, Registration, StaticDirectory};
pub use gate::{
    AdmissionGate, CircuitBreakerConfig, CircuitBreakerGate, CircuitBreakerStats, CircuitState,
};
pub use ids::{IdGenerator, SequentialIdGenerator};
pub use lock::{acquire_with_retry, DistributedLock, InMemoryLock};
