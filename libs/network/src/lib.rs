//! Network Infrastructure
//!
//! Peer-to-peer plumbing for the bus: TCP sessions between nodes, the
//! cluster routing table that maps identities and groups onto those sessions,
//! and the collaborator interfaces the node consumes for membership.
//!
//! ## Module Boundaries
//!
//! - [`transports`]: handshake, framed socket IO, per-peer session tasks
//! - [`cluster`]: routing table and the directory follower
//! - [`discovery`]: peer directory, distributed lock, id generator, admission gate
//! - [`retry`]: backoff policy shared by the lock and the dialer

pub mod cluster;
pub mod discovery;
pub mod error;
pub mod retry;
pub mod transports;

pub use cluster::{
    follow_directory, ClusterConfig, DeathPolicy, MachineId, PeerSnapshot, PeerState,
    RoutingTable,
};
pub use error::{
    DiscoveryError, DiscoveryResult, Result, RoutingError, RoutingResult, TransportError,
};
pub use retry::RetryPolicy;
pub use transports::{
    dial, FrameSink, PeerConnection, SessionContext, TcpAcceptor, TransportConfig,
};

// Defaults shared with configuration loading
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024; // 64KB
pub const DEFAULT_MAX_IDENTITIES: usize = 1024;
