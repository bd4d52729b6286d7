//! Network Error Types
//!
//! Error handling for the three network concerns:
//! - [`TransportError`]: sockets, handshakes and session queues
//! - [`RoutingError`]: cluster routing table lookups and sends
//! - [`DiscoveryError`]: peer directory, distributed lock and admission
//!
//! Protocol errors drop the connection and are never retried. Routing errors
//! are returned to the caller, who owns the retry policy.

use crate::cluster::{MachineId, PeerState};
use codec::ProtocolError;
use std::net::SocketAddr;
use thiserror::Error;

/// Socket and session errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Network connectivity errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Connection management errors
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
    },

    /// Framing and handshake errors; the connection is dropped
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<ProtocolError>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Deadline exceeded on a socket operation
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Bounded queue or buffer is full
    #[error("Resource exhausted: {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },

    /// The session has been closed
    #[error("Session {session_id} closed")]
    Closed { session_id: i64 },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source
    pub fn network_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network { .. } => true,
            TransportError::Connection { .. } => true,
            TransportError::Timeout { .. } => true,
            TransportError::ResourceExhausted { .. } => true,
            TransportError::Protocol { .. } => false,
            TransportError::Configuration { .. } => false,
            TransportError::Closed { .. } => false,
        }
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Network { .. } => "network",
            TransportError::Connection { .. } => "connection",
            TransportError::Protocol { .. } => "protocol",
            TransportError::Configuration { .. } => "configuration",
            TransportError::Timeout { .. } => "timeout",
            TransportError::ResourceExhausted { .. } => "resource_exhausted",
            TransportError::Closed { .. } => "closed",
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::network_with_source("I/O failure", err)
    }
}

/// Cluster routing failures returned to the sender
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Identity {id} is outside the routing table (capacity {capacity})")]
    UnknownIdentity { id: MachineId, capacity: usize },

    #[error("Identity {id} is not working (state {state:?})")]
    NotWorking { id: MachineId, state: PeerState },

    #[error("Identity {id} has no live connection")]
    NoConnection { id: MachineId },

    #[error("Unknown group '{group}'")]
    UnknownGroup { group: String },

    #[error("Group '{group}' has no working member")]
    NoWorkingMember { group: String },

    #[error("Send to identity {id} failed: {source}")]
    Send {
        id: MachineId,
        #[source]
        source: TransportError,
    },

    #[error("Routing table stopped")]
    Stopped,
}

impl RoutingError {
    /// Identity the failure concerns, when there is one
    pub fn identity(&self) -> Option<MachineId> {
        match self {
            Self::UnknownIdentity { id, .. }
            | Self::NotWorking { id, .. }
            | Self::NoConnection { id }
            | Self::Send { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Whether the failure says something about the peer rather than the caller
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            Self::NotWorking { .. } | Self::NoConnection { .. } | Self::Send { .. }
        )
    }
}

/// Peer directory, lock and admission failures
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Identity {id} is already registered by {holder}")]
    IdentityTaken { id: MachineId, holder: SocketAddr },

    #[error("Lease {lease_id} for identity {id} is not registered")]
    UnknownLease { id: MachineId, lease_id: i64 },

    #[error("Lock '{key}' not acquired after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    #[error("Directory backend error: {message}")]
    Backend { message: String },

    #[error("Directory watch closed")]
    WatchClosed,
}

pub type RoutingResult<T> = std::result::Result<T, RoutingError>;
pub type DiscoveryResult<T> = std::result::Result<T, DiscoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_are_not_retryable() {
        let err: TransportError = ProtocolError::invalid_magic(0x5355_4253, 0x1234_5678).into();
        assert!(!err.is_retryable());
        assert_eq!(err.category(), "protocol");
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_timeout_errors_are_retryable() {
        let err = TransportError::timeout("read frame", 10_000);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Timeout error: read frame exceeded 10000ms");
    }

    #[test]
    fn test_routing_error_names_identity() {
        let err = RoutingError::NotWorking {
            id: 7,
            state: PeerState::Die,
        };
        assert_eq!(err.identity(), Some(7));
        assert!(err.to_string().contains("Identity 7"));
        assert_eq!(
            RoutingError::UnknownGroup {
                group: "x".into()
            }
            .identity(),
            None
        );
    }

    #[test]
    fn test_only_peer_failures_are_peer_faults() {
        assert!(RoutingError::NoConnection { id: 2 }.is_peer_fault());
        assert!(RoutingError::NotWorking {
            id: 2,
            state: PeerState::Pause
        }
        .is_peer_fault());
        assert!(!RoutingError::UnknownGroup { group: "x".into() }.is_peer_fault());
        assert!(!RoutingError::NoWorkingMember { group: "x".into() }.is_peer_fault());
        assert!(!RoutingError::UnknownIdentity { id: 99, capacity: 8 }.is_peer_fault());
        assert!(!RoutingError::Stopped.is_peer_fault());
    }
}
