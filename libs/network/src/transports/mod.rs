//! TCP Peer Transport
//!
//! Every node listens on one TCP port and dials its peers. A session starts
//! with the client's 4-byte magic, then both sides trade a `Hello` frame
//! carrying machine id and group. After that the socket carries bare frames
//! in both directions: a reader task hands application frames to a
//! [`FrameSink`], a writer task drains the session's bounded send queue.

pub mod connection;
pub mod tcp;

pub use connection::PeerConnection;
pub use tcp::{
    client_handshake, dial, server_handshake, FrameReader, SessionContext, TcpAcceptor,
    HANDSHAKE_MAGIC,
};

use crate::cluster::MachineId;
use crate::error::Result;
use crate::TransportError;
use codec::FrameView;
use std::time::Duration;

/// Receiver for application frames read off a peer session
///
/// Called on the session's reader task with a view into its read buffer;
/// implementations copy what they keep and must not block.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, source: MachineId, frame: &FrameView<'_>) -> Result<()>;
}

/// Socket and session tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// Read and write deadline for a single socket operation
    pub io_deadline: Duration,
    /// Idle interval after which the writer emits a heartbeat
    pub heartbeat_interval: Duration,
    /// Frames a session may queue before `send` reports back-pressure
    pub send_queue_depth: usize,
    /// Largest frame accepted off the wire
    pub max_frame_len: usize,
    /// Initial read buffer and write batch size
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_deadline: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(3),
            send_queue_depth: 1024,
            max_frame_len: 16 * 1024 * 1024, // 16MB
            read_buffer_size: crate::DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval >= self.io_deadline {
            return Err(TransportError::configuration(
                format!(
                    "heartbeat interval {:?} must be shorter than the io deadline {:?}",
                    self.heartbeat_interval, self.io_deadline
                ),
                Some("heartbeat_interval"),
            ));
        }
        if self.send_queue_depth == 0 {
            return Err(TransportError::configuration(
                "send queue depth must be positive",
                Some("send_queue_depth"),
            ));
        }
        if self.max_frame_len < codec::HEADER_LEN {
            return Err(TransportError::configuration(
                format!(
                    "max frame length {} is smaller than a frame header",
                    self.max_frame_len
                ),
                Some("max_frame_len"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        TransportConfig::default().validate().unwrap();
    }

    #[test]
    fn test_heartbeat_must_beat_deadline() {
        let config = TransportConfig {
            heartbeat_interval: Duration::from_secs(10),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            TransportError::Configuration { field: Some(ref f), .. } if f == "heartbeat_interval"
        ));
    }
}
