//! Bus error types
//!
//! Pattern misuse (an empty ventilator, continuing a finished pipeline,
//! replying to a frame with no reply envelope) is reported without sending
//! anything. Routing and capacity failures come from the layer that refused
//! the frame and are wrapped unchanged.

use codec::{Channel, ProtocolError};
use network::{DiscoveryError, RoutingError, TransportError};
use serial::{EngineError, RingError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    /// Channel has no entry in the channel directory
    #[error("Channel {channel} has no owner")]
    UnknownChannel { channel: Channel },

    #[error("Ventilator requires at least one channel")]
    EmptyPipeline,

    #[error("Final stage may not continue the pipeline (channel {channel})")]
    PipelineFinished { channel: Channel },

    #[error("Frame on channel {channel} carries no reply envelope ({extend_len} extend bytes)")]
    MissingReplyEnvelope { channel: Channel, extend_len: usize },

    /// The admission gate is open and refuses remote sends
    #[error("Admission gate refused send on channel {channel}")]
    AdmissionRefused { channel: Channel },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Node is {state}")]
    InvalidState { state: &'static str },

    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Local ring buffer refused the frame
    #[error("Local delivery failed: {0}")]
    Capacity(#[from] RingError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl BusError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether the same send may succeed later without caller changes
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Capacity(e) => e.is_retryable(),
            Self::AdmissionRefused { .. } => true,
            Self::Routing(RoutingError::Send { source, .. }) => source.is_retryable(),
            Self::Routing(
                RoutingError::NoWorkingMember { .. } | RoutingError::NoConnection { .. },
            ) => true,
            Self::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type BusResult<T> = std::result::Result<T, BusError>;
