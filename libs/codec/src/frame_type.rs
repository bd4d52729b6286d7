//! Frame type registry
//!
//! The 16-bit frame type doubles as the channel number. Values 0-15 are
//! control frames the transport consumes itself; channels below
//! [`FIRST_APPLICATION_CHANNEL`] are reserved for framework use.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 16-bit topic identifier; identical to the frame type on the wire
pub type Channel = u16;

/// Highest frame type reserved for control traffic
pub const RESERVED_FRAME_TYPE_MAX: u16 = 15;

/// Highest channel reserved for framework control
pub const FRAMEWORK_CHANNEL_MAX: Channel = 49;

/// First channel available to applications by convention
pub const FIRST_APPLICATION_CHANNEL: Channel = 50;

/// Reserved control frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ControlType {
    /// No-op frame
    Nil = 0,
    /// Liveness probe, never answered
    Heartbeat = 1,
    /// Peer is closing the session
    Exit = 2,
    /// Round-trip probe, answered with `Pong`
    Ping = 3,
    /// Answer to `Ping`
    Pong = 4,
    /// Identity handshake carrying machine id and group
    Hello = 5,
    /// Gateway forwarding a user frame to a service
    GatewayToService = 8,
    /// Service frame forwarded by a gateway to a user
    GatewayToUser = 9,
    /// Gateway notice that a user left
    UserLeft = 10,
}

impl ControlType {
    /// Classify a raw frame type; `None` for anything outside the control table
    pub fn classify(frame_type: u16) -> Option<Self> {
        Self::try_from(frame_type).ok()
    }

    /// Whether the transport handles this frame without dispatching it
    pub fn is_transport_local(&self) -> bool {
        matches!(
            self,
            Self::Nil | Self::Heartbeat | Self::Exit | Self::Ping | Self::Pong | Self::Hello
        )
    }
}

/// Whether `channel` is outside the framework-reserved range
pub fn is_application_channel(channel: Channel) -> bool {
    channel >= FIRST_APPLICATION_CHANNEL
}
