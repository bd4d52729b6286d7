//! # Serial Bus Codec
//!
//! ## Purpose
//!
//! This crate contains the "Rules" layer of the bus:
//! - Frame encoding/decoding (length-prefixed, little-endian header)
//! - Reserved control frame types and channel ranges
//! - Thread-local buffer pool backing owned frames
//! - Addressing envelopes carried in the frame's extend segment
//!   (reply addresses, pipeline continuations, identity hello)
//!
//! ## Architecture Role
//!
//! ```text
//! codec → serial/      (ring buffer records are encoded frames)
//!   ↓  → network/      (sockets read and write encoded frames)
//!   ↓  → bus/          (patterns build envelopes into the extend segment)
//! Wire Format
//! ```
//!
//! ## Wire Layout
//!
//! ```text
//! offset 0..4  totalLength   u32 = 8 + len(payload) + len(extend)
//! offset 4..6  extendLength  u16
//! offset 6..8  frameType     u16
//! offset 8..N  payload       (N = totalLength - extendLength)
//! offset N..   extend        (extendLength bytes)
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Socket handling or connection state (belongs in network/)
//! - Dispatch or buffering between threads (belongs in serial/)

pub mod buffers;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod frame_type;

pub use envelope::{Hello, PipelineHops, ReplyEnvelope, REPLY_ENVELOPE_LEN};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{read_length_prefix, Frame, FrameView, HEADER_LEN, MAX_EXTEND_LEN, MAX_FRAME_LEN};
pub use frame_type::{
    is_application_channel, Channel, ControlType, FIRST_APPLICATION_CHANNEL,
    RESERVED_FRAME_TYPE_MAX,
};
