//! Protocol-level errors for frame processing
//!
//! Each variant carries the context needed to tell a truncated socket read
//! from a corrupted header or a caller misusing an envelope.

use thiserror::Error;

/// Frame codec errors with diagnostic context
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Buffer is too small to contain the expected structure
    #[error("Message too small: need {need} bytes, got {got} (context: {context})")]
    MessageTooSmall {
        need: usize,
        got: usize,
        context: String,
    },

    /// Header length disagrees with the bytes actually supplied
    #[error("Length mismatch: header declares {declared} bytes, buffer has {actual} (indicates: {diagnosis})")]
    LengthMismatch {
        declared: usize,
        actual: usize,
        diagnosis: String,
    },

    /// Declared extend segment does not fit inside the frame body
    #[error("Invalid extend length {extend_len}: frame body only has {body_len} bytes")]
    InvalidExtendLength { extend_len: usize, body_len: usize },

    /// Extend segment cannot be represented in the 16-bit header field
    #[error("Extend too large: {size} bytes exceeds limit {limit}")]
    ExtendTooLarge { size: usize, limit: usize },

    /// Frame cannot be represented in the 32-bit header field
    #[error("Frame too large: {size} bytes exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// Connection handshake magic validation failed
    #[error("Invalid magic number: expected {expected:#010x}, got {actual:#010x} (indicates: {diagnosis})")]
    InvalidMagic {
        expected: u32,
        actual: u32,
        diagnosis: String,
    },

    /// Frame carries no usable reply envelope
    #[error("Missing reply envelope: extend has {extend_len} bytes, need {need}")]
    MissingReplyEnvelope { extend_len: usize, need: usize },

    /// Pipeline continuation is not a whole number of 2-byte hops
    #[error("Malformed pipeline continuation: {extend_len} bytes is not a multiple of 2")]
    MalformedPipeline { extend_len: usize },

    /// Identity hello payload could not be parsed
    #[error("Invalid hello payload: {reason}")]
    InvalidHello { reason: String },
}

impl ProtocolError {
    /// Create MessageTooSmall error with diagnostic context
    pub fn message_too_small(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::MessageTooSmall {
            need,
            got,
            context: context.into(),
        }
    }

    /// Create LengthMismatch error with a best-guess diagnosis
    pub fn length_mismatch(declared: usize, actual: usize) -> Self {
        let diagnosis = if declared == 0 {
            "uninitialized header"
        } else if (declared as u32).swap_bytes() as usize == actual {
            "byte order (endianness) mismatch"
        } else if declared > actual {
            "truncated read"
        } else {
            "trailing bytes after frame"
        };

        Self::LengthMismatch {
            declared,
            actual,
            diagnosis: diagnosis.to_string(),
        }
    }

    /// Create InvalidMagic error with diagnostic context
    pub fn invalid_magic(expected: u32, actual: u32) -> Self {
        let diagnosis = match actual {
            0x0000_0000 => "peer sent nothing meaningful",
            0xFFFF_FFFF => "corrupted stream",
            _ if actual.swap_bytes() == expected => "byte order (endianness) mismatch",
            _ => "not a bus peer or wrong protocol",
        };

        Self::InvalidMagic {
            expected,
            actual,
            diagnosis: diagnosis.to_string(),
        }
    }

    /// Create InvalidHello error
    pub fn invalid_hello(reason: impl Into<String>) -> Self {
        Self::InvalidHello {
            reason: reason.into(),
        }
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
