//! # Frame - Self-Describing Binary Message Unit
//!
//! ## Purpose
//!
//! Defines the owned [`Frame`] used for sending and the borrowed [`FrameView`]
//! produced when decoding a read buffer. Both expose the same accessors; they
//! differ only in who owns the bytes.
//!
//! ## Ownership Model
//!
//! ```text
//! socket read buffer ──decode──> FrameView<'buf>   (valid until the next read)
//!                                   │
//!                                   └─to_frame()──> Frame (pooled, owned copy)
//!
//! Frame::encode ──> Frame ──as_bytes()──> socket write / ring buffer record
//! ```
//!
//! A view can never outlive the buffer it was decoded from; a handler that
//! wants to keep or mutate data must take the explicit copy via
//! [`FrameView::to_frame`].
//!
//! ## Mutation
//!
//! A built frame is immutable except for its frame type and its extend
//! segment. [`Frame::set_extend`] rewrites in place when the allocation can
//! hold the new size and otherwise moves to a fresh pooled buffer.

use crate::buffers;
use crate::error::{ProtocolError, ProtocolResult};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use tracing::trace;

/// Fixed header size: totalLength(4) + extendLength(2) + frameType(2)
pub const HEADER_LEN: usize = 8;

/// Largest extend segment the 16-bit header field can describe
pub const MAX_EXTEND_LEN: usize = u16::MAX as usize;

/// Largest frame the 32-bit header field can describe
pub const MAX_FRAME_LEN: usize = u32::MAX as usize;

/// Read the little-endian total length from the first four bytes of a frame
///
/// Returns `None` when fewer than four bytes are available.
pub fn read_length_prefix(prefix: &[u8]) -> Option<usize> {
    if prefix.len() < 4 {
        return None;
    }
    Some(LittleEndian::read_u32(&prefix[..4]) as usize)
}

fn check_extend(len: usize) -> ProtocolResult<()> {
    if len > MAX_EXTEND_LEN {
        return Err(ProtocolError::ExtendTooLarge {
            size: len,
            limit: MAX_EXTEND_LEN,
        });
    }
    Ok(())
}

fn write_header(header: &mut [u8], total: usize, extend_len: usize, frame_type: u16) {
    LittleEndian::write_u32(&mut header[0..4], total as u32);
    LittleEndian::write_u16(&mut header[4..6], extend_len as u16);
    LittleEndian::write_u16(&mut header[6..8], frame_type);
}

/// Owned frame backed by a pooled buffer
pub struct Frame {
    buf: Vec<u8>,
}

impl Frame {
    /// Build a frame from its parts
    pub fn encode(frame_type: u16, payload: &[u8], extend: &[u8]) -> ProtocolResult<Self> {
        check_extend(extend.len())?;
        let total = HEADER_LEN + payload.len() + extend.len();
        if total > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                limit: MAX_FRAME_LEN,
            });
        }

        let mut buf = buffers::acquire(total);
        buf.resize(HEADER_LEN, 0);
        write_header(&mut buf, total, extend.len(), frame_type);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(extend);
        Ok(Self { buf })
    }

    /// Decode and copy `buf` into an owned frame
    pub fn decode_owned(buf: &[u8]) -> ProtocolResult<Self> {
        FrameView::decode(buf).map(|view| view.to_frame())
    }

    /// Total encoded length (header + payload + extend)
    pub fn total_length(&self) -> usize {
        self.buf.len()
    }

    /// Length of the extend segment
    pub fn extend_length(&self) -> usize {
        LittleEndian::read_u16(&self.buf[4..6]) as usize
    }

    /// Message-kind discriminator; doubles as the channel
    pub fn frame_type(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[6..8])
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_LEN..self.payload_end()]
    }

    pub fn extend(&self) -> &[u8] {
        &self.buf[self.payload_end()..]
    }

    /// Complete wire encoding, starting with the length prefix
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Borrow this frame as a view
    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            buf: &self.buf,
            extend_len: self.extend_length(),
        }
    }

    /// Replace the frame type in place
    pub fn set_frame_type(&mut self, frame_type: u16) {
        LittleEndian::write_u16(&mut self.buf[6..8], frame_type);
    }

    /// Replace the extend segment
    ///
    /// Rewrites in place when the current allocation can hold the new size,
    /// otherwise copies header and payload into a fresh pooled buffer.
    pub fn set_extend(&mut self, extend: &[u8]) -> ProtocolResult<()> {
        check_extend(extend.len())?;
        let payload_end = self.payload_end();
        let total = payload_end + extend.len();
        if total > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                limit: MAX_FRAME_LEN,
            });
        }

        if total <= self.buf.capacity() {
            self.buf.truncate(payload_end);
            self.buf.extend_from_slice(extend);
        } else {
            trace!(
                capacity = self.buf.capacity(),
                required = total,
                "extend rewrite moved frame to a fresh buffer"
            );
            let mut fresh = buffers::acquire(total);
            fresh.extend_from_slice(&self.buf[..payload_end]);
            fresh.extend_from_slice(extend);
            let old = std::mem::replace(&mut self.buf, fresh);
            buffers::release(old);
        }

        let frame_type = self.frame_type();
        write_header(&mut self.buf[..HEADER_LEN], total, extend.len(), frame_type);
        Ok(())
    }

    /// Take the encoded bytes out of the pool's reach
    pub fn into_bytes(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    fn payload_end(&self) -> usize {
        self.buf.len() - self.extend_length()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        buffers::release(std::mem::take(&mut self.buf));
    }
}

impl Clone for Frame {
    fn clone(&self) -> Self {
        let mut buf = buffers::acquire(self.buf.len());
        buf.extend_from_slice(&self.buf);
        Self { buf }
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.buf == other.buf
    }
}

impl Eq for Frame {}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("frame_type", &self.frame_type())
            .field("payload_len", &self.payload().len())
            .field("extend_len", &self.extend_length())
            .finish()
    }
}

/// Borrowed, validated view over an encoded frame
///
/// Aliases the buffer it was decoded from; the borrow checker keeps it from
/// outliving the next read into that buffer.
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    buf: &'a [u8],
    extend_len: usize,
}

impl<'a> FrameView<'a> {
    /// Validate and view an encoded frame
    pub fn decode(buf: &'a [u8]) -> ProtocolResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::message_too_small(
                HEADER_LEN,
                buf.len(),
                "frame header",
            ));
        }

        let declared = LittleEndian::read_u32(&buf[0..4]) as usize;
        if declared != buf.len() {
            return Err(ProtocolError::length_mismatch(declared, buf.len()));
        }

        let extend_len = LittleEndian::read_u16(&buf[4..6]) as usize;
        let body_len = buf.len() - HEADER_LEN;
        if extend_len > body_len {
            return Err(ProtocolError::InvalidExtendLength {
                extend_len,
                body_len,
            });
        }

        Ok(Self { buf, extend_len })
    }

    pub fn total_length(&self) -> usize {
        self.buf.len()
    }

    pub fn extend_length(&self) -> usize {
        self.extend_len
    }

    pub fn frame_type(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[6..8])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buf[HEADER_LEN..self.buf.len() - self.extend_len]
    }

    pub fn extend(&self) -> &'a [u8] {
        &self.buf[self.buf.len() - self.extend_len..]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }

    /// Explicit copy into an owned, pooled frame
    pub fn to_frame(&self) -> Frame {
        let mut buf = buffers::acquire(self.buf.len());
        buf.extend_from_slice(self.buf);
        Frame { buf }
    }
}

impl fmt::Debug for FrameView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameView")
            .field("frame_type", &self.frame_type())
            .field("payload_len", &self.payload().len())
            .field("extend_len", &self.extend_len)
            .finish()
    }
}
