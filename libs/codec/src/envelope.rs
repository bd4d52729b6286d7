//! Addressing envelopes carried in a frame's extend segment
//!
//! - [`ReplyEnvelope`]: `[sender:4][reply_channel:2]`, written by Call and
//!   consumed by Reply
//! - [`PipelineHops`]: remaining pipeline stages, 2 bytes per hop
//! - [`Hello`]: identity handshake payload `[machine_id:4][group utf8]`

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame_type::Channel;
use byteorder::{ByteOrder, LittleEndian};

/// Encoded size of a reply envelope
pub const REPLY_ENVELOPE_LEN: usize = 6;

/// Return address recorded by a Call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyEnvelope {
    /// Machine identity of the caller
    pub sender: u32,
    /// Channel the caller listens on for the answer
    pub reply_channel: Channel,
}

impl ReplyEnvelope {
    pub fn new(sender: u32, reply_channel: Channel) -> Self {
        Self {
            sender,
            reply_channel,
        }
    }

    pub fn encode(&self) -> [u8; REPLY_ENVELOPE_LEN] {
        let mut out = [0u8; REPLY_ENVELOPE_LEN];
        LittleEndian::write_u32(&mut out[0..4], self.sender);
        LittleEndian::write_u16(&mut out[4..6], self.reply_channel);
        out
    }

    /// Parse the envelope from a received frame's extend segment
    pub fn decode(extend: &[u8]) -> ProtocolResult<Self> {
        if extend.len() < REPLY_ENVELOPE_LEN {
            return Err(ProtocolError::MissingReplyEnvelope {
                extend_len: extend.len(),
                need: REPLY_ENVELOPE_LEN,
            });
        }
        Ok(Self {
            sender: LittleEndian::read_u32(&extend[0..4]),
            reply_channel: LittleEndian::read_u16(&extend[4..6]),
        })
    }
}

/// Pipeline continuation: the channels still to visit, in order
pub struct PipelineHops;

impl PipelineHops {
    /// Encode a hop sequence
    pub fn encode(hops: &[Channel]) -> Vec<u8> {
        let mut out = vec![0u8; hops.len() * 2];
        for (chunk, hop) in out.chunks_exact_mut(2).zip(hops) {
            LittleEndian::write_u16(chunk, *hop);
        }
        out
    }

    /// Number of hops remaining in an extend segment
    pub fn remaining(extend: &[u8]) -> ProtocolResult<usize> {
        if extend.len() % 2 != 0 {
            return Err(ProtocolError::MalformedPipeline {
                extend_len: extend.len(),
            });
        }
        Ok(extend.len() / 2)
    }

    /// Pop the next hop, returning it with the still-encoded rest
    ///
    /// `Ok(None)` means the frame is at its final stage.
    pub fn split_first(extend: &[u8]) -> ProtocolResult<Option<(Channel, &[u8])>> {
        if Self::remaining(extend)? == 0 {
            return Ok(None);
        }
        Ok(Some((LittleEndian::read_u16(&extend[0..2]), &extend[2..])))
    }

    /// Decode every remaining hop
    pub fn decode(extend: &[u8]) -> ProtocolResult<Vec<Channel>> {
        Self::remaining(extend)?;
        Ok(extend.chunks_exact(2).map(LittleEndian::read_u16).collect())
    }
}

/// Identity announced by each side right after the connection handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub machine_id: u32,
    pub group: String,
}

impl Hello {
    pub fn new(machine_id: u32, group: impl Into<String>) -> Self {
        Self {
            machine_id,
            group: group.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 4];
        LittleEndian::write_u32(&mut out, self.machine_id);
        out.extend_from_slice(self.group.as_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        if payload.len() < 4 {
            return Err(ProtocolError::invalid_hello(format!(
                "payload has {} bytes, need at least 4",
                payload.len()
            )));
        }
        let group = std::str::from_utf8(&payload[4..])
            .map_err(|e| ProtocolError::invalid_hello(format!("group is not utf-8: {e}")))?;
        Ok(Self {
            machine_id: LittleEndian::read_u32(&payload[0..4]),
            group: group.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_envelope_layout() {
        let env = ReplyEnvelope::new(7, 0x0102);
        assert_eq!(env.encode(), [7, 0, 0, 0, 0x02, 0x01]);
        assert_eq!(ReplyEnvelope::decode(&env.encode()).unwrap(), env);
    }

    #[test]
    fn test_reply_envelope_missing() {
        let err = ReplyEnvelope::decode(&[1, 2, 3, 4]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MissingReplyEnvelope {
                extend_len: 4,
                need: REPLY_ENVELOPE_LEN
            }
        );
    }

    #[test]
    fn test_pipeline_pop_sequence() {
        let extend = PipelineHops::encode(&[72, 73]);
        assert_eq!(extend, vec![72, 0, 73, 0]);

        let (first, rest) = PipelineHops::split_first(&extend).unwrap().unwrap();
        assert_eq!(first, 72);
        let (second, rest) = PipelineHops::split_first(rest).unwrap().unwrap();
        assert_eq!(second, 73);
        assert!(PipelineHops::split_first(rest).unwrap().is_none());
    }

    #[test]
    fn test_pipeline_rejects_odd_length() {
        assert!(matches!(
            PipelineHops::split_first(&[1, 2, 3]),
            Err(ProtocolError::MalformedPipeline { extend_len: 3 })
        ));
    }

    #[test]
    fn test_hello_round_trip_and_errors() {
        let hello = Hello::new(42, "gateway");
        assert_eq!(Hello::decode(&hello.encode()).unwrap(), hello);
        assert!(Hello::decode(&[1, 2]).is_err());
        assert!(Hello::decode(&[1, 0, 0, 0, 0xFF, 0xFE]).is_err());
    }
}
