//! Inbound frame sink
//!
//! Frames read off peer sessions enter the local serial engine through the
//! same ring buffer local senders use, so remote and local traffic share one
//! dispatch order.

use codec::FrameView;
use network::{FrameSink, MachineId, Result, TransportError};
use serial::{RingError, RingProducer};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

pub struct RingSink {
    producer: RingProducer,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl RingSink {
    pub fn new(producer: RingProducer) -> Self {
        Self {
            producer,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl FrameSink for RingSink {
    fn deliver(&self, source: MachineId, frame: &FrameView<'_>) -> Result<()> {
        match self.producer.write(frame.as_bytes()) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                trace!(source, channel = frame.frame_type(), "inbound frame queued");
                Ok(())
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(match e {
                    RingError::Overflow { .. } => {
                        TransportError::resource_exhausted("ring_buffer", e.to_string())
                    }
                    RingError::Closed => {
                        TransportError::connection("local engine closed", None)
                    }
                    other => TransportError::protocol(other.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::Frame;
    use serial::ring_buffer;

    #[test]
    fn test_inbound_frames_land_in_ring() {
        let (producer, mut consumer) = ring_buffer(256).unwrap();
        let sink = RingSink::new(producer);
        let frame = Frame::encode(70, b"remote", &[]).unwrap();

        sink.deliver(3, &frame.view()).unwrap();
        let record = consumer.read().unwrap();
        assert_eq!(record.bytes(), frame.as_bytes());
        assert_eq!(sink.accepted(), 1);
    }

    #[test]
    fn test_closed_engine_rejects() {
        let (producer, _consumer) = ring_buffer(256).unwrap();
        producer.close();
        let sink = RingSink::new(producer);
        let frame = Frame::encode(70, b"late", &[]).unwrap();

        let err = sink.deliver(3, &frame.view()).unwrap_err();
        assert!(matches!(err, TransportError::Connection { .. }));
        assert_eq!(sink.rejected(), 1);
    }

    #[test]
    fn test_full_ring_reports_exhaustion() {
        let (producer, _consumer) = ring_buffer(64).unwrap();
        let sink = RingSink::new(producer);
        let frame = Frame::encode(70, &[0u8; 60], &[]).unwrap();

        let err = sink.deliver(3, &frame.view()).unwrap_err();
        assert!(err.is_retryable());
    }
}
