//! # Ring Buffer - Many Producers, One Consumer
//!
//! ## Purpose
//!
//! Fixed-capacity circular byte region that any number of producer threads
//! append length-prefixed records to, drained by exactly one consumer. The
//! split into a cloneable [`RingProducer`] and a unique [`RingConsumer`] makes
//! the single-consumer rule a type-level guarantee.
//!
//! ## Algorithm
//!
//! ```text
//!            available                 ask
//!               │                       │
//!   ... free ...│ rec A │ rec B │ rec C │ ... free ...
//!               │ done  │copying│ done  │
//!               ▼
//!   consumer reads A, then stops at B until B's submission flag is set
//! ```
//!
//! 1. A producer reserves `[start, end)` with a CAS on `ask`, failing with
//!    `Overflow` when `end - available >= capacity`.
//! 2. It copies the record in (two copies when the range wraps).
//! 3. It sets the submission flag at `start` with Release ordering.
//!
//! The consumer only trusts a length prefix after observing the flag at the
//! record's start with Acquire ordering, so it never reads a range whose
//! producer has reserved space but not finished copying. Producers finish out
//! of reservation order; the consumer simply waits at the first unfinished
//! record.
//!
//! Flags are keyed by the record's start position rather than its end. A flag
//! at a start position can only have been set by the record the consumer is
//! about to read: a producer cannot reserve that position on the next lap
//! until the consumer has committed past it, and the consumer clears the flag
//! when it reads.
//!
//! ## Performance Profile
//!
//! - **Write**: one CAS (retried under contention), one memcpy, one `fetch_or`
//! - **Read**: one flag load, one memcpy into the consumer's scratch buffer
//! - **Memory**: `capacity` bytes plus one bit per byte of capacity for flags

use crate::error::{RingError, RingResult};
use codec::read_length_prefix;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Bytes occupied by each record's length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Smallest capacity accepted by [`ring_buffer`]
pub const MIN_CAPACITY: usize = 8;

const FLAG_BITS: usize = 64;

struct Shared {
    storage: Box<[UnsafeCell<u8>]>,
    flags: Box<[AtomicU64]>,
    capacity: usize,
    mask: u64,
    ask: AtomicU64,
    available: AtomicU64,
    closed: AtomicBool,
}

// Byte ranges handed out by the `ask` CAS are disjoint between producers, and
// the consumer only touches a range after its submission flag is published.
unsafe impl Sync for Shared {}
unsafe impl Send for Shared {}

impl Shared {
    fn new(capacity: usize) -> Self {
        let storage = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
        let words = capacity.div_ceil(FLAG_BITS);
        let flags = (0..words).map(|_| AtomicU64::new(0)).collect();
        Self {
            storage,
            flags,
            capacity,
            mask: capacity as u64 - 1,
            ask: AtomicU64::new(0),
            available: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    fn flag_slot(&self, offset: u64) -> (&AtomicU64, u64) {
        let index = (offset & self.mask) as usize;
        (&self.flags[index / FLAG_BITS], 1u64 << (index % FLAG_BITS))
    }

    /// Copy `data` into the ring at logical `offset`, wrapping as needed
    ///
    /// # Safety
    /// The caller must own `[offset, offset + data.len())` through a
    /// successful reservation that has not yet been submitted.
    unsafe fn copy_in(&self, offset: u64, data: &[u8]) {
        let index = (offset & self.mask) as usize;
        let first = data.len().min(self.capacity - index);
        let base = self.base();
        std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(index), first);
        if first < data.len() {
            std::ptr::copy_nonoverlapping(data.as_ptr().add(first), base, data.len() - first);
        }
    }

    /// Copy `len` bytes starting at logical `offset` into `out`
    ///
    /// # Safety
    /// The range must belong to a submitted record not yet committed.
    unsafe fn copy_out(&self, offset: u64, len: usize, out: &mut Vec<u8>) {
        let index = (offset & self.mask) as usize;
        let first = len.min(self.capacity - index);
        let base = self.base() as *const u8;
        out.extend_from_slice(std::slice::from_raw_parts(base.add(index), first));
        if first < len {
            out.extend_from_slice(std::slice::from_raw_parts(base, len - first));
        }
    }
}

/// Create a ring buffer of `capacity` bytes
///
/// `capacity` must be a power of two of at least [`MIN_CAPACITY`].
pub fn ring_buffer(capacity: usize) -> RingResult<(RingProducer, RingConsumer)> {
    if capacity < MIN_CAPACITY || !capacity.is_power_of_two() {
        return Err(RingError::InvalidCapacity {
            capacity,
            minimum: MIN_CAPACITY,
        });
    }

    let shared = Arc::new(Shared::new(capacity));
    debug!(capacity, "ring buffer allocated");
    Ok((
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer {
            shared,
            next: 0,
            scratch: Vec::new(),
        },
    ))
}

/// Cloneable write handle
#[derive(Clone)]
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Append one record
    ///
    /// `data` must begin with its own total length as a little-endian u32,
    /// which every encoded frame already does. Never blocks: a full buffer is
    /// reported as [`RingError::Overflow`].
    pub fn write(&self, data: &[u8]) -> RingResult<()> {
        let shared = &*self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(RingError::Closed);
        }

        let declared = read_length_prefix(data);
        if declared != Some(data.len()) {
            return Err(RingError::InvalidRecord {
                declared,
                actual: data.len(),
            });
        }

        let len = data.len() as u64;
        let capacity = shared.capacity as u64;
        let mut start = shared.ask.load(Ordering::Relaxed);
        loop {
            let end = start + len;
            let available = shared.available.load(Ordering::Acquire);
            if end.saturating_sub(available) >= capacity {
                return Err(RingError::overflow(
                    data.len(),
                    start.saturating_sub(available),
                    shared.capacity,
                ));
            }
            match shared
                .ask
                .compare_exchange_weak(start, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => start = actual,
            }
        }

        // SAFETY: the CAS above gave this producer exclusive ownership of
        // [start, start + len) until its flag is published.
        unsafe { shared.copy_in(start, data) };

        let (word, bit) = shared.flag_slot(start);
        word.fetch_or(bit, Ordering::Release);
        Ok(())
    }

    /// Refuse all further writes
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn ask_cursor(&self) -> u64 {
        self.shared.ask.load(Ordering::Acquire)
    }

    pub fn available_cursor(&self) -> u64 {
        self.shared.available.load(Ordering::Acquire)
    }
}

/// One record read from the ring
///
/// Borrows the consumer's scratch buffer, so it must be dropped before the
/// next [`RingConsumer::read`].
#[derive(Debug)]
pub struct RingRecord<'a> {
    bytes: &'a [u8],
    end: u64,
}

impl<'a> RingRecord<'a> {
    /// Complete record including its length prefix
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Logical offset one past the record; pass to [`RingConsumer::commit`]
    pub fn end(&self) -> u64 {
        self.end
    }
}

/// Unique read handle
pub struct RingConsumer {
    shared: Arc<Shared>,
    next: u64,
    scratch: Vec<u8>,
}

impl RingConsumer {
    /// Take the next submitted record, or `None` when nothing is ready
    ///
    /// `None` is expected while a producer is still copying the record at
    /// the head; callers poll again later.
    pub fn read(&mut self) -> Option<RingRecord<'_>> {
        let shared = &*self.shared;
        let start = self.next;
        let (word, bit) = shared.flag_slot(start);
        if word.load(Ordering::Acquire) & bit == 0 {
            return None;
        }

        self.scratch.clear();
        // SAFETY: the flag at `start` was published after the whole record,
        // prefix included, was copied in.
        unsafe { shared.copy_out(start, LENGTH_PREFIX_LEN, &mut self.scratch) };
        let len = read_length_prefix(&self.scratch)
            .unwrap_or(LENGTH_PREFIX_LEN)
            .max(LENGTH_PREFIX_LEN);
        // SAFETY: as above; the record occupies [start, start + len).
        unsafe {
            shared.copy_out(
                start + LENGTH_PREFIX_LEN as u64,
                len - LENGTH_PREFIX_LEN,
                &mut self.scratch,
            )
        };
        word.fetch_and(!bit, Ordering::Release);

        let end = start + len as u64;
        self.next = end;
        Some(RingRecord {
            bytes: &self.scratch,
            end,
        })
    }

    /// Release every byte before `end` back to producers
    pub fn commit(&mut self, end: u64) {
        self.shared.available.store(end, Ordering::Release);
    }

    /// Refuse all further writes; already submitted records stay readable
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn ask_cursor(&self) -> u64 {
        self.shared.ask.load(Ordering::Acquire)
    }

    pub fn available_cursor(&self) -> u64 {
        self.shared.available.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::Frame;

    fn record(tag: u8, body_len: usize) -> Vec<u8> {
        Frame::encode(60 + tag as u16, &vec![tag; body_len], &[])
            .unwrap()
            .into_bytes()
    }

    #[test]
    fn test_rejects_bad_capacity() {
        assert!(matches!(
            ring_buffer(100),
            Err(RingError::InvalidCapacity { capacity: 100, .. })
        ));
        assert!(ring_buffer(4).is_err());
        assert!(ring_buffer(64).is_ok());
    }

    #[test]
    fn test_write_read_commit() {
        let (producer, mut consumer) = ring_buffer(256).unwrap();
        let data = record(1, 10);
        producer.write(&data).unwrap();

        let rec = consumer.read().unwrap();
        assert_eq!(rec.bytes(), data.as_slice());
        assert_eq!(rec.end(), 18);
        let end = rec.end();
        consumer.commit(end);

        assert!(consumer.read().is_none());
        assert_eq!(consumer.ask_cursor(), 18);
        assert_eq!(consumer.available_cursor(), 18);
    }

    #[test]
    fn test_empty_ring_reads_nothing() {
        let (_producer, mut consumer) = ring_buffer(64).unwrap();
        assert!(consumer.read().is_none());
    }

    #[test]
    fn test_record_must_carry_its_length() {
        let (producer, _consumer) = ring_buffer(64).unwrap();
        assert_eq!(
            producer.write(&[9, 0, 0, 0, 1]),
            Err(RingError::InvalidRecord {
                declared: Some(9),
                actual: 5
            })
        );
        assert_eq!(
            producer.write(&[1, 2]),
            Err(RingError::InvalidRecord {
                declared: None,
                actual: 2
            })
        );
    }

    #[test]
    fn test_overflow_until_commit() {
        let (producer, mut consumer) = ring_buffer(64).unwrap();
        let data = record(2, 12); // 20 bytes

        producer.write(&data).unwrap();
        producer.write(&data).unwrap();
        producer.write(&data).unwrap();
        let err = producer.write(&data).unwrap_err();
        assert!(matches!(err, RingError::Overflow { requested: 20, in_flight: 60, capacity: 64 }));

        let end = consumer.read().unwrap().end();
        consumer.commit(end);
        producer.write(&data).unwrap();
        assert!(producer.ask_cursor() - producer.available_cursor() < 64);
    }

    #[test]
    fn test_record_equal_to_capacity_never_fits() {
        let (producer, _consumer) = ring_buffer(16).unwrap();
        assert!(matches!(
            producer.write(&record(0, 8)),
            Err(RingError::Overflow { .. })
        ));
    }

    #[test]
    fn test_wraparound_preserves_bytes() {
        let (producer, mut consumer) = ring_buffer(32).unwrap();
        let first = record(1, 12); // 20 bytes
        let second = record(2, 10); // 18 bytes, wraps at offset 20

        producer.write(&first).unwrap();
        let end = consumer.read().unwrap().end();
        consumer.commit(end);

        producer.write(&second).unwrap();
        let rec = consumer.read().unwrap();
        assert_eq!(rec.bytes(), second.as_slice());
        assert_eq!(rec.end(), 38);
    }

    #[test]
    fn test_consumer_waits_for_unsubmitted_head() {
        let (producer, mut consumer) = ring_buffer(128).unwrap();
        let data = record(3, 4);

        // Reserve a range by hand without publishing it, as a slow producer would.
        let shared = &producer.shared;
        shared.ask.fetch_add(data.len() as u64, Ordering::AcqRel);
        producer.write(&data).unwrap();

        assert!(consumer.read().is_none());

        unsafe { shared.copy_in(0, &data) };
        let (word, bit) = shared.flag_slot(0);
        word.fetch_or(bit, Ordering::Release);

        let end = consumer.read().unwrap().end();
        assert_eq!(end, data.len() as u64);
        assert_eq!(consumer.read().unwrap().bytes(), data.as_slice());
    }

    #[test]
    fn test_closed_rejects_writes_but_drains() {
        let (producer, mut consumer) = ring_buffer(64).unwrap();
        let data = record(4, 4);
        producer.write(&data).unwrap();

        consumer.close();
        assert_eq!(producer.write(&data), Err(RingError::Closed));
        assert!(producer.is_closed());
        assert!(consumer.read().is_some());
    }
}
