//! Thread-Local Buffer Pool for Frame Construction
//!
//! ## Purpose
//!
//! Owned frames draw their backing `Vec<u8>` from a per-thread free list and
//! hand it back when dropped. Steady-state frame construction on a busy thread
//! therefore reuses a small set of hot allocations instead of hitting the
//! allocator for every message.
//!
//! ## Architecture Role
//!
//! ```text
//! Frame::encode ──acquire──> [Thread-Local Free List] <──release── Frame::drop
//!                                  ↑
//!                        bounded count, bounded capacity
//! ```
//!
//! ## Thread-Local Implementation
//!
//! ```text
//! Thread A: [free list: 0..=MAX_POOLED_BUFFERS]
//! Thread B: [free list: 0..=MAX_POOLED_BUFFERS]
//!           ↑ No contention - each thread has an independent pool
//! ```
//!
//! A frame built on one thread and dropped on another simply migrates its
//! buffer to the dropping thread's pool. Oversized buffers are never retained,
//! so one large frame cannot pin memory in a pool forever.

use std::cell::RefCell;

/// Default capacity for a freshly allocated frame buffer
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// Maximum number of idle buffers retained per thread
pub const MAX_POOLED_BUFFERS: usize = 256;

/// Buffers whose capacity exceeds this are dropped instead of pooled
pub const MAX_POOLED_CAPACITY: usize = 64 * 1024;

thread_local! {
    static FRAME_BUFFERS: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
}

/// Take an empty buffer with at least `min_capacity` bytes of capacity
///
/// Falls back to a fresh allocation when the pool is empty, already borrowed,
/// or being torn down at thread exit.
pub fn acquire(min_capacity: usize) -> Vec<u8> {
    let pooled = FRAME_BUFFERS
        .try_with(|cell| {
            let mut pool = cell.try_borrow_mut().ok()?;
            pool.pop()
        })
        .ok()
        .flatten();

    match pooled {
        Some(mut buf) => {
            buf.clear();
            if buf.capacity() < min_capacity {
                buf.reserve(min_capacity);
            }
            buf
        }
        None => Vec::with_capacity(min_capacity.max(DEFAULT_BUFFER_CAPACITY)),
    }
}

/// Return a buffer to the current thread's pool
pub fn release(mut buf: Vec<u8>) {
    if buf.capacity() == 0 || buf.capacity() > MAX_POOLED_CAPACITY {
        return;
    }
    buf.clear();

    let _ = FRAME_BUFFERS.try_with(|cell| {
        if let Ok(mut pool) = cell.try_borrow_mut() {
            if pool.len() < MAX_POOLED_BUFFERS {
                pool.push(buf);
            }
        }
    });
}

/// Number of idle buffers in the current thread's pool
pub fn pooled_count() -> usize {
    FRAME_BUFFERS
        .try_with(|cell| cell.try_borrow().map(|pool| pool.len()).unwrap_or(0))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuses_allocation() {
        let buf = acquire(128);
        let ptr = buf.as_ptr();
        let before = pooled_count();
        release(buf);
        assert_eq!(pooled_count(), before + 1);

        let reused = acquire(64);
        assert_eq!(reused.as_ptr(), ptr);
        assert!(reused.is_empty());
        assert_eq!(pooled_count(), before);
    }

    #[test]
    fn test_oversized_buffers_not_retained() {
        let before = pooled_count();
        release(Vec::with_capacity(MAX_POOLED_CAPACITY + 1));
        assert_eq!(pooled_count(), before);
    }

    #[test]
    fn test_acquire_grows_small_pooled_buffer() {
        release(Vec::with_capacity(16));
        let buf = acquire(4096);
        assert!(buf.capacity() >= 4096);
    }

    #[test]
    fn test_pools_are_thread_local() {
        release(acquire(32));
        let other = std::thread::spawn(pooled_count).join().unwrap();
        assert_eq!(other, 0);
    }
}
