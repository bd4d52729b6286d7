//! Join-all aggregation over a fixed channel set
//!
//! A bag keeps one FIFO slot per channel. A generation completes as soon as
//! every slot holds at least one frame; the oldest frame from each slot is
//! taken, in registration order, and handed to the bag's handler. Surplus
//! arrivals wait in their slot for the next generation, so frames never bleed
//! across generations and none is delivered twice.
//!
//! Each slot holds at most `depth` frames. A channel that keeps sending while
//! a sibling stays silent displaces its own oldest frame.

use codec::{Channel, Frame};
use std::collections::VecDeque;
use std::sync::Arc;

/// Callback for a completed generation; frames arrive in registration order
pub type BagHandler = Arc<dyn Fn(&[Frame]) + Send + Sync>;

/// Stable identifier of a bag inside one registry
pub type BagId = u32;

/// Frames one slot may hold while waiting for its siblings
pub const DEFAULT_SLOT_DEPTH: usize = 1024;

/// Result of filing one frame into a bag
#[derive(Debug)]
pub enum Offer {
    Pending,
    /// Slot was full; its oldest frame was dropped to make room
    Displaced,
    Complete(Vec<Frame>),
}

pub struct Bag {
    channels: Vec<Channel>,
    slots: Vec<VecDeque<Frame>>,
    depth: usize,
    handler: BagHandler,
}

impl Bag {
    /// `depth` is clamped to at least one frame per slot
    pub fn new(channels: Vec<Channel>, depth: usize, handler: BagHandler) -> Self {
        let depth = depth.max(1);
        let slots = channels.iter().map(|_| VecDeque::new()).collect();
        Self {
            channels,
            slots,
            depth,
            handler,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn handler(&self) -> &BagHandler {
        &self.handler
    }

    pub fn touches(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }

    /// File `frame` into `slot`
    ///
    /// A full slot only exists while some sibling slot is empty, so a
    /// displacing offer never completes a generation.
    pub fn offer(&mut self, slot: usize, frame: Frame) -> Offer {
        let Some(queue) = self.slots.get_mut(slot) else {
            return Offer::Pending;
        };
        if queue.len() >= self.depth {
            queue.pop_front();
            queue.push_back(frame);
            return Offer::Displaced;
        }
        queue.push_back(frame);

        if self.slots.iter().any(VecDeque::is_empty) {
            return Offer::Pending;
        }
        match self.slots.iter_mut().map(VecDeque::pop_front).collect() {
            Some(generation) => Offer::Complete(generation),
            None => Offer::Pending,
        }
    }

    /// Frames buffered towards incomplete generations
    pub fn pending(&self) -> usize {
        self.slots.iter().map(VecDeque::len).sum()
    }

    /// Discard every partial generation
    pub fn clear(&mut self) -> usize {
        let pending = self.pending();
        self.slots.iter_mut().for_each(VecDeque::clear);
        pending
    }
}
