//! # Dispatcher - Synchronous Drain of One Ring Buffer
//!
//! ## Purpose
//!
//! Owns the consumer end of a ring buffer together with the handler registry
//! and turns ring records into handler invocations. The engine calls
//! [`Dispatcher::drain`] once per tick; tests call it directly.
//!
//! ## Fault Isolation
//!
//! Every handler runs under `catch_unwind`. A panicking handler is logged
//! with its channel and counted; the frame that caused it is lost and the
//! drain continues with the next record.

use crate::bag::{BagHandler, Offer};
use crate::registry::{Handler, Registry, Route};
use crate::ring::RingConsumer;
use crate::stats::EngineStats;
use codec::{Channel, Frame, FrameView};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct Dispatcher {
    consumer: RingConsumer,
    registry: Registry,
    stats: Arc<EngineStats>,
}

impl Dispatcher {
    pub fn new(consumer: RingConsumer, stats: Arc<EngineStats>) -> Self {
        Self {
            consumer,
            registry: Registry::new(),
            stats,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn consumer(&self) -> &RingConsumer {
        &self.consumer
    }

    /// Dispatch every submitted record; returns the number handled
    ///
    /// Stops at the first record whose producer has not finished writing.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Some(record) = self.consumer.read() {
            let end = record.end();
            match FrameView::decode(record.bytes()) {
                Ok(view) => Self::dispatch(&mut self.registry, &self.stats, &view),
                Err(e) => {
                    self.stats.record_malformed();
                    warn!(error = %e, end, "discarding malformed ring record");
                }
            }
            self.consumer.commit(end);
            handled += 1;
        }
        handled
    }

    /// Remove `channels` from the registry; returns how many were subscribed
    pub fn unsubscribe(&mut self, channels: &[Channel]) -> usize {
        let removed = self.registry.unsubscribe(channels);
        debug!(?channels, removed, "channels unsubscribed");
        removed
    }

    /// Drop partial join-all generations ahead of shutdown
    pub fn discard_partial_generations(&mut self) -> usize {
        let discarded = self.registry.clear_partial_generations();
        if discarded > 0 {
            debug!(discarded, "partial join-all generations discarded");
        }
        discarded
    }

    fn dispatch(registry: &mut Registry, stats: &EngineStats, view: &FrameView<'_>) {
        let channel = view.frame_type();
        let route = match registry.route(channel) {
            Some(route) => route.clone(),
            None => {
                stats.record_unrouted();
                debug!(channel, len = view.total_length(), "no handler for channel");
                return;
            }
        };

        stats.record_dispatched();
        match route {
            Route::Direct(handler) => invoke(channel, &handler, view, stats),
            Route::Bag { bag, slot } => {
                let Some(bag) = registry.bag_mut(bag) else {
                    return;
                };
                match bag.offer(slot, view.to_frame()) {
                    Offer::Pending => {}
                    Offer::Displaced => {
                        stats.record_bag_overflow();
                        debug!(
                            channel,
                            depth = bag.depth(),
                            "join-all slot full, oldest frame dropped"
                        );
                    }
                    Offer::Complete(generation) => {
                        let handler = Arc::clone(bag.handler());
                        stats.record_generation();
                        invoke_bag(channel, &handler, &generation, stats);
                    }
                }
            }
        }
    }
}

fn invoke(channel: Channel, handler: &Handler, view: &FrameView<'_>, stats: &EngineStats) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(view))) {
        stats.record_fault();
        error!(channel, panic = %panic_message(&*panic), "handler panicked; frame dropped");
    }
}

fn invoke_bag(channel: Channel, handler: &BagHandler, frames: &[Frame], stats: &EngineStats) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(frames))) {
        stats.record_fault();
        error!(
            channel,
            frames = frames.len(),
            panic = %panic_message(&*panic),
            "join-all handler panicked; generation dropped"
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
