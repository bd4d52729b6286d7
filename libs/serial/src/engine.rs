//! # Serial Engine - Tick-Driven Dispatch Lifecycle
//!
//! ## Purpose
//!
//! Couples one ring buffer with one handler registry and a single consumer
//! task that drains the ring on a fixed tick instead of waking per message.
//! Producers obtain a [`RingProducer`] from the engine and write encoded
//! frames; handlers run on the drain task.
//!
//! ## Lifecycle
//!
//! ```text
//! Paused ──start()──> Working ──shutdown()──> Draining ──> Closed
//!   │                    │                       │
//!   subscribe*           unsubscribe_group       ring closed to producers,
//!   unsubscribe_group    (queued, acked on tick) settle, final drain,
//!   (applied directly)                           deferred release
//! ```
//!
//! Registration is only allowed while paused. Unsubscribing while working is
//! serialized through the drain task so the registry is never touched
//! mid-dispatch by another thread.
//!
//! ## Shutdown
//!
//! The drain task stops ticking, the ring refuses new writes, the engine
//! sleeps `shutdown_settle_ticks` ticks so producers already copying can
//! finish, then drains once more. Partial join-all generations are discarded.
//! The dispatcher, and with it every handler, is released on a detached task
//! after `release_grace`; a panic while releasing is logged, never propagated.

use crate::bag::BagHandler;
use crate::config::EngineConfig;
use crate::dispatcher::{panic_message, Dispatcher};
use crate::error::{EngineError, EngineResult};
use crate::registry::Handler;
use crate::ring::{ring_buffer, RingProducer};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use codec::{Channel, Frame, FrameView};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Observable engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EngineState {
    Paused = 0,
    Working = 1,
    Draining = 2,
    Closed = 3,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paused => "paused",
            Self::Working => "working",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

enum ControlRequest {
    Unsubscribe {
        channels: Vec<Channel>,
        ack: oneshot::Sender<usize>,
    },
}

type SharedDispatcher = Arc<Mutex<Option<Dispatcher>>>;

pub struct SerialEngine {
    config: EngineConfig,
    state: AtomicU8,
    producer: RingProducer,
    dispatcher: SharedDispatcher,
    stats: Arc<EngineStats>,
    control_tx: mpsc::Sender<ControlRequest>,
    control_rx: Mutex<Option<mpsc::Receiver<ControlRequest>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SerialEngine {
    /// Build a paused engine with its own ring buffer and registry
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let (producer, consumer) = ring_buffer(config.ring_capacity)?;
        let stats = Arc::new(EngineStats::default());
        let mut dispatcher = Dispatcher::new(consumer, Arc::clone(&stats));
        dispatcher.registry_mut().set_bag_depth(config.bag_slot_depth);
        let (control_tx, control_rx) = mpsc::channel(config.control_queue_depth.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            state: AtomicU8::new(EngineState::Paused.into()),
            producer,
            dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
            stats,
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> EngineState {
        EngineState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(EngineState::Closed)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write handle for this engine's ring buffer
    pub fn producer(&self) -> RingProducer {
        self.producer.clone()
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Channels currently holding a route, in ascending order
    pub fn subscribed_channels(&self) -> Vec<Channel> {
        self.dispatcher
            .lock()
            .as_ref()
            .map(|d| d.registry().channels())
            .unwrap_or_default()
    }

    /// Register `handler` for `channel`; the last registration wins
    pub fn subscribe<F>(&self, channel: Channel, handler: F) -> EngineResult<()>
    where
        F: Fn(&FrameView<'_>) + Send + Sync + 'static,
    {
        self.ensure_paused(channel)?;
        let handler: Handler = Arc::new(handler);
        self.with_dispatcher(|d| d.registry_mut().subscribe(channel, handler))
    }

    /// Register one handler on several channels; each frame is delivered once
    pub fn subscribe_any<F>(&self, channels: &[Channel], handler: F) -> EngineResult<()>
    where
        F: Fn(&FrameView<'_>) + Send + Sync + 'static,
    {
        let first = *channels.first().ok_or(EngineError::EmptyChannelSet {
            operation: "subscribe_any",
        })?;
        self.ensure_paused(first)?;

        let handler: Handler = Arc::new(handler);
        self.with_dispatcher(|d| {
            for channel in channels {
                d.registry_mut().subscribe(*channel, Arc::clone(&handler));
            }
        })
    }

    /// Join-all: invoke `handler` once every channel has delivered a frame
    ///
    /// Frames are passed in the order `channels` lists them.
    pub fn subscribe_all<F>(&self, channels: &[Channel], handler: F) -> EngineResult<()>
    where
        F: Fn(&[Frame]) + Send + Sync + 'static,
    {
        let first = *channels.first().ok_or(EngineError::EmptyChannelSet {
            operation: "subscribe_all",
        })?;
        self.ensure_paused(first)?;

        let mut seen = HashSet::with_capacity(channels.len());
        if let Some(channel) = channels.iter().find(|c| !seen.insert(**c)) {
            return Err(EngineError::DuplicateChannel { channel: *channel });
        }

        let handler: BagHandler = Arc::new(handler);
        self.with_dispatcher(|d| {
            let bag = d.registry_mut().subscribe_all(channels, handler);
            debug!(bag, ?channels, "join-all bag registered");
        })
    }

    /// Remove every route for `channels`
    ///
    /// Applied immediately while paused. While working the request is queued
    /// to the drain task and fails with [`EngineError::Timeout`] if it is not
    /// acknowledged within `unsubscribe_timeout_ticks` ticks.
    pub async fn unsubscribe_group(&self, channels: &[Channel]) -> EngineResult<usize> {
        match self.state() {
            EngineState::Paused => self.with_dispatcher(|d| d.unsubscribe(channels)),
            EngineState::Working => {
                let ticks = self.config.unsubscribe_timeout_ticks;
                let (ack_tx, ack_rx) = oneshot::channel();
                let request = ControlRequest::Unsubscribe {
                    channels: channels.to_vec(),
                    ack: ack_tx,
                };

                let exchange = async {
                    self.control_tx
                        .send(request)
                        .await
                        .map_err(|_| EngineError::Closed)?;
                    ack_rx.await.map_err(|_| EngineError::Closed)
                };

                tokio::time::timeout(self.config.ticks(ticks), exchange)
                    .await
                    .map_err(|_| EngineError::Timeout {
                        operation: "unsubscribe_group",
                        ticks,
                    })?
            }
            EngineState::Draining | EngineState::Closed => Err(EngineError::Closed),
        }
    }

    /// Spawn the drain task; requires a running tokio runtime
    pub fn start(&self) -> EngineResult<()> {
        self.transition(EngineState::Paused, EngineState::Working, "start")?;

        let Some(control_rx) = self.control_rx.lock().take() else {
            return Err(EngineError::InvalidState {
                operation: "start",
                state: self.state().as_str(),
            });
        };

        let handle = tokio::spawn(drain_loop(
            Arc::clone(&self.dispatcher),
            control_rx,
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.stats),
            self.config.tick,
        ));
        *self.task.lock() = Some(handle);

        info!(
            tick_us = self.config.tick.as_micros() as u64,
            capacity = self.config.ring_capacity,
            "serial engine working"
        );
        Ok(())
    }

    /// Drain and close; calling it again is a no-op
    pub async fn shutdown(&self) -> EngineResult<()> {
        let draining = self
            .transition(EngineState::Working, EngineState::Draining, "shutdown")
            .or_else(|_| self.transition(EngineState::Paused, EngineState::Draining, "shutdown"));
        if draining.is_err() {
            debug!(state = self.state().as_str(), "shutdown already in progress");
            return Ok(());
        }
        info!("serial engine draining");

        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "drain task ended abnormally");
            }
        }

        self.producer.close();
        tokio::time::sleep(self.config.ticks(self.config.shutdown_settle_ticks)).await;

        let dispatcher = {
            let mut guard = self.dispatcher.lock();
            if let Some(dispatcher) = guard.as_mut() {
                let flushed = dispatcher.drain();
                let discarded = dispatcher.discard_partial_generations();
                debug!(flushed, discarded, "final drain complete");
            }
            guard.take()
        };

        self.state.store(EngineState::Closed.into(), Ordering::Release);
        let stats = self.stats.snapshot();
        info!(
            dispatched = stats.dispatched,
            faults = stats.handler_faults,
            unrouted = stats.unrouted,
            "serial engine closed"
        );

        if let Some(dispatcher) = dispatcher {
            schedule_release(dispatcher, self.config.release_grace);
        }
        Ok(())
    }

    fn transition(
        &self,
        from: EngineState,
        to: EngineState,
        operation: &'static str,
    ) -> EngineResult<()> {
        self.state
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| EngineError::InvalidState {
                operation,
                state: EngineState::try_from(actual)
                    .unwrap_or(EngineState::Closed)
                    .as_str(),
            })
    }

    fn ensure_paused(&self, channel: Channel) -> EngineResult<()> {
        match self.state() {
            EngineState::Paused => Ok(()),
            EngineState::Working => Err(EngineError::AlreadyWorking { channel }),
            EngineState::Draining | EngineState::Closed => Err(EngineError::Closed),
        }
    }

    fn with_dispatcher<R>(&self, f: impl FnOnce(&mut Dispatcher) -> R) -> EngineResult<R> {
        let mut guard = self.dispatcher.lock();
        guard.as_mut().map(f).ok_or(EngineError::Closed)
    }
}

impl Drop for SerialEngine {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn drain_loop(
    dispatcher: SharedDispatcher,
    mut control_rx: mpsc::Receiver<ControlRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<EngineStats>,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {
                stats.record_tick();
                let mut guard = dispatcher.lock();
                let Some(dispatcher) = guard.as_mut() else {
                    break;
                };
                while let Ok(request) = control_rx.try_recv() {
                    match request {
                        ControlRequest::Unsubscribe { channels, ack } => {
                            let removed = dispatcher.unsubscribe(&channels);
                            let _ = ack.send(removed);
                        }
                    }
                }
                dispatcher.drain();
            }
        }
    }
    debug!("drain loop stopped");
}

fn schedule_release(dispatcher: Dispatcher, grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        release(dispatcher);
    });
}

fn release(dispatcher: Dispatcher) {
    match catch_unwind(AssertUnwindSafe(move || drop(dispatcher))) {
        Ok(()) => debug!("dispatcher released"),
        Err(panic) => error!(
            panic = %panic_message(&*panic),
            "fault while releasing dispatcher"
        ),
    }
}
