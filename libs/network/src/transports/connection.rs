//! Handle to one live peer session
//!
//! The routing table stores `Arc<PeerConnection>` in its slots. Sending only
//! enqueues onto the session's bounded writer queue; the writer task owns the
//! socket. Closing is a one-shot signal observed by both session tasks.

use crate::cluster::MachineId;
use crate::error::{Result, TransportError};
use codec::Frame;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Sending half of a peer session
#[derive(Debug)]
pub struct PeerConnection {
    session_id: i64,
    machine_id: MachineId,
    remote_addr: Option<SocketAddr>,
    tx: mpsc::Sender<Frame>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    frames_queued: AtomicU64,
}

impl PeerConnection {
    /// Connection whose writer queue is handed straight to the caller
    ///
    /// Used for in-process peers and by tests that inspect outbound frames.
    pub fn detached(
        session_id: i64,
        machine_id: MachineId,
        queue_depth: usize,
    ) -> (std::sync::Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        (std::sync::Arc::new(Self::new(session_id, machine_id, None, tx)), rx)
    }

    pub(crate) fn new(
        session_id: i64,
        machine_id: MachineId,
        remote_addr: Option<SocketAddr>,
        tx: mpsc::Sender<Frame>,
    ) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            session_id,
            machine_id,
            remote_addr,
            tx,
            closed: AtomicBool::new(false),
            close_tx,
            frames_queued: AtomicU64::new(0),
        }
    }

    /// Queue a frame for the writer without waiting
    pub fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed {
                session_id: self.session_id,
            });
        }
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.frames_queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::resource_exhausted(
                "send_queue",
                format!(
                    "session {} to machine {} has {} frames pending",
                    self.session_id,
                    self.machine_id,
                    self.tx.max_capacity()
                ),
            )),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed {
                session_id: self.session_id,
            }),
        }
    }

    /// Signal both session tasks to stop; true only for the first caller
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_tx.send_replace(true);
        debug!(
            session_id = self.session_id,
            machine_id = self.machine_id,
            "peer connection closed"
        );
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Receiver that flips to `true` once [`close`](Self::close) runs
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Frames accepted onto the writer queue over the connection's lifetime
    pub fn frames_queued(&self) -> u64 {
        self.frames_queued.load(Ordering::Relaxed)
    }
}
