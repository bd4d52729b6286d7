//! Addressing Patterns
//!
//! ## Purpose
//!
//! The six ways application code puts a frame on the bus. Each builds the
//! frame's extend segment for its pattern, resolves the destination channel
//! through the [`ChannelDirectory`] and hands the frame to either the local
//! ring buffer or the routing table.
//!
//! | pattern | extend | destination |
//! |---|---|---|
//! | `notify` | empty | channel owner |
//! | `call` | `[sender:4][reply:2]` | channel owner |
//! | `publish` | empty | every working member of the owner group |
//! | `ventilator` | remaining hops | first channel's owner |
//! | `next` | hops after the first | first remaining hop's owner |
//! | `reply` | empty | sender identity, on the reply channel |
//!
//! ## Remote Sends
//!
//! The admission gate is consulted before anything leaves the node; routing
//! failures count against it and successful sends reset it. Local delivery
//! never touches the gate.

use crate::channels::{ChannelDirectory, ChannelOwner};
use crate::error::{BusError, BusResult};
use codec::{Channel, Frame, FrameView, PipelineHops, ReplyEnvelope};
use network::discovery::AdmissionGate;
use network::{MachineId, RoutingResult, RoutingTable};
use serial::RingProducer;
use std::sync::Arc;
use tracing::{debug, trace};

/// Where a frame ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to this node's ring buffer
    Local,
    /// Queued on the session to one identity
    Remote(MachineId),
    /// Queued to this many group members
    Broadcast(usize),
}

struct BusInner {
    local_id: MachineId,
    channels: Arc<ChannelDirectory>,
    local: RingProducer,
    table: Arc<RoutingTable>,
    gate: Arc<dyn AdmissionGate>,
}

/// Handle for sending frames; cheap to clone into handlers
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(
        local_id: MachineId,
        channels: Arc<ChannelDirectory>,
        local: RingProducer,
        table: Arc<RoutingTable>,
        gate: Arc<dyn AdmissionGate>,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                local_id,
                channels,
                local,
                table,
                gate,
            }),
        }
    }

    pub fn local_id(&self) -> MachineId {
        self.inner.local_id
    }

    pub fn channels(&self) -> &Arc<ChannelDirectory> {
        &self.inner.channels
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.inner.table
    }

    /// Fire-and-forget to the owner of `channel`
    pub fn notify(&self, channel: Channel, payload: &[u8]) -> BusResult<Delivery> {
        let frame = Frame::encode(channel, payload, &[])?;
        self.route(frame, false)
    }

    /// Request whose handler answers on `reply_channel` via [`Bus::reply`]
    pub fn call(
        &self,
        channel: Channel,
        payload: &[u8],
        reply_channel: Channel,
    ) -> BusResult<Delivery> {
        let envelope = ReplyEnvelope::new(self.inner.local_id, reply_channel);
        let frame = Frame::encode(channel, payload, &envelope.encode())?;
        self.route(frame, false)
    }

    /// Broadcast to every working member of the channel's group
    ///
    /// Local and identity owners receive the frame exactly as with `notify`.
    pub fn publish(&self, channel: Channel, payload: &[u8]) -> BusResult<Delivery> {
        let frame = Frame::encode(channel, payload, &[])?;
        self.route(frame, true)
    }

    /// Start a pipeline: deliver to `channels[0]` carrying the rest as hops
    pub fn ventilator(&self, channels: &[Channel], payload: &[u8]) -> BusResult<Delivery> {
        let (&first, rest) = channels.split_first().ok_or(BusError::EmptyPipeline)?;
        let frame = Frame::encode(first, payload, &PipelineHops::encode(rest))?;
        debug!(channel = first, hops = rest.len(), "pipeline started");
        self.route(frame, false)
    }

    /// Forward `payload` to the next stage of `incoming`'s pipeline
    pub fn next(&self, incoming: &FrameView<'_>, payload: &[u8]) -> BusResult<Delivery> {
        let Some((hop, rest)) = PipelineHops::split_first(incoming.extend())? else {
            return Err(BusError::PipelineFinished {
                channel: incoming.frame_type(),
            });
        };
        let frame = Frame::encode(hop, payload, rest)?;
        trace!(from = incoming.frame_type(), to = hop, remaining = rest.len() / 2, "pipeline hop");
        self.route(frame, false)
    }

    /// Answer a frame sent with [`Bus::call`]
    pub fn reply(&self, incoming: &FrameView<'_>, payload: &[u8]) -> BusResult<Delivery> {
        let envelope = ReplyEnvelope::decode(incoming.extend()).map_err(|_| {
            BusError::MissingReplyEnvelope {
                channel: incoming.frame_type(),
                extend_len: incoming.extend_length(),
            }
        })?;
        let frame = Frame::encode(envelope.reply_channel, payload, &[])?;
        self.send_identity(envelope.reply_channel, envelope.sender, &frame)
    }

    /// Count in-flight work against `peer` until the guard drops
    ///
    /// A node whose own identity is `Die` tears its routing table down once
    /// every guard is gone.
    pub fn occupy(&self, peer: MachineId) -> BusResult<OccupancyGuard> {
        self.inner.table.change_occupancy(peer, 1)?;
        Ok(OccupancyGuard {
            table: Arc::clone(&self.inner.table),
            peer,
        })
    }

    fn route(&self, frame: Frame, broadcast: bool) -> BusResult<Delivery> {
        let channel = frame.frame_type();
        let owner = self
            .inner
            .channels
            .owner(channel)
            .ok_or(BusError::UnknownChannel { channel })?;

        match owner {
            ChannelOwner::Local => self.deliver_local(&frame),
            ChannelOwner::Identity(id) => self.send_identity(channel, id, &frame),
            ChannelOwner::Group(group) if broadcast => self
                .remote(channel, || self.inner.table.broadcast_group(&group, &frame))
                .map(Delivery::Broadcast),
            ChannelOwner::Group(group) => self
                .remote(channel, || self.inner.table.ask_group(&group, &frame))
                .map(Delivery::Remote),
        }
    }

    fn send_identity(&self, channel: Channel, id: MachineId, frame: &Frame) -> BusResult<Delivery> {
        if id == self.inner.local_id {
            return self.deliver_local(frame);
        }
        self.remote(channel, || self.inner.table.ask_appoint(id, frame))?;
        Ok(Delivery::Remote(id))
    }

    fn deliver_local(&self, frame: &Frame) -> BusResult<Delivery> {
        self.inner.local.write(frame.as_bytes())?;
        trace!(channel = frame.frame_type(), len = frame.total_length(), "delivered locally");
        Ok(Delivery::Local)
    }

    fn remote<T>(&self, channel: Channel, send: impl FnOnce() -> RoutingResult<T>) -> BusResult<T> {
        let gate = &self.inner.gate;
        if !gate.is_passable() {
            debug!(channel, "remote send refused by admission gate");
            return Err(BusError::AdmissionRefused { channel });
        }
        match send() {
            Ok(sent) => {
                gate.record_success();
                Ok(sent)
            }
            Err(e) => {
                if e.is_peer_fault() {
                    gate.record_failure();
                }
                debug!(channel, error = %e, "remote send failed");
                Err(e.into())
            }
        }
    }
}

/// Occupancy held against one peer; released on drop
#[must_use = "occupancy is released as soon as the guard drops"]
pub struct OccupancyGuard {
    table: Arc<RoutingTable>,
    peer: MachineId,
}

impl OccupancyGuard {
    pub fn peer(&self) -> MachineId {
        self.peer
    }
}

impl Drop for OccupancyGuard {
    fn drop(&mut self) {
        if let Err(e) = self.table.change_occupancy(self.peer, -1) {
            debug!(peer = self.peer, error = %e, "occupancy release dropped");
        }
    }
}
