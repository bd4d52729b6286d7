//! Channel ownership directory
//!
//! Every pattern resolves its destination channel here first. The owner
//! decides the transport: local channels go through this node's ring buffer,
//! group and identity channels through the routing table.

use codec::Channel;
use dashmap::DashMap;
use network::MachineId;
use tracing::debug;

/// Where frames for a channel are delivered
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelOwner {
    /// Handled by this node's serial engine
    Local,
    /// Handled by the working members of a group
    Group(String),
    /// Handled by one specific node
    Identity(MachineId),
}

#[derive(Debug, Default)]
pub struct ChannelDirectory {
    owners: DashMap<Channel, ChannelOwner>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the owner of `channel`, returning the previous one
    pub fn assign(&self, channel: Channel, owner: ChannelOwner) -> Option<ChannelOwner> {
        debug!(channel, ?owner, "channel assigned");
        self.owners.insert(channel, owner)
    }

    pub fn assign_local(&self, channels: &[Channel]) {
        for &channel in channels {
            self.assign(channel, ChannelOwner::Local);
        }
    }

    pub fn release(&self, channel: Channel) -> Option<ChannelOwner> {
        self.owners.remove(&channel).map(|(_, owner)| owner)
    }

    /// Drop every locally owned channel; returns how many were removed
    pub fn release_local(&self) -> usize {
        let before = self.owners.len();
        self.owners.retain(|_, owner| *owner != ChannelOwner::Local);
        before - self.owners.len()
    }

    pub fn owner(&self, channel: Channel) -> Option<ChannelOwner> {
        self.owners.get(&channel).map(|entry| entry.value().clone())
    }

    /// Locally owned channels in ascending order
    pub fn local_channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .owners
            .iter()
            .filter(|entry| *entry.value() == ChannelOwner::Local)
            .map(|entry| *entry.key())
            .collect();
        channels.sort_unstable();
        channels
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
