//! # Cluster Routing
//!
//! ## Purpose
//!
//! Maps machine identities to live peer connections and groups to their
//! working members. Senders only read atomics; every mutation is serialized
//! through the routing table's single event loop.
//!
//! ## Architecture Role
//!
//! ```text
//! TCP sessions ──register/lost──┐
//! peer directory ──follower─────┼──> [event loop] ──> slots + group index
//! in-flight work ──occupancy────┘                         │
//!                                                          ▼
//!                     ask_appoint / ask_group / broadcast_group (lock-free reads)
//! ```

pub mod follower;
pub mod table;

pub use follower::follow_directory;
pub use table::{PeerSnapshot, RoutingTable};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Cluster-wide node identity; indexes the routing table
pub type MachineId = u32;

/// Lifecycle state of a peer as seen by the routing table
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum PeerState {
    /// Accepting traffic and listed in its group
    Work = 0,
    /// Known but not accepting traffic; also the state of unseen identities
    Pause = 1,
    /// Announced departure
    Die = 2,
}

/// What a state change away from `Die` means
///
/// A fresh session registration revives an identity under either policy;
/// the policy only governs directory chatter about a departed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathPolicy {
    /// Later state reports for a departed identity are stale and ignored
    #[default]
    Sticky,
    /// Later state reports apply, so a reused identity can come back
    Revivable,
}

/// Routing table sizing and policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// This node's own identity
    pub local_id: MachineId,
    /// Number of identity slots; valid ids are `0..max_identities`
    pub max_identities: usize,
    pub death_policy: DeathPolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            local_id: 0,
            max_identities: crate::DEFAULT_MAX_IDENTITIES,
            death_policy: DeathPolicy::Sticky,
        }
    }
}
