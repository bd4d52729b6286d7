//! Peer directory interface and the static in-process directory

use crate::cluster::{MachineId, PeerState};
use crate::error::{DiscoveryError, DiscoveryResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What a node announces about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub machine_id: MachineId,
    pub group: String,
    /// Address other nodes dial
    pub address: SocketAddr,
    pub state: PeerState,
}

/// One change in the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Peer registered or changed its announced state
    Put(PeerInfo),
    /// Peer deregistered or its lease lapsed
    Delete { machine_id: MachineId },
}

/// Proof of a successful identity claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub machine_id: MachineId,
    pub lease_id: i64,
}

/// Membership service the node registers with and follows
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Claim `info.machine_id`; fails if another address holds it
    async fn register_identity(&self, info: PeerInfo) -> DiscoveryResult<Registration>;

    /// Publish a new lifecycle state for a held identity
    async fn update_state(
        &self,
        registration: &Registration,
        state: PeerState,
    ) -> DiscoveryResult<()>;

    /// Give the identity back; watchers see a `Delete`
    async fn deregister(&self, registration: &Registration) -> DiscoveryResult<()>;

    async fn list_peers(&self) -> DiscoveryResult<Vec<PeerInfo>>;

    /// Stream of changes, starting with a `Put` for every current peer
    async fn watch_changes(&self) -> DiscoveryResult<mpsc::Receiver<PeerEvent>>;

    /// Refresh the lease behind `registration`
    async fn keep_alive(&self, registration: &Registration) -> DiscoveryResult<()>;
}

struct Entry {
    info: PeerInfo,
    lease_id: i64,
}

#[derive(Default)]
struct DirectoryState {
    peers: BTreeMap<MachineId, Entry>,
    watchers: Vec<mpsc::Sender<PeerEvent>>,
    next_lease: i64,
}

impl DirectoryState {
    fn publish(&mut self, event: PeerEvent) {
        self.watchers.retain(|watcher| match watcher.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(?event, "directory watcher lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn held(&mut self, registration: &Registration) -> DiscoveryResult<&mut Entry> {
        match self.peers.get_mut(&registration.machine_id) {
            Some(entry) if entry.lease_id == registration.lease_id => Ok(entry),
            _ => Err(DiscoveryError::UnknownLease {
                id: registration.machine_id,
                lease_id: registration.lease_id,
            }),
        }
    }
}

/// In-process directory shared by every node in the same process
///
/// Leases never expire; `keep_alive` only checks the lease is still held.
pub struct StaticDirectory {
    state: Mutex<DirectoryState>,
    watch_depth: usize,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DirectoryState::default()),
            watch_depth: 256,
        }
    }

    /// Directory pre-populated with peers that are never registered through it
    pub fn with_peers(peers: impl IntoIterator<Item = PeerInfo>) -> Self {
        let directory = Self::new();
        {
            let mut state = directory.state.lock();
            for info in peers {
                state.next_lease += 1;
                let lease_id = state.next_lease;
                state.peers.insert(info.machine_id, Entry { info, lease_id });
            }
        }
        directory
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    async fn register_identity(&self, info: PeerInfo) -> DiscoveryResult<Registration> {
        let mut state = self.state.lock();
        if let Some(existing) = state.peers.get(&info.machine_id) {
            if existing.info.address != info.address {
                return Err(DiscoveryError::IdentityTaken {
                    id: info.machine_id,
                    holder: existing.info.address,
                });
            }
        }

        state.next_lease += 1;
        let registration = Registration {
            machine_id: info.machine_id,
            lease_id: state.next_lease,
        };
        info!(
            machine_id = info.machine_id,
            group = %info.group,
            address = %info.address,
            lease_id = registration.lease_id,
            "identity registered"
        );
        state.peers.insert(
            info.machine_id,
            Entry {
                info: info.clone(),
                lease_id: registration.lease_id,
            },
        );
        state.publish(PeerEvent::Put(info));
        Ok(registration)
    }

    async fn update_state(
        &self,
        registration: &Registration,
        peer_state: PeerState,
    ) -> DiscoveryResult<()> {
        let mut state = self.state.lock();
        let entry = state.held(registration)?;
        entry.info.state = peer_state;
        let info = entry.info.clone();
        debug!(machine_id = info.machine_id, state = ?peer_state, "announced state updated");
        state.publish(PeerEvent::Put(info));
        Ok(())
    }

    async fn deregister(&self, registration: &Registration) -> DiscoveryResult<()> {
        let mut state = self.state.lock();
        state.held(registration)?;
        state.peers.remove(&registration.machine_id);
        info!(machine_id = registration.machine_id, "identity deregistered");
        state.publish(PeerEvent::Delete {
            machine_id: registration.machine_id,
        });
        Ok(())
    }

    async fn list_peers(&self) -> DiscoveryResult<Vec<PeerInfo>> {
        Ok(self
            .state
            .lock()
            .peers
            .values()
            .map(|entry| entry.info.clone())
            .collect())
    }

    async fn watch_changes(&self) -> DiscoveryResult<mpsc::Receiver<PeerEvent>> {
        let mut state = self.state.lock();
        let depth = self.watch_depth.max(state.peers.len() + 1);
        let (tx, rx) = mpsc::channel(depth);
        for entry in state.peers.values() {
            tx.try_send(PeerEvent::Put(entry.info.clone()))
                .map_err(|_| DiscoveryError::WatchClosed)?;
        }
        state.watchers.push(tx);
        Ok(rx)
    }

    async fn keep_alive(&self, registration: &Registration) -> DiscoveryResult<()> {
        self.state.lock().held(registration).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: MachineId, port: u16) -> PeerInfo {
        PeerInfo {
            machine_id: id,
            group: "workers".into(),
            address: SocketAddr::from(([127, 0, 0, 1], port)),
            state: PeerState::Work,
        }
    }

    #[tokio::test]
    async fn test_identity_is_exclusive_per_address() {
        let directory = StaticDirectory::new();
        directory.register_identity(peer(1, 7001)).await.unwrap();

        let err = directory.register_identity(peer(1, 7002)).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::IdentityTaken { id: 1, .. }));

        // Same address re-registering gets a fresh lease
        let again = directory.register_identity(peer(1, 7001)).await.unwrap();
        assert_eq!(again.lease_id, 2);
    }

    #[tokio::test]
    async fn test_watch_replays_then_streams() {
        let directory = StaticDirectory::new();
        let first = directory.register_identity(peer(1, 7001)).await.unwrap();
        let mut watch = directory.watch_changes().await.unwrap();

        assert_eq!(watch.recv().await, Some(PeerEvent::Put(peer(1, 7001))));

        directory.update_state(&first, PeerState::Pause).await.unwrap();
        let Some(PeerEvent::Put(info)) = watch.recv().await else {
            panic!("expected put");
        };
        assert_eq!(info.state, PeerState::Pause);

        directory.deregister(&first).await.unwrap();
        assert_eq!(watch.recv().await, Some(PeerEvent::Delete { machine_id: 1 }));
        assert!(directory.list_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_lease_is_rejected() {
        let directory = StaticDirectory::with_peers([peer(3, 7003)]);
        let stale = Registration {
            machine_id: 3,
            lease_id: 99,
        };
        assert!(matches!(
            directory.keep_alive(&stale).await,
            Err(DiscoveryError::UnknownLease { id: 3, lease_id: 99 })
        ));
        assert_eq!(directory.list_peers().await.unwrap(), vec![peer(3, 7003)]);
    }

    #[test]
    fn test_peer_record_json_shape() {
        let json = serde_json::to_value(peer(7, 7007)).unwrap();
        assert_eq!(json["machine_id"], 7);
        assert_eq!(json["address"], "127.0.0.1:7007");
        assert_eq!(json["state"], "Work");

        let parsed: PeerInfo = serde_json::from_str(
            r#"{"machine_id":9,"group":"gw","address":"10.0.0.9:7000","state":"Pause"}"#,
        )
        .unwrap();
        assert_eq!(parsed.state, PeerState::Pause);
        assert_eq!(parsed.group, "gw");
    }
}
