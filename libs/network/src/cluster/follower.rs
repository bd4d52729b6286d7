//! Peer directory follower
//!
//! Turns the directory's change stream into routing table events: a `Put`
//! reports the peer's announced state, a `Delete` is a departure. Peers that
//! appear in `Work` are also forwarded to the optional dial queue so the node
//! can open a session to them.

use super::table::RoutingTable;
use super::PeerState;
use crate::discovery::{PeerEvent, PeerInfo};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Apply directory events until the stream ends or the table stops
///
/// Events about the local identity are ignored; the owning node drives its
/// own slot so that its departure waits for local work to drain.
pub async fn follow_directory(
    table: Arc<RoutingTable>,
    mut events: mpsc::Receiver<PeerEvent>,
    dial: Option<mpsc::UnboundedSender<PeerInfo>>,
) {
    let local_id = table.local_id();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = table.stopped() => break,
        };
        let Some(event) = event else {
            info!("peer directory watch ended");
            break;
        };

        let applied = match event {
            PeerEvent::Put(info) if info.machine_id == local_id => {
                trace!(state = ?info.state, "own directory entry changed");
                Ok(())
            }
            PeerEvent::Delete { machine_id } if machine_id == local_id => Ok(()),
            PeerEvent::Put(info) => {
                debug!(
                    peer = info.machine_id,
                    state = ?info.state,
                    group = %info.group,
                    "directory put"
                );
                let result = table.notify_state(info.machine_id, info.state);
                if info.state == PeerState::Work {
                    if let Some(dial) = &dial {
                        let _ = dial.send(info);
                    }
                }
                result
            }
            PeerEvent::Delete { machine_id } => {
                debug!(peer = machine_id, "directory delete");
                table.notify_departure(machine_id)
            }
        };

        if let Err(e) = applied {
            warn!(error = %e, "directory event not applied");
            if table.is_stopped() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterConfig, DeathPolicy};
    use std::net::SocketAddr;

    fn info(id: u32, state: PeerState) -> PeerInfo {
        PeerInfo {
            machine_id: id,
            group: "workers".into(),
            address: SocketAddr::from(([127, 0, 0, 1], 9000 + id as u16)),
            state,
        }
    }

    #[tokio::test]
    async fn test_events_become_state_changes_and_dials() {
        let table = RoutingTable::spawn(ClusterConfig {
            local_id: 0,
            max_identities: 8,
            death_policy: DeathPolicy::Sticky,
        });
        let (tx, rx) = mpsc::channel(8);
        let (dial_tx, mut dial_rx) = mpsc::unbounded_channel();
        let follower = tokio::spawn(follow_directory(Arc::clone(&table), rx, Some(dial_tx)));

        tx.send(PeerEvent::Put(info(0, PeerState::Work))).await.unwrap();
        tx.send(PeerEvent::Put(info(2, PeerState::Work))).await.unwrap();
        tx.send(PeerEvent::Put(info(3, PeerState::Pause))).await.unwrap();
        tx.send(PeerEvent::Delete { machine_id: 4 }).await.unwrap();
        drop(tx);
        follower.await.unwrap();
        table.flush().await.unwrap();

        assert_eq!(dial_rx.recv().await.unwrap().machine_id, 2);
        assert!(dial_rx.try_recv().is_err());
        assert_eq!(table.state(2), Some(PeerState::Work));
        assert_eq!(table.state(3), Some(PeerState::Pause));
        assert_eq!(table.state(4), Some(PeerState::Die));
    }

    #[tokio::test]
    async fn test_own_departure_is_left_to_the_node() {
        let table = RoutingTable::spawn(ClusterConfig {
            local_id: 1,
            max_identities: 8,
            death_policy: DeathPolicy::Sticky,
        });
        table.notify_state(1, PeerState::Work).unwrap();
        let (tx, rx) = mpsc::channel(8);
        let follower = tokio::spawn(follow_directory(Arc::clone(&table), rx, None));

        tx.send(PeerEvent::Put(info(1, PeerState::Die))).await.unwrap();
        tx.send(PeerEvent::Delete { machine_id: 1 }).await.unwrap();
        drop(tx);
        follower.await.unwrap();
        table.flush().await.unwrap();

        assert_eq!(table.state(1), Some(PeerState::Work));
        assert!(!table.is_stopped());
    }

    #[tokio::test]
    async fn test_follower_stops_with_table() {
        let table = RoutingTable::spawn(ClusterConfig::default());
        let (_tx, rx) = mpsc::channel(1);
        let follower = tokio::spawn(follow_directory(Arc::clone(&table), rx, None));

        table.shutdown();
        follower.await.unwrap();
        assert!(table.is_stopped());
    }
}
