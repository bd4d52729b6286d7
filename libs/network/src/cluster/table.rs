//! # Routing Table - Identity Slots and Group Index
//!
//! ## Purpose
//!
//! Fixed array of identity slots, each holding an atomically swapped
//! connection handle, an atomic lifecycle state, an occupancy counter and the
//! group the peer announced. A group index maps each group name to its
//! working members and is republished wholesale (RCU) on every change.
//!
//! ## Concurrency Model
//!
//! ```text
//! writers:  register_session / notify_state / notify_departure /
//!           session_lost / change_occupancy / shutdown
//!              │ (unbounded queue, never blocks)
//!              ▼
//!           event loop ── sole mutator of slots and group index
//!
//! readers:  ask_appoint / ask_group / broadcast_group
//!           atomic loads only, no locks on the send path
//! ```
//!
//! All membership changes are linearized by the loop, so two observers that
//! read the index after the loop processed an event see the same view.
//!
//! ## Teardown
//!
//! A shutdown event, or occupancy draining to zero while the local identity
//! is `Die`, stops the loop. Every connection still held by a slot is closed
//! once and later sends fail with [`RoutingError::Stopped`].

use super::{ClusterConfig, DeathPolicy, MachineId, PeerState};
use crate::error::{RoutingError, RoutingResult};
use crate::transports::PeerConnection;
use arc_swap::{ArcSwap, ArcSwapOption};
use codec::Frame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

type GroupIndex = HashMap<String, Vec<MachineId>>;

struct PeerSlot {
    connection: ArcSwapOption<PeerConnection>,
    state: AtomicU8,
    occupancy: AtomicI64,
    group: ArcSwapOption<String>,
}

impl PeerSlot {
    fn new() -> Self {
        Self {
            connection: ArcSwapOption::empty(),
            state: AtomicU8::new(PeerState::Pause.into()),
            occupancy: AtomicI64::new(0),
            group: ArcSwapOption::empty(),
        }
    }

    fn state(&self) -> PeerState {
        PeerState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(PeerState::Die)
    }

    fn set_state(&self, state: PeerState) {
        self.state.store(state.into(), Ordering::Release);
    }

    /// Connection if the peer is in `Work` and connected
    fn usable(&self) -> Option<Arc<PeerConnection>> {
        if self.state() != PeerState::Work {
            return None;
        }
        self.connection.load_full()
    }
}

/// Point-in-time view of one identity slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub id: MachineId,
    pub state: PeerState,
    pub group: Option<String>,
    pub occupancy: i64,
    pub session_id: Option<i64>,
}

enum RoutingEvent {
    Register {
        id: MachineId,
        group: String,
        connection: Arc<PeerConnection>,
    },
    StateChange {
        id: MachineId,
        state: PeerState,
    },
    Departure {
        id: MachineId,
    },
    SessionLost {
        id: MachineId,
        session_id: i64,
    },
    Occupancy {
        id: MachineId,
        delta: i64,
    },
    Flush(oneshot::Sender<()>),
    Shutdown,
}

pub struct RoutingTable {
    config: ClusterConfig,
    slots: Box<[PeerSlot]>,
    groups: ArcSwap<GroupIndex>,
    occupancy: AtomicI64,
    events: mpsc::UnboundedSender<RoutingEvent>,
    stopped: AtomicBool,
    stopped_tx: watch::Sender<bool>,
}

impl RoutingTable {
    /// Build the table and spawn its event loop on the current runtime
    pub fn spawn(config: ClusterConfig) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let (stopped_tx, _) = watch::channel(false);
        let slots = (0..config.max_identities).map(|_| PeerSlot::new()).collect();

        let table = Arc::new(Self {
            config,
            slots,
            groups: ArcSwap::from_pointee(GroupIndex::new()),
            occupancy: AtomicI64::new(0),
            events,
            stopped: AtomicBool::new(false),
            stopped_tx,
        });

        info!(
            local_id = table.config.local_id,
            capacity = table.config.max_identities,
            policy = ?table.config.death_policy,
            "routing table started"
        );
        tokio::spawn(Arc::clone(&table).run(rx));
        table
    }

    pub fn local_id(&self) -> MachineId {
        self.config.local_id
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn death_policy(&self) -> DeathPolicy {
        self.config.death_policy
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Resolves once the table has torn down
    pub async fn stopped(&self) {
        let mut rx = self.stopped_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Deliver to exactly one identity; never retried here
    pub fn ask_appoint(&self, target: MachineId, frame: &Frame) -> RoutingResult<()> {
        if self.is_stopped() {
            return Err(RoutingError::Stopped);
        }
        let slot = self.slot(target)?;

        let state = slot.state();
        if state != PeerState::Work {
            return Err(RoutingError::NotWorking { id: target, state });
        }
        let connection = slot
            .connection
            .load_full()
            .ok_or(RoutingError::NoConnection { id: target })?;

        connection
            .send(frame.clone())
            .map_err(|source| RoutingError::Send { id: target, source })
    }

    /// Deliver to the first working member of `group`
    ///
    /// No failover: if that member's send fails, the error is returned.
    pub fn ask_group(&self, group: &str, frame: &Frame) -> RoutingResult<MachineId> {
        if self.is_stopped() {
            return Err(RoutingError::Stopped);
        }
        let index = self.groups.load();
        let members = index.get(group).ok_or_else(|| RoutingError::UnknownGroup {
            group: group.to_string(),
        })?;

        for &id in members {
            let Some(connection) = self.slots.get(id as usize).and_then(PeerSlot::usable) else {
                continue;
            };
            return connection
                .send(frame.clone())
                .map(|()| id)
                .map_err(|source| RoutingError::Send { id, source });
        }

        Err(RoutingError::NoWorkingMember {
            group: group.to_string(),
        })
    }

    /// Deliver to every working member of `group`; returns how many accepted
    pub fn broadcast_group(&self, group: &str, frame: &Frame) -> RoutingResult<usize> {
        if self.is_stopped() {
            return Err(RoutingError::Stopped);
        }
        let index = self.groups.load();
        let members = index.get(group).ok_or_else(|| RoutingError::UnknownGroup {
            group: group.to_string(),
        })?;

        let mut delivered = 0;
        for &id in members {
            let Some(connection) = self.slots.get(id as usize).and_then(PeerSlot::usable) else {
                continue;
            };
            match connection.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer = id, group, error = %e, "broadcast send failed"),
            }
        }
        Ok(delivered)
    }

    /// Working members of `group` in join order
    pub fn group_members(&self, group: &str) -> Vec<MachineId> {
        self.groups.load().get(group).cloned().unwrap_or_default()
    }

    pub fn state(&self, id: MachineId) -> Option<PeerState> {
        self.slots.get(id as usize).map(PeerSlot::state)
    }

    pub fn peer(&self, id: MachineId) -> Option<PeerSnapshot> {
        let slot = self.slots.get(id as usize)?;
        Some(PeerSnapshot {
            id,
            state: slot.state(),
            group: slot.group.load_full().map(|g| g.as_ref().clone()),
            occupancy: slot.occupancy.load(Ordering::Acquire),
            session_id: slot.connection.load_full().map(|c| c.session_id()),
        })
    }

    /// Sum of every identity's occupancy
    pub fn total_occupancy(&self) -> i64 {
        self.occupancy.load(Ordering::Acquire)
    }

    /// Attach a freshly handshaken session to `id` and mark it working
    pub fn register_session(
        &self,
        id: MachineId,
        group: impl Into<String>,
        connection: Arc<PeerConnection>,
    ) -> RoutingResult<()> {
        self.slot(id)?;
        self.post(RoutingEvent::Register {
            id,
            group: group.into(),
            connection,
        })
    }

    /// Remote state report for `id`
    pub fn notify_state(&self, id: MachineId, state: PeerState) -> RoutingResult<()> {
        self.slot(id)?;
        self.post(RoutingEvent::StateChange { id, state })
    }

    /// `id` announced it is leaving
    pub fn notify_departure(&self, id: MachineId) -> RoutingResult<()> {
        self.slot(id)?;
        self.post(RoutingEvent::Departure { id })
    }

    /// A session ended; only clears the slot if it still holds that session
    pub fn session_lost(&self, id: MachineId, session_id: i64) -> RoutingResult<()> {
        self.slot(id)?;
        self.post(RoutingEvent::SessionLost { id, session_id })
    }

    /// Adjust the in-flight usage counter for `id`
    pub fn change_occupancy(&self, id: MachineId, delta: i64) -> RoutingResult<()> {
        self.slot(id)?;
        self.post(RoutingEvent::Occupancy { id, delta })
    }

    /// Wait until every event posted before this call has been applied
    pub async fn flush(&self) -> RoutingResult<()> {
        let (tx, rx) = oneshot::channel();
        self.post(RoutingEvent::Flush(tx))?;
        rx.await.map_err(|_| RoutingError::Stopped)
    }

    /// Stop the event loop and close every connection
    pub fn shutdown(&self) {
        let _ = self.events.send(RoutingEvent::Shutdown);
    }

    fn slot(&self, id: MachineId) -> RoutingResult<&PeerSlot> {
        self.slots
            .get(id as usize)
            .ok_or(RoutingError::UnknownIdentity {
                id,
                capacity: self.slots.len(),
            })
    }

    fn post(&self, event: RoutingEvent) -> RoutingResult<()> {
        if self.is_stopped() {
            return Err(RoutingError::Stopped);
        }
        self.events.send(event).map_err(|_| RoutingError::Stopped)
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<RoutingEvent>) {
        while let Some(event) = rx.recv().await {
            if !self.apply(event) {
                break;
            }
        }
        self.teardown();
    }

    /// Apply one event; `false` stops the loop
    fn apply(&self, event: RoutingEvent) -> bool {
        match event {
            RoutingEvent::Register {
                id,
                group,
                connection,
            } => self.on_register(id, group, connection),
            RoutingEvent::StateChange { id, state } => {
                self.on_state_change(id, state);
                return !(id == self.config.local_id && self.local_drained());
            }
            RoutingEvent::Departure { id } => {
                self.on_departure(id);
                return !(id == self.config.local_id && self.local_drained());
            }
            RoutingEvent::SessionLost { id, session_id } => self.on_session_lost(id, session_id),
            RoutingEvent::Occupancy { id, delta } => {
                if let Some(slot) = self.slots.get(id as usize) {
                    slot.occupancy.fetch_add(delta, Ordering::AcqRel);
                }
                let total = self.occupancy.fetch_add(delta, Ordering::AcqRel) + delta;
                debug!(peer = id, delta, total, "occupancy changed");
                return !(total == 0 && self.local_drained());
            }
            RoutingEvent::Flush(ack) => {
                let _ = ack.send(());
            }
            RoutingEvent::Shutdown => return false,
        }
        true
    }

    fn local_drained(&self) -> bool {
        let local_dead = self
            .slots
            .get(self.config.local_id as usize)
            .is_some_and(|slot| slot.state() == PeerState::Die);
        let drained = local_dead && self.total_occupancy() == 0;
        if drained {
            info!(local_id = self.config.local_id, "local identity dead and drained");
        }
        drained
    }

    fn on_register(&self, id: MachineId, group: String, connection: Arc<PeerConnection>) {
        let Some(slot) = self.slots.get(id as usize) else {
            return;
        };
        let session_id = connection.session_id();

        if let Some(previous) = slot.connection.swap(Some(connection)) {
            if previous.session_id() != session_id {
                previous.close();
            }
        }

        let stale = slot.occupancy.swap(0, Ordering::AcqRel);
        self.occupancy.fetch_sub(stale, Ordering::AcqRel);

        if let Some(old_group) = slot.group.swap(Some(Arc::new(group.clone()))) {
            if *old_group != group {
                self.leave(&old_group, id);
            }
        }

        slot.set_state(PeerState::Work);
        self.join(&group, id);
        info!(peer = id, group = %group, session_id, "peer session registered");
    }

    fn on_state_change(&self, id: MachineId, state: PeerState) {
        let Some(slot) = self.slots.get(id as usize) else {
            return;
        };
        let current = slot.state();
        if current == PeerState::Die
            && state != PeerState::Die
            && self.config.death_policy == DeathPolicy::Sticky
        {
            debug!(peer = id, ?state, "ignoring state change for departed identity");
            return;
        }

        slot.set_state(state);
        if let Some(group) = slot.group.load_full() {
            match state {
                PeerState::Work => self.join(&group, id),
                PeerState::Pause | PeerState::Die => self.leave(&group, id),
            }
        }
        debug!(peer = id, from = ?current, to = ?state, "peer state changed");
    }

    fn on_departure(&self, id: MachineId) {
        let Some(slot) = self.slots.get(id as usize) else {
            return;
        };
        if let Some(group) = slot.group.load_full() {
            self.leave(&group, id);
        }
        if let Some(connection) = slot.connection.swap(None) {
            connection.close();
        }
        slot.set_state(PeerState::Die);
        info!(peer = id, "peer departed");
    }

    fn on_session_lost(&self, id: MachineId, session_id: i64) {
        let Some(slot) = self.slots.get(id as usize) else {
            return;
        };
        let current = slot.connection.load_full().map(|c| c.session_id());
        if current != Some(session_id) {
            debug!(peer = id, session_id, ?current, "stale session loss ignored");
            return;
        }

        if let Some(connection) = slot.connection.swap(None) {
            connection.close();
        }
        if let Some(group) = slot.group.load_full() {
            self.leave(&group, id);
        }
        warn!(peer = id, session_id, "peer session lost");
    }

    fn join(&self, group: &str, id: MachineId) {
        if self
            .groups
            .load()
            .get(group)
            .is_some_and(|members| members.contains(&id))
        {
            return;
        }
        let mut index = GroupIndex::clone(&self.groups.load());
        index.entry(group.to_string()).or_default().push(id);
        self.groups.store(Arc::new(index));
    }

    fn leave(&self, group: &str, id: MachineId) {
        if !self
            .groups
            .load()
            .get(group)
            .is_some_and(|members| members.contains(&id))
        {
            return;
        }
        let mut index = GroupIndex::clone(&self.groups.load());
        if let Some(members) = index.get_mut(group) {
            members.retain(|member| *member != id);
        }
        self.groups.store(Arc::new(index));
    }

    fn teardown(&self) {
        self.stopped.store(true, Ordering::Release);
        let mut closed = 0;
        for slot in self.slots.iter() {
            if let Some(connection) = slot.connection.swap(None) {
                if connection.close() {
                    closed += 1;
                }
            }
        }
        self.groups.store(Arc::new(GroupIndex::new()));
        self.stopped_tx.send_replace(true);
        info!(closed, "routing table stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::PeerConnection;

    fn config(policy: DeathPolicy) -> ClusterConfig {
        ClusterConfig {
            local_id: 0,
            max_identities: 16,
            death_policy: policy,
        }
    }

    fn frame() -> Frame {
        Frame::encode(70, b"hi", &[]).unwrap()
    }

    fn connect(
        table: &RoutingTable,
        id: MachineId,
        group: &str,
        session_id: i64,
    ) -> (Arc<PeerConnection>, mpsc::Receiver<Frame>) {
        let (connection, rx) = PeerConnection::detached(session_id, id, 8);
        table
            .register_session(id, group, Arc::clone(&connection))
            .unwrap();
        (connection, rx)
    }

    #[tokio::test]
    async fn test_register_then_appoint() {
        let table = RoutingTable::spawn(config(DeathPolicy::Sticky));
        let (_conn, mut rx) = connect(&table, 3, "workers", 1);
        table.flush().await.unwrap();

        table.ask_appoint(3, &frame()).unwrap();
        assert_eq!(rx.recv().await.unwrap().payload(), b"hi");
        assert_eq!(table.group_members("workers"), vec![3]);
        assert_eq!(table.state(3), Some(PeerState::Work));
    }

    #[tokio::test]
    async fn test_appoint_errors_name_identity() {
        let table = RoutingTable::spawn(config(DeathPolicy::Sticky));

        let err = table.ask_appoint(99, &frame()).unwrap_err();
        assert!(matches!(err, RoutingError::UnknownIdentity { id: 99, capacity: 16 }));

        let err = table.ask_appoint(4, &frame()).unwrap_err();
        assert!(matches!(
            err,
            RoutingError::NotWorking {
                id: 4,
                state: PeerState::Pause
            }
        ));

        table.notify_state(4, PeerState::Work).unwrap();
        table.flush().await.unwrap();
        let err = table.ask_appoint(4, &frame()).unwrap_err();
        assert!(matches!(err, RoutingError::NoConnection { id: 4 }));
    }

    #[tokio::test]
    async fn test_die_removes_from_groups_and_fails_sends() {
        let table = RoutingTable::spawn(config(DeathPolicy::Sticky));
        let (_a, _rx_a) = connect(&table, 1, "workers", 1);
        let (_b, mut rx_b) = connect(&table, 2, "workers", 2);
        table.flush().await.unwrap();

        table.notify_state(1, PeerState::Die).unwrap();
        table.flush().await.unwrap();

        let err = table.ask_appoint(1, &frame()).unwrap_err();
        assert!(err.to_string().contains("Identity 1"));
        assert_eq!(table.group_members("workers"), vec![2]);
        assert_eq!(table.ask_group("workers", &frame()).unwrap(), 2);
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_sticky_death_ignores_work() {
        let table = RoutingTable::spawn(config(DeathPolicy::Sticky));
        let (_conn, _rx) = connect(&table, 5, "workers", 1);
        table.notify_state(5, PeerState::Die).unwrap();
        table.notify_state(5, PeerState::Work).unwrap();
        table.flush().await.unwrap();

        assert_eq!(table.state(5), Some(PeerState::Die));
        assert!(table.group_members("workers").is_empty());
        assert!(matches!(
            table.ask_group("workers", &frame()),
            Err(RoutingError::NoWorkingMember { .. })
        ));
    }

    #[tokio::test]
    async fn test_revivable_death_accepts_work() {
        let table = RoutingTable::spawn(config(DeathPolicy::Revivable));
        let (_conn, mut rx) = connect(&table, 5, "workers", 1);
        table.notify_state(5, PeerState::Die).unwrap();
        table.notify_state(5, PeerState::Work).unwrap();
        table.flush().await.unwrap();

        assert_eq!(table.state(5), Some(PeerState::Work));
        assert_eq!(table.group_members("workers"), vec![5]);
        table.ask_appoint(5, &frame()).unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_new_session_revives_under_sticky_policy() {
        let table = RoutingTable::spawn(config(DeathPolicy::Sticky));
        let (old, _rx_old) = connect(&table, 6, "workers", 1);
        table.notify_departure(6).unwrap();
        table.flush().await.unwrap();
        assert!(old.is_closed());
        assert_eq!(table.state(6), Some(PeerState::Die));

        let (_new, mut rx_new) = connect(&table, 6, "workers", 2);
        table.flush().await.unwrap();
        table.ask_appoint(6, &frame()).unwrap();
        assert!(rx_new.recv().await.is_some());
        assert_eq!(table.peer(6).unwrap().session_id, Some(2));
    }

    #[tokio::test]
    async fn test_stale_session_loss_is_ignored() {
        let table = RoutingTable::spawn(config(DeathPolicy::Sticky));
        let (first, _rx1) = connect(&table, 7, "workers", 10);
        let (_second, _rx2) = connect(&table, 7, "workers", 11);
        table.flush().await.unwrap();
        assert!(first.is_closed());

        table.session_lost(7, 10).unwrap();
        table.flush().await.unwrap();
        assert_eq!(table.peer(7).unwrap().session_id, Some(11));

        table.session_lost(7, 11).unwrap();
        table.flush().await.unwrap();
        assert_eq!(table.peer(7).unwrap().session_id, None);
        assert!(table.group_members("workers").is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_working_member() {
        let table = RoutingTable::spawn(config(DeathPolicy::Sticky));
        let (_a, mut rx_a) = connect(&table, 1, "feed", 1);
        let (_b, mut rx_b) = connect(&table, 2, "feed", 2);
        let (_c, _rx_c) = connect(&table, 3, "feed", 3);
        table.notify_state(3, PeerState::Pause).unwrap();
        table.flush().await.unwrap();

        assert_eq!(table.broadcast_group("feed", &frame()).unwrap(), 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
        assert!(matches!(
            table.broadcast_group("nobody", &frame()),
            Err(RoutingError::UnknownGroup { .. })
        ));
    }

    #[tokio::test]
    async fn test_occupancy_drain_after_local_death_tears_down() {
        let table = RoutingTable::spawn(config(DeathPolicy::Sticky));
        let (a, _rx_a) = connect(&table, 1, "workers", 1);
        let (b, _rx_b) = connect(&table, 2, "workers", 2);
        table.change_occupancy(1, 2).unwrap();
        table.notify_state(0, PeerState::Die).unwrap();
        table.flush().await.unwrap();
        assert!(!table.is_stopped());

        table.change_occupancy(1, -1).unwrap();
        table.flush().await.unwrap();
        assert!(!table.is_stopped());

        table.change_occupancy(1, -1).unwrap();
        table.stopped().await;

        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(matches!(
            table.ask_appoint(1, &frame()),
            Err(RoutingError::Stopped)
        ));
        assert!(matches!(
            table.notify_state(1, PeerState::Work),
            Err(RoutingError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_each_connection_once() {
        let table = RoutingTable::spawn(config(DeathPolicy::Sticky));
        let (a, _rx_a) = connect(&table, 1, "workers", 1);
        table.flush().await.unwrap();

        table.shutdown();
        table.stopped().await;

        assert!(a.is_closed());
        assert!(!a.close());
        assert_eq!(table.peer(1).unwrap().session_id, None);
    }
}
