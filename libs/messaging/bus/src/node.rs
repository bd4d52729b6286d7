//! # Bus Node
//!
//! ## Purpose
//!
//! Owns one serial engine, one routing table and the TCP sessions between
//! them and the rest of the cluster. Application code subscribes handlers
//! before [`Node::start`] and sends through the [`Bus`] handle.
//!
//! ## Startup
//!
//! ```text
//! lock sbus/identity/<id> ─> bind listener ─> engine working ─> local Work
//!     ─> register in directory ─> unlock ─> acceptor / follower / dialer / keep-alive
//! ```
//!
//! Only the lower identity of a pair dials, so two nodes that discover each
//! other at the same time still end up with a single session.
//!
//! ## Shutdown
//!
//! Announce `Die` to the directory, drain the engine while sessions are still
//! open, then release local channels and mark the local identity `Die`. The
//! routing table tears down every session once occupancy against this node
//! reaches zero; a table that does not drain within the transport's io
//! deadline is stopped anyway.

use crate::channels::{ChannelDirectory, ChannelOwner};
use crate::config::NodeConfig;
use crate::error::{BusError, BusResult};
use crate::patterns::Bus;
use crate::sink::RingSink;
use codec::{Channel, Frame, FrameView, Hello};
use network::discovery::{
    acquire_with_retry, CircuitBreakerGate, CircuitBreakerStats, DistributedLock, IdGenerator,
    InMemoryLock, PeerDirectory, PeerInfo, Registration, SequentialIdGenerator, StaticDirectory,
};
use network::{
    dial, follow_directory, MachineId, PeerState, RetryPolicy, RoutingTable, SessionContext,
    TcpAcceptor,
};
use parking_lot::Mutex;
use serial::{EngineStatsSnapshot, SerialEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Created => "created",
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
        }
    }
}

/// External services a node coordinates through
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn PeerDirectory>,
    pub lock: Arc<dyn DistributedLock>,
    pub ids: Arc<dyn IdGenerator>,
}

impl Collaborators {
    /// In-process directory seeded with `static_peers`
    pub fn standalone(static_peers: impl IntoIterator<Item = PeerInfo>) -> Self {
        Self {
            directory: Arc::new(StaticDirectory::with_peers(static_peers)),
            lock: Arc::new(InMemoryLock::new()),
            ids: Arc::new(SequentialIdGenerator::new()),
        }
    }
}

pub struct Node {
    config: NodeConfig,
    engine: SerialEngine,
    channels: Arc<ChannelDirectory>,
    table: Arc<RoutingTable>,
    gate: Arc<CircuitBreakerGate>,
    sink: Arc<RingSink>,
    bus: Bus,
    collaborators: Collaborators,
    state: Mutex<NodeState>,
    local_addr: Mutex<Option<SocketAddr>>,
    registration: Mutex<Option<Registration>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Build a stopped node; spawns the routing table loop on the current runtime
    pub fn new(config: NodeConfig, collaborators: Collaborators) -> BusResult<Self> {
        if config.cluster.local_id != config.machine_id {
            return Err(BusError::configuration(format!(
                "cluster local id {} differs from machine id {}",
                config.cluster.local_id, config.machine_id
            )));
        }
        config.transport.validate()?;

        let engine = SerialEngine::new(config.engine.clone())?;
        let table = RoutingTable::spawn(config.cluster.clone());
        let channels = Arc::new(ChannelDirectory::new());
        let gate = Arc::new(CircuitBreakerGate::new(config.gate.clone()));
        let sink = Arc::new(RingSink::new(engine.producer()));
        let bus = Bus::new(
            config.machine_id,
            Arc::clone(&channels),
            engine.producer(),
            Arc::clone(&table),
            gate.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            engine,
            channels,
            table,
            gate,
            sink,
            bus,
            collaborators,
            state: Mutex::new(NodeState::Created),
            local_addr: Mutex::new(None),
            registration: Mutex::new(None),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn machine_id(&self) -> MachineId {
        self.config.machine_id
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    pub fn channels(&self) -> &Arc<ChannelDirectory> {
        &self.channels
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn engine_stats(&self) -> EngineStatsSnapshot {
        self.engine.stats()
    }

    pub fn gate_stats(&self) -> CircuitBreakerStats {
        self.gate.stats()
    }

    /// Frames accepted from and refused to peer sessions
    pub fn inbound_counts(&self) -> (u64, u64) {
        (self.sink.accepted(), self.sink.rejected())
    }

    /// Bound listener address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Handle `channel` on this node
    pub fn subscribe<F>(&self, channel: Channel, handler: F) -> BusResult<()>
    where
        F: Fn(&FrameView<'_>) + Send + Sync + 'static,
    {
        self.engine.subscribe(channel, handler)?;
        self.channels.assign_local(&[channel]);
        Ok(())
    }

    pub fn subscribe_any<F>(&self, channels: &[Channel], handler: F) -> BusResult<()>
    where
        F: Fn(&FrameView<'_>) + Send + Sync + 'static,
    {
        self.engine.subscribe_any(channels, handler)?;
        self.channels.assign_local(channels);
        Ok(())
    }

    /// Join-all over `channels`; see [`SerialEngine::subscribe_all`]
    pub fn subscribe_all<F>(&self, channels: &[Channel], handler: F) -> BusResult<()>
    where
        F: Fn(&[Frame]) + Send + Sync + 'static,
    {
        self.engine.subscribe_all(channels, handler)?;
        self.channels.assign_local(channels);
        Ok(())
    }

    /// Stop handling `channels` here; returns how many routes were removed
    pub async fn unsubscribe_group(&self, channels: &[Channel]) -> BusResult<usize> {
        let removed = self.engine.unsubscribe_group(channels).await?;
        for &channel in channels {
            if self.channels.owner(channel) == Some(ChannelOwner::Local) {
                self.channels.release(channel);
            }
        }
        Ok(removed)
    }

    /// Claim the identity, open the listener and join the cluster
    pub async fn start(&self) -> BusResult<SocketAddr> {
        self.transition(NodeState::Created, NodeState::Starting)?;

        let key = format!("sbus/identity/{}", self.config.machine_id);
        let lock = Arc::clone(&self.collaborators.lock);
        if let Err(e) = acquire_with_retry(lock.as_ref(), &key, &self.config.lock_retry).await {
            *self.state.lock() = NodeState::Created;
            return Err(e.into());
        }

        let started = self.start_locked().await;
        if let Err(e) = lock.release(&key).await {
            warn!(key, error = %e, "identity lock release failed");
        }

        match started {
            Ok(addr) => {
                *self.state.lock() = NodeState::Running;
                info!(
                    machine_id = self.config.machine_id,
                    group = %self.config.group,
                    %addr,
                    "bus node running"
                );
                Ok(addr)
            }
            Err(e) => {
                warn!(error = %e, "bus node failed to start");
                self.abort_tasks();
                if let Err(e) = self.engine.shutdown().await {
                    debug!(error = %e, "engine shutdown after failed start");
                }
                self.table.shutdown();
                *self.state.lock() = NodeState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_locked(&self) -> BusResult<SocketAddr> {
        let acceptor = TcpAcceptor::bind(self.config.listen_addr).await?;
        let bound = acceptor.local_addr();
        *self.local_addr.lock() = Some(bound);

        self.engine.start()?;
        self.table.notify_state(self.config.machine_id, PeerState::Work)?;

        let directory = Arc::clone(&self.collaborators.directory);
        let registration = directory
            .register_identity(PeerInfo {
                machine_id: self.config.machine_id,
                group: self.config.group.clone(),
                address: self.config.advertise_addr.unwrap_or(bound),
                state: PeerState::Work,
            })
            .await?;
        *self.registration.lock() = Some(registration.clone());
        let events = directory.watch_changes().await?;

        let ctx = Arc::new(SessionContext {
            local: Hello::new(self.config.machine_id, self.config.group.clone()),
            config: self.config.transport.clone(),
            sink: self.sink.clone(),
            table: Arc::clone(&self.table),
            ids: Arc::clone(&self.collaborators.ids),
        });
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            acceptor.run(Arc::clone(&ctx), self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(follow_directory(
            Arc::clone(&self.table),
            events,
            Some(dial_tx),
        )));
        tasks.push(tokio::spawn(dial_peers(
            ctx,
            dial_rx,
            self.config.dial_retry.clone(),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(keep_alive(
            directory,
            registration,
            self.config.keep_alive_interval,
            self.shutdown_tx.subscribe(),
        )));
        Ok(bound)
    }

    /// Leave the cluster and stop every task; later calls return immediately
    pub async fn shutdown(&self) -> BusResult<()> {
        {
            let mut state = self.state.lock();
            let current = *state;
            match current {
                NodeState::Running => *state = NodeState::Stopping,
                NodeState::Created => {
                    *state = NodeState::Stopped;
                    self.table.shutdown();
                    return Ok(());
                }
                NodeState::Starting => {
                    return Err(BusError::InvalidState {
                        state: NodeState::Starting.as_str(),
                    })
                }
                NodeState::Stopping | NodeState::Stopped => return Ok(()),
            }
        }
        let id = self.config.machine_id;
        info!(machine_id = id, "bus node stopping");

        let registration = self.registration.lock().take();
        let directory = &self.collaborators.directory;
        if let Some(registration) = &registration {
            if let Err(e) = directory.update_state(registration, PeerState::Die).await {
                warn!(error = %e, "departure not announced");
            }
        }

        // Handlers still running, and the final drain, may send to peers.
        let engine_result = self.engine.shutdown().await;

        let released = self.channels.release_local();
        debug!(released, "local channels released");
        if let Err(e) = self.table.notify_state(id, PeerState::Die) {
            debug!(error = %e, "local death not recorded");
        }

        let drain_timeout = self.config.transport.io_deadline;
        if tokio::time::timeout(drain_timeout, self.table.stopped())
            .await
            .is_err()
        {
            warn!(
                occupancy = self.table.total_occupancy(),
                timeout_ms = drain_timeout.as_millis() as u64,
                "routing table did not drain, stopping it"
            );
            self.table.shutdown();
        }

        self.shutdown_tx.send_replace(true);
        if let Some(registration) = &registration {
            if let Err(e) = directory.deregister(registration).await {
                warn!(error = %e, "identity not deregistered");
            }
        }
        self.abort_tasks();

        *self.state.lock() = NodeState::Stopped;
        info!(machine_id = id, "bus node stopped");
        engine_result.map_err(Into::into)
    }

    fn transition(&self, from: NodeState, to: NodeState) -> BusResult<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(BusError::InvalidState {
                state: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        self.abort_tasks();
    }
}

/// Dial working peers announced by the directory
///
/// Only higher identities are dialed; lower ones dial this node.
async fn dial_peers(
    ctx: Arc<SessionContext>,
    mut peers: mpsc::UnboundedReceiver<PeerInfo>,
    policy: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let local_id = ctx.local.machine_id;
    loop {
        let info = tokio::select! {
            biased;
            _ = shutdown.wait_for(|s| *s) => break,
            info = peers.recv() => info,
        };
        let Some(info) = info else { break };
        if info.machine_id <= local_id {
            continue;
        }
        tokio::spawn(dial_with_retry(
            Arc::clone(&ctx),
            info,
            policy.clone(),
            shutdown.clone(),
        ));
    }
    debug!("peer dialer stopped");
}

async fn dial_with_retry(
    ctx: Arc<SessionContext>,
    info: PeerInfo,
    policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
) {
    let peer = info.machine_id;
    let attempts = policy.max_attempts.max(1);
    for attempt in 0..attempts {
        if *shutdown.borrow() || ctx.table.is_stopped() {
            return;
        }
        if ctx.table.peer(peer).is_some_and(|p| p.session_id.is_some()) {
            debug!(peer, "already connected");
            return;
        }
        match dial(info.address, Arc::clone(&ctx)).await {
            Ok(connection) => {
                debug!(peer, session_id = connection.session_id(), attempt, "peer dialed");
                return;
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(peer, address = %info.address, attempt, error = %e, "dial failed");
                if attempt + 1 < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    warn!(peer, attempts, "giving up on peer");
}

async fn keep_alive(
    directory: Arc<dyn PeerDirectory>,
    registration: Registration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|s| *s) => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = directory.keep_alive(&registration).await {
            warn!(machine_id = registration.machine_id, error = %e, "lease refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_before_start_stops_table() {
        let node = Node::new(NodeConfig::local(1, "solo"), Collaborators::standalone([])).unwrap();
        node.shutdown().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
        node.table().stopped().await;
        assert!(matches!(
            node.start().await,
            Err(BusError::InvalidState { state: "stopped" })
        ));
    }

    #[tokio::test]
    async fn test_subscribe_claims_local_channel() {
        let node = Node::new(NodeConfig::local(1, "solo"), Collaborators::standalone([])).unwrap();
        node.subscribe(70, |_| {}).unwrap();
        assert_eq!(node.channels().local_channels(), vec![70]);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_held_identity_lock_blocks_start() {
        let collaborators = Collaborators::standalone([]);
        assert!(collaborators.lock.try_acquire("sbus/identity/1").await.unwrap());

        let mut config = NodeConfig::local(1, "solo");
        config.lock_retry = RetryPolicy::new(2, 1);
        let node = Node::new(config, collaborators).unwrap();
        assert!(matches!(node.start().await, Err(BusError::Discovery(_))));
        assert_eq!(node.state(), NodeState::Created);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_registers_and_shutdown_deregisters() {
        let collaborators = Collaborators::standalone([]);
        let directory = Arc::clone(&collaborators.directory);
        let node = Node::new(NodeConfig::local(2, "solo"), collaborators).unwrap();

        let addr = node.start().await.unwrap();
        let peers = directory.list_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, addr);

        node.shutdown().await.unwrap();
        assert!(directory.list_peers().await.unwrap().is_empty());
        assert!(node.table().is_stopped());
        node.shutdown().await.unwrap();
    }
}
