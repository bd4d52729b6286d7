//! Two routing tables talking over loopback TCP

use codec::{Frame, FrameView, Hello};
use network::discovery::SequentialIdGenerator;
use network::{
    dial, ClusterConfig, FrameSink, MachineId, PeerState, RoutingTable, SessionContext,
    TcpAcceptor, TransportConfig,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<(MachineId, u16, Vec<u8>)>>,
    arrived: Notify,
}

impl FrameSink for RecordingSink {
    fn deliver(&self, source: MachineId, frame: &FrameView<'_>) -> network::Result<()> {
        self.frames
            .lock()
            .push((source, frame.frame_type(), frame.payload().to_vec()));
        self.arrived.notify_one();
        Ok(())
    }
}

impl RecordingSink {
    async fn wait_for(&self, count: usize) -> Vec<(MachineId, u16, Vec<u8>)> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.arrived.notified();
                if self.frames.lock().len() >= count {
                    return self.frames.lock().clone();
                }
                notified.await;
            }
        })
        .await
        .expect("frames did not arrive")
    }
}

struct TestNode {
    table: Arc<RoutingTable>,
    sink: Arc<RecordingSink>,
    ctx: Arc<SessionContext>,
}

fn node(id: MachineId, group: &str) -> TestNode {
    let table = RoutingTable::spawn(ClusterConfig {
        local_id: id,
        max_identities: 8,
        ..Default::default()
    });
    let sink = Arc::new(RecordingSink::default());
    let ctx = Arc::new(SessionContext {
        local: Hello::new(id, group),
        config: TransportConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..Default::default()
        },
        sink: sink.clone(),
        table: Arc::clone(&table),
        ids: Arc::new(SequentialIdGenerator::new()),
    });
    TestNode { table, sink, ctx }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn frames_flow_both_ways_after_handshake() {
    let hub = node(1, "hub");
    let worker = node(2, "workers");

    let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = acceptor.local_addr();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let accepting = tokio::spawn(acceptor.run(Arc::clone(&hub.ctx), shutdown_rx));

    let connection = dial(addr, Arc::clone(&worker.ctx)).await.unwrap();
    assert_eq!(connection.machine_id(), 1);
    worker.table.flush().await.unwrap();
    assert_eq!(worker.table.state(1), Some(PeerState::Work));
    wait_until(|| hub.table.state(2) == Some(PeerState::Work)).await;
    assert_eq!(hub.table.group_members("workers"), vec![2]);

    worker
        .table
        .ask_appoint(1, &Frame::encode(100, b"to hub", &[]).unwrap())
        .unwrap();
    let at_hub = hub.sink.wait_for(1).await;
    assert_eq!(at_hub[0], (2, 100, b"to hub".to_vec()));

    hub.table
        .ask_group("workers", &Frame::encode(101, b"to worker", &[]).unwrap())
        .unwrap();
    let at_worker = worker.sink.wait_for(1).await;
    assert_eq!(at_worker[0], (1, 101, b"to worker".to_vec()));

    shutdown_tx.send(true).unwrap();
    accepting.await.unwrap();
}

#[tokio::test]
async fn idle_session_survives_on_heartbeats() {
    let hub = node(1, "hub");
    let worker = node(2, "workers");

    let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = acceptor.local_addr();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(acceptor.run(Arc::clone(&hub.ctx), shutdown_rx));

    let connection = dial(addr, Arc::clone(&worker.ctx)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!connection.is_closed());
    assert!(worker.sink.frames.lock().is_empty());
}

#[tokio::test]
async fn closing_one_side_reports_session_loss_to_the_other() {
    let hub = node(1, "hub");
    let worker = node(2, "workers");

    let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = acceptor.local_addr();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(acceptor.run(Arc::clone(&hub.ctx), shutdown_rx));

    dial(addr, Arc::clone(&worker.ctx)).await.unwrap();
    wait_until(|| hub.table.peer(2).and_then(|p| p.session_id).is_some()).await;

    worker.table.shutdown();
    worker.table.stopped().await;

    wait_until(|| hub.table.peer(2).and_then(|p| p.session_id).is_none()).await;
    assert!(hub.table.group_members("workers").is_empty());
}
