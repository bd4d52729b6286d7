//! Two nodes sharing one directory, talking over loopback TCP

use bus::{BusError, ChannelOwner, Collaborators, Node, NodeConfig};
use network::{PeerState, RoutingError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn node(id: u32, group: &str, collaborators: &Collaborators) -> Node {
    let mut config = NodeConfig::local(id, group);
    config.transport.heartbeat_interval = Duration::from_millis(100);
    config.transport.io_deadline = Duration::from_secs(2);
    Node::new(config, collaborators.clone()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_and_reply_across_nodes() {
    let shared = Collaborators::standalone([]);
    let client = node(1, "clients", &shared);
    let server = node(2, "servers", &shared);

    {
        let bus = server.bus();
        server
            .subscribe(100, move |frame| {
                let mut answer = frame.payload().to_vec();
                answer.reverse();
                bus.reply(frame, &answer).unwrap();
            })
            .unwrap();
    }
    let replies: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
    {
        let replies = Arc::clone(&replies);
        client
            .subscribe(101, move |frame| replies.lock().push(frame.payload().to_vec()))
            .unwrap();
    }
    client
        .channels()
        .assign(100, ChannelOwner::Group("servers".into()));

    server.start().await.unwrap();
    client.start().await.unwrap();
    wait_until(|| client.table().group_members("servers") == vec![2]).await;
    wait_until(|| server.table().peer(1).is_some_and(|p| p.session_id.is_some())).await;

    client.bus().call(100, b"abc", 101).unwrap();
    wait_until(|| !replies.lock().is_empty()).await;
    assert_eq!(replies.lock()[0], b"cba".to_vec());
    assert!(server.inbound_counts().0 >= 1);

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_departed_server_leaves_group() {
    let shared = Collaborators::standalone([]);
    let client = node(1, "clients", &shared);
    let server = node(2, "servers", &shared);
    server.subscribe(100, |_| {}).unwrap();
    client
        .channels()
        .assign(100, ChannelOwner::Group("servers".into()));

    server.start().await.unwrap();
    client.start().await.unwrap();
    wait_until(|| client.table().group_members("servers") == vec![2]).await;

    server.shutdown().await.unwrap();
    wait_until(|| client.table().state(2) == Some(PeerState::Die)).await;
    assert!(client.table().group_members("servers").is_empty());

    assert!(matches!(
        client.bus().notify(100, b"late"),
        Err(BusError::Routing(RoutingError::NoWorkingMember { .. }))
    ));
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_node_with_same_identity_is_refused() {
    let shared = Collaborators::standalone([]);
    let first = node(3, "workers", &shared);
    let second = node(3, "workers", &shared);

    first.start().await.unwrap();
    let err = second.start().await.unwrap_err();
    assert!(matches!(err, BusError::Discovery(_)));
    assert_eq!(first.table().state(3), Some(PeerState::Work));

    first.shutdown().await.unwrap();
}
