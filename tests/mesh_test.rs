//! Multi-node mesh integration tests.
//!
//! Each test runs a small set of real nodes on loopback ports and drives
//! them through the public facade only. Port ranges are disjoint per test so
//! the suite can run in parallel.

use peermesh::{
    MessagePacket, NodeInfo, P2PConfig, P2PEvent, PeerInfo, RequestPacket, SessionState, P2P,
};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

type EventStore = Arc<std::sync::Mutex<Vec<P2PEvent>>>;

fn test_node_info(port: u16) -> NodeInfo {
    NodeInfo {
        os: "linux".into(),
        version: "1.0.0".into(),
        protocol_version: "1.1".into(),
        nethash: "mesh-test-net".into(),
        ws_port: port,
        height: 0,
        nonce: format!("node-{port}"),
        modules: vec![],
        min_version: "1.0.0".into(),
        extras: Map::new(),
    }
}

fn seed_info(port: u16) -> PeerInfo {
    PeerInfo {
        ip_address: "127.0.0.1".into(),
        ws_port: port,
        version: "1.0.0".into(),
        protocol_version: Some("1.1".into()),
        os: String::new(),
        height: 0,
        extras: Map::new(),
    }
}

fn local_id(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn start_node_with(
    port: u16,
    seeds: &[u16],
    tweak: impl FnOnce(&mut P2PConfig),
) -> Arc<P2P> {
    init_tracing();
    let mut config = P2PConfig::default();
    config.host_address = "127.0.0.1".into();
    config.populator_start_delay_ms = 50;
    config.populator_interval_ms = 250;
    config.peer_lists.seed_peers = seeds.iter().map(|p| seed_info(*p)).collect();
    tweak(&mut config);

    let p2p = P2P::new(config, test_node_info(port)).unwrap();
    p2p.start().await.unwrap();
    p2p
}

async fn start_node(port: u16, seeds: &[u16]) -> Arc<P2P> {
    start_node_with(port, seeds, |_| {}).await
}

async fn spawn_collector(p2p: &Arc<P2P>) -> EventStore {
    let mut rx = p2p.take_event_stream().await.unwrap();
    let store: EventStore = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = store.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            sink.lock().unwrap().push(event);
        }
    });
    store
}

fn has_event(store: &EventStore, pred: impl Fn(&P2PEvent) -> bool) -> bool {
    store.lock().unwrap().iter().any(pred)
}

async fn connected_ids(node: &Arc<P2P>) -> HashSet<String> {
    node.get_connected_peers()
        .await
        .iter()
        .map(|p| p.peer_id())
        .collect()
}

async fn wait_until<F, Fut>(timeout_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_seed_ring_reaches_full_mesh() {
    let ports = [36110u16, 36111, 36112];
    let a = start_node(ports[0], &[]).await;
    let b = start_node(ports[1], &[ports[0]]).await;
    let c = start_node(ports[2], &[ports[0]]).await;
    let nodes = [a.clone(), b.clone(), c.clone()];

    for (i, node) in nodes.iter().enumerate() {
        let expected: HashSet<String> = ports
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, p)| local_id(*p))
            .collect();
        let node = node.clone();
        let reached = wait_until(20_000, move || {
            let node = node.clone();
            let expected = expected.clone();
            async move { expected.is_subset(&connected_ids(&node).await) }
        })
        .await;
        assert!(reached, "node on port {} did not reach the full mesh", ports[i]);
    }

    // A node never lists itself among its own peers
    for node in &nodes {
        let own = node.own_peer_id().clone();
        assert!(!connected_ids(node).await.contains(&own));
    }

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_response_roundtrip() {
    let a = start_node(36120, &[]).await;
    let a_id = local_id(36120);

    // Application-level responder for a custom procedure
    let mut rx_a = a.take_event_stream().await.unwrap();
    tokio::spawn(async move {
        while let Some(event) = rx_a.recv().await {
            if let P2PEvent::RequestReceived(request) = event {
                if request.procedure == "echo" && !request.was_response_sent() {
                    let _ = request.end(json!({ "echo": request.data.clone() })).await;
                }
            }
        }
    });

    let b = start_node(36121, &[36120]).await;
    let connected = {
        let b = b.clone();
        let a_id = a_id.clone();
        wait_until(10_000, move || {
            let b = b.clone();
            let a_id = a_id.clone();
            async move { connected_ids(&b).await.contains(&a_id) }
        })
        .await
    };
    assert!(connected);

    // Custom procedure answered by the application
    let response = b
        .request_from_peer(&a_id, RequestPacket::new("echo", json!({"x": 7})))
        .await
        .unwrap();
    assert_eq!(response["echo"]["x"], 7);

    // Built-in status answered by the session itself
    let status = b
        .request_from_peer(&a_id, RequestPacket::new("status", Value::Null))
        .await
        .unwrap();
    assert_eq!(status["nethash"], "mesh-test-net");
    assert_eq!(status["wsPort"], 36120);

    // Selector-routed request reaches the only available peer
    let routed = b.request(RequestPacket::new("status", Value::Null)).await.unwrap();
    assert_eq!(routed["nethash"], "mesh-test-net");

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_penalty_accumulates_to_ban_and_unban() {
    let a = start_node_with(36130, &[], |c| {
        c.peer_ban_time_ms = 500;
    })
    .await;
    let events_a = spawn_collector(&a).await;
    let b = start_node(36131, &[36130]).await;
    let b_id = local_id(36131);

    let connected = {
        let a = a.clone();
        let b_id = b_id.clone();
        wait_until(10_000, move || {
            let a = a.clone();
            let b_id = b_id.clone();
            async move { connected_ids(&a).await.contains(&b_id) }
        })
        .await
    };
    assert!(connected);

    // A small penalty leaves the peer connected
    a.apply_penalty(&b_id, 10).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(connected_ids(&a).await.contains(&b_id));

    // Depleting the reputation bans and removes the peer
    a.apply_penalty(&b_id, 100).await.unwrap();
    let removed = {
        let a = a.clone();
        let b_id = b_id.clone();
        wait_until(2_000, move || {
            let a = a.clone();
            let b_id = b_id.clone();
            async move { !connected_ids(&a).await.contains(&b_id) }
        })
        .await
    };
    assert!(removed);
    assert!(has_event(&events_a, |e| matches!(
        e, P2PEvent::BanPeer { peer_id } if *peer_id == b_id
    )));
    assert!(has_event(&events_a, |e| matches!(
        e, P2PEvent::RemovePeer { peer_id } if *peer_id == b_id
    )));

    // After the ban expires the seed peer reconnects on its next dial
    let reconnected = {
        let a = a.clone();
        let b_id = b_id.clone();
        wait_until(15_000, move || {
            let a = a.clone();
            let b_id = b_id.clone();
            async move { connected_ids(&a).await.contains(&b_id) }
        })
        .await
    };
    assert!(reconnected);
    assert!(has_event(&events_a, |e| matches!(
        e, P2PEvent::UnbanPeer { peer_id } if *peer_id == b_id
    )));

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fan_out_delivers_messages() {
    let a = start_node(36140, &[]).await;
    let a_id = local_id(36140);
    let b = start_node(36141, &[36140]).await;
    let c = start_node(36142, &[36140]).await;
    let events_b = spawn_collector(&b).await;
    let events_c = spawn_collector(&c).await;

    for node in [&b, &c] {
        let node = node.clone();
        let a_id = a_id.clone();
        assert!(
            wait_until(10_000, move || {
                let node = node.clone();
                let a_id = a_id.clone();
                async move { connected_ids(&node).await.contains(&a_id) }
            })
            .await
        );
    }

    const SENT: usize = 20;
    for i in 0..SENT {
        a.send(MessagePacket::new("bar", json!({"seq": i}))).await.unwrap();
    }

    for events in [&events_b, &events_c] {
        let events = events.clone();
        let delivered = wait_until(10_000, move || {
            let events = events.clone();
            async move {
                let count = events
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|e| matches!(e, P2PEvent::MessageReceived(m) if m.event == "bar"))
                    .count();
                count >= SENT
            }
        })
        .await;
        assert!(delivered, "fan-out did not reach every peer");
    }

    // Payload shape: original data, sender id, numeric per-second rate
    for events in [&events_b, &events_c] {
        let events = events.lock().unwrap();
        let message = events
            .iter()
            .find_map(|e| match e {
                P2PEvent::MessageReceived(m) if m.event == "bar" => Some(m),
                _ => None,
            })
            .unwrap();
        assert_eq!(message.peer_id, a_id);
        assert!(message.data["seq"].is_u64());
        assert!(message.rate.is_finite() && message.rate >= 0.0);
    }

    for node in [&a, &b, &c] {
        node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_rate_breach_evicts_sender() {
    let a = start_node(36150, &[]).await;
    let a_id = local_id(36150);
    let b = start_node_with(36151, &[36150], |c| {
        c.rate_calculation_interval_ms = 100;
        c.ws_max_message_rate = 110.0;
        c.ws_max_message_rate_penalty = 100;
    })
    .await;
    let events_b = spawn_collector(&b).await;
    let b_id = local_id(36151);

    let connected = {
        let a = a.clone();
        let b_id = b_id.clone();
        wait_until(10_000, move || {
            let a = a.clone();
            let b_id = b_id.clone();
            async move { connected_ids(&a).await.contains(&b_id) }
        })
        .await
    };
    assert!(connected);

    for i in 0..300 {
        if a.send_to_peer(&b_id, MessagePacket::new("flood", json!(i))).await.is_err() {
            break;
        }
    }

    let banned = {
        let events_b = events_b.clone();
        let a_id = a_id.clone();
        wait_until(3_000, move || {
            let events_b = events_b.clone();
            let a_id = a_id.clone();
            async move {
                has_event(&events_b, |e| matches!(
                    e, P2PEvent::RemovePeer { peer_id } if *peer_id == a_id
                ))
            }
        })
        .await
    };
    assert!(banned, "flooding peer was not evicted");
    assert!(has_event(&events_b, |e| matches!(
        e, P2PEvent::BanPeer { peer_id } if *peer_id == a_id
    )));

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_payload_disconnects_sender() {
    let cap = |c: &mut P2PConfig| {
        c.ws_max_payload_inbound = 5_000;
        c.ws_max_payload_outbound = 5_000;
    };
    let a = start_node_with(36160, &[], cap).await;
    let a_id = local_id(36160);
    let b = start_node_with(36161, &[36160], cap).await;
    let events_b = spawn_collector(&b).await;
    let b_id = local_id(36161);

    let connected = {
        let a = a.clone();
        let b_id = b_id.clone();
        wait_until(10_000, move || {
            let a = a.clone();
            let b_id = b_id.clone();
            async move { connected_ids(&a).await.contains(&b_id) }
        })
        .await
    };
    assert!(connected);

    let oversized = "x".repeat(6_000);
    a.send_to_peer(&b_id, MessagePacket::new("big", json!(oversized))).await.unwrap();

    let dropped = {
        let events_b = events_b.clone();
        let a_id = a_id.clone();
        wait_until(3_000, move || {
            let events_b = events_b.clone();
            let a_id = a_id.clone();
            async move {
                has_event(&events_b, |e| matches!(
                    e, P2PEvent::RemovePeer { peer_id } if *peer_id == a_id
                ))
            }
        })
        .await
    };
    assert!(dropped, "oversized sender was not disconnected");

    // The oversized message itself was never delivered
    assert!(!has_event(&events_b, |e| matches!(
        e, P2PEvent::MessageReceived(m) if m.event == "big"
    )));

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_connection_rejected() {
    let a = start_node(36170, &[]).await;
    let b = start_node(36171, &[36170]).await;
    let a_id = local_id(36170);
    let b_id = local_id(36171);

    let connected = {
        let a = a.clone();
        let b_id = b_id.clone();
        wait_until(10_000, move || {
            let a = a.clone();
            let b_id = b_id.clone();
            async move { connected_ids(&a).await.contains(&b_id) }
        })
        .await
    };
    assert!(connected);

    // A already has an inbound session for B's id; dialing B anyway must be
    // rejected on B's side because B already has its outbound session to A
    let session = a.connect_to_peer(seed_info(36171)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(session.state().await, SessionState::Closed);

    let result = session.apply_node_info(a.node_info().await).await;
    assert!(matches!(result, Err(peermesh::P2PError::RpcResponseError { .. })));

    // The original pairing survives on both sides
    assert!(connected_ids(&a).await.contains(&b_id));
    assert!(connected_ids(&b).await.contains(&a_id));

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_drains_sessions() {
    let a = start_node(36180, &[]).await;
    let events_a = spawn_collector(&a).await;
    let b = start_node(36181, &[36180]).await;
    let b_id = local_id(36181);

    let connected = {
        let a = a.clone();
        let b_id = b_id.clone();
        wait_until(10_000, move || {
            let a = a.clone();
            let b_id = b_id.clone();
            async move { connected_ids(&a).await.contains(&b_id) }
        })
        .await
    };
    assert!(connected);

    b.stop().await;
    assert!(!b.is_active());
    assert!(b.get_connected_peers().await.is_empty());

    // A observes the clean close and drops the peer
    let removed = {
        let a = a.clone();
        let b_id = b_id.clone();
        wait_until(5_000, move || {
            let a = a.clone();
            let b_id = b_id.clone();
            async move { !connected_ids(&a).await.contains(&b_id) }
        })
        .await
    };
    assert!(removed);
    assert!(has_event(&events_a, |e| matches!(
        e,
        P2PEvent::CloseInbound { peer_id, code, .. }
            if *peer_id == b_id && *code == peermesh::INTENTIONAL_DISCONNECT_CODE
    )));

    // Stopping twice is harmless
    b.stop().await;
    a.stop().await;
}
