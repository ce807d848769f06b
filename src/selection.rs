//! Pluggable peer-selection policies.
//!
//! The pool never decides *which* peer serves a request, receives a fan-out
//! message, or gets dialed next; it hands the candidate sets to one of three
//! selector functions and acts on the result. Applications swap in their own
//! policies through [`crate::config::P2PConfig`]; the defaults below keep the
//! mesh healthy without any protocol knowledge.

use crate::types::{MessagePacket, NodeInfo, PeerInfo, RequestPacket};
use rand::Rng;
use std::sync::Arc;

/// Candidate set for routing a single RPC request.
#[derive(Debug, Clone)]
pub struct RequestSelectionInput {
    pub peers: Vec<PeerInfo>,
    pub node_info: NodeInfo,
    pub peer_limit: usize,
    pub request_packet: RequestPacket,
}

/// Candidate set for fanning out a message.
#[derive(Debug, Clone)]
pub struct SendSelectionInput {
    pub peers: Vec<PeerInfo>,
    pub node_info: NodeInfo,
    pub peer_limit: usize,
    pub message_packet: MessagePacket,
}

/// Candidate sets and quota state for choosing who to dial next.
#[derive(Debug, Clone)]
pub struct ConnectionSelectionInput {
    pub disconnected_new_peers: Vec<PeerInfo>,
    pub disconnected_tried_peers: Vec<PeerInfo>,
    pub connected_new_peers: Vec<PeerInfo>,
    pub connected_tried_peers: Vec<PeerInfo>,
    pub node_info: NodeInfo,
    pub max_outbound_connections: usize,
    pub outbound_count: usize,
    pub max_inbound_connections: usize,
    pub inbound_count: usize,
}

pub type RequestPeerSelector =
    Arc<dyn Fn(RequestSelectionInput) -> Option<PeerInfo> + Send + Sync>;
pub type SendPeerSelector = Arc<dyn Fn(SendSelectionInput) -> Vec<PeerInfo> + Send + Sync>;
pub type ConnectionPeerSelector =
    Arc<dyn Fn(ConnectionSelectionInput) -> Vec<PeerInfo> + Send + Sync>;

pub(crate) fn shuffle_in_place<T>(items: &mut [T]) {
    let mut rng = rand::thread_rng();
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

/// Default request routing: prefer peers at or above our height, fall back
/// to everyone, pick one uniformly at random.
pub fn select_peer_for_request(input: RequestSelectionInput) -> Option<PeerInfo> {
    let RequestSelectionInput { peers, node_info, .. } = input;
    if peers.is_empty() {
        return None;
    }

    let ahead: Vec<&PeerInfo> = peers.iter().filter(|p| p.height >= node_info.height).collect();
    let pool: Vec<&PeerInfo> = if ahead.is_empty() { peers.iter().collect() } else { ahead };

    let idx = rand::thread_rng().gen_range(0..pool.len());
    Some(pool[idx].clone())
}

/// Default fan-out: shuffle and take up to `peer_limit`.
pub fn select_peers_for_send(input: SendSelectionInput) -> Vec<PeerInfo> {
    let SendSelectionInput { mut peers, peer_limit, .. } = input;
    shuffle_in_place(&mut peers);
    peers.truncate(peer_limit);
    peers
}

/// Default dialing policy: fill the free outbound slots from a shuffled mix
/// of disconnected tried and new peers, tried first.
pub fn select_peers_for_connection(input: ConnectionSelectionInput) -> Vec<PeerInfo> {
    let free_slots = input
        .max_outbound_connections
        .saturating_sub(input.outbound_count);
    if free_slots == 0 {
        return Vec::new();
    }

    let mut tried = input.disconnected_tried_peers;
    let mut fresh = input.disconnected_new_peers;
    shuffle_in_place(&mut tried);
    shuffle_in_place(&mut fresh);

    let mut selected = tried;
    selected.extend(fresh);
    selected.truncate(free_slots);
    selected
}

/// The three default selectors bundled for configuration.
pub fn default_selectors() -> (RequestPeerSelector, SendPeerSelector, ConnectionPeerSelector) {
    (
        Arc::new(select_peer_for_request),
        Arc::new(select_peers_for_send),
        Arc::new(select_peers_for_connection),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn peer(ip: &str, port: u16, height: u64) -> PeerInfo {
        PeerInfo {
            ip_address: ip.to_string(),
            ws_port: port,
            version: "1.0.0".into(),
            protocol_version: Some("1.0".into()),
            os: String::new(),
            height,
            extras: Map::new(),
        }
    }

    fn node(height: u64) -> NodeInfo {
        NodeInfo {
            os: String::new(),
            version: "1.0.0".into(),
            protocol_version: "1.0".into(),
            nethash: "nh".into(),
            ws_port: 5000,
            height,
            nonce: "n".into(),
            modules: vec![],
            min_version: "1.0.0".into(),
            extras: Map::new(),
        }
    }

    #[test]
    fn test_request_selection_prefers_higher_peers() {
        let input = RequestSelectionInput {
            peers: vec![peer("1.1.1.1", 1, 5), peer("2.2.2.2", 2, 50)],
            node_info: node(10),
            peer_limit: 1,
            request_packet: RequestPacket::new("status", serde_json::Value::Null),
        };
        // Only one candidate is at our height or above
        let chosen = select_peer_for_request(input).unwrap();
        assert_eq!(chosen.ip_address, "2.2.2.2");
    }

    #[test]
    fn test_request_selection_falls_back_when_all_behind() {
        let input = RequestSelectionInput {
            peers: vec![peer("1.1.1.1", 1, 5)],
            node_info: node(100),
            peer_limit: 1,
            request_packet: RequestPacket::new("status", serde_json::Value::Null),
        };
        assert!(select_peer_for_request(input).is_some());
    }

    #[test]
    fn test_send_selection_respects_limit() {
        let peers: Vec<PeerInfo> = (1..=30).map(|i| peer("9.9.9.9", i, 0)).collect();
        let input = SendSelectionInput {
            peers,
            node_info: node(0),
            peer_limit: 16,
            message_packet: MessagePacket::new("bar", serde_json::Value::Null),
        };
        assert_eq!(select_peers_for_send(input).len(), 16);
    }

    #[test]
    fn test_connection_selection_fills_free_slots() {
        let input = ConnectionSelectionInput {
            disconnected_new_peers: (1..=10).map(|i| peer("8.8.8.8", i, 0)).collect(),
            disconnected_tried_peers: vec![peer("7.7.7.7", 99, 0)],
            connected_new_peers: vec![],
            connected_tried_peers: vec![],
            node_info: node(0),
            max_outbound_connections: 5,
            outbound_count: 2,
            max_inbound_connections: 100,
            inbound_count: 0,
        };
        let selected = select_peers_for_connection(input);
        assert_eq!(selected.len(), 3);
        // Tried peers are dialed before new ones
        assert_eq!(selected[0].ip_address, "7.7.7.7");
    }

    #[test]
    fn test_connection_selection_when_full() {
        let input = ConnectionSelectionInput {
            disconnected_new_peers: vec![peer("8.8.8.8", 1, 0)],
            disconnected_tried_peers: vec![],
            connected_new_peers: vec![],
            connected_tried_peers: vec![],
            node_info: node(0),
            max_outbound_connections: 2,
            outbound_count: 2,
            max_inbound_connections: 100,
            inbound_count: 0,
        };
        assert!(select_peers_for_connection(input).is_empty());
    }
}
