//! Shared types and constants for the peermesh protocol.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every inbound payload has an explicit size
//!    limit, defined over its serialized JSON bytes. An attacker cannot
//!    exhaust memory by sending large or many messages.
//!
//! 2. **DoS resistance** — per-connection rate accounting, reputation
//!    penalties and bans bound what any single peer can cost us.
//!
//! 3. **Eclipse resistance** — the peer book assigns addresses to buckets with
//!    a node-private seeded hash, so an adversary cannot precompute addresses
//!    that collide into a victim's buckets.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// DISCONNECT STATUS CODES
// =============================================================================
// Carried on the close frame so the remote end can tell a polite goodbye from
// an enforcement action. 1000/1006/1009 follow the usual socket close codes;
// the 4xxx range is application-defined.

/// Clean shutdown requested by the application.
pub const INTENTIONAL_DISCONNECT_CODE: u16 = 1000;

/// Transport dropped without a close frame.
pub const ABNORMAL_CLOSURE_CODE: u16 = 1006;

/// Frame exceeded the receive payload limit.
pub const MESSAGE_TOO_BIG_CODE: u16 = 1009;

/// Peer advertised a different network identifier during handshake.
pub const INCOMPATIBLE_NETWORK_CODE: u16 = 4102;

/// Peer's protocol/software version failed the compatibility check.
pub const INCOMPATIBLE_PROTOCOL_VERSION_CODE: u16 = 4103;

/// Reputation depleted; the peer is banned.
pub const FORBIDDEN_CONNECTION_CODE: u16 = 4403;

/// Peer did not answer an RPC within the ack timeout.
pub const FAILED_TO_RESPOND_CODE: u16 = 4404;

/// Disconnected to make room within a connection quota.
pub const EVICTED_PEER_CODE: u16 = 4418;

/// Second connection for a peer id that is already connected.
pub const DUPLICATE_CONNECTION_CODE: u16 = 4420;

/// Map a close code to a stable, loggable reason string.
///
/// Close reasons arrive from the remote end and are untrusted; events carry
/// this sanitized form instead of whatever the peer sent.
pub fn sanitize_close_reason(code: u16) -> &'static str {
    match code {
        INTENTIONAL_DISCONNECT_CODE => "Intentionally disconnected",
        ABNORMAL_CLOSURE_CODE => "Connection lost",
        MESSAGE_TOO_BIG_CODE => "Message exceeded payload limit",
        INCOMPATIBLE_NETWORK_CODE => "Incompatible network",
        INCOMPATIBLE_PROTOCOL_VERSION_CODE => "Incompatible protocol version",
        FORBIDDEN_CONNECTION_CODE => "Forbidden connection",
        FAILED_TO_RESPOND_CODE => "Failed to respond",
        EVICTED_PEER_CODE => "Evicted to free a connection slot",
        DUPLICATE_CONNECTION_CODE => "Duplicate connection",
        _ => "Unknown reason",
    }
}

// =============================================================================
// BUILT-IN VERBS
// =============================================================================

/// RPC: returns the remote node's advertised info.
pub const PROC_STATUS: &str = "status";

/// RPC: returns `{ "peers": [PeerInfo, ...] }` for discovery.
pub const PROC_LIST: &str = "list";

/// RPC: pushes fresh node info to an actively connected peer.
pub const PROC_UPDATE_MYSELF: &str = "updateMyself";

/// Message: fresh node info pushed to a passive peer.
pub const MSG_NODE_INFO_CHANGED: &str = "nodeInfoChanged";

/// Tag carried on every RPC request payload.
pub const RPC_REQUEST_TYPE: &str = "/RPCRequest";

// =============================================================================
// PEER IDENTITY
// =============================================================================

/// Canonical peer identifier: `"<ip>:<port>"` for IPv4,
/// `"[<ip>]:<port>"` for IPv6 (uncompressed form).
pub type PeerId = String;

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// We dialed the peer.
    Outbound,
    /// The peer dialed us.
    Inbound,
}

/// Which peer-book table an address lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKind {
    /// Recently learned, never connected.
    New,
    /// Successfully connected at least once.
    Tried,
}

// =============================================================================
// PEER INFO
// =============================================================================

/// A discovered peer's address and advertised node facts.
///
/// `ip_address` and `ws_port` are fixed at creation; the update path replaces
/// every other field but preserves them. Arbitrary advertised fields ride
/// along verbatim in `extras`, bounded by `max_peer_info_size` at validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Normalized textual IP. Wire field name is `ip`.
    #[serde(rename = "ip")]
    pub ip_address: String,
    pub ws_port: u16,
    /// Semver software version.
    pub version: String,
    /// `major.minor` protocol version. Absent on peers predating the scheme.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(default)]
    pub height: u64,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl PeerInfo {
    /// Canonical peer id for this address.
    pub fn peer_id(&self) -> PeerId {
        crate::addr::peer_id(&self.ip_address, self.ws_port)
    }
}

// =============================================================================
// NODE INFO
// =============================================================================

/// The local node's advertised state.
///
/// Serialized wholesale as the outbound handshake query and as the `status`
/// RPC response. `nonce` exists for self-connection detection; `nethash`
/// identifies the chain so nodes on different networks refuse each other.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub os: String,
    pub version: String,
    pub protocol_version: String,
    pub nethash: String,
    pub ws_port: u16,
    #[serde(default)]
    pub height: u64,
    /// Random per-process identity, compared during handshake to reject
    /// connections to ourselves.
    pub nonce: String,
    /// Registered application modules. Scales the inbound quota.
    #[serde(default)]
    pub modules: Vec<String>,
    /// Minimum acceptable software version for peers that advertise no
    /// protocol version.
    #[serde(default)]
    pub min_version: String,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl NodeInfo {
    /// Serialize to the raw JSON map exchanged on the wire.
    pub fn to_wire(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

// =============================================================================
// PACKETS
// =============================================================================

/// An outgoing RPC request: remote procedure name plus JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPacket {
    pub procedure: String,
    #[serde(default)]
    pub data: Value,
}

impl RequestPacket {
    pub fn new(procedure: impl Into<String>, data: Value) -> Self {
        Self { procedure: procedure.into(), data }
    }
}

/// A fire-and-forget message: event name plus JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePacket {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl MessagePacket {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self { event: event.into(), data }
    }
}

/// An inbound message delivered to the application, with the per-event
/// arrival rate observed for the sending peer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub event: String,
    pub data: Value,
    pub peer_id: PeerId,
    /// Events per second for this event name on this connection.
    pub rate: f64,
}

// =============================================================================
// PRODUCTIVITY
// =============================================================================

/// Counters measuring how responsive a remote peer is to our requests.
///
/// Invariant: `response_rate == response_counter / max(request_counter, 1)`.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Productivity {
    pub request_counter: u64,
    pub response_counter: u64,
    pub response_rate: f64,
    /// Milliseconds since the epoch of the last successful response.
    pub last_responded: u64,
}

impl Productivity {
    pub fn record_request(&mut self) {
        self.request_counter += 1;
        self.recompute();
    }

    pub fn record_response(&mut self) {
        self.response_counter += 1;
        self.last_responded = now_ms();
        self.recompute();
    }

    fn recompute(&mut self) {
        self.response_rate = self.response_counter as f64 / self.request_counter.max(1) as f64;
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_productivity_rate() {
        let mut p = Productivity::default();
        assert_eq!(p.response_rate, 0.0);

        p.record_request();
        p.record_request();
        p.record_response();
        assert_eq!(p.request_counter, 2);
        assert_eq!(p.response_counter, 1);
        assert_eq!(p.response_rate, 0.5);
        assert!(p.last_responded > 0);
    }

    #[test]
    fn test_productivity_rate_without_requests() {
        // Division guard: responses with no recorded request
        let mut p = Productivity::default();
        p.record_response();
        assert_eq!(p.response_rate, 1.0);
    }

    #[test]
    fn test_node_info_wire_roundtrip() {
        let info = NodeInfo {
            os: "linux".into(),
            version: "1.1.0".into(),
            protocol_version: "1.1".into(),
            nethash: "da3ed6a4".into(),
            ws_port: 5000,
            height: 42,
            nonce: "abcdef".into(),
            modules: vec!["chain".into()],
            min_version: "1.0.0".into(),
            extras: Map::new(),
        };

        let wire = info.to_wire();
        assert_eq!(wire.get("wsPort").and_then(Value::as_u64), Some(5000));
        assert_eq!(wire.get("nethash").and_then(Value::as_str), Some("da3ed6a4"));
    }

    #[test]
    fn test_sanitize_close_reason() {
        assert_eq!(sanitize_close_reason(1000), "Intentionally disconnected");
        assert_eq!(sanitize_close_reason(4403), "Forbidden connection");
        assert_eq!(sanitize_close_reason(9999), "Unknown reason");
    }
}
