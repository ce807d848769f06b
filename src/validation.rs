//! Schema and size validation for untrusted wire input.
//!
//! Everything arriving from a peer passes through here before it can touch
//! the pool or the book. Size limits are measured over serialized JSON bytes.

use crate::addr::normalize_address;
use crate::error::P2PError;
use crate::types::{MessagePacket, NodeInfo, PeerInfo, RequestPacket};
use semver::Version;
use serde_json::{Map, Value};

/// Wire fields lifted into named `PeerInfo` attributes. Everything else is
/// carried verbatim in `extras`.
const PEER_INFO_FIELDS: [&str; 6] = ["ip", "wsPort", "version", "protocolVersion", "os", "height"];

fn json_byte_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Validate a raw advertised peer record into a sanitized [`PeerInfo`].
///
/// Rejects records whose JSON exceeds `max_byte_size`, whose `ip` is not a
/// parseable IP address, whose `wsPort` is out of range, or whose `version`
/// is not valid semver. The wire field `ip` becomes the internal
/// `ip_address` in normalized form; `height` is coerced to a non-negative
/// integer defaulting to 0.
pub fn validate_peer_info(raw: &Value, max_byte_size: usize) -> Result<PeerInfo, P2PError> {
    if json_byte_size(raw) > max_byte_size {
        return Err(P2PError::InvalidPeer(format!(
            "peer info exceeds {max_byte_size} bytes"
        )));
    }

    let obj = raw
        .as_object()
        .ok_or_else(|| P2PError::InvalidPeer("peer info is not an object".into()))?;

    let ip = obj
        .get("ip")
        .and_then(Value::as_str)
        .ok_or_else(|| P2PError::InvalidPeer("missing ip".into()))?;
    let normalized = normalize_address(ip)
        .map_err(|_| P2PError::InvalidPeer(format!("unparseable ip {ip:?}")))?;

    let ws_port = obj
        .get("wsPort")
        .and_then(Value::as_u64)
        .filter(|p| (1..=u16::MAX as u64).contains(p))
        .ok_or_else(|| P2PError::InvalidPeer("invalid wsPort".into()))?
        as u16;

    let version = obj
        .get("version")
        .and_then(Value::as_str)
        .ok_or_else(|| P2PError::InvalidPeer("missing version".into()))?;
    Version::parse(version)
        .map_err(|_| P2PError::InvalidPeer(format!("version {version:?} is not semver")))?;

    let protocol_version = match obj.get("protocolVersion") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => {
            parse_protocol_version(s).ok_or_else(|| {
                P2PError::InvalidPeer(format!("protocolVersion {s:?} is not major.minor"))
            })?;
            Some(s.clone())
        }
        Some(_) => {
            return Err(P2PError::InvalidPeer("protocolVersion is not a string".into()));
        }
    };

    let os = obj
        .get("os")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let height = obj.get("height").and_then(Value::as_u64).unwrap_or(0);

    let extras: Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| !PEER_INFO_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(PeerInfo {
        ip_address: normalized.address,
        ws_port,
        version: version.to_string(),
        protocol_version,
        os,
        height,
        extras,
    })
}

/// Validate a discovery response of the form `{ "peers": [...] }`.
///
/// Fails if the `peers` array is missing or longer than `max_list_length`.
/// Entries whose serialized size exceeds `max_per_peer_bytes` are silently
/// dropped; the remaining entries must pass [`validate_peer_info`].
pub fn validate_peer_list(
    raw: &Value,
    max_list_length: usize,
    max_per_peer_bytes: usize,
) -> Result<Vec<PeerInfo>, P2PError> {
    let peers = raw
        .get("peers")
        .and_then(Value::as_array)
        .ok_or_else(|| P2PError::InvalidRpcResponse("missing peers array".into()))?;

    if peers.len() > max_list_length {
        return Err(P2PError::InvalidRpcResponse(format!(
            "peer list length {} exceeds {max_list_length}",
            peers.len()
        )));
    }

    peers
        .iter()
        .filter(|raw_peer| json_byte_size(raw_peer) <= max_per_peer_bytes)
        .map(|raw_peer| validate_peer_info(raw_peer, max_per_peer_bytes))
        .collect()
}

/// Validate an inbound RPC request payload. `procedure` must be a string.
pub fn validate_rpc_request(raw: &Value) -> Result<RequestPacket, P2PError> {
    let procedure = raw
        .get("procedure")
        .and_then(Value::as_str)
        .ok_or_else(|| P2PError::InvalidRpcRequest("procedure is not a string".into()))?;

    Ok(RequestPacket {
        procedure: procedure.to_string(),
        data: raw.get("data").cloned().unwrap_or(Value::Null),
    })
}

/// Validate an inbound protocol message payload. `event` must be a string.
pub fn validate_message(raw: &Value) -> Result<MessagePacket, P2PError> {
    let event = raw
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| P2PError::InvalidProtocolMessage("event is not a string".into()))?;

    Ok(MessagePacket {
        event: event.to_string(),
        data: raw.get("data").cloned().unwrap_or(Value::Null),
    })
}

/// Split a `major.minor` protocol version string.
pub fn parse_protocol_version(s: &str) -> Option<(u32, u32)> {
    let (major, minor) = s.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Decide whether a peer may join our mesh.
///
/// Peers that advertise no protocol version fall back to a semver floor:
/// their software version must be at least `node.min_version`. Peers with a
/// protocol version must match our major exactly, and the major must be at
/// least 1.
pub fn check_compatibility(peer: &PeerInfo, node: &NodeInfo) -> Result<(), P2PError> {
    let Some(protocol_version) = &peer.protocol_version else {
        let peer_version = Version::parse(&peer.version)
            .map_err(|_| P2PError::InvalidPeer(format!("version {:?} is not semver", peer.version)))?;
        let min_version = Version::parse(&node.min_version).map_err(|_| {
            P2PError::InvalidConfig(format!("minVersion {:?} is not semver", node.min_version))
        })?;
        if peer_version < min_version {
            return Err(P2PError::InvalidPeer(format!(
                "version {} is below minimum {}",
                peer.version, node.min_version
            )));
        }
        return Ok(());
    };

    let (peer_major, _) = parse_protocol_version(protocol_version).ok_or_else(|| {
        P2PError::InvalidPeer(format!("protocolVersion {protocol_version:?} is not major.minor"))
    })?;
    let (node_major, _) = parse_protocol_version(&node.protocol_version).ok_or_else(|| {
        P2PError::InvalidConfig(format!(
            "protocolVersion {:?} is not major.minor",
            node.protocol_version
        ))
    })?;

    if peer_major < 1 || peer_major != node_major {
        return Err(P2PError::InvalidPeer(format!(
            "protocol version {protocol_version} is incompatible with {}",
            node.protocol_version
        )));
    }

    Ok(())
}

/// Reject peers advertising a different network identifier.
pub fn check_network_compatibility(peer: &PeerInfo, node: &NodeInfo) -> Result<(), P2PError> {
    let nethash = peer.extras.get("nethash").and_then(Value::as_str);
    match nethash {
        Some(hash) if hash == node.nethash => Ok(()),
        Some(hash) => Err(P2PError::InvalidPeer(format!(
            "nethash {hash:?} does not match ours"
        ))),
        None => Err(P2PError::InvalidPeer("missing nethash".into())),
    }
}
