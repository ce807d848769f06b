//! Typed event stream surfaced by the facade.
//!
//! One enum, one channel. Sessions emit into the pool, the pool re-emits
//! upward after applying its side-effects, and the facade hands the combined
//! stream to the application.

use crate::request::P2PRequest;
use crate::types::{InboundMessage, PeerId, PeerInfo};

/// Everything observable about the mesh, in arrival order.
#[derive(Debug)]
pub enum P2PEvent {
    /// An inbound RPC arrived and may still be answered via the carried
    /// responder.
    RequestReceived(P2PRequest),
    /// An inbound fire-and-forget message arrived.
    MessageReceived(InboundMessage),
    /// Discovery learned a peer we had not seen before.
    DiscoveredPeer { peer_info: PeerInfo },
    /// An outbound dial completed.
    ConnectOutbound { peer_id: PeerId },
    /// An outbound dial was abandoned before completing.
    ConnectAbortOutbound { peer_id: PeerId },
    /// An outbound connection closed.
    CloseOutbound { peer_id: PeerId, code: u16, reason: String },
    /// An inbound connection closed.
    CloseInbound { peer_id: PeerId, code: u16, reason: String },
    OutboundSocketError { peer_id: PeerId, error: String },
    InboundSocketError { peer_id: PeerId, error: String },
    /// A peer pushed fresh info and it validated.
    UpdatedPeerInfo { peer_info: PeerInfo },
    /// A peer pushed fresh info and it failed validation.
    FailedPeerInfoUpdate { peer_id: PeerId, error: String },
    FailedToFetchPeerInfo { peer_id: PeerId, error: String },
    FailedToFetchPeers { peer_id: PeerId, error: String },
    FailedToPushNodeInfo { peer_id: PeerId, error: String },
    /// Post-connect status or discovery fetch failed; the session stays up.
    FailedToCollectPeerDetailsOnConnect { peer_id: PeerId, error: String },
    FailedToSendMessage { peer_id: PeerId, error: String },
    /// Reputation depleted; the peer is banned until the unban timer fires.
    BanPeer { peer_id: PeerId },
    UnbanPeer { peer_id: PeerId },
    /// The peer left the pool maps.
    RemovePeer { peer_id: PeerId },
    InvalidRequestReceived { peer_id: PeerId, error: String },
    InvalidMessageReceived { peer_id: PeerId, error: String },
}

impl P2PEvent {
    /// Stable event name, matching the wire-level vocabulary.
    pub fn name(&self) -> &'static str {
        match self {
            P2PEvent::RequestReceived(_) => "requestReceived",
            P2PEvent::MessageReceived(_) => "messageReceived",
            P2PEvent::DiscoveredPeer { .. } => "discoveredPeer",
            P2PEvent::ConnectOutbound { .. } => "connectOutbound",
            P2PEvent::ConnectAbortOutbound { .. } => "connectAbortOutbound",
            P2PEvent::CloseOutbound { .. } => "closeOutbound",
            P2PEvent::CloseInbound { .. } => "closeInbound",
            P2PEvent::OutboundSocketError { .. } => "outboundSocketError",
            P2PEvent::InboundSocketError { .. } => "inboundSocketError",
            P2PEvent::UpdatedPeerInfo { .. } => "updatedPeerInfo",
            P2PEvent::FailedPeerInfoUpdate { .. } => "failedPeerInfoUpdate",
            P2PEvent::FailedToFetchPeerInfo { .. } => "failedToFetchPeerInfo",
            P2PEvent::FailedToFetchPeers { .. } => "failedToFetchPeers",
            P2PEvent::FailedToPushNodeInfo { .. } => "failedToPushNodeInfo",
            P2PEvent::FailedToCollectPeerDetailsOnConnect { .. } => {
                "failedToCollectPeerDetailsOnConnect"
            }
            P2PEvent::FailedToSendMessage { .. } => "failedToSendMessage",
            P2PEvent::BanPeer { .. } => "banPeer",
            P2PEvent::UnbanPeer { .. } => "unbanPeer",
            P2PEvent::RemovePeer { .. } => "removePeer",
            P2PEvent::InvalidRequestReceived { .. } => "invalidRequestReceived",
            P2PEvent::InvalidMessageReceived { .. } => "invalidMessageReceived",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_wire_stable() {
        let peer_id = || "127.0.0.1:5000".to_string();
        assert_eq!(P2PEvent::BanPeer { peer_id: peer_id() }.name(), "banPeer");
        assert_eq!(P2PEvent::UnbanPeer { peer_id: peer_id() }.name(), "unbanPeer");
        assert_eq!(P2PEvent::RemovePeer { peer_id: peer_id() }.name(), "removePeer");
        assert_eq!(
            P2PEvent::CloseInbound { peer_id: peer_id(), code: 1000, reason: String::new() }.name(),
            "closeInbound"
        );
    }
}
