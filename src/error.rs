//! Error taxonomy for the networking layer.
//!
//! Validation failures are recoverable: the offending frame is dropped, an
//! event is emitted, and the connection stays up. RPC failures surface to the
//! caller as typed errors; only a timeout also disconnects. Depleted
//! reputation, rate breaches and oversized payloads are fatal for the session
//! and close it with a specific status code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2PError {
    /// Peer info failed schema or size validation.
    #[error("invalid peer info: {0}")]
    InvalidPeer(String),

    /// Inbound RPC request failed validation.
    #[error("invalid RPC request: {0}")]
    InvalidRpcRequest(String),

    /// Inbound protocol message failed validation.
    #[error("invalid protocol message: {0}")]
    InvalidProtocolMessage(String),

    /// RPC response failed validation.
    #[error("invalid RPC response: {0}")]
    InvalidRpcResponse(String),

    /// Remote did not answer within the ack timeout. Disconnects the peer.
    #[error("RPC timeout for procedure {procedure} on peer {peer_id}")]
    RpcTimeout { procedure: String, peer_id: String },

    /// Transport-level failure on a request. Does not disconnect.
    #[error("RPC failure for procedure {procedure} on peer {peer_id}: {message}")]
    RpcResponseError {
        procedure: String,
        peer_id: String,
        message: String,
    },

    /// A request was answered twice.
    #[error("response already sent for procedure {0}")]
    ResponseAlreadySent(String),

    /// No peer was available to route a request to.
    #[error("request failed: {0}")]
    RequestFail(String),

    /// No peer was available to send a message to.
    #[error("send failed: {0}")]
    SendFail(String),

    /// An inbound connection failed during handshake.
    #[error("inbound handshake failed for {peer_id}: {message}")]
    PeerInboundHandshakeError { peer_id: String, message: String },

    /// An outbound dial could not be established.
    #[error("outbound connection to {peer_id} failed: {message}")]
    PeerOutboundConnectionError { peer_id: String, message: String },

    /// Address does not belong to a supported network family.
    #[error("unsupported address: {0}")]
    UnsupportedAddress(String),

    /// Pool misconfiguration detected during start.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl P2PError {
    /// Short stable kind tag, used in emitted events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            P2PError::InvalidPeer(_) => "InvalidPeer",
            P2PError::InvalidRpcRequest(_) => "InvalidRPCRequest",
            P2PError::InvalidProtocolMessage(_) => "InvalidProtocolMessage",
            P2PError::InvalidRpcResponse(_) => "InvalidRPCResponse",
            P2PError::RpcTimeout { .. } => "RPCTimeout",
            P2PError::RpcResponseError { .. } => "RPCResponseError",
            P2PError::ResponseAlreadySent(_) => "ResponseAlreadySent",
            P2PError::RequestFail(_) => "RequestFail",
            P2PError::SendFail(_) => "SendFail",
            P2PError::PeerInboundHandshakeError { .. } => "PeerInboundHandshakeError",
            P2PError::PeerOutboundConnectionError { .. } => "PeerOutboundConnectionError",
            P2PError::UnsupportedAddress(_) => "UnsupportedAddress",
            P2PError::InvalidConfig(_) => "InvalidConfig",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_tags() {
        let err = P2PError::RpcTimeout {
            procedure: "status".into(),
            peer_id: "127.0.0.1:5000".into(),
        };
        assert_eq!(err.kind(), "RPCTimeout");
        assert!(err.to_string().contains("status"));
    }
}
