//! Unstructured peer-to-peer mesh networking for blockchain nodes.
//!
//! The crate keeps a live mesh of peer connections over framed duplex
//! sockets, multiplexes request/response RPC and fire-and-forget messages
//! per connection, discovers new peers through a bucketed address book, and
//! defends the node against misbehaving peers with rate accounting,
//! reputation, eviction and bans.

pub mod addr;
pub mod config;
pub mod error;
pub mod event;
pub mod p2p;
pub mod peer_book;
pub mod pool;
pub mod request;
pub mod selection;
pub mod session;
pub mod transport;
pub mod types;
pub mod validation;

// Re-exports
pub use addr::{bucket_id, classify_network, normalize_address, peer_id, Network, NormalizedAddress};
pub use config::{P2PConfig, PeerLists};
pub use error::P2PError;
pub use event::P2PEvent;
pub use p2p::{P2P, MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE};
pub use peer_book::{sanitize_peer_lists, PeerBook, PeerBookStats};
pub use pool::{select_peer_to_evict, EvictionCandidate, PeerPool, PoolStats};
pub use request::P2PRequest;
pub use selection::{
    ConnectionPeerSelector, ConnectionSelectionInput, RequestPeerSelector, RequestSelectionInput,
    SendPeerSelector, SendSelectionInput,
};
pub use session::{PeerSession, SessionConfig, SessionState, INITIAL_REPUTATION};
pub use types::{
    ConnectionKind, InboundMessage, MessagePacket, NodeInfo, PeerId, PeerInfo, PeerKind,
    Productivity, RequestPacket, EVICTED_PEER_CODE, FAILED_TO_RESPOND_CODE,
    FORBIDDEN_CONNECTION_CODE, INCOMPATIBLE_NETWORK_CODE, INCOMPATIBLE_PROTOCOL_VERSION_CODE,
    INTENTIONAL_DISCONNECT_CODE,
};
pub use validation::{
    check_compatibility, check_network_compatibility, validate_message, validate_peer_info,
    validate_peer_list, validate_rpc_request,
};
