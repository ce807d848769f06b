//! Top-level facade: lifecycle, inbound acceptance, discovery and the
//! application-facing event stream.

use crate::config::{P2PConfig, PeerLists};
use crate::error::P2PError;
use crate::event::P2PEvent;
use crate::peer_book::{sanitize_peer_lists, PeerBook, PeerBookStats};
use crate::pool::{PeerPool, PoolStats};
use crate::request::P2PRequest;
use crate::selection::shuffle_in_place;
use crate::session::PeerSession;
use crate::transport::{read_frame_unsplit, write_frame_unsplit, Frame};
use crate::types::{
    MessagePacket, NodeInfo, PeerId, PeerInfo, RequestPacket, DUPLICATE_CONNECTION_CODE,
    FORBIDDEN_CONNECTION_CODE, INCOMPATIBLE_NETWORK_CODE, INCOMPATIBLE_PROTOCOL_VERSION_CODE,
    INTENTIONAL_DISCONNECT_CODE, PROC_LIST,
};
use crate::validation::{
    check_compatibility, check_network_compatibility, validate_peer_info, validate_peer_list,
};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Upper bound on how many live peers one discovery cycle probes for lists.
pub const MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE: usize = 100;

/// An unstructured peer-to-peer mesh endpoint.
///
/// `start` binds the listener and spawns the discovery populator; `stop`
/// drains every session and cancels all background work. Everything
/// observable arrives on the stream returned by
/// [`take_event_stream`](Self::take_event_stream).
pub struct P2P {
    config: Arc<P2PConfig>,
    node_info: Mutex<NodeInfo>,
    pool: Mutex<Option<Arc<PeerPool>>>,
    book: Mutex<PeerBook>,
    sanitized: Mutex<PeerLists>,
    active: AtomicBool,
    own_peer_id: PeerId,
    user_tx: mpsc::UnboundedSender<P2PEvent>,
    user_rx: Mutex<Option<mpsc::UnboundedReceiver<P2PEvent>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    relay_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl P2P {
    pub fn new(config: P2PConfig, node_info: NodeInfo) -> Result<Arc<Self>, P2PError> {
        config.validate()?;

        let own_address = crate::addr::normalize_address(&config.host_address)
            .map_err(|_| P2PError::InvalidConfig(format!(
                "host address {:?} is not an IP address",
                config.host_address
            )))?;
        let own_peer_id = crate::addr::peer_id(&own_address.address, node_info.ws_port);

        let book = PeerBook::new(&config);
        let (user_tx, user_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            config: Arc::new(config),
            node_info: Mutex::new(node_info),
            pool: Mutex::new(None),
            book: Mutex::new(book),
            sanitized: Mutex::new(PeerLists::default()),
            active: AtomicBool::new(false),
            own_peer_id,
            user_tx,
            user_rx: Mutex::new(Some(user_rx)),
            tasks: Mutex::new(Vec::new()),
            relay_task: Mutex::new(None),
            listen_addr: Mutex::new(None),
        }))
    }

    /// The application's end of the event stream. Yields `None` after the
    /// first call.
    pub async fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<P2PEvent>> {
        self.user_rx.lock().await.take()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn own_peer_id(&self) -> &PeerId {
        &self.own_peer_id
    }

    pub async fn node_info(&self) -> NodeInfo {
        self.node_info.lock().await.clone()
    }

    /// Sanitize peer lists, open the listener and spawn the discovery
    /// populator. Idempotent while active.
    pub async fn start(self: &Arc<Self>) -> Result<(), P2PError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let sanitized = sanitize_peer_lists(&self.config.peer_lists, &self.config.blacklisted_ips);
        *self.sanitized.lock().await = sanitized.clone();

        let node_info = self.node_info.lock().await.clone();

        let host: IpAddr = self
            .config
            .host_address
            .parse()
            .map_err(|_| P2PError::InvalidConfig(format!(
                "host address {:?} is not an IP address",
                self.config.host_address
            )))?;
        let bind_addr = SocketAddr::new(host, node_info.ws_port);
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(P2PError::InvalidConfig(format!(
                    "failed to bind listener on {bind_addr}: {e}"
                )));
            }
        };
        *self.listen_addr.lock().await = listener.local_addr().ok();
        info!("Listening on {bind_addr}");

        let (facade_tx, facade_rx) = mpsc::unbounded_channel();
        let pool = PeerPool::new(self.config.clone(), node_info.clone(), facade_tx, &sanitized).await;
        *self.pool.lock().await = Some(pool);

        self.seed_peer_book(&sanitized).await;

        *self.relay_task.lock().await =
            Some(tokio::spawn(Self::relay_loop(self.clone(), facade_rx)));

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Self::accept_loop(self.clone(), listener)));
        tasks.push(tokio::spawn(Self::populator_loop(self.clone())));

        Ok(())
    }

    /// Cancel the populator and listener, drain every session and stop the
    /// pool. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        let pool = self.pool.lock().await.clone();
        if let Some(pool) = pool {
            pool.remove_all_peers(INTENTIONAL_DISCONNECT_CODE, "Intentionally disconnected")
                .await;
            // Let the close events drain through the relay chain
            tokio::time::sleep(Duration::from_millis(50)).await;
            pool.shutdown().await;
        }
        *self.pool.lock().await = None;

        if let Some(relay) = self.relay_task.lock().await.take() {
            relay.abort();
        }
        *self.listen_addr.lock().await = None;
        info!("P2P node stopped");
    }

    async fn seed_peer_book(&self, sanitized: &PeerLists) {
        let mut book = self.book.lock().await;
        for peer in sanitized
            .seed_peers
            .iter()
            .chain(sanitized.fixed_peers.iter())
            .chain(sanitized.whitelisted.iter())
        {
            if peer.peer_id() != self.own_peer_id {
                let _ = book.add_new(peer.clone());
            }
        }
        for peer in &sanitized.previous_peers {
            if peer.peer_id() != self.own_peer_id {
                let _ = book.add_tried(peer.clone());
            }
        }
    }

    async fn pool(&self) -> Result<Arc<PeerPool>, P2PError> {
        self.pool
            .lock()
            .await
            .clone()
            .ok_or_else(|| P2PError::RequestFail("node is not active".into()))
    }

    // -------------------------------------------------------------------------
    // Application-facing operations
    // -------------------------------------------------------------------------

    /// Route a request to one peer chosen by the request selector.
    pub async fn request(&self, packet: RequestPacket) -> Result<Value, P2PError> {
        self.pool().await?.request(packet).await
    }

    /// Fan a message out to peers chosen by the send selector.
    pub async fn send(&self, packet: MessagePacket) -> Result<(), P2PError> {
        self.pool().await?.send(packet).await;
        Ok(())
    }

    pub async fn request_from_peer(
        &self,
        peer_id: &str,
        packet: RequestPacket,
    ) -> Result<Value, P2PError> {
        self.pool().await?.request_from_peer(peer_id, packet).await
    }

    pub async fn send_to_peer(&self, peer_id: &str, packet: MessagePacket) -> Result<(), P2PError> {
        let pool = self
            .pool()
            .await
            .map_err(|_| P2PError::SendFail("node is not active".into()))?;
        pool.send_to_peer(peer_id, packet).await
    }

    /// Subtract reputation from a connected peer. Depletion bans the peer.
    pub async fn apply_penalty(&self, peer_id: &str, penalty: i64) -> Result<(), P2PError> {
        self.pool().await?.apply_penalty(peer_id, penalty).await
    }

    /// Open (or reuse) an outbound session to a specific peer.
    pub async fn connect_to_peer(&self, peer_info: PeerInfo) -> Result<Arc<PeerSession>, P2PError> {
        let pool = self
            .pool()
            .await
            .map_err(|_| P2PError::PeerOutboundConnectionError {
                peer_id: peer_info.peer_id(),
                message: "node is not active".into(),
            })?;
        Ok(pool.add_outbound_peer(peer_info).await)
    }

    /// Connected peers, deduplicated by id.
    pub async fn get_connected_peers(&self) -> Vec<PeerInfo> {
        match self.pool().await {
            Ok(pool) => pool.get_connected_peers().await,
            Err(_) => Vec::new(),
        }
    }

    /// Cache fresh node info and propagate it to every live session.
    pub async fn apply_node_info(&self, node_info: NodeInfo) -> Result<(), P2PError> {
        *self.node_info.lock().await = node_info.clone();
        self.pool().await?.apply_node_info(node_info).await;
        Ok(())
    }

    pub async fn pool_stats(&self) -> PoolStats {
        match self.pool().await {
            Ok(pool) => pool.stats().await,
            Err(_) => PoolStats::default(),
        }
    }

    pub async fn book_stats(&self) -> PeerBookStats {
        self.book.lock().await.stats()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock().await
    }

    // -------------------------------------------------------------------------
    // Inbound acceptance
    // -------------------------------------------------------------------------

    async fn accept_loop(p2p: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let p2p = p2p.clone();
                    tokio::spawn(async move {
                        p2p.handle_inbound_connection(stream, remote).await;
                    });
                }
                Err(e) => {
                    debug!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_inbound_connection(self: &Arc<Self>, mut stream: TcpStream, remote: SocketAddr) {
        let remote_label = remote.to_string();

        let frame = read_frame_unsplit(
            &mut stream,
            self.config.ws_max_payload_inbound,
            Duration::from_millis(self.config.connect_timeout_ms),
        )
        .await;

        let handshake = match frame {
            Ok(Frame::Handshake { info }) => info,
            Ok(_) => {
                self.emit_handshake_error(&remote_label, "expected a handshake frame");
                return;
            }
            Err(e) => {
                self.emit_handshake_error(&remote_label, &e.to_string());
                return;
            }
        };

        let mut raw = handshake.as_object().cloned().unwrap_or_default();
        raw.insert("ip".into(), json!(remote.ip().to_string()));

        let peer_info = match validate_peer_info(
            &Value::Object(raw),
            self.config.max_peer_info_size,
        ) {
            Ok(info) => info,
            Err(e) => {
                self.emit_handshake_error(&remote_label, &e.to_string());
                return;
            }
        };
        let peer_id = peer_info.peer_id();
        let node_info = self.node_info.lock().await.clone();

        // Our own nonce coming back means we dialed ourselves
        let remote_nonce = peer_info.extras.get("nonce").and_then(Value::as_str);
        if remote_nonce == Some(node_info.nonce.as_str()) {
            Self::reject(&mut stream, DUPLICATE_CONNECTION_CODE, "Self connection").await;
            return;
        }

        if self.is_blacklisted(&peer_info.ip_address) {
            Self::reject(&mut stream, FORBIDDEN_CONNECTION_CODE, "Blacklisted address").await;
            self.emit_handshake_error(&peer_id, "blacklisted address");
            return;
        }

        let pool = match self.pool().await {
            Ok(pool) => pool,
            Err(_) => return,
        };

        if pool.is_banned(&peer_id).await {
            Self::reject(&mut stream, FORBIDDEN_CONNECTION_CODE, "Peer is banned").await;
            self.emit_handshake_error(&peer_id, "peer is banned");
            return;
        }

        if let Err(e) = check_network_compatibility(&peer_info, &node_info) {
            Self::reject(&mut stream, INCOMPATIBLE_NETWORK_CODE, "Incompatible network").await;
            self.emit_handshake_error(&peer_id, &e.to_string());
            return;
        }

        if let Err(e) = check_compatibility(&peer_info, &node_info) {
            Self::reject(
                &mut stream,
                INCOMPATIBLE_PROTOCOL_VERSION_CODE,
                "Incompatible protocol version",
            )
            .await;
            self.emit_handshake_error(&peer_id, &e.to_string());
            return;
        }

        if pool.has_peer(&peer_id).await {
            Self::reject(&mut stream, DUPLICATE_CONNECTION_CODE, "Duplicate connection").await;
            self.emit_handshake_error(&peer_id, "duplicate connection");
            return;
        }

        match pool.add_inbound_peer(peer_info.clone(), stream).await {
            Ok(_) => {
                self.register_discovered_peer(&peer_info).await;
                debug!("Accepted inbound peer {peer_id}");
            }
            Err(e) => {
                self.emit_handshake_error(&peer_id, &e.to_string());
            }
        }
    }

    async fn reject(stream: &mut TcpStream, code: u16, reason: &str) {
        let _ = write_frame_unsplit(
            stream,
            &Frame::Close { code, reason: reason.to_string() },
        )
        .await;
    }

    fn emit_handshake_error(&self, peer_id: &str, message: &str) {
        let error = P2PError::PeerInboundHandshakeError {
            peer_id: peer_id.to_string(),
            message: message.to_string(),
        };
        warn!("{error}");
        let _ = self.user_tx.send(P2PEvent::InboundSocketError {
            peer_id: peer_id.to_string(),
            error: error.to_string(),
        });
    }

    fn is_blacklisted(&self, ip_address: &str) -> bool {
        self.config
            .blacklisted_ips
            .iter()
            .any(|blocked| {
                crate::addr::normalize_address(blocked)
                    .map(|n| n.address == ip_address)
                    .unwrap_or(false)
            })
    }

    // -------------------------------------------------------------------------
    // Event relaying
    // -------------------------------------------------------------------------

    /// Consume pool events, answer built-in discovery requests, keep the
    /// book current and forward everything to the application stream.
    async fn relay_loop(p2p: Arc<Self>, mut rx: mpsc::UnboundedReceiver<P2PEvent>) {
        while let Some(event) = rx.recv().await {
            match &event {
                P2PEvent::RequestReceived(request) => {
                    if request.procedure == PROC_LIST {
                        p2p.handle_peer_list_request(request).await;
                    }
                }
                P2PEvent::DiscoveredPeer { peer_info } => {
                    p2p.register_discovered_peer(peer_info).await;
                }
                P2PEvent::ConnectOutbound { peer_id } => {
                    let _ = p2p.book.lock().await.upgrade_new_to_tried(peer_id);
                }
                P2PEvent::BanPeer { peer_id } => {
                    p2p.book.lock().await.remove(peer_id);
                }
                P2PEvent::UnbanPeer { peer_id } => {
                    p2p.restore_static_peer(peer_id).await;
                }
                _ => {}
            }
            let _ = p2p.user_tx.send(event);
        }
    }

    /// Answer the built-in `list` RPC with our known peers, excluding the
    /// requester and ourselves.
    async fn handle_peer_list_request(&self, request: &P2PRequest) {
        if request.was_response_sent() {
            return;
        }

        let mut known = self.book.lock().await.get_all_peers();
        if let Ok(pool) = self.pool().await {
            known.extend(pool.get_connected_peers().await);
        }

        let mut seen = HashSet::new();
        let mut peers: Vec<PeerInfo> = known
            .into_iter()
            .filter(|peer| {
                let id = peer.peer_id();
                id != request.peer_id && id != self.own_peer_id && seen.insert(id)
            })
            .collect();
        shuffle_in_place(&mut peers);
        peers.truncate(self.config.max_peer_discovery_response_length);

        let peers_json: Vec<Value> = peers
            .iter()
            .filter_map(|peer| serde_json::to_value(peer).ok())
            .collect();
        let _ = request.end(json!({ "peers": peers_json })).await;
    }

    /// Add a newly learned peer to the book. Returns true when it was
    /// actually new.
    async fn register_discovered_peer(&self, peer_info: &PeerInfo) -> bool {
        let peer_id = peer_info.peer_id();
        if peer_id == self.own_peer_id || self.is_blacklisted(&peer_info.ip_address) {
            return false;
        }

        let mut book = self.book.lock().await;
        if book.contains(&peer_id) {
            return false;
        }
        book.add_new(peer_info.clone()).unwrap_or(false)
    }

    /// Re-seed a statically configured peer after its ban expires, so the
    /// populator can dial it again.
    async fn restore_static_peer(&self, peer_id: &str) {
        let sanitized = self.sanitized.lock().await;
        let known = sanitized
            .seed_peers
            .iter()
            .chain(sanitized.fixed_peers.iter())
            .chain(sanitized.whitelisted.iter())
            .chain(sanitized.previous_peers.iter())
            .find(|peer| peer.peer_id() == peer_id)
            .cloned();
        drop(sanitized);

        if let Some(peer) = known {
            let _ = self.book.lock().await.add_new(peer);
        }
    }

    // -------------------------------------------------------------------------
    // Discovery populator
    // -------------------------------------------------------------------------

    async fn populator_loop(p2p: Arc<Self>) {
        tokio::time::sleep(Duration::from_millis(p2p.config.populator_start_delay_ms)).await;

        let interval_ms = p2p.config.populator_interval_ms;
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            // Jitter decorrelates dial times across nodes, so two peers do
            // not keep crossing each other's duplicate-connection check
            let jitter_ms = { rand::thread_rng().gen_range(0..=interval_ms / 4 + 1) };
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            p2p.run_discovery_cycle().await;
        }
    }

    /// One discovery round: probe a sample of live peers for their lists,
    /// merge what validates into the new table, then trigger fresh dials.
    async fn run_discovery_cycle(self: &Arc<Self>) {
        let Ok(pool) = self.pool().await else {
            return;
        };

        let mut sample = pool.connected_sessions().await;
        shuffle_in_place(&mut sample);
        sample.truncate(MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE);

        let mut accepted = 0usize;
        for session in sample {
            let response = session
                .request(&RequestPacket::new(PROC_LIST, Value::Null))
                .await;
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    let _ = self.user_tx.send(P2PEvent::FailedToFetchPeers {
                        peer_id: session.id().clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            match validate_peer_list(
                &response,
                self.config.max_peer_discovery_response_length,
                self.config.max_peer_info_size,
            ) {
                Ok(peers) => {
                    for peer in peers {
                        if accepted >= self.config.minimum_peer_discovery_threshold {
                            break;
                        }
                        if self.register_discovered_peer(&peer).await {
                            accepted += 1;
                            let _ = self
                                .user_tx
                                .send(P2PEvent::DiscoveredPeer { peer_info: peer });
                        }
                    }
                }
                Err(e) => {
                    let _ = self.user_tx.send(P2PEvent::FailedToFetchPeers {
                        peer_id: session.id().clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let (new_peers, tried_peers) = {
            let book = self.book.lock().await;
            (book.new_peers(), book.tried_peers())
        };
        let fixed_peers = self.sanitized.lock().await.fixed_peers.clone();
        pool.trigger_new_connections(new_peers, tried_peers, fixed_peers).await;
    }
}
