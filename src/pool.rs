//! Connection pool: inbound/outbound session maps, quotas, eviction,
//! shuffling, bans and selector-driven routing.
//!
//! The pool owns every session exclusively, one map per direction, keyed by
//! peer id. Sessions report through a channel the pool relays upward after
//! applying its side-effects (map removal, ban timers).

use crate::config::{P2PConfig, PeerLists};
use crate::error::P2PError;
use crate::event::P2PEvent;
use crate::selection::{ConnectionSelectionInput, RequestSelectionInput, SendSelectionInput};
use crate::session::{PeerSession, SessionConfig, SessionState};
use crate::types::{
    ConnectionKind, MessagePacket, NodeInfo, PeerId, PeerInfo, RequestPacket,
    EVICTED_PEER_CODE,
};
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Snapshot scored by the inbound eviction cascade.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub peer_id: PeerId,
    pub latency_ms: Option<u64>,
    pub response_rate: f64,
    pub connect_time_ms: u64,
    pub whitelisted: bool,
}

fn protected_count(len: usize, ratio: f64) -> usize {
    (len as f64 * ratio).ceil() as usize
}

/// Choose an inbound peer to evict, or `None` when every peer is protected.
///
/// Whitelisted peers leave candidacy up-front. Three cascading filters then
/// shield the best peers: lowest latency, highest response rate, oldest
/// connection, each protecting its configured fraction. A filter that leaves
/// a single candidate decides; otherwise the victim is drawn uniformly from
/// whoever is left.
pub fn select_peer_to_evict(
    mut candidates: Vec<EvictionCandidate>,
    latency_ratio: f64,
    productivity_ratio: f64,
    longevity_ratio: f64,
) -> Option<PeerId> {
    candidates.retain(|c| !c.whitelisted);
    if candidates.len() <= 1 {
        return candidates.pop().map(|c| c.peer_id);
    }

    // Lowest latency is safest
    candidates.sort_by(|a, b| match (a.latency_ms, b.latency_ms) {
        (Some(a_lat), Some(b_lat)) => a_lat.cmp(&b_lat),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    let protect = protected_count(candidates.len(), latency_ratio).min(candidates.len());
    candidates.drain(..protect);
    if candidates.len() <= 1 {
        return candidates.pop().map(|c| c.peer_id);
    }

    // Highest response rate is safest
    candidates.sort_by(|a, b| {
        b.response_rate
            .partial_cmp(&a.response_rate)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let protect = protected_count(candidates.len(), productivity_ratio).min(candidates.len());
    candidates.drain(..protect);
    if candidates.len() <= 1 {
        return candidates.pop().map(|c| c.peer_id);
    }

    // Oldest connection is safest
    candidates.sort_by(|a, b| a.connect_time_ms.cmp(&b.connect_time_ms));
    let protect = protected_count(candidates.len(), longevity_ratio).min(candidates.len());
    candidates.drain(..protect);
    if candidates.is_empty() {
        return None;
    }

    let idx = rand::thread_rng().gen_range(0..candidates.len());
    Some(candidates.swap_remove(idx).peer_id)
}

/// Pool occupancy counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub inbound: usize,
    pub outbound: usize,
    pub banned: usize,
}

pub struct PeerPool {
    config: Arc<P2PConfig>,
    node_info: Mutex<NodeInfo>,
    inbound: Mutex<HashMap<PeerId, Arc<PeerSession>>>,
    outbound: Mutex<HashMap<PeerId, Arc<PeerSession>>>,
    banned: Mutex<HashSet<PeerId>>,
    fixed_ids: HashSet<PeerId>,
    whitelisted_ids: HashSet<PeerId>,
    /// Cloned into every session; the relay loop consumes the other end.
    session_events: mpsc::UnboundedSender<P2PEvent>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl PeerPool {
    /// Build the pool and start its relay and shuffle tasks. Session events
    /// are re-emitted on `upstream` after side-effects are applied.
    pub async fn new(
        config: Arc<P2PConfig>,
        node_info: NodeInfo,
        upstream: mpsc::UnboundedSender<P2PEvent>,
        sanitized_lists: &PeerLists,
    ) -> Arc<Self> {
        let (session_events, session_events_rx) = mpsc::unbounded_channel();

        let fixed_ids = sanitized_lists.fixed_peers.iter().map(PeerInfo::peer_id).collect();
        let whitelisted_ids = sanitized_lists.whitelisted.iter().map(PeerInfo::peer_id).collect();

        let pool = Arc::new(Self {
            config,
            node_info: Mutex::new(node_info),
            inbound: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            banned: Mutex::new(HashSet::new()),
            fixed_ids,
            whitelisted_ids,
            session_events,
            tasks: Mutex::new(Vec::new()),
        });

        let relay = tokio::spawn(Self::relay_loop(pool.clone(), session_events_rx, upstream));
        let shuffle = tokio::spawn(Self::shuffle_loop(pool.clone()));
        pool.tasks.lock().await.extend([relay, shuffle]);

        pool
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Admit a handshake-validated inbound connection. Enforces the inbound
    /// quota by evicting one peer first when at capacity, and refuses
    /// duplicate peer ids outright.
    pub async fn add_inbound_peer(
        self: &Arc<Self>,
        peer_info: PeerInfo,
        stream: tokio::net::TcpStream,
    ) -> Result<Arc<PeerSession>, P2PError> {
        let peer_id = peer_info.peer_id();

        if self.has_peer(&peer_id).await {
            return Err(P2PError::PeerInboundHandshakeError {
                peer_id,
                message: "duplicate connection".into(),
            });
        }

        let multiplier = match self.config.inbound_quota_multiplier {
            Some(multiplier) => multiplier,
            None => self.node_info.lock().await.modules.len() + 1,
        };
        let quota = self.config.max_inbound_connections * multiplier.max(1);
        if self.inbound.lock().await.len() >= quota {
            self.evict_inbound_peer().await;
        }

        let node_info = self.node_info.lock().await.clone();
        let session = PeerSession::new(
            ConnectionKind::Inbound,
            peer_info,
            node_info,
            SessionConfig::for_kind(&self.config, ConnectionKind::Inbound),
            self.session_events.clone(),
        );
        session.open_inbound(stream).await;
        self.inbound.lock().await.insert(peer_id.clone(), session.clone());
        debug!("Admitted inbound peer {}", peer_id);
        Ok(session)
    }

    /// Create (or return the existing) outbound session for a peer and start
    /// dialing in the background. Idempotent by peer id.
    pub async fn add_outbound_peer(self: &Arc<Self>, peer_info: PeerInfo) -> Arc<PeerSession> {
        let peer_id = peer_info.peer_id();
        let node_info = self.node_info.lock().await.clone();

        let session = {
            let mut outbound = self.outbound.lock().await;
            if let Some(existing) = outbound.get(&peer_id) {
                return existing.clone();
            }
            let session = PeerSession::new(
                ConnectionKind::Outbound,
                peer_info,
                node_info,
                SessionConfig::for_kind(&self.config, ConnectionKind::Outbound),
                self.session_events.clone(),
            );
            outbound.insert(peer_id.clone(), session.clone());
            session
        };
        debug!("Dialing outbound peer {}", peer_id);

        let dialing = session.clone();
        let handle = tokio::spawn(async move {
            let _ = dialing.connect().await;
        });
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);

        session
    }

    async fn evict_inbound_peer(&self) {
        let candidates = {
            let inbound = self.inbound.lock().await;
            let mut candidates = Vec::with_capacity(inbound.len());
            for (peer_id, session) in inbound.iter() {
                candidates.push(EvictionCandidate {
                    peer_id: peer_id.clone(),
                    latency_ms: session.latency_ms(),
                    response_rate: session.productivity().await.response_rate,
                    connect_time_ms: session.connect_time_ms(),
                    whitelisted: self.whitelisted_ids.contains(peer_id),
                });
            }
            candidates
        };

        let victim = select_peer_to_evict(
            candidates,
            self.config.latency_protection_ratio,
            self.config.productivity_protection_ratio,
            self.config.longevity_protection_ratio,
        );

        if let Some(peer_id) = victim {
            let session = self.inbound.lock().await.get(&peer_id).cloned();
            if let Some(session) = session {
                info!("Evicting inbound peer {} to free a slot", peer_id);
                session
                    .disconnect(EVICTED_PEER_CODE, "Evicted to free a connection slot")
                    .await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    pub async fn has_peer(&self, peer_id: &str) -> bool {
        self.inbound.lock().await.contains_key(peer_id)
            || self.outbound.lock().await.contains_key(peer_id)
    }

    pub async fn get_session(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        if let Some(session) = self.outbound.lock().await.get(peer_id) {
            return Some(session.clone());
        }
        self.inbound.lock().await.get(peer_id).cloned()
    }

    pub async fn is_banned(&self, peer_id: &str) -> bool {
        self.banned.lock().await.contains(peer_id)
    }

    /// Every open session, outbound first. The same peer id appears twice
    /// when both directions are connected.
    pub async fn connected_sessions(&self) -> Vec<Arc<PeerSession>> {
        let mut sessions: Vec<Arc<PeerSession>> =
            self.outbound.lock().await.values().cloned().collect();
        sessions.extend(self.inbound.lock().await.values().cloned());

        let mut open = Vec::with_capacity(sessions.len());
        for session in sessions {
            if session.state().await == SessionState::Open {
                open.push(session);
            }
        }
        open
    }

    async fn connected_pairs(&self) -> Vec<(Arc<PeerSession>, PeerInfo)> {
        let sessions = self.connected_sessions().await;
        let mut pairs = Vec::with_capacity(sessions.len());
        for session in sessions {
            let info = session.peer_info().await;
            pairs.push((session, info));
        }
        pairs
    }

    /// Connected peers deduplicated by id.
    pub async fn get_connected_peers(&self) -> Vec<PeerInfo> {
        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        for (_, info) in self.connected_pairs().await {
            if seen.insert(info.peer_id()) {
                peers.push(info);
            }
        }
        peers
    }

    pub async fn counts(&self) -> (usize, usize) {
        (
            self.outbound.lock().await.len(),
            self.inbound.lock().await.len(),
        )
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            inbound: self.inbound.lock().await.len(),
            outbound: self.outbound.lock().await.len(),
            banned: self.banned.lock().await.len(),
        }
    }

    // -------------------------------------------------------------------------
    // Routing
    // -------------------------------------------------------------------------

    /// Route a request through the configured request selector.
    pub async fn request(self: &Arc<Self>, packet: RequestPacket) -> Result<Value, P2PError> {
        let pairs = self.connected_pairs().await;
        if pairs.is_empty() {
            return Err(P2PError::RequestFail("no peers available".into()));
        }

        let input = RequestSelectionInput {
            peers: pairs.iter().map(|(_, info)| info.clone()).collect(),
            node_info: self.node_info.lock().await.clone(),
            peer_limit: 1,
            request_packet: packet.clone(),
        };
        let selected = (self.config.peer_selection_for_request)(input)
            .ok_or_else(|| P2PError::RequestFail("no peer selected for request".into()))?;
        let selected_id = selected.peer_id();

        let session = pairs
            .into_iter()
            .find(|(_, info)| info.peer_id() == selected_id)
            .map(|(session, _)| session)
            .ok_or_else(|| P2PError::RequestFail("selected peer is gone".into()))?;

        session.request(&packet).await
    }

    /// Fan a message out through the configured send selector. Per-peer send
    /// failures are emitted, not returned.
    pub async fn send(self: &Arc<Self>, packet: MessagePacket) {
        let mut pairs = self.connected_pairs().await;

        let input = SendSelectionInput {
            peers: pairs.iter().map(|(_, info)| info.clone()).collect(),
            node_info: self.node_info.lock().await.clone(),
            peer_limit: self.config.send_peer_limit,
            message_packet: packet.clone(),
        };
        let selected = (self.config.peer_selection_for_send)(input);

        for target in selected {
            let target_id = target.peer_id();
            let Some(pos) = pairs.iter().position(|(_, info)| info.peer_id() == target_id) else {
                continue;
            };
            let (session, _) = pairs.remove(pos);
            if let Err(e) = session.send(&packet).await {
                self.emit(P2PEvent::FailedToSendMessage {
                    peer_id: target_id,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Request from one specific peer.
    pub async fn request_from_peer(
        self: &Arc<Self>,
        peer_id: &str,
        packet: RequestPacket,
    ) -> Result<Value, P2PError> {
        let session = self
            .get_session(peer_id)
            .await
            .ok_or_else(|| P2PError::RequestFail(format!("peer {peer_id} is not connected")))?;
        session.request(&packet).await
    }

    /// Subtract reputation from one specific peer's session.
    pub async fn apply_penalty(
        self: &Arc<Self>,
        peer_id: &str,
        penalty: i64,
    ) -> Result<(), P2PError> {
        let session = self
            .get_session(peer_id)
            .await
            .ok_or_else(|| P2PError::RequestFail(format!("peer {peer_id} is not connected")))?;
        session.apply_penalty(penalty).await;
        Ok(())
    }

    /// Send to one specific peer.
    pub async fn send_to_peer(
        self: &Arc<Self>,
        peer_id: &str,
        packet: MessagePacket,
    ) -> Result<(), P2PError> {
        let session = self
            .get_session(peer_id)
            .await
            .ok_or_else(|| P2PError::SendFail(format!("peer {peer_id} is not connected")))?;
        session.send(&packet).await
    }

    // -------------------------------------------------------------------------
    // Connection maintenance
    // -------------------------------------------------------------------------

    /// Dial new peers chosen by the connection selector, plus every
    /// disconnected fixed peer unconditionally.
    pub async fn trigger_new_connections(
        self: &Arc<Self>,
        new_peers: Vec<PeerInfo>,
        tried_peers: Vec<PeerInfo>,
        fixed_peers: Vec<PeerInfo>,
    ) {
        let connected: HashSet<PeerId> = {
            let mut ids: HashSet<PeerId> = self.inbound.lock().await.keys().cloned().collect();
            ids.extend(self.outbound.lock().await.keys().cloned());
            ids
        };
        let banned = self.banned.lock().await.clone();
        let fixed_ids: HashSet<PeerId> = fixed_peers.iter().map(PeerInfo::peer_id).collect();

        let dialable = |peer: &PeerInfo| {
            let id = peer.peer_id();
            !connected.contains(&id) && !banned.contains(&id) && !fixed_ids.contains(&id)
        };

        let (outbound_count, inbound_count) = self.counts().await;
        let input = ConnectionSelectionInput {
            disconnected_new_peers: new_peers.iter().filter(|p| dialable(p)).cloned().collect(),
            disconnected_tried_peers: tried_peers.iter().filter(|p| dialable(p)).cloned().collect(),
            connected_new_peers: new_peers
                .iter()
                .filter(|p| connected.contains(&p.peer_id()))
                .cloned()
                .collect(),
            connected_tried_peers: tried_peers
                .iter()
                .filter(|p| connected.contains(&p.peer_id()))
                .cloned()
                .collect(),
            node_info: self.node_info.lock().await.clone(),
            max_outbound_connections: self.config.max_outbound_connections,
            outbound_count,
            max_inbound_connections: self.config.max_inbound_connections,
            inbound_count,
        };
        let mut to_dial = (self.config.peer_selection_for_connection)(input);

        for fixed in fixed_peers {
            let id = fixed.peer_id();
            if !connected.contains(&id) && !banned.contains(&id) {
                to_dial.push(fixed);
            }
        }

        let mut seen = HashSet::new();
        for peer_info in to_dial {
            if seen.insert(peer_info.peer_id()) {
                self.add_outbound_peer(peer_info).await;
            }
        }
    }

    /// Push fresh node info to every connected session concurrently.
    pub async fn apply_node_info(self: &Arc<Self>, node_info: NodeInfo) {
        *self.node_info.lock().await = node_info.clone();

        for session in self.connected_sessions().await {
            let info = node_info.clone();
            let pool = self.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = session.apply_node_info(info).await {
                    pool.emit(P2PEvent::FailedToPushNodeInfo {
                        peer_id: session.id().clone(),
                        error: e.to_string(),
                    });
                }
            });
            let mut tasks = self.tasks.lock().await;
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }

    pub async fn node_info(&self) -> NodeInfo {
        self.node_info.lock().await.clone()
    }

    /// Disconnect every session with the given status code.
    pub async fn remove_all_peers(self: &Arc<Self>, code: u16, reason: &str) {
        let sessions: Vec<Arc<PeerSession>> = {
            let mut all: Vec<Arc<PeerSession>> =
                self.inbound.lock().await.values().cloned().collect();
            all.extend(self.outbound.lock().await.values().cloned());
            all
        };
        for session in sessions {
            session.disconnect(code, reason).await;
        }
    }

    /// Stop the relay, shuffle and dial tasks.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    // -------------------------------------------------------------------------
    // Background tasks
    // -------------------------------------------------------------------------

    /// Re-emit session events upward, applying pool side-effects: close
    /// events drop the session from its map and emit `removePeer`; bans
    /// start the unban timer.
    async fn relay_loop(
        pool: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<P2PEvent>,
        upstream: mpsc::UnboundedSender<P2PEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            match &event {
                P2PEvent::CloseInbound { peer_id, .. } => {
                    let peer_id = peer_id.clone();
                    let removed = pool.inbound.lock().await.remove(&peer_id).is_some();
                    let _ = upstream.send(event);
                    if removed {
                        let _ = upstream.send(P2PEvent::RemovePeer { peer_id });
                    }
                }
                P2PEvent::CloseOutbound { peer_id, .. }
                | P2PEvent::ConnectAbortOutbound { peer_id } => {
                    let peer_id = peer_id.clone();
                    let removed = pool.outbound.lock().await.remove(&peer_id).is_some();
                    let _ = upstream.send(event);
                    if removed {
                        let _ = upstream.send(P2PEvent::RemovePeer { peer_id });
                    }
                }
                P2PEvent::BanPeer { peer_id } => {
                    let peer_id = peer_id.clone();
                    pool.banned.lock().await.insert(peer_id.clone());
                    let _ = upstream.send(event);

                    let unban_pool = pool.clone();
                    let unban_upstream = upstream.clone();
                    let ban_time = pool.config.peer_ban_time_ms;
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(ban_time)).await;
                        unban_pool.banned.lock().await.remove(&peer_id);
                        let _ = unban_upstream.send(P2PEvent::UnbanPeer { peer_id });
                    });
                    pool.tasks.lock().await.push(handle);
                }
                _ => {
                    let _ = upstream.send(event);
                }
            }
        }
    }

    /// Periodically evict one random non-fixed outbound peer, bounding the
    /// lifetime of any single outbound relationship.
    async fn shuffle_loop(pool: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(pool.config.outbound_shuffle_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let candidates: Vec<Arc<PeerSession>> = pool
                .outbound
                .lock()
                .await
                .iter()
                .filter(|(peer_id, _)| !pool.fixed_ids.contains(*peer_id))
                .map(|(_, session)| session.clone())
                .collect();

            if candidates.is_empty() {
                continue;
            }

            let idx = rand::thread_rng().gen_range(0..candidates.len());
            let victim = &candidates[idx];
            debug!("Shuffling out outbound peer {}", victim.id());
            victim
                .disconnect(EVICTED_PEER_CODE, "Evicted to free a connection slot")
                .await;
        }
    }

    fn emit(&self, event: P2PEvent) {
        let _ = self.session_events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, latency: Option<u64>, rate: f64, connected: u64) -> EvictionCandidate {
        EvictionCandidate {
            peer_id: id.to_string(),
            latency_ms: latency,
            response_rate: rate,
            connect_time_ms: connected,
            whitelisted: false,
        }
    }

    #[test]
    fn test_eviction_empty() {
        assert!(select_peer_to_evict(vec![], 0.068, 0.068, 0.5).is_none());
    }

    #[test]
    fn test_eviction_single_candidate() {
        let candidates = vec![candidate("a", Some(10), 1.0, 1)];
        assert_eq!(select_peer_to_evict(candidates, 0.068, 0.068, 0.5).unwrap(), "a");
    }

    #[test]
    fn test_eviction_whitelisted_never_chosen() {
        let mut protected = candidate("vip", Some(1), 1.0, 1);
        protected.whitelisted = true;
        let candidates = vec![protected, candidate("b", None, 0.0, 100)];
        assert_eq!(select_peer_to_evict(candidates, 0.0, 0.0, 0.0).unwrap(), "b");
    }

    #[test]
    fn test_eviction_protects_best_peers() {
        // Full protection ratios: everyone is shielded, nobody is evicted
        let candidates = vec![
            candidate("a", Some(10), 1.0, 1),
            candidate("b", Some(20), 0.5, 2),
            candidate("c", None, 0.0, 3),
        ];
        assert!(select_peer_to_evict(candidates, 1.0, 0.0, 0.0).is_none());
    }

    #[test]
    fn test_eviction_latency_protection() {
        // One-third latency protection shields the fastest peer; the victim
        // comes from the rest
        let candidates = vec![
            candidate("fast", Some(5), 0.0, 50),
            candidate("slow", Some(500), 0.0, 50),
            candidate("unmeasured", None, 0.0, 50),
        ];
        for _ in 0..20 {
            let victim =
                select_peer_to_evict(candidates.clone(), 0.34, 0.0, 0.0).unwrap();
            assert_ne!(victim, "fast");
        }
    }

    #[test]
    fn test_eviction_longevity_protection() {
        let candidates = vec![
            candidate("old", None, 0.0, 1),
            candidate("young", None, 0.0, 1_000),
        ];
        // After latency and productivity leave both, longevity shields the
        // older connection and the younger one is the only candidate left
        let victim = select_peer_to_evict(candidates, 0.0, 0.0, 0.5).unwrap();
        assert_eq!(victim, "young");
    }
}
