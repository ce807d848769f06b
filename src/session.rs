//! Per-connection session: RPC multiplexing, rate accounting, productivity,
//! reputation and keep-alive over one framed duplex socket.
//!
//! A session is created by the pool, owns its socket exclusively, and reports
//! everything observable through the pool's event channel. All periodic work
//! runs on spawned tasks whose handles are kept for cancellation; `disconnect`
//! is idempotent and tears all of them down.

use crate::config::P2PConfig;
use crate::error::P2PError;
use crate::event::P2PEvent;
use crate::request::P2PRequest;
use crate::transport::{dial, read_frame, write_frame, Frame, FrameError};
use crate::types::{
    sanitize_close_reason, ConnectionKind, InboundMessage, MessagePacket, NodeInfo, PeerId,
    PeerInfo, Productivity, RequestPacket, ABNORMAL_CLOSURE_CODE,
    INCOMPATIBLE_NETWORK_CODE, INCOMPATIBLE_PROTOCOL_VERSION_CODE, FAILED_TO_RESPOND_CODE,
    FORBIDDEN_CONNECTION_CODE, MESSAGE_TOO_BIG_CODE, MSG_NODE_INFO_CHANGED, PROC_LIST,
    PROC_STATUS, PROC_UPDATE_MYSELF, RPC_REQUEST_TYPE,
};
use crate::validation::{
    check_compatibility, check_network_compatibility, validate_message, validate_peer_info,
    validate_peer_list, validate_rpc_request,
};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Initial reputation of every session. Depletion triggers a ban.
pub const INITIAL_REPUTATION: i64 = 100;

/// Latency placeholder before the first keep-alive round trip.
const LATENCY_UNMEASURED: u64 = u64::MAX;

/// Outgoing frame queue depth per connection.
const WRITE_QUEUE_CAPACITY: usize = 1024;

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// Per-session snapshot of the pool configuration, taken at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub rate_calculation_interval_ms: u64,
    pub ws_max_message_rate: f64,
    pub ws_max_message_rate_penalty: i64,
    /// Receive payload cap for this connection kind.
    pub max_payload: usize,
    pub max_peer_info_size: usize,
    pub max_peer_discovery_response_length: usize,
    pub ping_interval_min_ms: u64,
    pub ping_interval_max_ms: u64,
    pub productivity_reset_interval_ms: u64,
}

impl SessionConfig {
    pub fn for_kind(config: &P2PConfig, kind: ConnectionKind) -> Self {
        Self {
            connect_timeout_ms: config.connect_timeout_ms,
            ack_timeout_ms: config.ack_timeout_ms,
            rate_calculation_interval_ms: config.rate_calculation_interval_ms,
            ws_max_message_rate: config.ws_max_message_rate,
            ws_max_message_rate_penalty: config.ws_max_message_rate_penalty,
            max_payload: match kind {
                ConnectionKind::Inbound => config.ws_max_payload_inbound,
                ConnectionKind::Outbound => config.ws_max_payload_outbound,
            },
            max_peer_info_size: config.max_peer_info_size,
            max_peer_discovery_response_length: config.max_peer_discovery_response_length,
            ping_interval_min_ms: config.ping_interval_min_ms,
            ping_interval_max_ms: config.ping_interval_max_ms,
            productivity_reset_interval_ms: config.productivity_reset_interval_ms,
        }
    }
}

/// Sliding-window counters rotated by the rate timer.
#[derive(Debug, Default)]
struct RateMeters {
    ws_message_count: u64,
    ws_message_rate: f64,
    rpc_counter: HashMap<String, u64>,
    rpc_rates: HashMap<String, f64>,
    message_counter: HashMap<String, u64>,
    message_rates: HashMap<String, f64>,
}

pub struct PeerSession {
    kind: ConnectionKind,
    config: SessionConfig,
    peer_id: PeerId,
    info: Mutex<PeerInfo>,
    node_info: Mutex<NodeInfo>,
    state: Mutex<SessionState>,
    connect_lock: Mutex<()>,
    reputation: Mutex<i64>,
    banned: AtomicBool,
    latency_ms: AtomicU64,
    connect_time_ms: u64,
    meters: Mutex<RateMeters>,
    productivity: Mutex<Productivity>,
    outgoing: Mutex<Option<mpsc::Sender<Frame>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Option<Value>, String>>>>,
    next_request_id: AtomicU64,
    ping_sent_at: Mutex<Option<Instant>>,
    events: mpsc::UnboundedSender<P2PEvent>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    writer_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PeerSession {
    pub fn new(
        kind: ConnectionKind,
        peer_info: PeerInfo,
        node_info: NodeInfo,
        config: SessionConfig,
        events: mpsc::UnboundedSender<P2PEvent>,
    ) -> Arc<Self> {
        let peer_id = peer_info.peer_id();
        Arc::new(Self {
            kind,
            config,
            peer_id,
            info: Mutex::new(peer_info),
            node_info: Mutex::new(node_info),
            state: Mutex::new(SessionState::Connecting),
            connect_lock: Mutex::new(()),
            reputation: Mutex::new(INITIAL_REPUTATION),
            banned: AtomicBool::new(false),
            latency_ms: AtomicU64::new(LATENCY_UNMEASURED),
            connect_time_ms: crate::types::now_ms(),
            meters: Mutex::new(RateMeters::default()),
            productivity: Mutex::new(Productivity::default()),
            outgoing: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            ping_sent_at: Mutex::new(None),
            events,
            tasks: Mutex::new(Vec::new()),
            writer_task: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn connect_time_ms(&self) -> u64 {
        self.connect_time_ms
    }

    /// Last measured keep-alive round trip, or `None` before the first pong.
    pub fn latency_ms(&self) -> Option<u64> {
        match self.latency_ms.load(Ordering::SeqCst) {
            LATENCY_UNMEASURED => None,
            value => Some(value),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub async fn peer_info(&self) -> PeerInfo {
        self.info.lock().await.clone()
    }

    pub async fn reputation(&self) -> i64 {
        *self.reputation.lock().await
    }

    pub async fn productivity(&self) -> Productivity {
        self.productivity.lock().await.clone()
    }

    /// Frames per second received in the last rate window.
    pub async fn ws_message_rate(&self) -> f64 {
        self.meters.lock().await.ws_message_rate
    }

    // -------------------------------------------------------------------------
    // Socket lifecycle
    // -------------------------------------------------------------------------

    /// Adopt a pre-accepted inbound socket and start the session machinery.
    pub async fn open_inbound(self: &Arc<Self>, stream: TcpStream) {
        self.attach_socket(stream).await;
    }

    /// Dial the peer and start the session machinery. Idempotent while the
    /// session is connecting or open; fails after close.
    pub async fn connect(self: &Arc<Self>) -> Result<(), P2PError> {
        let _guard = self.connect_lock.lock().await;

        match *self.state.lock().await {
            SessionState::Open => return Ok(()),
            SessionState::Closed => {
                return Err(P2PError::SendFail("socket does not exist".into()));
            }
            SessionState::Connecting => {}
        }

        let (ip_address, ws_port) = {
            let info = self.info.lock().await;
            (info.ip_address.clone(), info.ws_port)
        };
        let handshake = Value::Object(self.node_info.lock().await.to_wire());

        match dial(
            &ip_address,
            ws_port,
            handshake,
            Duration::from_millis(self.config.connect_timeout_ms),
        )
        .await
        {
            Ok(stream) => {
                self.attach_socket(stream).await;
                debug!("Connected outbound to {}", self.peer_id);
                self.emit(P2PEvent::ConnectOutbound { peer_id: self.peer_id.clone() });

                let session = self.clone();
                let details = tokio::spawn(async move {
                    session.collect_peer_details_on_connect().await;
                });
                self.tasks.lock().await.push(details);
                Ok(())
            }
            Err(e) => {
                *self.state.lock().await = SessionState::Closed;
                debug!("Outbound dial to {} failed: {}", self.peer_id, e);
                self.emit(P2PEvent::ConnectAbortOutbound { peer_id: self.peer_id.clone() });
                Err(e)
            }
        }
    }

    fn connect_boxed(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = Result<(), P2PError>> + Send + '_>> {
        Box::pin(self.connect())
    }

    async fn attach_socket(self: &Arc<Self>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Frame>(WRITE_QUEUE_CAPACITY);

        *self.outgoing.lock().await = Some(tx);
        *self.state.lock().await = SessionState::Open;

        *self.writer_task.lock().await = Some(tokio::spawn(Self::writer_loop(rx, write_half)));

        let mut tasks = self.tasks.lock().await;

        let session = self.clone();
        let max_payload = self.config.max_payload;
        tasks.push(tokio::spawn(async move {
            Self::reader_loop(session, read_half, max_payload).await;
        }));

        let session = self.clone();
        tasks.push(tokio::spawn(async move {
            session.rate_loop().await;
        }));

        let session = self.clone();
        tasks.push(tokio::spawn(async move {
            session.productivity_reset_loop().await;
        }));

        if self.kind == ConnectionKind::Inbound {
            let session = self.clone();
            tasks.push(tokio::spawn(async move {
                session.ping_loop().await;
            }));
        }
    }

    /// Close the connection with a status code. Idempotent: the first call
    /// transitions to `Closed`, emits the close event and cancels every
    /// session task; later calls are no-ops.
    pub async fn disconnect(self: &Arc<Self>, code: u16, reason: &str) {
        {
            let mut state = self.state.lock().await;
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        debug!("Disconnecting {} ({}): {}", self.peer_id, code, reason);

        let mut flushed_close = false;
        if let Some(outgoing) = self.outgoing.lock().await.take() {
            flushed_close = outgoing
                .try_send(Frame::Close { code, reason: reason.to_string() })
                .is_ok();
        }

        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err("socket closed".into()));
        }

        let event = match self.kind {
            ConnectionKind::Inbound => P2PEvent::CloseInbound {
                peer_id: self.peer_id.clone(),
                code,
                reason: reason.to_string(),
            },
            ConnectionKind::Outbound => P2PEvent::CloseOutbound {
                peer_id: self.peer_id.clone(),
                code,
                reason: reason.to_string(),
            },
        };
        self.emit(event);

        // The writer drains up to the close frame on its own; abort it only
        // when the close frame could not be queued.
        if !flushed_close {
            if let Some(writer) = self.writer_task.lock().await.take() {
                writer.abort();
            }
        }
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    // -------------------------------------------------------------------------
    // Outgoing verbs
    // -------------------------------------------------------------------------

    async fn ensure_connected(self: &Arc<Self>) -> Result<(), P2PError> {
        match *self.state.lock().await {
            SessionState::Open => Ok(()),
            SessionState::Closed => Err(P2PError::SendFail("socket does not exist".into())),
            SessionState::Connecting => match self.kind {
                ConnectionKind::Outbound => self.connect_boxed().await,
                ConnectionKind::Inbound => {
                    Err(P2PError::SendFail("socket does not exist".into()))
                }
            },
        }
    }

    async fn sender(&self) -> Result<mpsc::Sender<Frame>, P2PError> {
        self.outgoing
            .lock()
            .await
            .clone()
            .ok_or_else(|| P2PError::SendFail("socket does not exist".into()))
    }

    /// Fire-and-forget message to the peer.
    pub async fn send(self: &Arc<Self>, packet: &MessagePacket) -> Result<(), P2PError> {
        self.ensure_connected().await?;
        let sender = self.sender().await?;
        let payload = serde_json::to_value(packet)
            .map_err(|e| P2PError::SendFail(e.to_string()))?;
        sender
            .send(Frame::Message { payload })
            .await
            .map_err(|_| P2PError::SendFail("socket does not exist".into()))
    }

    fn to_rpc_error(&self, procedure: &str, error: P2PError) -> P2PError {
        match error {
            P2PError::SendFail(message) => P2PError::RpcResponseError {
                procedure: procedure.to_string(),
                peer_id: self.peer_id.clone(),
                message,
            },
            other => other,
        }
    }

    /// RPC round trip. A timeout disconnects the peer and surfaces as
    /// [`P2PError::RpcTimeout`]; any other failure keeps the connection and
    /// surfaces as [`P2PError::RpcResponseError`].
    pub async fn request(self: &Arc<Self>, packet: &RequestPacket) -> Result<Value, P2PError> {
        self.ensure_connected()
            .await
            .map_err(|e| self.to_rpc_error(&packet.procedure, e))?;
        let sender = self
            .sender()
            .await
            .map_err(|e| self.to_rpc_error(&packet.procedure, e))?;

        self.productivity.lock().await.record_request();

        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let payload = json!({
            "type": RPC_REQUEST_TYPE,
            "procedure": packet.procedure,
            "data": packet.data,
        });
        if sender.send(Frame::Request { id, payload }).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(P2PError::RpcResponseError {
                procedure: packet.procedure.clone(),
                peer_id: self.peer_id.clone(),
                message: "socket does not exist".into(),
            });
        }

        match timeout(Duration::from_millis(self.config.ack_timeout_ms), rx).await {
            Err(_) => {
                self.pending.lock().await.remove(&id);
                self.disconnect(FAILED_TO_RESPOND_CODE, "RPC response not received in time")
                    .await;
                Err(P2PError::RpcTimeout {
                    procedure: packet.procedure.clone(),
                    peer_id: self.peer_id.clone(),
                })
            }
            Ok(Err(_)) => Err(P2PError::RpcResponseError {
                procedure: packet.procedure.clone(),
                peer_id: self.peer_id.clone(),
                message: "connection closed before response".into(),
            }),
            Ok(Ok(Err(message))) => Err(P2PError::RpcResponseError {
                procedure: packet.procedure.clone(),
                peer_id: self.peer_id.clone(),
                message,
            }),
            Ok(Ok(Ok(body))) => match body {
                None | Some(Value::Null) => Err(P2PError::RpcResponseError {
                    procedure: packet.procedure.clone(),
                    peer_id: self.peer_id.clone(),
                    message: format!(
                        "Failed to handle response for procedure {}",
                        packet.procedure
                    ),
                }),
                Some(data) => {
                    self.productivity.lock().await.record_response();
                    Ok(data)
                }
            },
        }
    }

    /// Push fresh local node info to the peer. Passive (inbound) peers get
    /// the `nodeInfoChanged` message; peers we dialed get the
    /// `updateMyself` RPC.
    pub async fn apply_node_info(self: &Arc<Self>, node_info: NodeInfo) -> Result<(), P2PError> {
        let wire = Value::Object(node_info.to_wire());
        *self.node_info.lock().await = node_info;

        match self.kind {
            ConnectionKind::Inbound => {
                self.send(&MessagePacket::new(MSG_NODE_INFO_CHANGED, wire)).await
            }
            ConnectionKind::Outbound => {
                self.request(&RequestPacket::new(PROC_UPDATE_MYSELF, wire))
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Subtract reputation. At zero or below the session emits `banPeer`
    /// exactly once and closes with a forbidden-connection code.
    pub async fn apply_penalty(self: &Arc<Self>, penalty: i64) {
        let depleted = {
            let mut reputation = self.reputation.lock().await;
            *reputation -= penalty;
            warn!(
                "Peer {} penalized (-{}), reputation now {}",
                self.peer_id, penalty, *reputation
            );
            *reputation <= 0
        };

        if depleted && !self.banned.swap(true, Ordering::SeqCst) {
            self.emit(P2PEvent::BanPeer { peer_id: self.peer_id.clone() });
            self.disconnect(FORBIDDEN_CONNECTION_CODE, "Peer banned").await;
        }
    }

    // -------------------------------------------------------------------------
    // Socket tasks
    // -------------------------------------------------------------------------

    async fn writer_loop(mut rx: mpsc::Receiver<Frame>, mut write_half: OwnedWriteHalf) {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, Frame::Close { .. });
            if write_frame(&mut write_half, &frame).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
    }

    async fn reader_loop(session: Arc<PeerSession>, mut read_half: OwnedReadHalf, max_payload: usize) {
        loop {
            match read_frame(&mut read_half, max_payload).await {
                Ok(frame) => {
                    if session.handle_frame(frame).await {
                        break;
                    }
                }
                Err(FrameError::PayloadTooLarge { size, limit }) => {
                    session.emit_socket_error(format!(
                        "frame of {size} bytes exceeds the {limit} byte limit"
                    ));
                    session
                        .disconnect(MESSAGE_TOO_BIG_CODE, sanitize_close_reason(MESSAGE_TOO_BIG_CODE))
                        .await;
                    break;
                }
                Err(FrameError::Malformed(e)) => {
                    // Length-prefixed framing survives a bad payload
                    session.emit_socket_error(e);
                }
                Err(FrameError::Io(_)) => {
                    session
                        .disconnect(
                            ABNORMAL_CLOSURE_CODE,
                            sanitize_close_reason(ABNORMAL_CLOSURE_CODE),
                        )
                        .await;
                    break;
                }
            }
        }
    }

    /// Rotate rate windows. A breach of the frame-rate ceiling costs
    /// reputation immediately and skips the rotation for that window.
    async fn rate_loop(self: Arc<Self>) {
        let interval_ms = self.config.rate_calculation_interval_ms;
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let breached = {
                let mut meters = self.meters.lock().await;
                let ws_rate = meters.ws_message_count as f64 * 1000.0 / interval_ms as f64;
                meters.ws_message_rate = ws_rate;
                meters.ws_message_count = 0;

                if ws_rate > self.config.ws_max_message_rate {
                    true
                } else {
                    let counters: Vec<(String, u64)> = meters.rpc_counter.drain().collect();
                    for (procedure, count) in counters {
                        meters
                            .rpc_rates
                            .insert(procedure, count as f64 / interval_ms as f64);
                    }
                    let counters: Vec<(String, u64)> = meters.message_counter.drain().collect();
                    for (event, count) in counters {
                        meters
                            .message_rates
                            .insert(event, count as f64 / interval_ms as f64);
                    }
                    false
                }
            };

            if breached {
                self.apply_penalty(self.config.ws_max_message_rate_penalty).await;
            }
        }
    }

    /// Zero the productivity counters when the peer has not answered
    /// anything for a full interval.
    async fn productivity_reset_loop(self: Arc<Self>) {
        let interval_ms = self.config.productivity_reset_interval_ms;
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let mut productivity = self.productivity.lock().await;
            if productivity.last_responded + interval_ms < crate::types::now_ms() {
                *productivity = Productivity::default();
            }
        }
    }

    /// Keep-alive for inbound sessions: ping on a uniformly random interval,
    /// record the round trip as latency, reschedule regardless of outcome.
    async fn ping_loop(self: Arc<Self>) {
        loop {
            let delay_ms = {
                rand::thread_rng()
                    .gen_range(self.config.ping_interval_min_ms..=self.config.ping_interval_max_ms)
            };
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            let Ok(sender) = self.sender().await else {
                return;
            };
            *self.ping_sent_at.lock().await = Some(Instant::now());
            if sender.send(Frame::Ping).await.is_err() {
                return;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Inbound frame handling
    // -------------------------------------------------------------------------

    /// Process one frame. Returns true when the session closed.
    async fn handle_frame(self: &Arc<Self>, frame: Frame) -> bool {
        if !matches!(frame, Frame::Handshake { .. } | Frame::Close { .. }) {
            self.meters.lock().await.ws_message_count += 1;
        }

        match frame {
            Frame::Handshake { .. } => {
                // Only meaningful before the session exists
                self.emit_socket_error("unexpected handshake frame".to_string());
            }
            Frame::Request { id, payload } => {
                self.handle_request_frame(id, payload).await;
            }
            Frame::Response { id, data, error } => {
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let result = match error {
                        Some(message) => Err(message),
                        None => Ok(data),
                    };
                    let _ = tx.send(result);
                }
            }
            Frame::Message { payload } => {
                self.handle_message_frame(payload).await;
            }
            Frame::Ping => {
                if let Ok(sender) = self.sender().await {
                    let _ = sender.send(Frame::Pong).await;
                }
            }
            Frame::Pong => {
                if let Some(sent_at) = self.ping_sent_at.lock().await.take() {
                    self.latency_ms
                        .store(sent_at.elapsed().as_millis() as u64, Ordering::SeqCst);
                }
            }
            Frame::Close { code, .. } => {
                self.disconnect(code, sanitize_close_reason(code)).await;
                return true;
            }
        }

        *self.state.lock().await == SessionState::Closed
    }

    async fn handle_request_frame(self: &Arc<Self>, id: u64, payload: Value) {
        let sender = match self.sender().await {
            Ok(sender) => sender,
            Err(_) => return,
        };

        let packet = match validate_rpc_request(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                let _ = sender
                    .send(Frame::Response { id, data: None, error: Some(e.to_string()) })
                    .await;
                self.emit(P2PEvent::InvalidRequestReceived {
                    peer_id: self.peer_id.clone(),
                    error: e.to_string(),
                });
                return;
            }
        };

        let rate = {
            let mut meters = self.meters.lock().await;
            *meters.rpc_counter.entry(packet.procedure.clone()).or_insert(0) += 1;
            meters.rpc_rates.get(&packet.procedure).copied().unwrap_or(0.0) * 1000.0
        };
        let productivity = self.productivity.lock().await.clone();

        let request = P2PRequest::new(
            packet.procedure.clone(),
            packet.data.clone(),
            self.peer_id.clone(),
            rate,
            productivity,
            id,
            sender,
        );

        match packet.procedure.as_str() {
            PROC_UPDATE_MYSELF => match self.update_from_protocol_peer_info(&packet.data).await {
                Ok(info) => {
                    let _ = request.end(json!(true)).await;
                    self.emit(P2PEvent::UpdatedPeerInfo { peer_info: info });
                }
                Err(e) => {
                    let _ = request.error(&e.to_string()).await;
                    self.emit(P2PEvent::FailedPeerInfoUpdate {
                        peer_id: self.peer_id.clone(),
                        error: e.to_string(),
                    });
                }
            },
            PROC_STATUS => {
                let wire = Value::Object(self.node_info.lock().await.to_wire());
                let _ = request.end(wire).await;
            }
            _ => {}
        }

        // Higher layers may answer anything the session did not; the one-shot
        // responder rejects a second answer.
        self.emit(P2PEvent::RequestReceived(request));
    }

    async fn handle_message_frame(self: &Arc<Self>, payload: Value) {
        let packet = match validate_message(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                self.emit(P2PEvent::InvalidMessageReceived {
                    peer_id: self.peer_id.clone(),
                    error: e.to_string(),
                });
                return;
            }
        };

        let rate = {
            let mut meters = self.meters.lock().await;
            *meters.message_counter.entry(packet.event.clone()).or_insert(0) += 1;
            meters.message_rates.get(&packet.event).copied().unwrap_or(0.0) * 1000.0
        };

        if packet.event == MSG_NODE_INFO_CHANGED {
            match self.update_from_protocol_peer_info(&packet.data).await {
                Ok(info) => self.emit(P2PEvent::UpdatedPeerInfo { peer_info: info }),
                Err(e) => self.emit(P2PEvent::FailedPeerInfoUpdate {
                    peer_id: self.peer_id.clone(),
                    error: e.to_string(),
                }),
            }
        }

        self.emit(P2PEvent::MessageReceived(InboundMessage {
            event: packet.event,
            data: packet.data,
            peer_id: self.peer_id.clone(),
            rate,
        }));
    }

    /// Apply a peer-supplied info record, preserving the connection's address
    /// and port, and validating before any state changes.
    async fn update_from_protocol_peer_info(&self, data: &Value) -> Result<PeerInfo, P2PError> {
        let (ip_address, ws_port) = {
            let info = self.info.lock().await;
            (info.ip_address.clone(), info.ws_port)
        };

        let mut raw = data.as_object().cloned().unwrap_or_default();
        raw.insert("ip".into(), json!(ip_address));
        raw.insert("wsPort".into(), json!(ws_port));

        let info = validate_peer_info(&Value::Object(raw), self.config.max_peer_info_size)?;
        *self.info.lock().await = info.clone();
        Ok(info)
    }

    // -------------------------------------------------------------------------
    // Post-connect detail collection (outbound)
    // -------------------------------------------------------------------------

    async fn collect_peer_details_on_connect(self: &Arc<Self>) {
        let (status, peers) = tokio::join!(self.fetch_status(), self.fetch_peers());

        if let Err(e) = status.and(peers) {
            self.emit(P2PEvent::FailedToCollectPeerDetailsOnConnect {
                peer_id: self.peer_id.clone(),
                error: e.to_string(),
            });
        }
    }

    /// Ask the peer for its node info, validate, check compatibility and
    /// apply. Validation runs before any state is touched, so a bad response
    /// leaves the previous info intact.
    pub async fn fetch_status(self: &Arc<Self>) -> Result<PeerInfo, P2PError> {
        let response = self.request(&RequestPacket::new(PROC_STATUS, Value::Null)).await?;

        let info = match self.update_from_protocol_peer_info(&response).await {
            Ok(info) => info,
            Err(e) => {
                self.emit(P2PEvent::FailedToFetchPeerInfo {
                    peer_id: self.peer_id.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let node_info = self.node_info.lock().await.clone();
        if let Err(e) = check_network_compatibility(&info, &node_info) {
            self.disconnect(
                INCOMPATIBLE_NETWORK_CODE,
                sanitize_close_reason(INCOMPATIBLE_NETWORK_CODE),
            )
            .await;
            return Err(e);
        }
        if let Err(e) = check_compatibility(&info, &node_info) {
            self.disconnect(
                INCOMPATIBLE_PROTOCOL_VERSION_CODE,
                sanitize_close_reason(INCOMPATIBLE_PROTOCOL_VERSION_CODE),
            )
            .await;
            return Err(e);
        }

        self.emit(P2PEvent::UpdatedPeerInfo { peer_info: info.clone() });
        Ok(info)
    }

    /// Ask the peer for its known peers; emit one `discoveredPeer` per entry.
    pub async fn fetch_peers(self: &Arc<Self>) -> Result<Vec<PeerInfo>, P2PError> {
        let response = self.request(&RequestPacket::new(PROC_LIST, Value::Null)).await?;

        match validate_peer_list(
            &response,
            self.config.max_peer_discovery_response_length,
            self.config.max_peer_info_size,
        ) {
            Ok(peers) => {
                for peer_info in &peers {
                    self.emit(P2PEvent::DiscoveredPeer { peer_info: peer_info.clone() });
                }
                Ok(peers)
            }
            Err(e) => {
                self.emit(P2PEvent::FailedToFetchPeers {
                    peer_id: self.peer_id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------

    fn emit(&self, event: P2PEvent) {
        let _ = self.events.send(event);
    }

    fn emit_socket_error(&self, error: String) {
        let event = match self.kind {
            ConnectionKind::Inbound => P2PEvent::InboundSocketError {
                peer_id: self.peer_id.clone(),
                error,
            },
            ConnectionKind::Outbound => P2PEvent::OutboundSocketError {
                peer_id: self.peer_id.clone(),
                error,
            },
        };
        self.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::P2PConfig;
    use serde_json::Map;

    fn peer_info(ip: &str, port: u16) -> PeerInfo {
        PeerInfo {
            ip_address: ip.to_string(),
            ws_port: port,
            version: "1.0.0".into(),
            protocol_version: Some("1.0".into()),
            os: String::new(),
            height: 0,
            extras: Map::new(),
        }
    }

    fn node_info() -> NodeInfo {
        NodeInfo {
            os: "linux".into(),
            version: "1.0.0".into(),
            protocol_version: "1.0".into(),
            nethash: "nh".into(),
            ws_port: 5000,
            height: 0,
            nonce: "local".into(),
            modules: vec![],
            min_version: "1.0.0".into(),
            extras: Map::new(),
        }
    }

    fn session(kind: ConnectionKind) -> (Arc<PeerSession>, mpsc::UnboundedReceiver<P2PEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SessionConfig::for_kind(&P2PConfig::default(), kind);
        let session = PeerSession::new(kind, peer_info("203.0.113.7", 5001), node_info(), config, tx);
        (session, rx)
    }

    #[tokio::test]
    async fn test_penalty_bans_exactly_once() {
        let (session, mut rx) = session(ConnectionKind::Inbound);

        session.apply_penalty(10).await;
        assert_eq!(session.reputation().await, 90);

        session.apply_penalty(100).await;
        assert_eq!(session.state().await, SessionState::Closed);

        // A further penalty must not ban again
        session.apply_penalty(50).await;

        let mut ban_events = 0;
        let mut close_events = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                P2PEvent::BanPeer { .. } => ban_events += 1,
                P2PEvent::CloseInbound { code, .. } => {
                    assert_eq!(code, FORBIDDEN_CONNECTION_CODE);
                    close_events += 1;
                }
                _ => {}
            }
        }
        assert_eq!(ban_events, 1);
        assert_eq!(close_events, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (session, mut rx) = session(ConnectionKind::Outbound);

        session.disconnect(1000, "bye").await;
        session.disconnect(1000, "bye again").await;

        let mut close_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, P2PEvent::CloseOutbound { .. }) {
                close_events += 1;
            }
        }
        assert_eq!(close_events, 1);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (session, _rx) = session(ConnectionKind::Outbound);
        session.disconnect(1000, "bye").await;

        let result = session.send(&MessagePacket::new("x", Value::Null)).await;
        assert!(matches!(result, Err(P2PError::SendFail(_))));

        let result = session.request(&RequestPacket::new("status", Value::Null)).await;
        assert!(matches!(result, Err(P2PError::RpcResponseError { .. })));
    }

    #[tokio::test]
    async fn test_update_preserves_address_and_port() {
        let (session, _rx) = session(ConnectionKind::Inbound);

        let pushed = json!({
            "ip": "99.99.99.99",
            "wsPort": 9999,
            "version": "2.0.0",
            "height": 500,
        });
        let info = session.update_from_protocol_peer_info(&pushed).await.unwrap();
        assert_eq!(info.ip_address, "203.0.113.7");
        assert_eq!(info.ws_port, 5001);
        assert_eq!(info.version, "2.0.0");
        assert_eq!(info.height, 500);
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_info() {
        let (session, _rx) = session(ConnectionKind::Inbound);

        let before = session.peer_info().await;
        let pushed = json!({"version": "not-semver"});
        assert!(session.update_from_protocol_peer_info(&pushed).await.is_err());
        assert_eq!(session.peer_info().await, before);
    }
}
