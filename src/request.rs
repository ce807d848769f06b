//! Inbound RPC requests and their one-shot responders.

use crate::error::P2PError;
use crate::transport::Frame;
use crate::types::{PeerId, Productivity};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// An RPC request received from a peer, carrying everything a handler needs
/// to decide and answer: the procedure, its payload, the observed call rate
/// and a productivity snapshot for the peer.
///
/// The responder is strictly one-shot. The session answers built-in
/// procedures itself and still forwards the request upward, so a handler
/// must check [`was_response_sent`](Self::was_response_sent) before
/// answering or be prepared for [`P2PError::ResponseAlreadySent`].
#[derive(Debug)]
pub struct P2PRequest {
    pub procedure: String,
    pub data: Value,
    pub peer_id: PeerId,
    /// Calls per second observed for this procedure on this connection.
    pub rate: f64,
    pub productivity: Productivity,
    responder: Responder,
}

#[derive(Debug, Clone)]
struct Responder {
    request_id: u64,
    sent: Arc<AtomicBool>,
    outgoing: mpsc::Sender<Frame>,
}

impl P2PRequest {
    pub(crate) fn new(
        procedure: String,
        data: Value,
        peer_id: PeerId,
        rate: f64,
        productivity: Productivity,
        request_id: u64,
        outgoing: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            procedure,
            data,
            peer_id,
            rate,
            productivity,
            responder: Responder {
                request_id,
                sent: Arc::new(AtomicBool::new(false)),
                outgoing,
            },
        }
    }

    /// Whether the request has already been answered.
    pub fn was_response_sent(&self) -> bool {
        self.responder.sent.load(Ordering::SeqCst)
    }

    /// Answer the request with a payload.
    pub async fn end(&self, data: Value) -> Result<(), P2PError> {
        self.respond(Some(data), None).await
    }

    /// Answer the request with an error the remote caller will observe.
    pub async fn error(&self, message: &str) -> Result<(), P2PError> {
        self.respond(None, Some(message.to_string())).await
    }

    async fn respond(&self, data: Option<Value>, error: Option<String>) -> Result<(), P2PError> {
        if self.responder.sent.swap(true, Ordering::SeqCst) {
            return Err(P2PError::ResponseAlreadySent(self.procedure.clone()));
        }

        let frame = Frame::Response {
            id: self.responder.request_id,
            data,
            error,
        };
        self.responder
            .outgoing
            .send(frame)
            .await
            .map_err(|_| P2PError::SendFail("socket does not exist".into()))
    }
}
