//! Framed duplex transport over TCP.
//!
//! Frames are length-prefixed JSON: a big-endian `u32` byte count followed by
//! one serialized [`Frame`]. The length is checked against the receiving
//! side's payload cap before any allocation, so an oversized announcement
//! costs the sender its connection, not us our memory.

use crate::error::P2PError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Everything that can travel on a connection.
///
/// `Request`/`Response` form the request-reply verb, correlated by `id`.
/// `Message` is the fire-and-forget verb. `Ping`/`Pong` carry keep-alives.
/// `Close` announces a disconnect with a status code before the stream drops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Frame {
    /// First frame on an outbound connection: the dialer's node-info fields.
    Handshake { info: Value },
    Request {
        id: u64,
        payload: Value,
    },
    Response {
        id: u64,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Message { payload: Value },
    Ping,
    Pong,
    Close { code: u16, reason: String },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {limit} byte payload limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one frame, enforcing the receive payload cap before allocating.
pub async fn read_frame(reader: &mut OwnedReadHalf, max_payload: usize) -> Result<Frame, FrameError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > max_payload {
        return Err(FrameError::PayloadTooLarge { size: len, limit: max_payload });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    serde_json::from_slice(&buf).map_err(|e| FrameError::Malformed(e.to_string()))
}

/// Serialize and write one frame.
pub async fn write_frame(writer: &mut OwnedWriteHalf, frame: &Frame) -> Result<(), FrameError> {
    let bytes = serde_json::to_vec(frame).map_err(|e| FrameError::Malformed(e.to_string()))?;
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Write one frame on a stream that has not been split yet. Used for close
/// frames on connections rejected before a session exists.
pub async fn write_frame_unsplit(stream: &mut TcpStream, frame: &Frame) -> Result<(), FrameError> {
    let bytes = serde_json::to_vec(frame).map_err(|e| FrameError::Malformed(e.to_string()))?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    Ok(())
}

/// Read one frame from an unsplit stream, bounded by `deadline`. Used by the
/// acceptor for the handshake frame.
pub async fn read_frame_unsplit(
    stream: &mut TcpStream,
    max_payload: usize,
    deadline: Duration,
) -> Result<Frame, FrameError> {
    let read = async {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > max_payload {
            return Err(FrameError::PayloadTooLarge { size: len, limit: max_payload });
        }

        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        serde_json::from_slice(&buf).map_err(|e| FrameError::Malformed(e.to_string()))
    };

    match timeout(deadline, read).await {
        Ok(result) => result,
        Err(_) => Err(FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "handshake timed out",
        ))),
    }
}

/// Dial a peer and deliver the handshake query.
///
/// The handshake carries the dialer's node-info fields so the acceptor can
/// validate us before admitting the connection.
pub async fn dial(
    ip_address: &str,
    port: u16,
    handshake: Value,
    connect_timeout: Duration,
) -> Result<TcpStream, P2PError> {
    let peer_id = crate::addr::peer_id(ip_address, port);
    let ip: IpAddr = ip_address.parse().map_err(|_| {
        P2PError::PeerOutboundConnectionError {
            peer_id: peer_id.clone(),
            message: format!("unparseable address {ip_address:?}"),
        }
    })?;
    let addr = SocketAddr::new(ip, port);

    let mut stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(P2PError::PeerOutboundConnectionError {
                peer_id,
                message: e.to_string(),
            });
        }
        Err(_) => {
            return Err(P2PError::PeerOutboundConnectionError {
                peer_id,
                message: "connect timed out".into(),
            });
        }
    };

    write_frame_unsplit(&mut stream, &Frame::Handshake { info: handshake })
        .await
        .map_err(|e| P2PError::PeerOutboundConnectionError {
            peer_id,
            message: e.to_string(),
        })?;

    Ok(stream)
}
