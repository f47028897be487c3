//! Cluster RPC Protocol
//!
//! Defines the binary protocol used between broker nodes. Messages are
//! serialized with bincode and sent as length-prefixed frames:
//! `[u32 big-endian length][bincode payload]`.
//!
//! Requests carry a caller-chosen id that the response echoes, so any
//! number of calls can be in flight on one connection.

use bincode::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::remote::RemoteError;

/// Protocol version for compatibility checking
pub const CLUSTER_PROTOCOL_VERSION: u8 = 1;

/// Largest frame accepted from a peer
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// The four remote operations a node answers
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum RpcRequest {
    /// Does the node have a subscriber for this topic/qos?
    QuerySubscribe { topic: String, qos: u8 },
    /// How many shared subscribers does the node have for this topic/qos?
    QueryShareSubscribe { topic: String, qos: u8 },
    /// Close the client's connection if it lives on the node
    QueryConnect { client_id: String },
    /// Deliver a publish to the node's local subscribers
    DeliverMessage { topic: String, payload: Vec<u8> },
}

impl RpcRequest {
    /// Get the operation name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            RpcRequest::QuerySubscribe { .. } => "QuerySubscribe",
            RpcRequest::QueryShareSubscribe { .. } => "QueryShareSubscribe",
            RpcRequest::QueryConnect { .. } => "QueryConnect",
            RpcRequest::DeliverMessage { .. } => "DeliverMessage",
        }
    }
}

/// Responses to [`RpcRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum RpcResponse {
    /// Plain response code
    Response { ret_code: i32 },
    /// Response code plus shared subscriber count
    ShareSubscribe { ret_code: i32, share_sub_count: i32 },
}

impl RpcResponse {
    pub fn ret_code(&self) -> i32 {
        match self {
            RpcResponse::Response { ret_code } => *ret_code,
            RpcResponse::ShareSubscribe { ret_code, .. } => *ret_code,
        }
    }
}

/// Messages exchanged between cluster nodes over TCP
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ClusterMessage {
    /// Handshake sent when connecting to a peer
    Hello {
        /// Node ID of the sender
        node_id: String,
        /// Protocol version
        version: u8,
    },

    /// Handshake acknowledgment
    HelloAck {
        /// Node ID of the responder
        node_id: String,
        /// Protocol version
        version: u8,
    },

    /// A call
    Request { id: u64, request: RpcRequest },

    /// The answer to the call with the same id
    Response { id: u64, response: RpcResponse },

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong
    Pong,
}

impl ClusterMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::HelloAck { .. } => "HelloAck",
            ClusterMessage::Request { .. } => "Request",
            ClusterMessage::Response { .. } => "Response",
            ClusterMessage::Ping => "Ping",
            ClusterMessage::Pong => "Pong",
        }
    }
}

/// Frame a message with length prefix for TCP transmission.
///
/// Fails with [`RemoteError::Codec`] when the encoded message exceeds
/// [`MAX_FRAME_SIZE`], so nothing a peer would refuse is ever written.
pub fn frame_message(msg: &ClusterMessage) -> Result<Vec<u8>, RemoteError> {
    let payload = msg.encode()?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(RemoteError::Codec(format!(
            "{} of {} bytes exceeds frame limit of {}",
            msg.type_name(),
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Write one framed message
pub async fn write_message<W>(writer: &mut W, msg: &ClusterMessage) -> Result<(), RemoteError>
where
    W: AsyncWrite + Unpin,
{
    let frame = frame_message(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// frames. A [`RemoteError::Codec`] means the whole frame was consumed and
/// dropped; the stream is still aligned on the next frame.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<ClusterMessage>, RemoteError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        let mut body = (&mut *reader).take(len as u64);
        let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        if skipped < len as u64 {
            return Err(RemoteError::ConnectionLost(
                "Connection closed inside an oversized frame".to_string(),
            ));
        }
        return Err(RemoteError::Codec(format!(
            "Dropped frame of {} bytes, limit is {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(ClusterMessage::decode(&buf)?))
}
