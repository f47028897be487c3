//! Remote Peer Errors and Status

use std::fmt;

/// Error type for remote node operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection to the remote node failed or was lost
    ConnectionLost(String),
    /// Remote node rejected the handshake or the call
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Frame could not be encoded or decoded
    Codec(String),
    /// Other error
    Other(String),
}

impl RemoteError {
    /// Whether this is a transport-level failure (dial or call could not complete)
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::ConnectionLost(_) | RemoteError::Timeout)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            RemoteError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            RemoteError::Timeout => write!(f, "Operation timed out"),
            RemoteError::Codec(msg) => write!(f, "Codec error: {}", msg),
            RemoteError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        RemoteError::ConnectionLost(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for RemoteError {
    fn from(e: bincode::error::EncodeError) -> Self {
        RemoteError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for RemoteError {
    fn from(e: bincode::error::DecodeError) -> Self {
        RemoteError::Codec(e.to_string())
    }
}

/// Liveness of a known cluster node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePeerStatus {
    /// Not known to the directory, or its connection dropped and waits to be
    /// re-dialled by the next call
    Disconnected,
    /// Dialling
    Connecting,
    /// Dial failed, sleeping before the next attempt
    Backoff,
    /// Channel established and registered
    Connected,
}
