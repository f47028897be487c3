//! Cluster Module
//!
//! Inter-node RPC mesh for MeshMQ.
//!
//! # Architecture
//!
//! - **Directory**: the set of known nodes and, for each connected one, the
//!   channel used to reach it
//! - **Connector**: dials a node with exponential backoff and evicts it after
//!   too many failed attempts
//! - **Manager**: fans relay, force-disconnect and tally queries out to every
//!   connected peer in parallel
//! - **Server/Service**: answers those queries from other nodes against
//!   local subscription and client state
//!
//! Peers talk over TCP with length-prefixed bincode frames (see
//! [`protocol`]).
//!
//! # Usage
//!
//! ```toml
//! # meshmq.toml
//! [cluster]
//! enabled = true
//! node_id = "node-a"
//! rpc_bind = "0.0.0.0:8933"
//! peers = [
//!     { node_id = "node-b", address = "10.0.0.2:8933" },
//! ]
//! ```

mod channel;
mod connector;
mod directory;
mod manager;
pub mod protocol;
mod server;
mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelSettings, Dialer, PeerChannel, TcpDialer, TcpPeerChannel};
pub use connector::{Backoff, ConnectOutcome, ConnectState, Delay, PeerConnector, TokioDelay};
pub use directory::{ClusterDirectory, ClusterNode};
pub use manager::ClusterManager;
pub use protocol::{ClusterMessage, RpcRequest, RpcResponse, CLUSTER_PROTOCOL_VERSION};
pub use server::ClusterServer;
pub use service::ClusterService;

// Re-export cluster config
pub use crate::config::{ClusterConfig, RetryConfig};
