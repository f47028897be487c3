//! MeshMQ - inter-node RPC mesh for a clustered MQTT broker
//!
//! Lets broker nodes ask each other whether a topic has subscribers, relay
//! publishes, force remote client disconnects and count shared subscribers
//! across the cluster.

pub mod cluster;
pub mod config;
pub mod local;
pub mod protocol;
pub mod remote;
pub mod topic;

pub use cluster::{ClusterConfig, ClusterManager, ClusterNode, ClusterService};
pub use config::Config;
pub use protocol::{ClusterTally, QoS, QueryOutcome};
pub use remote::{RemoteError, RemotePeerStatus};
