//! Local Broker Collaborators
//!
//! The cluster layer answers peers by consulting state that lives on this
//! node: the subscription index, the client registry and the publish
//! pipeline. These traits are the seams; [`memory`] provides in-memory
//! implementations for the node binary and tests.

mod memory;

pub use memory::{DeliveredMessage, LocalDelivery, MemoryClient, MemoryClients, MemorySubscriptions};

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::QoS;

/// One subscriber matched by the local index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedSubscriber {
    /// Granted QoS
    pub qos: QoS,
    /// Whether the subscription belongs to a `$share/` group
    pub is_shared: bool,
}

/// Subscription index lookup failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexError(pub String);

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription index error: {}", self.0)
    }
}

impl std::error::Error for IndexError {}

/// Matches a topic against locally registered subscribers
pub trait SubscriptionIndex: Send + Sync {
    fn matches(&self, topic: &str, qos: QoS) -> Result<Vec<MatchedSubscriber>, IndexError>;
}

/// A live client connection on this node
pub trait ClientHandle: Send + Sync {
    fn client_id(&self) -> &str;

    /// Forcibly close the connection
    fn close(&self);
}

/// Maps client ids to live connections on this node
pub trait ClientRegistry: Send + Sync {
    fn find(&self, client_id: &str) -> Option<Arc<dyn ClientHandle>>;
}

/// Delivers a publish to this node's local subscribers only
pub trait PublishPipeline: Send + Sync {
    fn deliver(&self, topic: &str, payload: Bytes, retain: bool);
}
