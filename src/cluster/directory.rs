//! Cluster Directory
//!
//! The per-broker table of known nodes and their live channels. The peer
//! connector is the only writer; broadcasts read it through [`snapshot`],
//! which copies the current entries so a membership change in flight never
//! affects a round that already started.
//!
//! [`snapshot`]: ClusterDirectory::snapshot

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::{Entry, OccupiedEntry};
use dashmap::DashMap;
use serde::Deserialize;

use crate::remote::RemotePeerStatus;

use super::channel::PeerChannel;

/// Identity and locator of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ClusterNode {
    /// Unique within the cluster, stable for the node's lifetime
    pub node_id: String,
    /// `host:port` of the node's RPC listener
    pub address: String,
}

impl ClusterNode {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
        }
    }
}

/// A member entry. `generation` tells apart successive memberships of the
/// same node id.
#[derive(Debug, Clone)]
struct Member {
    node: ClusterNode,
    generation: u64,
}

/// Node table plus node id -> established channel
#[derive(Default)]
pub struct ClusterDirectory {
    nodes: DashMap<String, Member>,
    channels: DashMap<String, Arc<dyn PeerChannel>>,
    status: DashMap<String, RemotePeerStatus>,
    next_generation: AtomicU64,
}

impl ClusterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cluster member.
    ///
    /// Returns the membership generation, or `None` if the node id is
    /// already known.
    pub fn add_node(&self, node: ClusterNode) -> Option<u64> {
        match self.nodes.entry(node.node_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
                self.status
                    .insert(node.node_id.clone(), RemotePeerStatus::Disconnected);
                entry.insert(Member { node, generation });
                Some(generation)
            }
        }
    }

    /// Look up a member
    pub fn node(&self, node_id: &str) -> Option<ClusterNode> {
        self.nodes.get(node_id).map(|m| m.node.clone())
    }

    /// Current membership generation of a node
    pub fn generation(&self, node_id: &str) -> Option<u64> {
        self.nodes.get(node_id).map(|m| m.generation)
    }

    /// Whether the node is still a cluster member
    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Whether `generation` is still the node's current membership
    pub fn is_current(&self, node_id: &str, generation: u64) -> bool {
        self.generation(node_id) == Some(generation)
    }

    /// All current members, in no particular order
    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.nodes.iter().map(|m| m.node.clone()).collect()
    }

    /// Install an established channel for a member.
    ///
    /// Returns false, without installing, if that membership ended while the
    /// channel was being established.
    pub fn register(
        &self,
        node_id: &str,
        generation: u64,
        channel: Arc<dyn PeerChannel>,
    ) -> bool {
        // Holding the member entry keeps a concurrent evict from interleaving
        let Some(member) = self.nodes.get(node_id) else {
            return false;
        };
        if member.generation != generation {
            return false;
        }
        self.channels.insert(node_id.to_string(), channel);
        self.status
            .insert(node_id.to_string(), RemotePeerStatus::Connected);
        true
    }

    /// The live channel for a node, if one was established
    pub fn lookup(&self, node_id: &str) -> Option<Arc<dyn PeerChannel>> {
        self.channels.get(node_id).map(|c| c.value().clone())
    }

    /// Copy of every (node id, channel) entry, in no particular order
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn PeerChannel>)> {
        self.channels
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Drop the node's channel, keeping it as a member
    pub fn remove(&self, node_id: &str) -> Option<Arc<dyn PeerChannel>> {
        let removed = self.channels.remove(node_id).map(|(_, c)| c);
        if removed.is_some() {
            self.status
                .insert(node_id.to_string(), RemotePeerStatus::Disconnected);
        }
        removed
    }

    /// Remove the node from membership along with its channel and status
    pub fn evict(&self, node_id: &str) -> Option<ClusterNode> {
        match self.nodes.entry(node_id.to_string()) {
            Entry::Occupied(entry) => Some(self.evict_entry(entry)),
            Entry::Vacant(_) => None,
        }
    }

    /// Like [`evict`](Self::evict), but only while `generation` is the
    /// node's current membership
    pub fn evict_generation(&self, node_id: &str, generation: u64) -> Option<ClusterNode> {
        match self.nodes.entry(node_id.to_string()) {
            Entry::Occupied(entry) if entry.get().generation == generation => {
                Some(self.evict_entry(entry))
            }
            _ => None,
        }
    }

    fn evict_entry(&self, entry: OccupiedEntry<'_, String, Member>) -> ClusterNode {
        self.channels.remove(entry.key());
        self.status.remove(entry.key());
        entry.remove().node
    }

    /// Update a member's liveness. Ignored for unknown nodes and for a
    /// membership that has since ended.
    pub fn set_status(&self, node_id: &str, generation: u64, status: RemotePeerStatus) {
        let Some(member) = self.nodes.get(node_id) else {
            return;
        };
        if member.generation != generation {
            return;
        }
        if let Some(mut current) = self.status.get_mut(node_id) {
            *current = status;
        }
    }

    /// A node's liveness; unknown nodes are `Disconnected`, as are connected
    /// nodes whose connection dropped and waits to be re-dialled
    pub fn status(&self, node_id: &str) -> RemotePeerStatus {
        let status = self
            .status
            .get(node_id)
            .map(|s| *s.value())
            .unwrap_or(RemotePeerStatus::Disconnected);
        match status {
            RemotePeerStatus::Connected => match self.lookup(node_id) {
                Some(channel) if channel.is_connected() => RemotePeerStatus::Connected,
                _ => RemotePeerStatus::Disconnected,
            },
            other => other,
        }
    }

    /// Number of members
    pub fn peer_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of members with an established channel
    pub fn connected_count(&self) -> usize {
        self.channels.len()
    }
}
