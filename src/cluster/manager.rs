//! Cluster Manager
//!
//! Entry point the rest of the broker uses to reach other nodes: membership
//! changes go through [`ClusterManager::add_node`], and the three broadcast
//! operations fan out over a snapshot of the directory.
//!
//! Every broadcast dispatches one task per peer and bounds each call with
//! the configured timeout. A peer whose call fails or times out is logged and
//! skipped for that round; callers cannot tell it apart from a peer that had
//! nothing to report.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::protocol::{ClusterTally, QueryOutcome, RelayMessage, SubscriptionQuery};
use crate::remote::{RemoteError, RemotePeerStatus};

use super::channel::{ChannelSettings, PeerChannel, TcpDialer};
use super::connector::{ConnectOutcome, PeerConnector, TokioDelay};
use super::directory::{ClusterDirectory, ClusterNode};
use super::server::ClusterServer;
use super::service::ClusterService;

/// Coordinates membership, connections and cluster-wide queries for one broker
pub struct ClusterManager {
    /// Our node ID
    node_id: String,
    directory: Arc<ClusterDirectory>,
    connector: Arc<PeerConnector>,
    call_timeout: Duration,
}

impl ClusterManager {
    pub fn new(
        node_id: impl Into<String>,
        directory: Arc<ClusterDirectory>,
        connector: Arc<PeerConnector>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            directory,
            connector,
            call_timeout,
        }
    }

    /// Build a manager dialing real TCP channels
    pub fn from_config(config: &ClusterConfig) -> Self {
        let node_id = config.get_node_id();
        let directory = Arc::new(ClusterDirectory::new());
        let settings = ChannelSettings {
            connect_timeout: config.connect_timeout,
            call_timeout: config.call_timeout,
            keepalive_interval: config.keepalive_interval,
        };
        let connector = Arc::new(PeerConnector::new(
            directory.clone(),
            Arc::new(TcpDialer::new(node_id.clone(), settings)),
            Arc::new(TokioDelay),
            config.retry.backoff(),
        ));
        Self::new(node_id, directory, connector, config.call_timeout)
    }

    /// Get our node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn directory(&self) -> &Arc<ClusterDirectory> {
        &self.directory
    }

    /// Get the number of known peers
    pub fn peer_count(&self) -> usize {
        self.directory.peer_count()
    }

    /// Get the number of peers with an established channel
    pub fn connected_peer_count(&self) -> usize {
        self.directory.connected_count()
    }

    pub fn peer_status(&self, node_id: &str) -> RemotePeerStatus {
        self.directory.status(node_id)
    }

    /// Bind the RPC listener and start connecting to `peers`.
    ///
    /// Returns the bound listener address.
    pub async fn start(
        &self,
        bind: SocketAddr,
        service: Arc<ClusterService>,
        peers: &[ClusterNode],
    ) -> Result<SocketAddr, RemoteError> {
        let server = ClusterServer::bind(bind, self.node_id.clone(), service).await?;
        let local_addr = server.local_addr()?;
        server.spawn();

        info!(
            "Cluster node '{}' started on {} with {} configured peers",
            self.node_id,
            local_addr,
            peers.len()
        );

        for peer in peers {
            self.add_node(peer.clone());
        }
        Ok(local_addr)
    }

    /// Learn about a node and start connecting to it.
    ///
    /// Returns `None` for ourselves and for nodes already known.
    pub fn add_node(&self, node: ClusterNode) -> Option<JoinHandle<ConnectOutcome>> {
        if node.node_id == self.node_id {
            debug!("Cluster: skipping self ({})", node.node_id);
            return None;
        }
        let Some(generation) = self.directory.add_node(node.clone()) else {
            debug!("Cluster: node '{}' already known", node.node_id);
            return None;
        };

        info!("Cluster: new node '{}' at {}", node.node_id, node.address);
        Some(self.connector.spawn(node, generation))
    }

    /// Drop a node from membership. Returns whether it was known.
    pub fn remove_node(&self, node_id: &str) -> bool {
        let removed = self.directory.evict(node_id).is_some();
        if removed {
            info!("Cluster peer '{}' left the cluster", node_id);
        }
        removed
    }

    /// Forward a locally-originated publish to every peer with a matching
    /// subscriber.
    ///
    /// Each peer is asked `QuerySubscribe` and, on a match, immediately sent
    /// `DeliverMessage`. Returns the node ids that accepted the delivery.
    pub async fn relay_publish(&self, topic: &str, payload: Bytes, qos: u8) -> Vec<String> {
        let query = SubscriptionQuery::new(topic, qos);
        let message = RelayMessage::new(topic, payload);
        let call_timeout = self.call_timeout;

        let delivered = self
            .broadcast(move |node_id, channel| {
                let query = query.clone();
                let message = message.clone();
                async move {
                    let outcome = bounded_call(
                        &node_id,
                        "QuerySubscribe",
                        call_timeout,
                        channel.query_subscribe(&query),
                    )
                    .await?;
                    if !outcome.is_match() {
                        return None;
                    }

                    bounded_call(
                        &node_id,
                        "DeliverMessage",
                        call_timeout,
                        channel.deliver_message(&message),
                    )
                    .await?;
                    debug!("Cluster: relayed '{}' to '{}'", message.topic, node_id);
                    Some(node_id)
                }
            })
            .await;

        delivered.into_iter().flatten().flatten().collect()
    }

    /// Ask every peer to close its connection for `client_id`, if it has one.
    ///
    /// Responses are not inspected.
    pub async fn query_force_disconnect(&self, client_id: &str) {
        let client_id = client_id.to_string();
        let call_timeout = self.call_timeout;

        self.broadcast(move |node_id, channel| {
            let client_id = client_id.clone();
            async move {
                bounded_call(
                    &node_id,
                    "QueryConnect",
                    call_timeout,
                    channel.query_connect(&client_id),
                )
                .await;
            }
        })
        .await;
    }

    /// Tally shared subscribers for `topic` across the cluster.
    ///
    /// Only peers reporting a count above zero appear in the result.
    pub async fn query_cluster_share_tally(&self, topic: &str, qos: u8) -> ClusterTally {
        let query = SubscriptionQuery::new(topic, qos);
        let call_timeout = self.call_timeout;

        let counts = self
            .broadcast(move |node_id, channel| {
                let query = query.clone();
                async move {
                    let outcome = bounded_call(
                        &node_id,
                        "QueryShareSubscribe",
                        call_timeout,
                        channel.query_share_subscribe(&query),
                    )
                    .await?;
                    Some((node_id, outcome.share_sub_count))
                }
            })
            .await;

        counts
            .into_iter()
            .flatten()
            .flatten()
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    /// Run `per_peer` for every directory entry in its own task.
    ///
    /// A panicking task is logged and contributes nothing.
    async fn broadcast<F, Fut, T>(&self, per_peer: F) -> Vec<Option<T>>
    where
        F: Fn(String, Arc<dyn PeerChannel>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let tasks: Vec<_> = self
            .directory
            .snapshot()
            .into_iter()
            .map(|(node_id, channel)| {
                let label = node_id.clone();
                (label, tokio::spawn(per_peer(node_id, channel)))
            })
            .collect();

        let (labels, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        join_all(handles)
            .await
            .into_iter()
            .zip(labels)
            .map(|(result, node_id)| match result {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Cluster: task for peer '{}' failed: {}", node_id, e);
                    None
                }
            })
            .collect()
    }
}

/// Run one remote call under `timeout`, logging and swallowing failures
async fn bounded_call<F>(
    node_id: &str,
    operation: &str,
    timeout: Duration,
    call: F,
) -> Option<QueryOutcome>
where
    F: Future<Output = Result<QueryOutcome, RemoteError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(outcome)) => Some(outcome),
        Ok(Err(e)) if e.is_transport() => {
            warn!("Cluster peer '{}': unreachable for {}: {}", node_id, operation, e);
            None
        }
        Ok(Err(e)) => {
            error!("Cluster peer '{}': {} failed: {}", node_id, operation, e);
            None
        }
        Err(_) => {
            warn!(
                "Cluster peer '{}': {} timed out after {:?}",
                node_id, operation, timeout
            );
            None
        }
    }
}
