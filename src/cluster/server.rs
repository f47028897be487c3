//! Cluster RPC Listener
//!
//! Accepts connections from peer nodes and answers their requests through
//! [`ClusterService`]. Each request runs in its own task and responses go
//! out through a per-connection writer, so a slow handler never holds up
//! other calls on the same connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::remote::RemoteError;

use super::protocol::{read_message, write_message, ClusterMessage, CLUSTER_PROTOCOL_VERSION};
use super::service::ClusterService;

/// How long an accepted connection may take to say Hello
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener for inbound cluster RPC
pub struct ClusterServer {
    listener: TcpListener,
    local_node_id: String,
    service: Arc<ClusterService>,
}

impl ClusterServer {
    /// Bind the RPC listener
    pub async fn bind(
        addr: SocketAddr,
        local_node_id: impl Into<String>,
        service: Arc<ClusterService>,
    ) -> Result<Self, RemoteError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            local_node_id: local_node_id.into(),
            service,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr, RemoteError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop in a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Accept peer connections forever
    pub async fn run(self) {
        info!(
            "Cluster RPC listening on {:?} (node '{}')",
            self.listener.local_addr().ok(),
            self.local_node_id
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Incoming cluster peer connection from {}", addr);

                    let service = self.service.clone();
                    let node_id = self.local_node_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_incoming_peer(stream, service, node_id).await
                        {
                            debug!("Incoming peer connection {} error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept peer connection: {}", e);
                }
            }
        }
    }

    async fn handle_incoming_peer(
        stream: TcpStream,
        service: Arc<ClusterService>,
        local_node_id: String,
    ) -> Result<(), RemoteError> {
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();

        let hello = tokio::time::timeout(HELLO_TIMEOUT, read_message(&mut read_half))
            .await
            .map_err(|_| RemoteError::Timeout)??;

        let peer_node_id = match hello {
            Some(ClusterMessage::Hello { node_id, version }) => {
                let ack = ClusterMessage::HelloAck {
                    node_id: local_node_id.clone(),
                    version: CLUSTER_PROTOCOL_VERSION,
                };
                write_message(&mut write_half, &ack).await?;

                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(RemoteError::Rejected(format!(
                        "Protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                node_id
            }
            Some(other) => {
                return Err(RemoteError::Rejected(format!(
                    "Expected Hello, got {}",
                    other.type_name()
                )))
            }
            None => return Ok(()),
        };

        info!("Incoming cluster peer: {}", peer_node_id);

        let (tx, mut rx) = mpsc::channel::<ClusterMessage>(1024);
        let writer_peer = peer_node_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write_message(&mut write_half, &msg).await {
                    warn!("Cluster peer '{}': write error: {}", writer_peer, e);
                    break;
                }
            }
        });

        let result = loop {
            let msg = match read_message(&mut read_half).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!("Cluster peer '{}' disconnected", peer_node_id);
                    break Ok(());
                }
                // The bad frame was consumed; the connection stays usable
                Err(RemoteError::Codec(e)) => {
                    warn!("Cluster peer '{}': dropped frame: {}", peer_node_id, e);
                    continue;
                }
                Err(e) => break Err(e),
            };

            match msg {
                ClusterMessage::Request { id, request } => {
                    debug!(
                        "Cluster peer '{}': {} (call {})",
                        peer_node_id,
                        request.type_name(),
                        id
                    );
                    let service = service.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = service.handle(request);
                        let _ = tx.send(ClusterMessage::Response { id, response }).await;
                    });
                }
                ClusterMessage::Ping => {
                    let _ = tx.send(ClusterMessage::Pong).await;
                }
                other => {
                    debug!(
                        "Cluster peer '{}': ignoring unexpected {}",
                        peer_node_id,
                        other.type_name()
                    );
                }
            }
        };

        drop(tx);
        // Let in-flight responses drain before the connection closes
        let _ = writer.await;
        result
    }
}
