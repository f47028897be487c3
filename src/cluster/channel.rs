//! Peer Channels
//!
//! A [`PeerChannel`] is a reusable handle for calling the four remote
//! operations on one node. [`TcpPeerChannel`] multiplexes calls over a
//! single TCP connection: every request gets an id, a writer task owns the
//! write half, and a reader task routes responses back to the waiting call.
//!
//! A channel outlives its connection. When the connection drops, or the peer
//! stops answering keep-alive pings, the next call dials a fresh one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocol::{QueryOutcome, RelayMessage, SubscriptionQuery};
use crate::remote::RemoteError;

use super::directory::ClusterNode;
use super::protocol::{
    frame_message, read_message, write_message, ClusterMessage, RpcRequest, RpcResponse,
    CLUSTER_PROTOCOL_VERSION,
};

/// The typed remote operations one node can invoke on another
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Ask whether the peer has a subscriber for the topic/qos
    async fn query_subscribe(&self, query: &SubscriptionQuery)
        -> Result<QueryOutcome, RemoteError>;

    /// Ask how many shared subscribers the peer has for the topic/qos
    async fn query_share_subscribe(
        &self,
        query: &SubscriptionQuery,
    ) -> Result<QueryOutcome, RemoteError>;

    /// Ask the peer to close the client's connection if it holds one
    async fn query_connect(&self, client_id: &str) -> Result<QueryOutcome, RemoteError>;

    /// Hand a publish to the peer's local subscribers
    async fn deliver_message(&self, message: &RelayMessage) -> Result<QueryOutcome, RemoteError>;

    /// Whether the underlying connection is currently up
    fn is_connected(&self) -> bool {
        true
    }
}

/// Opens channels to cluster nodes
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, node: &ClusterNode) -> Result<Arc<dyn PeerChannel>, RemoteError>;
}

/// Timeouts for TCP peer channels
#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    /// Bound on one dial plus handshake
    pub connect_timeout: Duration,
    /// Bound on one call, from send until response
    pub call_timeout: Duration,
    /// Interval between keep-alive pings. A connection that hears nothing
    /// for a whole interval after a ping is considered dead.
    pub keepalive_interval: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30 * 60),
        }
    }
}

type PendingCalls = Arc<DashMap<u64, oneshot::Sender<RpcResponse>>>;

/// One established TCP connection and the tasks serving it
struct Connection {
    pending: PendingCalls,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Dial `node`, perform the handshake and start the connection tasks
    async fn open(
        local_node_id: &str,
        node: &ClusterNode,
        settings: ChannelSettings,
    ) -> Result<Self, RemoteError> {
        let stream = tokio::time::timeout(
            settings.connect_timeout,
            handshake(local_node_id, node),
        )
        .await
        .map_err(|_| RemoteError::Timeout)??;

        let (mut read_half, mut write_half) = stream.into_split();
        let pending: PendingCalls = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        // Set by the reader on every inbound frame, cleared by each ping
        let heard = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1024);
        let ping = frame_message(&ClusterMessage::Ping)?;

        // Writer: owns the write half, interleaves calls and keep-alive pings
        let writer_node = node.node_id.clone();
        let writer_closed = closed.clone();
        let writer_pending = pending.clone();
        let writer_heard = heard.clone();
        let keepalive = settings.keepalive_interval;
        tokio::spawn(async move {
            let mut ping_timer =
                tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
            loop {
                let frame = tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = ping_timer.tick() => {
                        if !writer_heard.swap(false, Ordering::AcqRel) {
                            warn!(
                                "ClusterPeer '{}': no answer to keep-alive within {:?}, closing",
                                writer_node, keepalive
                            );
                            break;
                        }
                        ping.clone()
                    }
                };
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    error!("ClusterPeer '{}': write error: {}", writer_node, e);
                    break;
                }
            }
            writer_closed.store(true, Ordering::Release);
            writer_pending.clear();
        });

        // Reader: routes responses to their waiting calls
        let reader_node = node.node_id.clone();
        let reader_closed = closed.clone();
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            loop {
                let msg = match read_message(&mut read_half).await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        info!("ClusterPeer '{}': connection closed by peer", reader_node);
                        break;
                    }
                    Err(RemoteError::Codec(e)) => {
                        warn!("ClusterPeer '{}': dropped frame: {}", reader_node, e);
                        heard.store(true, Ordering::Release);
                        continue;
                    }
                    Err(e) => {
                        error!("ClusterPeer '{}': read error: {}", reader_node, e);
                        break;
                    }
                };
                heard.store(true, Ordering::Release);

                match msg {
                    ClusterMessage::Response { id, response } => {
                        if let Some((_, waiter)) = reader_pending.remove(&id) {
                            let _ = waiter.send(response);
                        } else {
                            debug!(
                                "ClusterPeer '{}': late response for call {}",
                                reader_node, id
                            );
                        }
                    }
                    ClusterMessage::Pong => {
                        debug!("ClusterPeer '{}': Pong received", reader_node);
                    }
                    other => {
                        debug!(
                            "ClusterPeer '{}': ignoring unexpected {}",
                            reader_node,
                            other.type_name()
                        );
                    }
                }
            }
            reader_closed.store(true, Ordering::Release);
            // Dropping the senders fails every call still waiting
            reader_pending.clear();
        });

        Ok(Self {
            pending,
            outbound: tx,
            closed,
            reader,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn call(
        &self,
        id: u64,
        frame: Vec<u8>,
        call_timeout: Duration,
    ) -> Result<RpcResponse, RemoteError> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        // The connection tasks may have torn down before the insert
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(RemoteError::ConnectionLost("Channel closed".to_string()));
        }

        let result = tokio::time::timeout(call_timeout, async {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| RemoteError::ConnectionLost("Writer closed".to_string()))?;
            rx.await.map_err(|_| {
                RemoteError::ConnectionLost("Connection closed before response".to_string())
            })
        })
        .await
        .unwrap_or(Err(RemoteError::Timeout));

        if result.is_err() {
            self.pending.remove(&id);
        }
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn handshake(local_node_id: &str, node: &ClusterNode) -> Result<TcpStream, RemoteError> {
    let mut stream = TcpStream::connect(node.address.as_str()).await?;
    stream.set_nodelay(true)?;

    let hello = ClusterMessage::Hello {
        node_id: local_node_id.to_string(),
        version: CLUSTER_PROTOCOL_VERSION,
    };
    write_message(&mut stream, &hello).await?;

    match read_message(&mut stream).await? {
        Some(ClusterMessage::HelloAck { node_id, version }) => {
            if version != CLUSTER_PROTOCOL_VERSION {
                return Err(RemoteError::Rejected(format!(
                    "Protocol version mismatch: {} vs {}",
                    version, CLUSTER_PROTOCOL_VERSION
                )));
            }
            info!(
                "ClusterPeer '{}': Connected to {} (peer_id={})",
                node.node_id, node.address, node_id
            );
            Ok(stream)
        }
        Some(other) => Err(RemoteError::Rejected(format!(
            "Expected HelloAck, got {}",
            other.type_name()
        ))),
        None => Err(RemoteError::ConnectionLost(
            "Connection closed during handshake".to_string(),
        )),
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// A multiplexed RPC channel to one node, re-dialled on demand
pub struct TcpPeerChannel {
    local_node_id: String,
    node: ClusterNode,
    settings: ChannelSettings,
    next_id: AtomicU64,
    connection: RwLock<Arc<Connection>>,
    /// Serializes re-dials so concurrent calls share one new connection
    redial: Mutex<()>,
}

impl TcpPeerChannel {
    /// Dial `node` and return a channel over the established connection
    pub async fn connect(
        local_node_id: &str,
        node: &ClusterNode,
        settings: ChannelSettings,
    ) -> Result<Self, RemoteError> {
        let connection = Connection::open(local_node_id, node, settings).await?;
        Ok(Self {
            local_node_id: local_node_id.to_string(),
            node: node.clone(),
            settings,
            next_id: AtomicU64::new(1),
            connection: RwLock::new(Arc::new(connection)),
            redial: Mutex::new(()),
        })
    }

    /// Remote node id
    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    /// The current connection, dialling a new one if it has gone away
    async fn live_connection(&self) -> Result<Arc<Connection>, RemoteError> {
        let current = self.connection.read().clone();
        if !current.is_closed() {
            return Ok(current);
        }

        let _redial = self.redial.lock().await;
        // Another call may have re-dialled while this one waited
        let current = self.connection.read().clone();
        if !current.is_closed() {
            return Ok(current);
        }

        info!(
            "ClusterPeer '{}': connection lost, re-dialling {}",
            self.node.node_id, self.node.address
        );
        let fresh =
            Arc::new(Connection::open(&self.local_node_id, &self.node, self.settings).await?);
        *self.connection.write() = fresh.clone();
        Ok(fresh)
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Oversized requests fail here, before touching the connection
        let frame = frame_message(&ClusterMessage::Request { id, request })?;
        let connection = self.live_connection().await?;
        connection.call(id, frame, self.settings.call_timeout).await
    }
}

fn plain_outcome(response: RpcResponse) -> Result<QueryOutcome, RemoteError> {
    match response {
        RpcResponse::Response { ret_code } => Ok(QueryOutcome {
            ret_code,
            share_sub_count: 0,
        }),
        other => Err(RemoteError::Other(format!(
            "Unexpected response {:?}",
            other
        ))),
    }
}

#[async_trait]
impl PeerChannel for TcpPeerChannel {
    async fn query_subscribe(
        &self,
        query: &SubscriptionQuery,
    ) -> Result<QueryOutcome, RemoteError> {
        let response = self
            .call(RpcRequest::QuerySubscribe {
                topic: query.topic.clone(),
                qos: query.qos,
            })
            .await?;
        plain_outcome(response)
    }

    async fn query_share_subscribe(
        &self,
        query: &SubscriptionQuery,
    ) -> Result<QueryOutcome, RemoteError> {
        let response = self
            .call(RpcRequest::QueryShareSubscribe {
                topic: query.topic.clone(),
                qos: query.qos,
            })
            .await?;
        match response {
            RpcResponse::ShareSubscribe {
                ret_code,
                share_sub_count,
            } => Ok(QueryOutcome {
                ret_code,
                share_sub_count,
            }),
            other => Err(RemoteError::Other(format!(
                "Unexpected response {:?}",
                other
            ))),
        }
    }

    async fn query_connect(&self, client_id: &str) -> Result<QueryOutcome, RemoteError> {
        let response = self
            .call(RpcRequest::QueryConnect {
                client_id: client_id.to_string(),
            })
            .await?;
        plain_outcome(response)
    }

    async fn deliver_message(&self, message: &RelayMessage) -> Result<QueryOutcome, RemoteError> {
        let response = self
            .call(RpcRequest::DeliverMessage {
                topic: message.topic.clone(),
                payload: message.payload.to_vec(),
            })
            .await?;
        plain_outcome(response)
    }

    fn is_connected(&self) -> bool {
        !self.connection.read().is_closed()
    }
}

/// Dials [`TcpPeerChannel`]s on behalf of the local node
pub struct TcpDialer {
    local_node_id: String,
    settings: ChannelSettings,
}

impl TcpDialer {
    pub fn new(local_node_id: impl Into<String>, settings: ChannelSettings) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            settings,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, node: &ClusterNode) -> Result<Arc<dyn PeerChannel>, RemoteError> {
        let channel = TcpPeerChannel::connect(&self.local_node_id, node, self.settings).await?;
        Ok(Arc::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::protocol::MAX_FRAME_SIZE;
    use crate::cluster::server::ClusterServer;
    use crate::cluster::service::ClusterService;
    use crate::local::{LocalDelivery, MemoryClients, MemorySubscriptions, SubscriptionIndex};
    use crate::protocol::{QoS, RET_OK};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn settings(keepalive: Duration) -> ChannelSettings {
        ChannelSettings {
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(2),
            keepalive_interval: keepalive,
        }
    }

    async fn serve(addr: SocketAddr, subscriptions: Arc<MemorySubscriptions>) -> SocketAddr {
        let index: Arc<dyn SubscriptionIndex> = subscriptions;
        let service = Arc::new(ClusterService::new(
            index.clone(),
            Arc::new(MemoryClients::new()),
            Arc::new(LocalDelivery::new(index)),
        ));
        let server = ClusterServer::bind(addr, "remote", service).await.unwrap();
        let addr = server.local_addr().unwrap();
        server.spawn();
        addr
    }

    /// Accept one connection, answer the handshake, then hand the stream back
    async fn accept_handshake(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        match read_message(&mut stream).await.unwrap() {
            Some(ClusterMessage::Hello { .. }) => {}
            other => panic!("expected Hello, got {:?}", other),
        }
        let ack = ClusterMessage::HelloAck {
            node_id: "remote".to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        write_message(&mut stream, &ack).await.unwrap();
        stream
    }

    async fn wait_disconnected(channel: &TcpPeerChannel) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection should be detected as down");
    }

    #[tokio::test]
    async fn test_redials_after_peer_restart() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let node = ClusterNode::new("remote", addr.to_string());

        let (channel, stream) = tokio::join!(
            TcpPeerChannel::connect("local", &node, settings(Duration::from_secs(60))),
            accept_handshake(&listener)
        );
        let channel = channel.unwrap();

        // Peer goes away
        drop(stream);
        drop(listener);
        wait_disconnected(&channel).await;

        // And comes back on the same address
        let subscriptions = Arc::new(MemorySubscriptions::new());
        subscriptions
            .subscribe("a/b", "c1", QoS::AtMostOnce)
            .unwrap();
        serve(addr, subscriptions).await;

        let outcome = channel
            .query_subscribe(&SubscriptionQuery::new("a/b", 0))
            .await
            .unwrap();
        assert_eq!(outcome.ret_code, RET_OK);
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_failed_redial_fails_only_that_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let node = ClusterNode::new("remote", addr.to_string());

        let (channel, stream) = tokio::join!(
            TcpPeerChannel::connect("local", &node, settings(Duration::from_secs(60))),
            accept_handshake(&listener)
        );
        let channel = channel.unwrap();
        drop(stream);
        drop(listener);
        wait_disconnected(&channel).await;

        let err = channel.query_connect("c1").await.unwrap_err();
        assert!(err.is_transport());

        serve(addr, Arc::new(MemorySubscriptions::new())).await;
        let outcome = channel.query_connect("c1").await.unwrap();
        assert_eq!(outcome.ret_code, RET_OK);
    }

    #[tokio::test]
    async fn test_keepalive_answered_keeps_connection() {
        let addr = serve(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(MemorySubscriptions::new()),
        )
        .await;
        let node = ClusterNode::new("remote", addr.to_string());

        let channel = TcpPeerChannel::connect("local", &node, settings(Duration::from_millis(30)))
            .await
            .unwrap();

        // Several ping rounds with no calls in between
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(channel.is_connected());
        assert!(channel.query_connect("c1").await.is_ok());
    }

    #[tokio::test]
    async fn test_silent_peer_detected_by_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node = ClusterNode::new("remote", listener.local_addr().unwrap().to_string());

        let (channel, _stream) = tokio::join!(
            TcpPeerChannel::connect("local", &node, settings(Duration::from_millis(30))),
            accept_handshake(&listener)
        );
        let channel = channel.unwrap();

        // The peer holds the socket open but never answers a Ping
        wait_disconnected(&channel).await;
    }

    #[tokio::test]
    async fn test_oversized_call_keeps_connection() {
        let addr = serve(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(MemorySubscriptions::new()),
        )
        .await;
        let node = ClusterNode::new("remote", addr.to_string());
        let channel = TcpPeerChannel::connect("local", &node, settings(Duration::from_secs(60)))
            .await
            .unwrap();

        let big = RelayMessage::new("t", vec![0u8; MAX_FRAME_SIZE + 1]);
        let err = channel.deliver_message(&big).await.unwrap_err();
        assert!(matches!(err, RemoteError::Codec(_)));

        assert!(channel.is_connected());
        let outcome = channel
            .deliver_message(&RelayMessage::new("t", &b"small"[..]))
            .await
            .unwrap();
        assert_eq!(outcome.ret_code, RET_OK);
    }
}
