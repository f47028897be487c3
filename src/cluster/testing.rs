//! Test doubles for channels, dialers and delays

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::protocol::{QueryOutcome, RelayMessage, SubscriptionQuery, RET_NOT_FOUND, RET_OK};
use crate::remote::RemoteError;

use super::channel::{Dialer, PeerChannel};
use super::connector::Delay;
use super::directory::ClusterNode;

/// A call observed by [`StaticPeer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    QuerySubscribe(SubscriptionQuery),
    QueryShareSubscribe(SubscriptionQuery),
    QueryConnect(String),
    DeliverMessage(RelayMessage),
}

/// A channel answering every call with a fixed outcome
pub struct StaticPeer {
    outcome: Result<QueryOutcome, RemoteError>,
    latency: Duration,
    connected: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
}

impl StaticPeer {
    fn with(outcome: Result<QueryOutcome, RemoteError>) -> Self {
        Self {
            outcome,
            latency: Duration::ZERO,
            connected: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn matching() -> Self {
        Self::with(Ok(QueryOutcome::ok()))
    }

    pub fn not_matching() -> Self {
        Self::with(Ok(QueryOutcome::not_found()))
    }

    pub fn share_count(count: i32) -> Self {
        let ret_code = if count > 0 { RET_OK } else { RET_NOT_FOUND };
        Self::with(Ok(QueryOutcome {
            ret_code,
            share_sub_count: count,
        }))
    }

    pub fn failing() -> Self {
        Self::with(Err(RemoteError::ConnectionLost("refused".to_string())))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Simulate the underlying connection dropping or coming back
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn into_channel(self) -> Arc<dyn PeerChannel> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    async fn answer(&self, call: RecordedCall) -> Result<QueryOutcome, RemoteError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let delivered = matches!(call, RecordedCall::DeliverMessage(_));
        self.calls.lock().push(call);
        match &self.outcome {
            // Deliveries are always acknowledged by a reachable peer
            Ok(_) if delivered => Ok(QueryOutcome::ok()),
            other => other.clone(),
        }
    }
}

#[async_trait]
impl PeerChannel for StaticPeer {
    async fn query_subscribe(
        &self,
        query: &SubscriptionQuery,
    ) -> Result<QueryOutcome, RemoteError> {
        self.answer(RecordedCall::QuerySubscribe(query.clone())).await
    }

    async fn query_share_subscribe(
        &self,
        query: &SubscriptionQuery,
    ) -> Result<QueryOutcome, RemoteError> {
        self.answer(RecordedCall::QueryShareSubscribe(query.clone()))
            .await
    }

    async fn query_connect(&self, client_id: &str) -> Result<QueryOutcome, RemoteError> {
        self.answer(RecordedCall::QueryConnect(client_id.to_string()))
            .await
    }

    async fn deliver_message(&self, message: &RelayMessage) -> Result<QueryOutcome, RemoteError> {
        self.answer(RecordedCall::DeliverMessage(message.clone()))
            .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Dialer failing a set number of times per node before succeeding
#[derive(Default)]
pub struct FlakyDialer {
    /// node id -> failures before success; absent means never succeed
    failures: HashMap<String, u32>,
    /// node ids whose dial never completes
    hanging: Vec<String>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl FlakyDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed_after(mut self, node_id: &str, failures: u32) -> Self {
        self.failures.insert(node_id.to_string(), failures);
        self
    }

    pub fn hang(mut self, node_id: &str) -> Self {
        self.hanging.push(node_id.to_string());
        self
    }

    pub fn attempts(&self, node_id: &str) -> u32 {
        self.attempts.lock().get(node_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Dialer for FlakyDialer {
    async fn dial(&self, node: &ClusterNode) -> Result<Arc<dyn PeerChannel>, RemoteError> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(node.node_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if self.hanging.contains(&node.node_id) {
            std::future::pending::<()>().await;
        }

        match self.failures.get(&node.node_id) {
            Some(&failures) if attempt > failures => Ok(StaticPeer::matching().into_channel()),
            _ => Err(RemoteError::ConnectionLost(format!(
                "{} refused connection",
                node.address
            ))),
        }
    }
}

/// Delay that records requested sleeps and returns immediately
#[derive(Default)]
pub struct RecordingDelay {
    slept: Mutex<Vec<Duration>>,
    count: AtomicU32,
}

impl RecordingDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Delay for RecordingDelay {
    async fn sleep(&self, duration: Duration) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.slept.lock().push(duration);
        tokio::task::yield_now().await;
    }
}
