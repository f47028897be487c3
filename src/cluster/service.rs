//! Inbound Cluster Service
//!
//! Answers the four remote operations on behalf of this node's local state.
//! Rejections (qos out of range, no subscriber, index failure) are response
//! codes, never errors.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error};

use crate::local::{ClientRegistry, MatchedSubscriber, PublishPipeline, SubscriptionIndex};
use crate::protocol::{QueryOutcome, RelayMessage, SubscriptionQuery, RET_NOT_FOUND, RET_OK};

use super::protocol::{RpcRequest, RpcResponse};

/// Handlers backing the RPC listener
pub struct ClusterService {
    subscriptions: Arc<dyn SubscriptionIndex>,
    clients: Arc<dyn ClientRegistry>,
    pipeline: Arc<dyn PublishPipeline>,
}

impl ClusterService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionIndex>,
        clients: Arc<dyn ClientRegistry>,
        pipeline: Arc<dyn PublishPipeline>,
    ) -> Self {
        Self {
            subscriptions,
            clients,
            pipeline,
        }
    }

    /// Look up local subscribers, or `None` when the query must be rejected
    fn lookup(&self, query: &SubscriptionQuery) -> Option<Vec<MatchedSubscriber>> {
        let qos = query.valid_qos()?;
        match self.subscriptions.matches(&query.topic, qos) {
            Ok(subs) => Some(subs),
            Err(e) => {
                error!("Search subscribers for '{}' failed: {}", query.topic, e);
                None
            }
        }
    }

    /// `retCode = 0` when at least one local subscriber matches
    pub fn query_subscribe(&self, query: &SubscriptionQuery) -> QueryOutcome {
        match self.lookup(query) {
            Some(subs) if !subs.is_empty() => QueryOutcome::ok(),
            _ => QueryOutcome::not_found(),
        }
    }

    /// Like [`query_subscribe`](Self::query_subscribe), plus the number of
    /// matched subscribers that are shared subscriptions
    pub fn query_share_subscribe(&self, query: &SubscriptionQuery) -> QueryOutcome {
        let Some(subs) = self.lookup(query) else {
            return QueryOutcome::not_found();
        };

        let ret_code = if subs.is_empty() { RET_NOT_FOUND } else { RET_OK };
        let share_sub_count = subs.iter().filter(|s| s.is_shared).count() as i32;
        QueryOutcome {
            ret_code,
            share_sub_count,
        }
    }

    /// Close the client's local connection if there is one. Always succeeds.
    pub fn query_connect(&self, client_id: &str) -> QueryOutcome {
        match self.clients.find(client_id) {
            Some(client) => {
                debug!("Closing client '{}' on cluster request", client.client_id());
                client.close();
            }
            None => debug!("QueryConnect: no local client '{}'", client_id),
        }
        QueryOutcome::ok()
    }

    /// Deliver a relayed publish to local subscribers only, as a non-retained publish
    pub fn deliver_message(&self, message: RelayMessage) -> QueryOutcome {
        debug!(
            "Delivering relayed publish '{}' ({} bytes)",
            message.topic,
            message.payload.len()
        );
        self.pipeline.deliver(&message.topic, message.payload, false);
        QueryOutcome::ok()
    }

    /// Dispatch a wire request to its handler
    pub fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::QuerySubscribe { topic, qos } => {
                let outcome = self.query_subscribe(&SubscriptionQuery { topic, qos });
                RpcResponse::Response {
                    ret_code: outcome.ret_code,
                }
            }
            RpcRequest::QueryShareSubscribe { topic, qos } => {
                let outcome = self.query_share_subscribe(&SubscriptionQuery { topic, qos });
                RpcResponse::ShareSubscribe {
                    ret_code: outcome.ret_code,
                    share_sub_count: outcome.share_sub_count,
                }
            }
            RpcRequest::QueryConnect { client_id } => RpcResponse::Response {
                ret_code: self.query_connect(&client_id).ret_code,
            },
            RpcRequest::DeliverMessage { topic, payload } => RpcResponse::Response {
                ret_code: self
                    .deliver_message(RelayMessage {
                        topic,
                        payload: Bytes::from(payload),
                    })
                    .ret_code,
            },
        }
    }
}
