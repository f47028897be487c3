//! In-memory local collaborators

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::protocol::QoS;
use crate::topic::{parse_shared_subscription, topic_matches_filter, validate_topic_filter};

use super::{
    ClientHandle, ClientRegistry, IndexError, MatchedSubscriber, PublishPipeline,
    SubscriptionIndex,
};

#[derive(Debug, Clone)]
struct LocalSubscription {
    client_id: Arc<str>,
    qos: QoS,
}

/// Subscription index keyed by the filter as subscribed, `$share/` prefix included
#[derive(Default)]
pub struct MemorySubscriptions {
    filters: DashMap<String, Vec<LocalSubscription>>,
}

impl MemorySubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a client's subscription to `filter`
    pub fn subscribe(&self, filter: &str, client_id: &str, qos: QoS) -> Result<(), IndexError> {
        validate_topic_filter(filter).map_err(|e| IndexError(e.to_string()))?;

        let mut subs = self.filters.entry(filter.to_string()).or_default();
        subs.retain(|s| &*s.client_id != client_id);
        subs.push(LocalSubscription {
            client_id: Arc::from(client_id),
            qos,
        });
        Ok(())
    }

    /// Remove a client's subscription, returning whether it existed
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let removed = match self.filters.get_mut(filter) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|s| &*s.client_id != client_id);
                subs.len() != before
            }
            None => false,
        };
        self.filters.remove_if(filter, |_, subs| subs.is_empty());
        removed
    }

    /// Total number of subscriptions
    pub fn len(&self) -> usize {
        self.filters.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SubscriptionIndex for MemorySubscriptions {
    fn matches(&self, topic: &str, qos: QoS) -> Result<Vec<MatchedSubscriber>, IndexError> {
        let mut matched = Vec::new();

        for entry in self.filters.iter() {
            let (filter, is_shared) = match parse_shared_subscription(entry.key()) {
                Some((_, filter)) => (filter, true),
                None => (entry.key().as_str(), false),
            };
            if !topic_matches_filter(topic, filter) {
                continue;
            }

            matched.extend(entry.value().iter().map(|sub| MatchedSubscriber {
                qos: sub.qos.min(qos),
                is_shared,
            }));
        }

        Ok(matched)
    }
}

/// A client connection tracked by [`MemoryClients`]
pub struct MemoryClient {
    client_id: String,
    closed: AtomicBool,
}

impl MemoryClient {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ClientHandle for MemoryClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Client '{}' closed by cluster request", self.client_id);
        }
    }
}

/// Client registry holding live connections by client id
#[derive(Default)]
pub struct MemoryClients {
    clients: DashMap<String, Arc<MemoryClient>>,
}

impl MemoryClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live connection, replacing any previous one for the id
    pub fn connect(&self, client_id: &str) -> Arc<MemoryClient> {
        let client = Arc::new(MemoryClient {
            client_id: client_id.to_string(),
            closed: AtomicBool::new(false),
        });
        self.clients.insert(client_id.to_string(), client.clone());
        client
    }

    /// Number of live (not closed) connections
    pub fn live_count(&self) -> usize {
        self.clients.iter().filter(|c| !c.value().is_closed()).count()
    }
}

impl ClientRegistry for MemoryClients {
    fn find(&self, client_id: &str) -> Option<Arc<dyn ClientHandle>> {
        let client = self.clients.get(client_id)?;
        if client.is_closed() {
            return None;
        }
        Some(client.value().clone() as Arc<dyn ClientHandle>)
    }
}

/// A publish handed to [`LocalDelivery`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
    /// Number of local subscribers the publish matched
    pub subscribers: usize,
}

/// Publish pipeline that fans out to the local index only
pub struct LocalDelivery {
    index: Arc<dyn SubscriptionIndex>,
    delivered: Mutex<Vec<DeliveredMessage>>,
}

impl LocalDelivery {
    pub fn new(index: Arc<dyn SubscriptionIndex>) -> Self {
        Self {
            index,
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Everything delivered so far, oldest first
    pub fn delivered(&self) -> Vec<DeliveredMessage> {
        self.delivered.lock().clone()
    }
}

impl PublishPipeline for LocalDelivery {
    fn deliver(&self, topic: &str, payload: Bytes, retain: bool) {
        let subscribers = self
            .index
            .matches(topic, QoS::AtMostOnce)
            .map(|m| m.len())
            .unwrap_or(0);

        debug!(
            "Local delivery: '{}' ({} bytes) to {} subscribers",
            topic,
            payload.len(),
            subscribers
        );

        self.delivered.lock().push(DeliveredMessage {
            topic: topic.to_string(),
            payload,
            retain,
            subscribers,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriptions_match_and_share_flag() {
        let subs = MemorySubscriptions::new();
        subs.subscribe("sensor/+", "c1", QoS::AtLeastOnce).unwrap();
        subs.subscribe("$share/g1/sensor/#", "c2", QoS::AtLeastOnce)
            .unwrap();
        subs.subscribe("other/#", "c3", QoS::AtMostOnce).unwrap();

        let mut matched = subs.matches("sensor/temp", QoS::AtLeastOnce).unwrap();
        matched.sort_by_key(|m| m.is_shared);
        assert_eq!(
            matched,
            vec![
                MatchedSubscriber {
                    qos: QoS::AtLeastOnce,
                    is_shared: false
                },
                MatchedSubscriber {
                    qos: QoS::AtLeastOnce,
                    is_shared: true
                },
            ]
        );

        assert!(subs.matches("nothing/here", QoS::AtMostOnce).unwrap().is_empty());
    }

    #[test]
    fn test_granted_qos_is_minimum() {
        let subs = MemorySubscriptions::new();
        subs.subscribe("a", "c1", QoS::AtMostOnce).unwrap();

        let matched = subs.matches("a", QoS::AtLeastOnce).unwrap();
        assert_eq!(matched[0].qos, QoS::AtMostOnce);
    }

    #[test]
    fn test_resubscribe_replaces_and_unsubscribe() {
        let subs = MemorySubscriptions::new();
        subs.subscribe("a/b", "c1", QoS::AtMostOnce).unwrap();
        subs.subscribe("a/b", "c1", QoS::AtLeastOnce).unwrap();
        assert_eq!(subs.len(), 1);

        assert!(subs.unsubscribe("a/b", "c1"));
        assert!(!subs.unsubscribe("a/b", "c1"));
        assert!(subs.is_empty());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let subs = MemorySubscriptions::new();
        assert!(subs.subscribe("a/#/b", "c1", QoS::AtMostOnce).is_err());
    }

    #[test]
    fn test_clients_close() {
        let clients = MemoryClients::new();
        let client = clients.connect("c1");
        assert_eq!(clients.live_count(), 1);

        let handle = clients.find("c1").expect("client should be live");
        assert_eq!(handle.client_id(), "c1");
        handle.close();

        assert!(client.is_closed());
        assert!(clients.find("c1").is_none());
        assert_eq!(clients.live_count(), 0);
    }

    #[test]
    fn test_local_delivery_records() {
        let subs = Arc::new(MemorySubscriptions::new());
        subs.subscribe("a/+", "c1", QoS::AtMostOnce).unwrap();
        let delivery = LocalDelivery::new(subs);

        delivery.deliver("a/b", Bytes::from_static(b"hi"), false);

        let delivered = delivery.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].topic, "a/b");
        assert_eq!(delivered[0].payload, Bytes::from_static(b"hi"));
        assert!(!delivered[0].retain);
        assert_eq!(delivered[0].subscribers, 1);
    }
}
