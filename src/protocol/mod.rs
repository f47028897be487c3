//! Cluster query and relay value types
//!
//! Defines the values exchanged between broker nodes: subscription queries,
//! query outcomes, relayed messages and the share-subscription tally.

use std::collections::HashMap;

use bytes::Bytes;

/// Response code for "at least one matching subscriber" / success
pub const RET_OK: i32 = 0;

/// Response code for "no match or error"
pub const RET_NOT_FOUND: i32 = 404;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// A "do you have a subscriber for this topic?" request.
///
/// The qos is kept as the raw wire value. Anything above 1 is carried to the
/// answering node, which rejects it there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionQuery {
    pub topic: String,
    pub qos: u8,
}

impl SubscriptionQuery {
    pub fn new(topic: impl Into<String>, qos: u8) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }

    /// The QoS to match with, or `None` when the query is out of range (qos > 1)
    pub fn valid_qos(&self) -> Option<QoS> {
        QoS::from_u8(self.qos).filter(|qos| *qos <= QoS::AtLeastOnce)
    }
}

/// Answer to a subscription query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryOutcome {
    pub ret_code: i32,
    pub share_sub_count: i32,
}

impl QueryOutcome {
    pub fn ok() -> Self {
        Self {
            ret_code: RET_OK,
            share_sub_count: 0,
        }
    }

    pub fn not_found() -> Self {
        Self {
            ret_code: RET_NOT_FOUND,
            share_sub_count: 0,
        }
    }

    /// Whether the peer reported at least one matching subscriber
    pub fn is_match(&self) -> bool {
        self.ret_code == RET_OK
    }
}

/// A publish forwarded to another node.
///
/// Retain and duplicate flags are deliberately absent: the receiving node
/// always treats the copy as a fresh, non-retained publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl RelayMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Node id -> shared subscriber count, only for nodes reporting a count above zero
pub type ClusterTally = HashMap<String, i32>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_qos() {
        assert_eq!(SubscriptionQuery::new("a", 0).valid_qos(), Some(QoS::AtMostOnce));
        assert_eq!(SubscriptionQuery::new("a", 1).valid_qos(), Some(QoS::AtLeastOnce));
        assert_eq!(SubscriptionQuery::new("a", 2).valid_qos(), None);
        assert_eq!(SubscriptionQuery::new("a", 3).valid_qos(), None);
    }

    #[test]
    fn test_outcome_is_match() {
        assert!(QueryOutcome::ok().is_match());
        assert!(!QueryOutcome::not_found().is_match());
        let other = QueryOutcome {
            ret_code: 500,
            share_sub_count: 3,
        };
        assert!(!other.is_match());
    }

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from_u8(1), Some(QoS::AtLeastOnce));
        assert_eq!(QoS::from_u8(3), None);
    }
}
