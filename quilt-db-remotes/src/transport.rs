//! The pub/sub transport seam
//!
//! The remoting layer is written against this trait; any broker that offers
//! topic wildcards, retained messages, and last-will can carry a domain.
//! The in-memory broker in [`crate::broker`] implements it for tests and
//! single-process deployments.

use async_trait::async_trait;
use std::fmt::Debug;
use tokio::sync::mpsc;

use crate::error::Result;

/// A message delivered to a subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportMessage {
    /// The concrete topic it was published to
    pub topic: String,
    /// The payload; empty clears a retained record
    pub payload: Vec<u8>,
}

/// One clone's connection to the broker
///
/// Topic filters use MQTT-style wildcards: `+` matches one level, a
/// trailing `#` matches the rest.
#[async_trait]
pub trait PubSubTransport: Debug + Send + Sync {
    /// Publish a payload; `retain` keeps it for future subscribers
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;

    /// Subscribe to a topic filter
    ///
    /// Matching retained messages are delivered into the channel before
    /// this call returns, so election and presence reads are race-free.
    async fn subscribe(&self, filter: &str) -> Result<mpsc::UnboundedReceiver<TransportMessage>>;

    /// Register the message the broker publishes if this client vanishes
    async fn set_last_will(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;

    /// Disconnect; fires the last will
    async fn close(&self) -> Result<()>;
}

/// Does `topic` match an MQTT-style `filter`?
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
