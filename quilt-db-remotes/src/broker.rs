//! In-memory pub/sub broker
//!
//! A single-process broker carrying one or more domains: retained messages,
//! wildcard subscriptions, and per-client last-wills. Delivery is FIFO per
//! publisher under one broker lock, which is what makes the retained-hello
//! genesis election race-free in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{RemotesError, Result};
use crate::transport::{topic_matches, PubSubTransport, TransportMessage};

struct Subscription {
    client: String,
    filter: String,
    sender: mpsc::UnboundedSender<TransportMessage>,
}

#[derive(Default)]
struct BrokerState {
    subscriptions: Vec<Subscription>,
    retained: HashMap<String, Vec<u8>>,
    last_wills: HashMap<String, (String, Vec<u8>, bool)>,
}

/// The shared broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("subscriptions", &state.subscriptions.len())
            .field("retained", &state.retained.len())
            .finish()
    }
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client
    pub fn client(&self, client_id: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            client_id: client_id.into(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) {
        let mut state = self.state.lock();
        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.clone());
            }
        }
        let message = TransportMessage {
            topic: topic.to_string(),
            payload,
        };
        state.subscriptions.retain(|sub| {
            if !topic_matches(&sub.filter, topic) {
                return true;
            }
            // A dead receiver prunes its subscription.
            sub.sender.send(message.clone()).is_ok()
        });
    }

    fn subscribe(
        &self,
        client: &str,
        filter: &str,
    ) -> mpsc::UnboundedReceiver<TransportMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        // Retained messages are delivered before the subscription is live,
        // under the same lock as any concurrent publish.
        for (topic, payload) in &state.retained {
            if topic_matches(filter, topic) {
                let _ = sender.send(TransportMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                });
            }
        }
        state.subscriptions.push(Subscription {
            client: client.to_string(),
            filter: filter.to_string(),
            sender,
        });
        receiver
    }

    fn disconnect(&self, client: &str) {
        let will = {
            let mut state = self.state.lock();
            state.subscriptions.retain(|sub| sub.client != client);
            state.last_wills.remove(client)
        };
        if let Some((topic, payload, retain)) = will {
            tracing::debug!(client, topic = %topic, "firing last will");
            self.publish(&topic, payload, retain);
        }
    }
}

/// One client's handle on the broker
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: String,
    closed: Arc<AtomicBool>,
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("client_id", &self.client_id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryTransport {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemotesError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.check_open()?;
        self.broker.publish(topic, payload, retain);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::UnboundedReceiver<TransportMessage>> {
        self.check_open()?;
        Ok(self.broker.subscribe(&self.client_id, filter))
    }

    async fn set_last_will(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.check_open()?;
        self.broker
            .state
            .lock()
            .last_wills
            .insert(self.client_id.clone(), (topic.to_string(), payload, retain));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.broker.disconnect(&self.client_id);
        Ok(())
    }
}
