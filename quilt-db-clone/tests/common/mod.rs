//! Shared harness for clone scenario tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use quilt_db_clone::{CloneConfig, CloneEngine};
use quilt_db_core::MemoryKvStore;
use quilt_db_remotes::{MemoryBroker, PubSubTransport, Result, TransportMessage};

pub const DOMAIN: &str = "test.quilt.db";

static LOG_INIT: std::sync::Once = std::sync::Once::new();

/// Honor `RUST_LOG` in scenario tests
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll a condition until it holds or a deadline passes
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Start a clone over a fresh store on the shared broker
pub async fn start_clone(broker: &MemoryBroker, config: CloneConfig) -> CloneEngine {
    init_logging();
    let client = broker.client(config.id.clone());
    CloneEngine::start(config, Arc::new(MemoryKvStore::new()), Arc::new(client), None)
        .await
        .expect("clone starts")
}

/// A transport decorator that can hold back operations-topic publishes
///
/// Everything else (presence, send/reply, streamed channels) passes
/// through, so clones stay responsive while their deltas are in flight.
/// Used to stage genuinely concurrent writes.
#[derive(Debug, Clone)]
pub struct GatedTransport {
    inner: Arc<dyn PubSubTransport>,
    held: Arc<Mutex<Option<Vec<(String, Vec<u8>, bool)>>>>,
}

impl GatedTransport {
    pub fn new(inner: Arc<dyn PubSubTransport>) -> Self {
        Self {
            inner,
            held: Arc::new(Mutex::new(None)),
        }
    }

    /// Start holding back operation publishes
    pub fn hold(&self) {
        *self.held.lock() = Some(Vec::new());
    }

    /// Release everything held, in publish order
    pub async fn release(&self) {
        let queued = self.held.lock().take().unwrap_or_default();
        for (topic, payload, retain) in queued {
            self.inner
                .publish(&topic, payload, retain)
                .await
                .expect("release publish");
        }
    }
}

#[async_trait]
impl PubSubTransport for GatedTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        if topic.ends_with("/operations") {
            let mut held = self.held.lock();
            if let Some(queue) = held.as_mut() {
                queue.push((topic.to_string(), payload, retain));
                return Ok(());
            }
        }
        self.inner.publish(topic, payload, retain).await
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::UnboundedReceiver<TransportMessage>> {
        self.inner.subscribe(filter).await
    }

    async fn set_last_will(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.inner.set_last_will(topic, payload, retain).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Start a clone behind a gate on its outbound deltas
pub async fn start_gated(
    broker: &MemoryBroker,
    config: CloneConfig,
) -> (CloneEngine, GatedTransport) {
    init_logging();
    let gate = GatedTransport::new(Arc::new(broker.client(config.id.clone())));
    let engine = CloneEngine::start(
        config,
        Arc::new(MemoryKvStore::new()),
        Arc::new(gate.clone()),
        None,
    )
    .await
    .expect("clone starts");
    (engine, gate)
}

/// The subject object `{"@id": id, property: value}`
pub fn subject(id: &str, property: &str, value: JsonValue) -> JsonValue {
    serde_json::json!({ "@id": id, property: value })
}
