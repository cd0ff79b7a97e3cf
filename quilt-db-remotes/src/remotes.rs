//! The pub/sub remoting client
//!
//! [`Remotes`] connects one clone to its domain: genesis election over the
//! retained registry hello, presence tracking, the operations broadcast
//! with echo suppression, request/reply over unicast topics, and streamed
//! channels for snapshot and rev-up transfer.
//!
//! The engine supplies a [`RemotesCallbacks`] implementation; `Remotes`
//! holds it behind `Arc<dyn _>` and never reaches back into the engine
//! otherwise, keeping the dependency one-directional.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use quilt_db_core::TreeClock;

use crate::error::{RemotesError, Result};
use crate::messages::{
    decode, encode, ControlRequest, ControlResponse, HelloRecord, OperationEnvelope,
    PresenceRecord, ReplyEnvelope, StreamMessage,
};
use crate::topics;
use crate::transport::{PubSubTransport, TransportMessage};

/// Default request deadline
pub const SEND_TIMEOUT_DEFAULT_MS: u64 = 2000;

/// Tunables for the remoting client
#[derive(Clone, Debug)]
pub struct RemotesOptions {
    /// Deadline for one request/reply round trip
    pub send_timeout: Duration,
}

impl Default for RemotesOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(SEND_TIMEOUT_DEFAULT_MS),
        }
    }
}

/// A snapshot answer from the engine: metadata plus two producer channels
pub struct SnapshotAnswer {
    pub last_time: TreeClock,
    pub last_hash: String,
    /// Snapshot batches, in order
    pub batches: mpsc::Receiver<JsonValue>,
    /// Operations committed while the transfer runs
    pub updates: mpsc::Receiver<JsonValue>,
}

/// An ordered stream of journaled operations for rev-up
pub type OperationStream = mpsc::Receiver<JsonValue>;

/// What the engine answers remote requests with
#[async_trait]
pub trait RemotesCallbacks: Send + Sync {
    /// An operation arrived on the broadcast topic (echo already suppressed)
    async fn on_operation(&self, data: JsonValue);

    /// Fork this clone's clock for a joiner
    async fn answer_new_clock(&self) -> Result<TreeClock>;

    /// Capture a snapshot for a joiner
    async fn answer_snapshot(&self) -> Result<SnapshotAnswer>;

    /// Operations the requester missed since `time`; `None` when rev-up is
    /// impossible from there
    async fn answer_revup(&self, time: TreeClock) -> Result<Option<OperationStream>>;
}

/// An incoming streamed channel
pub struct StreamReceiver {
    receiver: mpsc::UnboundedReceiver<TransportMessage>,
}

impl StreamReceiver {
    /// The next streamed value; `None` when the producer completed
    pub async fn next(&mut self) -> Result<Option<JsonValue>> {
        match self.receiver.recv().await {
            None => Err(RemotesError::transport("stream channel dropped")),
            Some(message) => match decode::<StreamMessage>(&message.payload)? {
                StreamMessage::Next { value } => Ok(Some(value)),
                StreamMessage::Complete => Ok(None),
                StreamMessage::Error { message } => Err(RemotesError::peer(message)),
            },
        }
    }
}

/// An incoming snapshot transfer
pub struct SnapshotIncoming {
    pub last_time: TreeClock,
    pub last_hash: String,
    pub data: StreamReceiver,
    pub updates: StreamReceiver,
}

type ReplySlot = oneshot::Sender<(topics::ReplyAddress, ReplyEnvelope)>;

/// The per-clone remoting client
pub struct Remotes {
    id: String,
    domain: String,
    transport: Arc<dyn PubSubTransport>,
    options: RemotesOptions,
    replies: Arc<Mutex<HashMap<String, ReplySlot>>>,
    recently_sent_to: Mutex<HashSet<String>>,
    presence: Arc<RwLock<HashMap<String, PresenceRecord>>>,
    presence_changed: Arc<Notify>,
    address_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Debug for Remotes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remotes")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("present", &self.present())
            .finish()
    }
}

impl Remotes {
    /// Create a client for a clone on a domain
    pub fn new(
        id: impl Into<String>,
        domain: impl Into<String>,
        transport: Arc<dyn PubSubTransport>,
        options: RemotesOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            domain: domain.into(),
            transport,
            options,
            replies: Arc::new(Mutex::new(HashMap::new())),
            recently_sent_to: Mutex::new(HashSet::new()),
            presence: Arc::new(RwLock::new(HashMap::new())),
            presence_changed: Arc::new(Notify::new()),
            address_locks: Mutex::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// This clone's id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Genesis election: observe the retained registry hello
    ///
    /// Returns true when no other clone's hello is retained, in which case
    /// our own hello is published (retained) and we are the domain genesis.
    /// The retained-message guarantee makes the read race-free: retained
    /// records are delivered before `subscribe` returns.
    pub async fn elect_genesis(&self) -> Result<bool> {
        let registry = topics::registry(&self.domain);
        let mut sub = self.transport.subscribe(&registry).await?;
        while let Ok(message) = sub.try_recv() {
            if message.payload.is_empty() {
                continue;
            }
            let hello: HelloRecord = decode(&message.payload)?;
            if hello.id != self.id {
                tracing::info!(first = %hello.id, "domain already has a genesis hello");
                return Ok(false);
            }
        }
        self.announce().await?;
        tracing::info!(id = %self.id, "published genesis hello");
        Ok(true)
    }

    /// Publish our retained hello unconditionally
    ///
    /// Used by a configured genesis, which skips the election, and on
    /// reconnect; repeated hellos from the same id are idempotent.
    pub async fn announce(&self) -> Result<()> {
        self.transport
            .publish(
                &topics::registry(&self.domain),
                encode(&HelloRecord { id: self.id.clone() })?,
                true,
            )
            .await
    }

    /// Go live: presence, dispatch loops, and the operations subscription
    pub async fn start(self: &Arc<Self>, callbacks: Arc<dyn RemotesCallbacks>) -> Result<()> {
        let presence_topic = topics::presence(&self.domain, &self.id);
        // The broker clears our presence if we vanish.
        self.transport
            .set_last_will(&presence_topic, Vec::new(), true)
            .await?;

        let presence_sub = self
            .transport
            .subscribe(&topics::presence_filter(&self.domain))
            .await?;
        let reply_sub = self.transport.subscribe(&topics::reply_filter(&self.id)).await?;
        let send_sub = self.transport.subscribe(&topics::send_filter(&self.id)).await?;
        let ops_sub = self
            .transport
            .subscribe(&topics::operations(&self.domain))
            .await?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Self::presence_loop(self.clone(), presence_sub)));
        tasks.push(tokio::spawn(Self::reply_loop(self.clone(), reply_sub)));
        tasks.push(tokio::spawn(Self::send_loop(
            self.clone(),
            callbacks.clone(),
            send_sub,
        )));
        tasks.push(tokio::spawn(Self::operations_loop(
            self.clone(),
            callbacks,
            ops_sub,
        )));
        drop(tasks);

        let record = PresenceRecord {
            client_id: self.id.clone(),
            address: topics::presence(&self.domain, &self.id),
        };
        self.transport
            .publish(&presence_topic, encode(&record)?, true)
            .await?;
        tracing::info!(id = %self.id, domain = %self.domain, "remotes online");
        Ok(())
    }

    /// Broadcast one operation in journal order
    pub async fn publish_operation(&self, data: JsonValue) -> Result<()> {
        let envelope = OperationEnvelope {
            from: self.id.clone(),
            data,
        };
        self.transport
            .publish(&topics::operations(&self.domain), encode(&envelope)?, false)
            .await
    }

    /// Currently present peers (excluding ourselves)
    pub fn present(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .presence
            .read()
            .keys()
            .filter(|id| *id != &self.id)
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    /// Wait until the presence set changes
    pub async fn presence_change(&self) {
        self.presence_changed.notified().await;
    }

    /// Ask any peer to fork its clock for us
    pub async fn new_clock(&self) -> Result<TreeClock> {
        let (peer, _reply, envelope) = self.send_request(&ControlRequest::NewClock).await?;
        match envelope.body {
            Some(ControlResponse::NewClock { clock }) => {
                tracing::info!(peer = %peer, "received forked clock");
                Ok(clock)
            }
            Some(ControlResponse::Error { message }) => Err(RemotesError::peer(message)),
            other => Err(RemotesError::bad_message(format!(
                "unexpected new-clock reply: {:?}",
                other
            ))),
        }
    }

    /// Ask any peer for the operations we missed since `time`
    ///
    /// `Ok(None)` means the chosen peer cannot rev-up us; the caller falls
    /// back to a snapshot (or retries against another peer).
    pub async fn revup(&self, time: &TreeClock) -> Result<Option<StreamReceiver>> {
        let request = ControlRequest::Revup { time: time.clone() };
        let (peer, reply, envelope) = self.send_request(&request).await?;
        match envelope.body {
            Some(ControlResponse::RevupAccept { updates_address }) => {
                let receiver = self.open_stream(&updates_address).await?;
                self.send_ack(&peer, &reply.message_id).await?;
                tracing::info!(peer = %peer, "rev-up stream open");
                Ok(Some(receiver))
            }
            Some(ControlResponse::RevupReject) => Ok(None),
            Some(ControlResponse::Error { message }) => Err(RemotesError::peer(message)),
            other => Err(RemotesError::bad_message(format!(
                "unexpected revup reply: {:?}",
                other
            ))),
        }
    }

    /// Ask any peer for a full snapshot
    pub async fn snapshot(&self) -> Result<SnapshotIncoming> {
        let (peer, reply, envelope) = self.send_request(&ControlRequest::Snapshot).await?;
        match envelope.body {
            Some(ControlResponse::Snapshot {
                last_time,
                last_hash,
                data_address,
                updates_address,
            }) => {
                let data = self.open_stream(&data_address).await?;
                let updates = self.open_stream(&updates_address).await?;
                self.send_ack(&peer, &reply.message_id).await?;
                tracing::info!(peer = %peer, "snapshot streams open");
                Ok(SnapshotIncoming {
                    last_time,
                    last_hash,
                    data,
                    updates,
                })
            }
            Some(ControlResponse::Error { message }) => Err(RemotesError::peer(message)),
            other => Err(RemotesError::bad_message(format!(
                "unexpected snapshot reply: {:?}",
                other
            ))),
        }
    }

    /// Disconnect: cancel in-flight requests, clear presence, close transport
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Pending requesters observe Closed via their dropped slots.
        self.replies.lock().clear();
        let _ = self
            .transport
            .publish(&topics::presence(&self.domain, &self.id), Vec::new(), true)
            .await;
        self.transport.close().await?;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!(id = %self.id, "remotes closed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Requester internals
    // ------------------------------------------------------------------

    fn pick_peer(&self) -> Result<String> {
        let present = self.present();
        if present.is_empty() {
            return Err(RemotesError::NoneVisible);
        }
        let mut recent = self.recently_sent_to.lock();
        let peer = match present.iter().find(|p| !recent.contains(*p)) {
            Some(peer) => peer.clone(),
            None => {
                // Every peer has been tried; start the rotation over.
                recent.clear();
                present[0].clone()
            }
        };
        recent.insert(peer.clone());
        Ok(peer)
    }

    async fn send_request(
        &self,
        request: &ControlRequest,
    ) -> Result<(String, topics::ReplyAddress, ReplyEnvelope)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemotesError::Closed);
        }
        let peer = self.pick_peer()?;
        let message_id = Uuid::new_v4().to_string();
        let receiver = self.register_reply(&message_id);
        let topic = topics::send(&peer, &self.id, &message_id, "control");
        self.transport
            .publish(&topic, encode(request)?, false)
            .await?;
        tracing::debug!(peer = %peer, message_id = %message_id, "request sent");
        self.await_reply(&message_id, receiver)
            .await
            .map(|(reply, envelope)| (peer, reply, envelope))
    }

    fn register_reply(&self, message_id: &str) -> oneshot::Receiver<(topics::ReplyAddress, ReplyEnvelope)> {
        let (sender, receiver) = oneshot::channel();
        self.replies.lock().insert(message_id.to_string(), sender);
        receiver
    }

    async fn await_reply(
        &self,
        message_id: &str,
        receiver: oneshot::Receiver<(topics::ReplyAddress, ReplyEnvelope)>,
    ) -> Result<(topics::ReplyAddress, ReplyEnvelope)> {
        match tokio::time::timeout(self.options.send_timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                if self.closed.load(Ordering::Acquire) {
                    Err(RemotesError::Closed)
                } else {
                    Err(RemotesError::transport("reply slot dropped"))
                }
            }
            Err(_) => {
                // Late replies find no slot and are dropped.
                self.replies.lock().remove(message_id);
                Err(RemotesError::SendTimeout(
                    self.options.send_timeout.as_millis() as u64,
                ))
            }
        }
    }

    async fn send_ack(&self, to: &str, their_message_id: &str) -> Result<()> {
        let topic = topics::reply(to, &self.id, &Uuid::new_v4().to_string(), their_message_id);
        self.transport
            .publish(&topic, encode(&ReplyEnvelope::ack())?, false)
            .await
    }

    async fn open_stream(&self, address: &str) -> Result<StreamReceiver> {
        Ok(StreamReceiver {
            receiver: self.transport.subscribe(address).await?,
        })
    }

    // ------------------------------------------------------------------
    // Responder internals
    // ------------------------------------------------------------------

    fn stream_sender(self: &Arc<Self>, address: &str) -> StreamSender {
        let lock = self
            .address_locks
            .lock()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        StreamSender {
            transport: self.transport.clone(),
            address: address.to_string(),
            lock,
        }
    }

    async fn presence_loop(
        this: Arc<Self>,
        mut sub: mpsc::UnboundedReceiver<TransportMessage>,
    ) {
        while let Some(message) = sub.recv().await {
            let id = message.topic.rsplit('/').next().unwrap_or_default().to_string();
            if message.payload.is_empty() {
                if this.presence.write().remove(&id).is_some() {
                    tracing::debug!(peer = %id, "peer departed");
                }
            } else {
                match decode::<PresenceRecord>(&message.payload) {
                    Ok(record) => {
                        this.presence.write().insert(id, record);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable presence record");
                        continue;
                    }
                }
            }
            this.presence_changed.notify_waiters();
        }
    }

    async fn reply_loop(this: Arc<Self>, mut sub: mpsc::UnboundedReceiver<TransportMessage>) {
        while let Some(message) = sub.recv().await {
            let Ok(address) = topics::ReplyAddress::parse(&message.topic) else {
                continue;
            };
            let Ok(envelope) = decode::<ReplyEnvelope>(&message.payload) else {
                tracing::warn!(topic = %message.topic, "undecodable reply");
                continue;
            };
            let slot = this.replies.lock().remove(&address.sent_message_id);
            match slot {
                Some(sender) => {
                    let _ = sender.send((address, envelope));
                }
                None => {
                    tracing::debug!(topic = %message.topic, "late reply dropped");
                }
            }
        }
    }

    async fn operations_loop(
        this: Arc<Self>,
        callbacks: Arc<dyn RemotesCallbacks>,
        mut sub: mpsc::UnboundedReceiver<TransportMessage>,
    ) {
        while let Some(message) = sub.recv().await {
            let envelope = match decode::<OperationEnvelope>(&message.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable operation");
                    continue;
                }
            };
            if envelope.from == this.id {
                continue;
            }
            callbacks.on_operation(envelope.data).await;
        }
    }

    async fn send_loop(
        this: Arc<Self>,
        callbacks: Arc<dyn RemotesCallbacks>,
        mut sub: mpsc::UnboundedReceiver<TransportMessage>,
    ) {
        while let Some(message) = sub.recv().await {
            let Ok(address) = topics::SendAddress::parse(&message.topic) else {
                tracing::warn!(topic = %message.topic, "malformed request topic");
                continue;
            };
            let request = match decode::<ControlRequest>(&message.payload) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable request");
                    continue;
                }
            };
            // Each request is served on its own task so a streaming
            // transfer never blocks the dispatch loop.
            let this = this.clone();
            let callbacks = callbacks.clone();
            tokio::spawn(async move {
                this.handle_request(callbacks, address, request).await;
            });
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        callbacks: Arc<dyn RemotesCallbacks>,
        address: topics::SendAddress,
        request: ControlRequest,
    ) {
        tracing::debug!(from = %address.from, request = ?request, "handling request");
        match request {
            ControlRequest::NewClock => {
                let body = match callbacks.answer_new_clock().await {
                    Ok(clock) => ControlResponse::NewClock { clock },
                    Err(e) => ControlResponse::Error {
                        message: e.to_string(),
                    },
                };
                let _ = self.send_reply(&address, ReplyEnvelope::body(body, false)).await;
            }
            ControlRequest::Revup { time } => match callbacks.answer_revup(time).await {
                Ok(Some(operations)) => {
                    let updates_address = topics::sub_address(&self.domain);
                    let body = ControlResponse::RevupAccept {
                        updates_address: updates_address.clone(),
                    };
                    if let Ok(true) = self
                        .reply_and_await_ack(&address, ReplyEnvelope::body(body, true))
                        .await
                    {
                        let sender = self.stream_sender(&updates_address);
                        sender.pump(operations).await;
                    }
                }
                Ok(None) => {
                    let _ = self
                        .send_reply(&address, ReplyEnvelope::body(ControlResponse::RevupReject, false))
                        .await;
                }
                Err(e) => {
                    let body = ControlResponse::Error {
                        message: e.to_string(),
                    };
                    let _ = self.send_reply(&address, ReplyEnvelope::body(body, false)).await;
                }
            },
            ControlRequest::Snapshot => match callbacks.answer_snapshot().await {
                Ok(answer) => {
                    let data_address = topics::sub_address(&self.domain);
                    let updates_address = topics::sub_address(&self.domain);
                    let body = ControlResponse::Snapshot {
                        last_time: answer.last_time.clone(),
                        last_hash: answer.last_hash.clone(),
                        data_address: data_address.clone(),
                        updates_address: updates_address.clone(),
                    };
                    if let Ok(true) = self
                        .reply_and_await_ack(&address, ReplyEnvelope::body(body, true))
                        .await
                    {
                        let updates_sender = self.stream_sender(&updates_address);
                        let updates_task =
                            tokio::spawn(async move { updates_sender.pump(answer.updates).await });
                        let data_sender = self.stream_sender(&data_address);
                        data_sender.pump(answer.batches).await;
                        let _ = updates_task.await;
                    }
                }
                Err(e) => {
                    let body = ControlResponse::Error {
                        message: e.to_string(),
                    };
                    let _ = self.send_reply(&address, ReplyEnvelope::body(body, false)).await;
                }
            },
        }
    }

    async fn send_reply(&self, to: &topics::SendAddress, envelope: ReplyEnvelope) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        let topic = topics::reply(&to.from, &self.id, &message_id, &to.message_id);
        self.transport
            .publish(&topic, encode(&envelope)?, false)
            .await?;
        Ok(message_id)
    }

    /// Reply expecting an ack; true when the ack arrived in time
    async fn reply_and_await_ack(
        &self,
        to: &topics::SendAddress,
        envelope: ReplyEnvelope,
    ) -> Result<bool> {
        let message_id = Uuid::new_v4().to_string();
        let receiver = self.register_reply(&message_id);
        let topic = topics::reply(&to.from, &self.id, &message_id, &to.message_id);
        self.transport
            .publish(&topic, encode(&envelope)?, false)
            .await?;
        match self.await_reply(&message_id, receiver).await {
            Ok(_) => Ok(true),
            Err(RemotesError::SendTimeout(_)) => {
                tracing::warn!(to = %to.from, "requester never acked; dropping stream");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Emits `next*/complete/error` on one sub-channel address, serialized by a
/// per-address FIFO lock so subscribers observe strict order
pub struct StreamSender {
    transport: Arc<dyn PubSubTransport>,
    address: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl StreamSender {
    /// Emit one value
    pub async fn next(&self, value: JsonValue) -> Result<()> {
        self.emit(StreamMessage::Next { value }).await
    }

    /// Emit the completion sentinel
    pub async fn complete(&self) -> Result<()> {
        self.emit(StreamMessage::Complete).await
    }

    /// Emit the error sentinel
    pub async fn error(&self, message: impl Into<String>) -> Result<()> {
        self.emit(StreamMessage::Error {
            message: message.into(),
        })
        .await
    }

    /// Drain a channel into the address, then complete
    pub async fn pump(&self, mut source: mpsc::Receiver<JsonValue>) {
        while let Some(value) = source.recv().await {
            if self.next(value).await.is_err() {
                return;
            }
        }
        let _ = self.complete().await;
    }

    async fn emit(&self, message: StreamMessage) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.transport
            .publish(&self.address, encode(&message)?, false)
            .await
    }
}
