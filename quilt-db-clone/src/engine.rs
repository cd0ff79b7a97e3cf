//! The clone engine
//!
//! [`CloneEngine`] orchestrates one replica of a domain: it owns the
//! dataset, the remoting client, and the causal clock, and drives the
//! bootstrap state machine (genesis, rev-up, snapshot). It answers peer
//! requests through the [`RemotesCallbacks`] seam it hands to `Remotes`,
//! so the dependency stays one-directional.
//!
//! Clock discipline: the clock mutex serializes every local transaction and
//! every remote application. A local write ticks once before its delta is
//! constructed; a remote delta merges then ticks for the application event;
//! a constraint repair ticks once more and is journaled and published
//! strictly after the delta that triggered it.

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use quilt_db_constraint::{build_constraint, Constraint, Unconstrained};
use quilt_db_core::{
    BlankIdSource, GraphUpdate, KvStore, Patch, StoreLock, Term, TreeClock, Triple,
};
use quilt_db_dataset::{
    DatasetOptions, DatasetStats, DeltaMessage, SnapshotBatch, SnapshotHeader, SuSetDataset,
};
use quilt_db_remotes::{
    OperationStream, PubSubTransport, Remotes, RemotesCallbacks, RemotesError, RemotesOptions,
    SnapshotAnswer,
};

use crate::config::CloneConfig;
use crate::error::{CloneError, Result};
use crate::json;

const BOOTSTRAP_ATTEMPTS: u32 = 4;
const REVUP_PAGE_SIZE: usize = 32;

/// Where the clone is in its lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloneStatus {
    /// Bootstrapping against the domain
    Starting,
    /// Live: accepting writes and exchanging deltas
    Online { genesis: bool },
    /// Closed; all operations fail
    Closed,
}

struct EngineInner {
    config: CloneConfig,
    base: String,
    vocab: String,
    dataset: Arc<SuSetDataset>,
    remotes: Arc<Remotes>,
    /// The clone's causal clock; None until bootstrap determines it
    clock: Mutex<Option<TreeClock>>,
    blanks: BlankIdSource,
    status: RwLock<CloneStatus>,
    /// Operations buffered while bootstrap is in flight
    buffered: SyncMutex<Option<Vec<JsonValue>>>,
    /// Published delta fan-out feeding snapshot update channels
    published: broadcast::Sender<JsonValue>,
    store_lock: SyncMutex<Option<StoreLock>>,
    closed: AtomicBool,
}

/// One replica of a shared domain
#[derive(Clone)]
pub struct CloneEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for CloneEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneEngine")
            .field("id", &self.inner.config.id)
            .field("domain", &self.inner.config.domain)
            .field("status", &self.status())
            .finish()
    }
}

impl CloneEngine {
    /// Start a clone: validate config, lock storage, elect or bootstrap,
    /// and go online
    ///
    /// Transport errors during bootstrap are fatal: the clone closes and
    /// the error is returned.
    pub async fn start(
        config: CloneConfig,
        store: Arc<dyn KvStore>,
        transport: Arc<dyn PubSubTransport>,
        data_dir: Option<&Path>,
    ) -> Result<Self> {
        config.validate()?;
        let store_lock = match data_dir {
            Some(dir) => Some(StoreLock::acquire(dir)?),
            None => None,
        };

        let constraint: Arc<dyn Constraint> = match &config.constraint {
            Some(spec) => build_constraint(spec, &config.vocab_iri()).map_err(|e| match e {
                quilt_db_constraint::ConstraintError::Config(msg) => CloneError::Config(msg),
                other => CloneError::Dataset(other.into()),
            })?,
            None => Arc::new(Unconstrained),
        };

        let dataset = Arc::new(
            SuSetDataset::open(
                store,
                constraint,
                DatasetOptions {
                    snapshot_batch_size: config.snapshot_batch_size,
                    ..DatasetOptions::default()
                },
            )
            .await?,
        );
        let remotes = Remotes::new(
            &config.id,
            &config.domain,
            transport,
            RemotesOptions {
                send_timeout: std::time::Duration::from_millis(config.send_timeout),
            },
        );

        let (published, _) = broadcast::channel(64);
        let inner = Arc::new(EngineInner {
            base: config.base_iri(),
            vocab: config.vocab_iri(),
            dataset,
            remotes,
            clock: Mutex::new(None),
            blanks: BlankIdSource::new(),
            status: RwLock::new(CloneStatus::Starting),
            buffered: SyncMutex::new(Some(Vec::new())),
            published,
            store_lock: SyncMutex::new(store_lock),
            closed: AtomicBool::new(false),
            config,
        });
        let engine = CloneEngine { inner };

        match engine.bootstrap().await {
            Ok(genesis) => {
                engine.inner.drain_buffered().await;
                *engine.inner.status.write() = CloneStatus::Online { genesis };
                tracing::info!(
                    id = %engine.inner.config.id,
                    genesis,
                    "clone online"
                );
                Ok(engine)
            }
            Err(e) => {
                tracing::error!(id = %engine.inner.config.id, error = %e, "bootstrap failed");
                engine.close().await;
                Err(e)
            }
        }
    }

    /// This clone's id
    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// Lifecycle status
    pub fn status(&self) -> CloneStatus {
        self.inner.status.read().clone()
    }

    /// The clone's current causal time
    pub async fn time(&self) -> Option<TreeClock> {
        self.inner.clock.lock().await.clone()
    }

    /// Subscribe to post-commit updates
    pub fn updates(&self) -> broadcast::Receiver<GraphUpdate> {
        self.inner.dataset.updates()
    }

    /// Write a triple-level patch
    pub async fn write(&self, patch: Patch) -> Result<()> {
        self.inner.ensure_online()?;
        self.inner.transact_local(patch).await
    }

    /// Insert one JSON subject (`{"@id": "fred", "name": "Fred"}`)
    pub async fn write_subject(&self, subject: &JsonValue) -> Result<()> {
        let triples =
            json::subject_to_triples(subject, &self.inner.base, &self.inner.vocab, &self.inner.blanks)?;
        self.write(Patch::insert(triples)).await
    }

    /// Delete one JSON subject's listed properties
    pub async fn delete_subject(&self, subject: &JsonValue) -> Result<()> {
        let triples =
            json::subject_to_triples(subject, &self.inner.base, &self.inner.vocab, &self.inner.blanks)?;
        self.write(Patch::delete(triples)).await
    }

    /// Read one subject as a compact JSON object
    pub async fn describe(&self, id: &str) -> Result<Option<JsonValue>> {
        self.inner.ensure_online()?;
        let subject = json::resolve_id(id, &self.inner.base);
        let triples = self.inner.dataset.view().about(&subject).await?;
        if triples.is_empty() {
            return Ok(None);
        }
        Ok(Some(json::triples_to_subject(
            &subject,
            &triples,
            &self.inner.base,
            &self.inner.vocab,
        )))
    }

    /// All triples of a subject (the triple-level read surface)
    pub async fn about(&self, subject: &Term) -> Result<Vec<Triple>> {
        self.inner.ensure_online()?;
        Ok(self.inner.dataset.view().about(subject).await?)
    }

    /// Dataset counters for diagnostics and tests
    pub async fn stats(&self) -> Result<DatasetStats> {
        Ok(self.inner.dataset.stats().await?)
    }

    /// Re-validate the journal hash chain
    pub async fn verify_journal(&self) -> Result<()> {
        Ok(self.inner.dataset.verify_journal().await?)
    }

    /// Close the clone: cancel requests, complete update streams, close the
    /// transport and the store, release the storage lock. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    async fn bootstrap(&self) -> Result<bool> {
        let inner = &self.inner;
        let callbacks: Arc<dyn RemotesCallbacks> = Arc::new(EngineCallbacks {
            inner: inner.clone(),
        });

        if let Some(time) = inner.dataset.current_time() {
            // Restart with local state: rejoin and catch up.
            inner.remotes.announce().await?;
            inner.remotes.start(callbacks.clone()).await?;
            *inner.clock.lock().await = Some(time.clone());
            inner.catch_up(time).await?;
            return Ok(false);
        }

        if inner.config.genesis {
            // Declared genesis: no peer consultation.
            inner.remotes.announce().await?;
            let time = TreeClock::genesis();
            inner.dataset.initialize(&time).await?;
            *inner.clock.lock().await = Some(time);
            inner.remotes.start(callbacks.clone()).await?;
            return Ok(true);
        }

        if inner.remotes.elect_genesis().await? {
            let time = TreeClock::genesis();
            inner.dataset.initialize(&time).await?;
            *inner.clock.lock().await = Some(time);
            inner.remotes.start(callbacks.clone()).await?;
            return Ok(true);
        }

        // Fresh clone on an existing domain: get an identity, then the data.
        inner.remotes.start(callbacks.clone()).await?;
        let remotes = inner.remotes.clone();
        let forked = inner
            .with_retries("new clock", || {
                let remotes = remotes.clone();
                async move { remotes.new_clock().await }
            })
            .await?;
        inner.adopt_snapshot(forked).await?;
        Ok(false)
    }
}

impl EngineInner {
    fn ensure_online(&self) -> Result<()> {
        match &*self.status.read() {
            CloneStatus::Closed => Err(CloneError::Closed),
            _ => Ok(()),
        }
    }

    /// One local transaction: tick, transact, publish in journal order
    async fn transact_local(&self, patch: Patch) -> Result<()> {
        let mut clock = self.clock.lock().await;
        let current = clock.clone().ok_or(CloneError::Closed)?;
        let time = current.tick();
        let (message, ()) = self
            .dataset
            .transact(&time, move |_view| async move { Ok((patch, ())) })
            .await?;
        if let Some(message) = message {
            *clock = Some(time);
            self.publish_delta(&message).await?;
        }
        Ok(())
    }

    async fn publish_delta(&self, message: &DeltaMessage) -> Result<()> {
        let json = message.to_json()?;
        let _ = self.published.send(json.clone());
        self.remotes.publish_operation(json).await?;
        Ok(())
    }

    /// An operation arrived on the broadcast topic
    async fn handle_operation(&self, data: JsonValue) {
        {
            let mut buffered = self.buffered.lock();
            if let Some(queue) = buffered.as_mut() {
                queue.push(data);
                return;
            }
        }
        if let Err(e) = self.apply_operation(data).await {
            match &e {
                CloneError::Dataset(quilt_db_dataset::DatasetError::BadUpdate(_)) => {
                    // Protocol divergence is fatal for the receiver.
                    tracing::error!(error = %e, "bad update received; closing clone");
                    self.close().await;
                }
                _ => tracing::warn!(error = %e, "failed to apply operation"),
            }
        }
    }

    /// Apply one remote delta under the clock mutex
    async fn apply_operation(&self, data: JsonValue) -> Result<()> {
        let message = DeltaMessage::from_json(&data)?;
        let mut clock = self.clock.lock().await;
        let Some(current) = clock.clone() else {
            return Ok(());
        };
        if current.same_identity(&message.time) {
            tracing::debug!(tid = %message.tid, "refusing self-echo delta");
            return Ok(());
        }
        let merged = current.merge(&message.time);
        let arrival = merged.tick();
        let repair_time = arrival.tick();
        let outcome = self.dataset.apply(&message, &arrival, &repair_time).await?;
        if !outcome.applied {
            // Duplicate: no journal entry, but causal knowledge advances.
            *clock = Some(merged);
        } else if let Some(repair) = outcome.repair {
            *clock = Some(repair_time);
            self.publish_delta(&repair).await?;
        } else {
            *clock = Some(arrival);
        }
        Ok(())
    }

    /// Restart catch-up: rev-up from our journal time, snapshot fallback
    async fn catch_up(&self, time: TreeClock) -> Result<()> {
        let remotes = self.remotes.clone();
        let revup_time = time.clone();
        let attempt = self
            .with_retries("rev-up", || {
                let remotes = remotes.clone();
                let time = revup_time.clone();
                async move { remotes.revup(&time).await }
            })
            .await;
        match attempt {
            Ok(Some(mut stream)) => {
                let mut count = 0usize;
                while let Some(value) = stream.next().await.map_err(CloneError::from)? {
                    self.apply_operation(value).await?;
                    count += 1;
                }
                tracing::info!(operations = count, "rev-up complete");
                Ok(())
            }
            Ok(None) => {
                tracing::info!("peer cannot rev-up us; falling back to snapshot");
                self.adopt_snapshot(time).await
            }
            Err(CloneError::Remotes(RemotesError::NoneVisible)) => {
                // Alone in the domain; nothing to catch up from.
                tracing::info!("no peers visible; continuing from local state");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Adopt a full snapshot from any peer, continuing as `identity`
    async fn adopt_snapshot(&self, identity: TreeClock) -> Result<()> {
        let remotes = self.remotes.clone();
        let mut incoming = self
            .with_retries("snapshot", || {
                let remotes = remotes.clone();
                async move { remotes.snapshot().await }
            })
            .await?;

        let local = identity.merge(&incoming.last_time).tick();
        let header = SnapshotHeader {
            last_time: incoming.last_time.clone(),
            last_hash: incoming.last_hash.clone(),
        };
        self.dataset.reset_to_snapshot(&header, &local).await?;
        *self.clock.lock().await = Some(local);

        let mut batches = 0usize;
        while let Some(value) = incoming.data.next().await.map_err(CloneError::from)? {
            let batch: SnapshotBatch = serde_json::from_value(value)
                .map_err(|e| CloneError::bootstrap(format!("bad snapshot batch: {}", e)))?;
            self.dataset.apply_snapshot_batch(batch).await?;
            batches += 1;
        }
        tracing::info!(batches, "snapshot adopted");

        // Operations committed at the producer during the transfer.
        while let Some(value) = incoming.updates.next().await.map_err(CloneError::from)? {
            self.apply_operation(value).await?;
        }
        Ok(())
    }

    /// Drain operations buffered during bootstrap, then go live
    async fn drain_buffered(&self) {
        loop {
            let batch = {
                let mut buffered = self.buffered.lock();
                let queue = buffered.take().unwrap_or_default();
                if queue.is_empty() {
                    // Leave None: operations now apply directly.
                    break;
                }
                *buffered = Some(Vec::new());
                queue
            };
            for data in batch {
                if let Err(e) = self.apply_operation(data).await {
                    tracing::warn!(error = %e, "failed to apply buffered operation");
                }
            }
        }
    }

    /// Bounded retries over transient request failures
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = quilt_db_remotes::Result<T>>,
    {
        let mut attempts = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e @ RemotesError::SendTimeout(_)) if attempts < BOOTSTRAP_ATTEMPTS => {
                    attempts += 1;
                    tracing::warn!(what, attempt = attempts, error = %e, "retrying request");
                }
                Err(RemotesError::NoneVisible) if attempts < BOOTSTRAP_ATTEMPTS => {
                    attempts += 1;
                    let wait = std::time::Duration::from_millis(self.config.send_timeout);
                    let _ = tokio::time::timeout(wait, self.remotes.presence_change()).await;
                }
                Err(e) => {
                    tracing::warn!(what, error = %e, "request failed");
                    return Err(CloneError::Remotes(e));
                }
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.status.write() = CloneStatus::Closed;
        // Teardown runs detached: closing the remotes aborts the dispatch
        // tasks, and close may have been invoked from one of them.
        let remotes = self.remotes.clone();
        let dataset = self.dataset.clone();
        let store_lock = self.store_lock.lock().take();
        let id = self.config.id.clone();
        let teardown = tokio::spawn(async move {
            if let Err(e) = remotes.close().await {
                tracing::warn!(error = %e, "remotes close failed");
            }
            if let Err(e) = dataset.close().await {
                tracing::warn!(error = %e, "dataset close failed");
            }
            if let Some(lock) = store_lock {
                lock.release();
            }
            tracing::info!(id = %id, "clone closed");
        });
        let _ = teardown.await;
    }
}

/// The engine's answers to peer requests
struct EngineCallbacks {
    inner: Arc<EngineInner>,
}

#[async_trait]
impl RemotesCallbacks for EngineCallbacks {
    async fn on_operation(&self, data: JsonValue) {
        self.inner.handle_operation(data).await;
    }

    async fn answer_new_clock(&self) -> quilt_db_remotes::Result<TreeClock> {
        let mut clock = self.inner.clock.lock().await;
        let current = clock
            .clone()
            .ok_or_else(|| RemotesError::transport("clone not online"))?;
        let (ours, theirs) = current.fork();
        // Our identity narrows; persist it before handing out the half.
        self.inner
            .dataset
            .save_time(&ours)
            .await
            .map_err(|e| RemotesError::transport(e.to_string()))?;
        *clock = Some(ours);
        tracing::info!("forked clock for a joiner");
        Ok(theirs)
    }

    async fn answer_snapshot(&self) -> quilt_db_remotes::Result<SnapshotAnswer> {
        let mut producer = self
            .inner
            .dataset
            .take_snapshot()
            .await
            .map_err(|e| RemotesError::transport(e.to_string()))?;
        let header = producer.header().clone();

        let (batch_tx, batches) = mpsc::channel(4);
        let (done_tx, done_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            while let Some(batch) = producer.next_batch() {
                let value = match serde_json::to_value(&batch) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(error = %e, "unencodable snapshot batch");
                        break;
                    }
                };
                if batch_tx.send(value).await.is_err() {
                    break;
                }
            }
            let _ = done_tx.send(());
        });

        // Deltas published while the transfer runs flow to the updates
        // channel so the requester misses nothing.
        let (update_tx, updates) = mpsc::channel(16);
        let mut publishes = self.inner.published.subscribe();
        tokio::spawn(async move {
            let mut done_rx = done_rx;
            loop {
                tokio::select! {
                    _ = &mut done_rx => break,
                    received = publishes.recv() => match received {
                        Ok(value) => {
                            if update_tx.send(value).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "snapshot update forwarding lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(SnapshotAnswer {
            last_time: header.last_time,
            last_hash: header.last_hash,
            batches,
            updates,
        })
    }

    async fn answer_revup(
        &self,
        time: TreeClock,
    ) -> quilt_db_remotes::Result<Option<OperationStream>> {
        let start = match self.inner.dataset.revup_start(&time).await {
            Ok(start) => start,
            Err(quilt_db_dataset::DatasetError::CannotRevup) => return Ok(None),
            Err(e) => return Err(RemotesError::transport(e.to_string())),
        };
        let (tx, rx) = mpsc::channel(16);
        let dataset = self.inner.dataset.clone();
        tokio::spawn(async move {
            let mut from = start;
            loop {
                match dataset.operations_page(from, &time, REVUP_PAGE_SIZE).await {
                    Ok((entries, next)) => {
                        for entry in entries {
                            if tx.send(entry.delta).await.is_err() {
                                return;
                            }
                        }
                        match next {
                            Some(tick) => from = tick,
                            None => return,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "rev-up paging failed");
                        return;
                    }
                }
            }
        });
        Ok(Some(rx))
    }
}
