//! The SU-SET dataset
//!
//! [`SuSetDataset`] is the convergence heart of a clone: a transactional
//! quad store whose every change is expressed as a delta that commutes with
//! every concurrent delta. Assertions carry the asserting transaction's TID
//! in the TID index; retractions name the TIDs they cancel, so concurrent
//! re-assertions survive a retraction that never saw them.
//!
//! All mutation happens under one FIFO transaction lock and commits as a
//! single atomic KV batch (quads + TID index + journal). Update
//! notifications are emitted strictly after commit, in transaction order.

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use quilt_db_constraint::Constraint;
use quilt_db_core::{
    GraphReader, GraphUpdate, KvBatch, KvStore, Patch, Term, Tid, TreeClock, Triple,
};

use crate::delta::{DeltaMessage, EncodedDelta, ReifiedDelete};
use crate::error::{DatasetError, Result};
use crate::journal::{EntryWalker, Journal, JournalEntry, JournalState};
use crate::keys;
use crate::snapshot::{SnapshotBatch, SnapshotHeader, SnapshotProducer, SnapshotQuad};
use crate::tid_index::TidIndex;

/// Default number of quads per streamed snapshot batch
pub const SNAPSHOT_BATCH_SIZE_DEFAULT: usize = 10;

/// Tunables for a dataset
#[derive(Clone, Debug)]
pub struct DatasetOptions {
    /// Quads per streamed snapshot batch
    pub snapshot_batch_size: usize,
    /// Buffered update notifications per subscriber
    pub update_buffer: usize,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            snapshot_batch_size: SNAPSHOT_BATCH_SIZE_DEFAULT,
            update_buffer: 64,
        }
    }
}

/// Outcome of applying a remote delta
#[derive(Debug)]
pub struct ApplyOutcome {
    /// False when the delta was a duplicate (known TID) and was discarded
    pub applied: bool,
    /// A constraint repair to publish, journaled after the applied delta
    pub repair: Option<DeltaMessage>,
}

/// Read-only view over the data graph
#[derive(Clone)]
pub struct DatasetView {
    store: Arc<dyn KvStore>,
}

impl DatasetView {
    fn decode(bytes: &[u8]) -> Result<Triple> {
        serde_json::from_slice(bytes)
            .map_err(|e| DatasetError::journal(format!("corrupt data quad: {}", e)))
    }

    /// Every triple about a subject
    pub async fn about(&self, subject: &Term) -> Result<Vec<Triple>> {
        let entries = self
            .store
            .scan_prefix(&keys::data_s_prefix(subject))
            .await?;
        let mut triples = Vec::with_capacity(entries.len());
        for (_, bytes) in entries {
            triples.push(Self::decode(&bytes)?);
        }
        triples.sort();
        Ok(triples)
    }
}

#[async_trait]
impl GraphReader for DatasetView {
    async fn values(
        &self,
        subject: &Term,
        predicate: &Term,
    ) -> quilt_db_core::Result<Vec<Term>> {
        let entries = self
            .store
            .scan_prefix(&keys::data_sp_prefix(subject, predicate))
            .await?;
        let mut values = Vec::with_capacity(entries.len());
        for (_, bytes) in entries {
            let triple = Self::decode(&bytes).map_err(dataset_to_core)?;
            values.push(triple.o);
        }
        Ok(values)
    }
}

fn dataset_to_core(e: DatasetError) -> quilt_db_core::Error {
    match e {
        DatasetError::Core(core) => core,
        other => quilt_db_core::Error::storage(other.to_string()),
    }
}

/// Point-in-time counts for logging and tests
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetStats {
    pub quads: usize,
    pub tid_mappings: usize,
    pub all_tids: usize,
    pub journal_entries: usize,
}

/// The transactional, convergent quad store
pub struct SuSetDataset {
    store: Arc<dyn KvStore>,
    journal: Journal,
    tids: TidIndex,
    constraint: Arc<dyn Constraint>,
    txn_lock: Mutex<()>,
    updates_tx: broadcast::Sender<GraphUpdate>,
    options: DatasetOptions,
}

impl std::fmt::Debug for SuSetDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuSetDataset")
            .field("journal", &self.journal)
            .field("constraint", &self.constraint)
            .finish()
    }
}

impl SuSetDataset {
    /// Open a dataset over a store
    pub async fn open(
        store: Arc<dyn KvStore>,
        constraint: Arc<dyn Constraint>,
        options: DatasetOptions,
    ) -> Result<Self> {
        let journal = Journal::load(store.clone()).await?;
        let (updates_tx, _) = broadcast::channel(options.update_buffer);
        Ok(Self {
            tids: TidIndex::new(store.clone()),
            store,
            journal,
            constraint,
            txn_lock: Mutex::new(()),
            updates_tx,
            options,
        })
    }

    /// Write the first journal entry if the store is fresh
    pub async fn initialize(&self, time: &TreeClock) -> Result<()> {
        let _guard = self.txn_lock.lock().await;
        if self.journal.state().is_some() {
            return Ok(());
        }
        let mut batch = KvBatch::new();
        let state = self.journal.stage_initialize(&mut batch, time)?;
        self.store.apply(batch).await?;
        self.journal.commit(state);
        tracing::info!(ticks = time.ticks(), "journal initialized");
        Ok(())
    }

    /// Subscribe to post-commit update notifications
    pub fn updates(&self) -> broadcast::Receiver<GraphUpdate> {
        self.updates_tx.subscribe()
    }

    /// The clone's current causal time
    pub fn current_time(&self) -> Option<TreeClock> {
        self.journal.current_time()
    }

    /// A read view over the committed data graph
    pub fn view(&self) -> DatasetView {
        DatasetView {
            store: self.store.clone(),
        }
    }

    /// Run one local transaction
    ///
    /// `time` is the freshly ticked clock for this transaction. `prepare`
    /// runs under the transaction lock against a consistent read view and
    /// yields the patch plus a caller value; any error inside it discards
    /// the patch. An empty patch commits nothing and yields no delta.
    pub async fn transact<F, Fut, V>(
        &self,
        time: &TreeClock,
        prepare: F,
    ) -> Result<(Option<DeltaMessage>, V)>
    where
        F: FnOnce(DatasetView) -> Fut + Send,
        Fut: std::future::Future<Output = Result<(Patch, V)>> + Send,
        V: Send,
    {
        let _guard = self.txn_lock.lock().await;
        let view = self.view();
        let (mut patch, value) = prepare(view.clone()).await?;
        dedup_triples(&mut patch.inserts);
        dedup_triples(&mut patch.deletes);
        if patch.is_empty() {
            return Ok((None, value));
        }

        // Pre-constraint update over the caller's patch as given.
        let update = GraphUpdate::new(time.ticks(), &patch.inserts, &patch.deletes);
        self.constraint.check(&update, &view).await?;

        let state = self.require_state()?;
        let mut batch = KvBatch::new();
        let tid = Tid::mint();

        // Retractions tombstone every TID currently asserting the triple.
        let mut reified = Vec::new();
        let mut actual_deletes = Vec::new();
        for triple in &patch.deletes {
            let ours = self.tids.tids_of(&triple.id()).await?;
            if ours.is_empty() {
                continue;
            }
            self.tids.stage_remove_tids(&mut batch, &triple.id(), &ours);
            batch.delete(keys::data_key(triple));
            reified.push(ReifiedDelete::new(triple.clone(), ours));
            actual_deletes.push(triple.clone());
        }

        for triple in &patch.inserts {
            self.stage_insert(&mut batch, triple, &tid)?;
        }
        self.tids.stage_add_all(&mut batch, &tid);

        let message = DeltaMessage::new(
            tid,
            time.clone(),
            EncodedDelta::new(patch.inserts.clone(), reified),
        );
        let (_entry, next) =
            self.journal
                .stage_append(&mut batch, &state, message.to_json()?, time, None)?;

        self.store.apply(batch).await?;
        self.journal.commit(next);

        tracing::debug!(
            tid = %message.tid,
            tick = time.ticks(),
            inserts = patch.inserts.len(),
            deletes = actual_deletes.len(),
            "local transaction committed"
        );
        self.notify(GraphUpdate::new(
            time.ticks(),
            &patch.inserts,
            &actual_deletes,
        ));
        Ok((Some(message), value))
    }

    /// Apply a remote delta
    ///
    /// `arrival_time` journals the delta (the caller's clock merged with the
    /// message time, then ticked). `repair_time` journals a constraint
    /// repair, if one is produced; the caller advances its clock to
    /// `repair_time` only when the outcome carries a repair.
    pub async fn apply(
        &self,
        message: &DeltaMessage,
        arrival_time: &TreeClock,
        repair_time: &TreeClock,
    ) -> Result<ApplyOutcome> {
        let _guard = self.txn_lock.lock().await;

        if self.tids.knows_tid(&message.tid).await? {
            tracing::debug!(tid = %message.tid, "duplicate delta discarded");
            return Ok(ApplyOutcome {
                applied: false,
                repair: None,
            });
        }

        let view = self.view();
        let state = self.require_state()?;
        let mut batch = KvBatch::new();

        let mut inserts = message.delta.inserts.clone();
        dedup_triples(&mut inserts);

        // Merge retractions: remove only the TIDs both sides know; the
        // triple itself goes when its last TID goes.
        let mut actual_deletes = Vec::new();
        for del in &message.delta.deletes {
            let id = del.triple.id();
            let ours = self.tids.tids_of(&id).await?;
            if ours.is_empty() {
                continue;
            }
            let theirs: FxHashSet<Tid> = del.tids.iter().copied().collect();
            let to_remove: Vec<Tid> = ours.iter().copied().filter(|t| theirs.contains(t)).collect();
            if to_remove.is_empty() {
                continue;
            }
            self.tids.stage_remove_tids(&mut batch, &id, &to_remove);
            if to_remove.len() == ours.len() {
                batch.delete(keys::data_key(&del.triple));
                actual_deletes.push(del.triple.clone());
            }
        }
        self.tids.stage_add_all(&mut batch, &message.tid);

        // Let the constraint see the decided update against committed state.
        let update = GraphUpdate::new(arrival_time.ticks(), &inserts, &actual_deletes);
        let repair = self.constraint.apply(&update, &view).await?;

        let outcome = match repair {
            None => {
                for triple in &inserts {
                    self.stage_insert(&mut batch, triple, &message.tid)?;
                }
                let (_entry, next) = self.journal.stage_append(
                    &mut batch,
                    &state,
                    message.to_json()?,
                    arrival_time,
                    Some(&message.time),
                )?;
                self.store.apply(batch).await?;
                self.journal.commit(next);
                self.notify(GraphUpdate::new(
                    arrival_time.ticks(),
                    &inserts,
                    &actual_deletes,
                ));
                ApplyOutcome {
                    applied: true,
                    repair: None,
                }
            }
            Some(repair) => {
                // The repair is a nested local transaction at `repair_time`.
                let repair_tid = Tid::mint();
                let repaired: FxHashSet<Triple> = repair.deletes.iter().cloned().collect();

                // Repair-deleted triples the remote delta was inserting never
                // touch the data graph; their tombstone carries the remote
                // delta's TID so replicas that did insert them catch up.
                let mut surviving = Vec::new();
                for triple in inserts.iter() {
                    if !repaired.contains(triple) {
                        surviving.push(triple.clone());
                    }
                }
                for triple in &surviving {
                    self.stage_insert(&mut batch, triple, &message.tid)?;
                }

                // Each repair-deleted triple tombstones every TID that would
                // otherwise assert it: its pre-existing ones plus the remote
                // delta's, when the delta was (re-)inserting it.
                let mut repair_reified = Vec::new();
                let mut repair_deletes = Vec::new();
                let mut repaired_sorted: Vec<&Triple> = repaired.iter().collect();
                repaired_sorted.sort();
                for triple in repaired_sorted {
                    let mut tombstoned = self.tids.tids_of(&triple.id()).await?;
                    if !tombstoned.is_empty() {
                        self.tids
                            .stage_remove_tids(&mut batch, &triple.id(), &tombstoned);
                        batch.delete(keys::data_key(triple));
                        repair_deletes.push(triple.clone());
                    }
                    if inserts.contains(triple) {
                        tombstoned.push(message.tid);
                    }
                    if tombstoned.is_empty() {
                        continue;
                    }
                    repair_reified.push(ReifiedDelete::new(triple.clone(), tombstoned));
                }
                for triple in &repair.inserts {
                    self.stage_insert(&mut batch, triple, &repair_tid)?;
                }
                self.tids.stage_add_all(&mut batch, &repair_tid);

                let repair_message = DeltaMessage::new(
                    repair_tid,
                    repair_time.clone(),
                    EncodedDelta::new(repair.inserts.clone(), repair_reified),
                );

                // The applied remote first, its repair immediately after.
                let (_e1, mid) = self.journal.stage_append(
                    &mut batch,
                    &state,
                    message.to_json()?,
                    arrival_time,
                    Some(&message.time),
                )?;
                let (_e2, next) = self.journal.stage_append(
                    &mut batch,
                    &mid,
                    repair_message.to_json()?,
                    repair_time,
                    None,
                )?;
                self.store.apply(batch).await?;
                self.journal.commit(next);

                tracing::info!(
                    tid = %message.tid,
                    repair_tid = %repair_message.tid,
                    "remote delta repaired by constraint"
                );
                self.notify(GraphUpdate::new(
                    arrival_time.ticks(),
                    &surviving,
                    &actual_deletes,
                ));
                self.notify(GraphUpdate::new(
                    repair_time.ticks(),
                    &repair.inserts,
                    &repair_deletes,
                ));
                ApplyOutcome {
                    applied: true,
                    repair: Some(repair_message),
                }
            }
        };

        tracing::debug!(
            tid = %message.tid,
            tick = arrival_time.ticks(),
            "remote delta applied"
        );
        Ok(outcome)
    }

    /// Capture a snapshot at the current journal tail
    ///
    /// The read set is materialized under the transaction lock; the
    /// returned producer then streams bounded batches lock-free.
    pub async fn take_snapshot(&self) -> Result<SnapshotProducer> {
        let _guard = self.txn_lock.lock().await;
        let state = self.require_state()?;

        let mut all_tids = Vec::new();
        for (key, _) in self.store.scan_prefix(keys::ALL_TIDS_PREFIX).await? {
            let suffix = &key[keys::ALL_TIDS_PREFIX.len()..];
            if let Ok(tid) = Tid::parse(suffix) {
                all_tids.push(tid);
            }
        }

        let mut quads = Vec::new();
        for (_, bytes) in self.store.scan_prefix(keys::DATA_PREFIX).await? {
            let triple = DatasetView::decode(&bytes)?;
            let tids = self.tids.tids_of(&triple.id()).await?;
            quads.push(SnapshotQuad { triple, tids });
        }

        tracing::info!(
            quads = quads.len(),
            tids = all_tids.len(),
            tick = state.tail_tick,
            "snapshot captured"
        );
        Ok(SnapshotProducer::new(
            SnapshotHeader {
                last_time: state.time,
                last_hash: state.last_hash,
            },
            all_tids,
            quads,
            self.options.snapshot_batch_size,
        ))
    }

    /// Truncate local state and reset the journal to an adopted snapshot
    /// tail; batches then arrive via [`SuSetDataset::apply_snapshot_batch`]
    pub async fn reset_to_snapshot(
        &self,
        header: &SnapshotHeader,
        local_time: &TreeClock,
    ) -> Result<()> {
        let _guard = self.txn_lock.lock().await;
        self.store.clear().await?;
        let mut batch = KvBatch::new();
        let state =
            self.journal
                .stage_reset(&mut batch, &header.last_time, &header.last_hash, local_time)?;
        self.store.apply(batch).await?;
        self.journal.commit(state);
        tracing::info!(tick = local_time.ticks(), "journal reset to snapshot tail");
        Ok(())
    }

    /// Apply one received snapshot batch
    pub async fn apply_snapshot_batch(&self, batch_in: SnapshotBatch) -> Result<()> {
        let _guard = self.txn_lock.lock().await;
        let mut batch = KvBatch::new();
        match batch_in {
            SnapshotBatch::Tids { tids } => {
                for tid in &tids {
                    self.tids.stage_add_all(&mut batch, tid);
                }
            }
            SnapshotBatch::Quads { quads } => {
                for SnapshotQuad { triple, tids } in &quads {
                    batch.put(
                        keys::data_key(triple),
                        serde_json::to_vec(triple).map_err(quilt_db_core::Error::from)?,
                    );
                    for tid in tids {
                        self.tids.stage_add_triple(&mut batch, &triple.id(), tid);
                    }
                }
            }
        }
        self.store.apply(batch).await?;
        Ok(())
    }

    /// Journal entries a requester at `time` has not seen, from its last
    /// known tick of this clone forward
    ///
    /// Fails with [`DatasetError::CannotRevup`] when the requester has never
    /// seen this clone (or diverged in shape); the caller falls back to a
    /// snapshot.
    pub async fn operations_since(&self, time: &TreeClock) -> Result<EntryWalker<'_>> {
        let _guard = self.txn_lock.lock().await;
        let current = self
            .journal
            .current_time()
            .ok_or_else(|| DatasetError::journal("journal not initialized"))?;
        let ticks = time.get_ticks(&current).ok_or(DatasetError::CannotRevup)?;
        Ok(self.journal.entries_from(ticks + 1, Some(time.clone())))
    }

    /// Persist a clock change that has no event to journal (identity fork)
    pub async fn save_time(&self, time: &TreeClock) -> Result<()> {
        let _guard = self.txn_lock.lock().await;
        let state = self.require_state()?;
        let mut batch = KvBatch::new();
        let next = self.journal.stage_time(&mut batch, &state, time)?;
        self.store.apply(batch).await?;
        self.journal.commit(next);
        Ok(())
    }

    /// The first journal tick a rev-up for `time` starts from
    ///
    /// Fails with [`DatasetError::CannotRevup`] on a divergent shape, like
    /// [`SuSetDataset::operations_since`].
    pub async fn revup_start(&self, time: &TreeClock) -> Result<u64> {
        let _guard = self.txn_lock.lock().await;
        let current = self
            .journal
            .current_time()
            .ok_or_else(|| DatasetError::journal("journal not initialized"))?;
        let ticks = time.get_ticks(&current).ok_or(DatasetError::CannotRevup)?;
        Ok(ticks + 1)
    }

    /// One bounded, restartable page of journal entries from `from_tick`
    /// that a requester at `after` has not seen
    ///
    /// Returns the page and the tick to resume from, or `None` past the
    /// tail. Entries are immutable, so pages need no lock.
    pub async fn operations_page(
        &self,
        from_tick: u64,
        after: &TreeClock,
        limit: usize,
    ) -> Result<(Vec<JournalEntry>, Option<u64>)> {
        use quilt_db_core::CompareMode;
        let tail = self.journal.state().map(|s| s.tail_tick).unwrap_or(0);
        let mut entries = Vec::new();
        let mut tick = from_tick;
        while tick <= tail && entries.len() < limit {
            if let Some(entry) = self.journal.find_entry_by_ticks(tick).await? {
                if !entry.delta.is_null()
                    && after.any_lt(&entry.local_time, CompareMode::IncludeIds)
                {
                    entries.push(entry);
                }
            }
            tick += 1;
        }
        let next = if tick <= tail { Some(tick) } else { None };
        Ok((entries, next))
    }

    /// Re-validate the journal hash chain
    pub async fn verify_journal(&self) -> Result<()> {
        self.journal.verify_chain().await
    }

    /// Point-in-time counts
    pub async fn stats(&self) -> Result<DatasetStats> {
        Ok(DatasetStats {
            quads: self.store.scan_prefix(keys::DATA_PREFIX).await?.len(),
            tid_mappings: self.store.scan_prefix(keys::TIDS_PREFIX).await?.len(),
            all_tids: self.store.scan_prefix(keys::ALL_TIDS_PREFIX).await?.len(),
            journal_entries: self.store.scan_prefix(keys::ENTRY_PREFIX).await?.len(),
        })
    }

    /// Close the underlying store
    pub async fn close(&self) -> Result<()> {
        self.store.close().await?;
        Ok(())
    }

    fn stage_insert(&self, batch: &mut KvBatch, triple: &Triple, tid: &Tid) -> Result<()> {
        batch.put(
            keys::data_key(triple),
            serde_json::to_vec(triple).map_err(quilt_db_core::Error::from)?,
        );
        self.tids.stage_add_triple(batch, &triple.id(), tid);
        Ok(())
    }

    fn require_state(&self) -> Result<JournalState> {
        self.journal
            .state()
            .ok_or_else(|| DatasetError::journal("journal not initialized"))
    }

    fn notify(&self, update: GraphUpdate) {
        if update.is_empty() {
            return;
        }
        // No subscribers is fine.
        let _ = self.updates_tx.send(update);
    }
}

fn dedup_triples(triples: &mut Vec<Triple>) {
    triples.sort();
    triples.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilt_db_constraint::{SingleValued, Unconstrained};
    use quilt_db_core::MemoryKvStore;

    const NAME: &str = "http://test/#name";

    fn fred(value: &str) -> Triple {
        Triple::new(
            Term::iri("http://test/fred"),
            Term::iri(NAME),
            Term::literal(value),
        )
    }

    async fn dataset(constraint: Arc<dyn Constraint>) -> SuSetDataset {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        SuSetDataset::open(store, constraint, DatasetOptions::default())
            .await
            .unwrap()
    }

    async fn genesis_dataset() -> (SuSetDataset, TreeClock) {
        let ds = dataset(Arc::new(Unconstrained)).await;
        let time = TreeClock::genesis();
        ds.initialize(&time).await.unwrap();
        (ds, time)
    }

    async fn write(ds: &SuSetDataset, time: &TreeClock, patch: Patch) -> DeltaMessage {
        let (message, ()) = ds
            .transact(time, |_view| async move { Ok((patch, ())) })
            .await
            .unwrap();
        message.unwrap()
    }

    #[tokio::test]
    async fn test_transact_insert_and_journal() {
        let (ds, t0) = genesis_dataset().await;
        let t1 = t0.tick();
        let message = write(&ds, &t1, Patch::insert(vec![fred("Fred")])).await;

        assert_eq!(message.time, t1);
        assert_eq!(message.delta.inserts, vec![fred("Fred")]);
        assert!(message.delta.deletes.is_empty());

        let values = ds
            .view()
            .values(&Term::iri("http://test/fred"), &Term::iri(NAME))
            .await
            .unwrap();
        assert_eq!(values, vec![Term::literal("Fred")]);

        let stats = ds.stats().await.unwrap();
        assert_eq!(stats.quads, 1);
        assert_eq!(stats.all_tids, 1);
        // Initial entry plus the transaction.
        assert_eq!(stats.journal_entries, 2);
        ds.verify_journal().await.unwrap();
    }

    #[tokio::test]
    async fn test_transact_delete_tombstones_tids() {
        let (ds, t0) = genesis_dataset().await;
        let t1 = t0.tick();
        let insert = write(&ds, &t1, Patch::insert(vec![fred("Fred")])).await;
        let t2 = t1.tick();
        let delete = write(&ds, &t2, Patch::delete(vec![fred("Fred")])).await;

        assert_eq!(delete.delta.deletes.len(), 1);
        assert_eq!(delete.delta.deletes[0].tids, vec![insert.tid]);

        let stats = ds.stats().await.unwrap();
        assert_eq!(stats.quads, 0);
        assert_eq!(stats.tid_mappings, 0);
    }

    #[tokio::test]
    async fn test_delete_of_absent_triple_is_silent() {
        let (ds, t0) = genesis_dataset().await;
        let t1 = t0.tick();
        let (message, ()) = ds
            .transact(&t1, |_view| async move {
                Ok((Patch::delete(vec![fred("Nobody")]), ()))
            })
            .await
            .unwrap();
        // The patch had no effect: no delta, no journal entry.
        assert!(message.is_some());
        assert!(message.unwrap().delta.deletes.is_empty());
    }

    #[tokio::test]
    async fn test_constraint_veto_leaves_no_trace() {
        let ds = dataset(Arc::new(SingleValued::new(NAME))).await;
        let t0 = TreeClock::genesis();
        ds.initialize(&t0).await.unwrap();
        let t1 = t0.tick();
        let result = ds
            .transact(&t1, |_view| async move {
                Ok((
                    Patch::insert(vec![fred("Fred"), fred("Flintstone")]),
                    (),
                ))
            })
            .await;
        assert!(matches!(result, Err(ref e) if e.is_constraint_failure()));

        let stats = ds.stats().await.unwrap();
        assert_eq!(stats.quads, 0);
        assert_eq!(stats.journal_entries, 1);
    }

    #[tokio::test]
    async fn test_apply_is_dedup_idempotent() {
        let (a, a0) = genesis_dataset().await;
        let a1 = a0.tick();
        let message = write(&a, &a1, Patch::insert(vec![fred("Fred")])).await;

        // Applying our own published delta back is a no-op by TID.
        let arrival = a1.tick();
        let repair_t = arrival.tick();
        let outcome = a.apply(&message, &arrival, &repair_t).await.unwrap();
        assert!(!outcome.applied);
        assert!(outcome.repair.is_none());
        assert_eq!(a.stats().await.unwrap().journal_entries, 2);
    }

    #[tokio::test]
    async fn test_remote_apply_converges() {
        let (a, genesis) = genesis_dataset().await;
        let (a_clock, b_clock) = genesis.fork();
        let b = dataset(Arc::new(Unconstrained)).await;
        b.initialize(&b_clock).await.unwrap();

        let a1 = a_clock.tick();
        let message = write(&a, &a1, Patch::insert(vec![fred("Fred")])).await;

        let merged = b_clock.merge(&message.time);
        let arrival = merged.tick();
        let repair_t = arrival.tick();
        let outcome = b.apply(&message, &arrival, &repair_t).await.unwrap();
        assert!(outcome.applied);

        let values = b
            .view()
            .values(&Term::iri("http://test/fred"), &Term::iri(NAME))
            .await
            .unwrap();
        assert_eq!(values, vec![Term::literal("Fred")]);
        // B now knows A's TID.
        let second = b.apply(&message, &arrival.tick(), &repair_t.tick()).await.unwrap();
        assert!(!second.applied);
    }

    #[tokio::test]
    async fn test_concurrent_retract_spares_unseen_assertion() {
        // A inserts, B observes, both at parity; then A retracts while C's
        // concurrent re-assertion (different TID) is already at B. B must
        // keep the triple alive under C's TID.
        let (a, genesis) = genesis_dataset().await;
        let (a_clock, rest) = genesis.fork();
        let (b_clock, c_clock) = rest.fork();
        let b = dataset(Arc::new(Unconstrained)).await;
        b.initialize(&b_clock).await.unwrap();
        let c = dataset(Arc::new(Unconstrained)).await;
        c.initialize(&c_clock).await.unwrap();

        let a1 = a_clock.tick();
        let a_insert = write(&a, &a1, Patch::insert(vec![fred("Fred")])).await;

        // B sees A's insert.
        let b_arrival = b_clock.merge(&a_insert.time).tick();
        b.apply(&a_insert, &b_arrival, &b_arrival.tick()).await.unwrap();

        // C concurrently asserts the same triple with its own TID.
        let c1 = c_clock.tick();
        let c_insert = write(&c, &c1, Patch::insert(vec![fred("Fred")])).await;
        let b_arrival2 = b_arrival.merge(&c_insert.time).tick();
        b.apply(&c_insert, &b_arrival2, &b_arrival2.tick()).await.unwrap();

        // A retracts, knowing only its own assertion.
        let a2 = a1.tick();
        let a_delete = write(&a, &a2, Patch::delete(vec![fred("Fred")])).await;
        let b_arrival3 = b_arrival2.merge(&a_delete.time).tick();
        b.apply(&a_delete, &b_arrival3, &b_arrival3.tick()).await.unwrap();

        // The triple survives at B under C's TID.
        let values = b
            .view()
            .values(&Term::iri("http://test/fred"), &Term::iri(NAME))
            .await
            .unwrap();
        assert_eq!(values, vec![Term::literal("Fred")]);
        let tids = b.tids.tids_of(&fred("Fred").id()).await.unwrap();
        assert_eq!(tids, vec![c_insert.tid]);
    }

    #[tokio::test]
    async fn test_remote_repair_is_deterministic_convergence() {
        let constraint = || Arc::new(SingleValued::new(NAME)) as Arc<dyn Constraint>;
        let store_a: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let a = SuSetDataset::open(store_a, constraint(), DatasetOptions::default())
            .await
            .unwrap();
        let genesis = TreeClock::genesis();
        let (a_clock, b_clock) = genesis.fork();
        a.initialize(&a_clock).await.unwrap();
        let store_b: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let b = SuSetDataset::open(store_b, constraint(), DatasetOptions::default())
            .await
            .unwrap();
        b.initialize(&b_clock).await.unwrap();

        // Concurrent single-valued writes.
        let a1 = a_clock.tick();
        let a_msg = write(&a, &a1, Patch::insert(vec![fred("Fred")])).await;
        let b1 = b_clock.tick();
        let b_msg = write(&b, &b1, Patch::insert(vec![fred("Flintstone")])).await;

        // Cross-apply; each side repairs.
        let a_arrival = a1.merge(&b_msg.time).tick();
        let a_out = a.apply(&b_msg, &a_arrival, &a_arrival.tick()).await.unwrap();
        let b_arrival = b1.merge(&a_msg.time).tick();
        let b_out = b.apply(&a_msg, &b_arrival, &b_arrival.tick()).await.unwrap();
        let a_repair = a_out.repair.expect("a repairs");
        let b_repair = b_out.repair.expect("b repairs");

        // Both repairs delete the same value.
        assert_eq!(a_repair.delta.deletes.len(), 1);
        assert_eq!(
            a_repair.delta.deletes[0].triple,
            b_repair.delta.deletes[0].triple
        );

        // Exchange the repairs; they are no-ops on already-repaired state.
        let a_arr2 = a_arrival.tick().merge(&b_repair.time).tick();
        a.apply(&b_repair, &a_arr2, &a_arr2.tick()).await.unwrap();
        let b_arr2 = b_arrival.tick().merge(&a_repair.time).tick();
        b.apply(&a_repair, &b_arr2, &b_arr2.tick()).await.unwrap();

        let read = |ds: &SuSetDataset| {
            let view = ds.view();
            async move {
                view.values(&Term::iri("http://test/fred"), &Term::iri(NAME))
                    .await
                    .unwrap()
            }
        };
        let a_values = read(&a).await;
        let b_values = read(&b).await;
        assert_eq!(a_values, vec![Term::literal("Flintstone")]);
        assert_eq!(a_values, b_values);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let (a, t0) = genesis_dataset().await;
        let mut time = t0;
        for value in ["Fred", "Wilma", "Pebbles"] {
            time = time.tick();
            let triple = Triple::new(
                Term::iri(format!("http://test/{}", value.to_lowercase())),
                Term::iri(NAME),
                Term::literal(value),
            );
            write(&a, &time, Patch::insert(vec![triple])).await;
        }

        let mut producer = a.take_snapshot().await.unwrap();
        let header = producer.header().clone();
        assert_eq!(header.last_time, time);

        // A fresh clone adopts the snapshot.
        let (_, b_clock) = time.fork();
        let b = dataset(Arc::new(Unconstrained)).await;
        b.reset_to_snapshot(&header, &b_clock).await.unwrap();
        while let Some(batch) = producer.next_batch() {
            b.apply_snapshot_batch(batch).await.unwrap();
        }

        let a_stats = a.stats().await.unwrap();
        let b_stats = b.stats().await.unwrap();
        assert_eq!(b_stats.quads, a_stats.quads);
        assert_eq!(b_stats.tid_mappings, a_stats.tid_mappings);
        assert_eq!(b_stats.all_tids, a_stats.all_tids);

        let values = b
            .view()
            .values(&Term::iri("http://test/fred"), &Term::iri(NAME))
            .await
            .unwrap();
        assert_eq!(values, vec![Term::literal("Fred")]);
    }

    #[tokio::test]
    async fn test_operations_since() {
        let (a, genesis) = genesis_dataset().await;
        let (mut a_time, b_time) = genesis.fork();
        let mut messages = Vec::new();
        for n in 0..5 {
            a_time = a_time.tick();
            let triple = Triple::new(
                Term::iri(format!("http://test/s{}", n)),
                Term::iri(NAME),
                Term::literal(format!("v{}", n)),
            );
            messages.push(write(&a, &a_time, Patch::insert(vec![triple])).await);
        }

        // B has seen nothing of A beyond the fork point.
        let mut walker = a.operations_since(&b_time).await.unwrap();
        let mut replayed = Vec::new();
        while let Some(entry) = walker.next().await.unwrap() {
            replayed.push(DeltaMessage::from_json(&entry.delta).unwrap());
        }
        assert_eq!(replayed, messages);
    }

    #[tokio::test]
    async fn test_operations_since_divergent_fails() {
        let (a, _genesis) = genesis_dataset().await;
        // A requester whose tree forks past our identity path cannot
        // attribute our ticks; rev-up is refused.
        let (forked, _) = TreeClock::genesis().fork();
        let err = a.operations_since(&forked).await.err().expect("must fail");
        assert!(matches!(err, DatasetError::CannotRevup));
    }
}
