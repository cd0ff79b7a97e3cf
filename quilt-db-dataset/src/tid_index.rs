//! The triple-to-TID index
//!
//! For every asserted triple the index records which transactions assert
//! it; a triple stays in the data graph while at least one TID remains.
//! The AllTids set records every TID ever applied and backs duplicate
//! suppression for broker redelivery.

use std::sync::Arc;

use quilt_db_core::{KvBatch, KvStore, Tid, TripleId};

use crate::error::Result;
use crate::keys;

/// Graph-stored mapping from triple identity to asserting TIDs
pub struct TidIndex {
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for TidIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TidIndex").finish()
    }
}

impl TidIndex {
    /// Create the index over a store
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Stage an idempotent `(triple, tid)` mapping insert
    pub fn stage_add_triple(&self, batch: &mut KvBatch, triple_id: &TripleId, tid: &Tid) {
        batch.put(keys::tid_key(triple_id, tid), Vec::new());
    }

    /// Stage removal of specific TID mappings of a triple
    ///
    /// The caller removes the triple itself from the data graph when the
    /// remaining set becomes empty.
    pub fn stage_remove_tids(&self, batch: &mut KvBatch, triple_id: &TripleId, tids: &[Tid]) {
        for tid in tids {
            batch.delete(keys::tid_key(triple_id, tid));
        }
    }

    /// Stage membership of the AllTids set
    pub fn stage_add_all(&self, batch: &mut KvBatch, tid: &Tid) {
        batch.put(keys::all_tids_key(tid), Vec::new());
    }

    /// Current TIDs asserting a triple
    pub async fn tids_of(&self, triple_id: &TripleId) -> Result<Vec<Tid>> {
        let prefix = keys::tids_prefix(triple_id);
        let entries = self.store.scan_prefix(&prefix).await?;
        let mut tids = Vec::with_capacity(entries.len());
        for (key, _) in entries {
            let suffix = &key[prefix.len()..];
            if let Ok(tid) = Tid::parse(suffix) {
                tids.push(tid);
            }
        }
        Ok(tids)
    }

    /// Duplicate-suppression query: has this TID ever been applied here?
    pub async fn knows_tid(&self, tid: &Tid) -> Result<bool> {
        Ok(self.store.get(&keys::all_tids_key(tid)).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilt_db_core::{MemoryKvStore, Term, Triple};

    fn triple_id() -> TripleId {
        Triple::new(
            Term::iri("http://test/fred"),
            Term::iri("http://test/#name"),
            Term::literal("Fred"),
        )
        .id()
    }

    #[tokio::test]
    async fn test_add_and_query() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let index = TidIndex::new(store.clone());
        let id = triple_id();
        let tid = Tid::mint();

        let mut batch = KvBatch::new();
        index.stage_add_triple(&mut batch, &id, &tid);
        // Idempotent re-add in the same batch.
        index.stage_add_triple(&mut batch, &id, &tid);
        index.stage_add_all(&mut batch, &tid);
        store.apply(batch).await.unwrap();

        assert_eq!(index.tids_of(&id).await.unwrap(), vec![tid]);
        assert!(index.knows_tid(&tid).await.unwrap());
        assert!(!index.knows_tid(&Tid::mint()).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_subset() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let index = TidIndex::new(store.clone());
        let id = triple_id();
        let keep = Tid::mint();
        let drop = Tid::mint();

        let mut batch = KvBatch::new();
        index.stage_add_triple(&mut batch, &id, &keep);
        index.stage_add_triple(&mut batch, &id, &drop);
        store.apply(batch).await.unwrap();

        let mut batch = KvBatch::new();
        index.stage_remove_tids(&mut batch, &id, &[drop]);
        store.apply(batch).await.unwrap();

        assert_eq!(index.tids_of(&id).await.unwrap(), vec![keep]);
    }
}
