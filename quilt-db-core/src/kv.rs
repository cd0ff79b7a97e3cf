//! Ordered key-value storage seam
//!
//! The dataset persists quads, the TID index, and the journal through this
//! trait. Implementations must provide atomic batched writes and ordered
//! key iteration; everything else (graph layout, hashing, journaling) is
//! built above the seam.
//!
//! [`MemoryKvStore`] is the in-process implementation used by tests and by
//! single-process deployments.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// A single write operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// An atomic batch of write operations
///
/// A batch either applies completely or not at all; the dataset relies on
/// this to keep quad writes, TID index writes, and the journal append of one
/// transaction indivisible.
#[derive(Clone, Debug, Default)]
pub struct KvBatch {
    ops: Vec<KvOp>,
}

impl KvBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(KvOp::Put {
            key: key.into(),
            value,
        });
        self
    }

    /// Queue a delete
    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(KvOp::Delete { key: key.into() });
        self
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume into the operation list
    pub fn into_ops(self) -> Vec<KvOp> {
        self.ops
    }
}

/// Ordered key-value store with atomic batched writes
#[async_trait]
pub trait KvStore: Debug + Send + Sync {
    /// Read a single value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Apply a batch atomically
    async fn apply(&self, batch: KvBatch) -> Result<()>;

    /// All entries under a prefix, in key order
    ///
    /// Intended for bounded prefixes (journal head, TID sets of one triple).
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Up to `limit` entries under `prefix` with keys strictly after
    /// `start_after`, in key order
    ///
    /// This is the restartable cursor used by snapshot batching: the last
    /// key of one page is the `start_after` of the next.
    async fn scan_from(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>>;

    /// Remove every entry; used when a snapshot replaces local state
    async fn clear(&self) -> Result<()>;

    /// Close the store; later operations fail with [`Error::Closed`]
    async fn close(&self) -> Result<()>;

    /// Convenience single put
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut batch = KvBatch::new();
        batch.put(key, value);
        self.apply(batch).await
    }
}

/// In-memory ordered store
///
/// A `BTreeMap` under `parking_lot::RwLock`; key order gives the scan
/// guarantees for free. Thread-safe and cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    entries: std::sync::Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    closed: std::sync::Arc<AtomicBool>,
}

impl MemoryKvStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// A fresh handle over the same stored data
    ///
    /// Closing a handle ends that handle's session without destroying the
    /// data, like closing and reopening an on-disk store.
    pub fn reopen(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            closed: std::sync::Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of stored entries (tests and diagnostics)
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when the store holds nothing
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Debug for MemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKvStore")
            .field("entries", &self.entries.read().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn apply(&self, batch: KvBatch) -> Result<()> {
        self.check_open()?;
        let mut entries = self.entries.write();
        for op in batch.into_ops() {
            match op {
                KvOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                KvOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.check_open()?;
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn scan_from(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        self.check_open()?;
        let entries = self.entries.read();
        let start = match start_after {
            Some(after) if after >= prefix => {
                std::ops::Bound::Excluded(after.to_string())
            }
            _ => std::ops::Bound::Included(prefix.to_string()),
        };
        Ok(entries
            .range((start, std::ops::Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.check_open()?;
        self.entries.write().clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get() {
        let store = MemoryKvStore::new();
        store.put("a/1", b"one".to_vec()).await.unwrap();
        assert_eq!(store.get("a/1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get("a/2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_batch_is_atomic_unit() {
        let store = MemoryKvStore::new();
        let mut batch = KvBatch::new();
        batch.put("a/1", b"one".to_vec());
        batch.put("a/2", b"two".to_vec());
        batch.delete("a/1");
        store.apply(batch).await.unwrap();
        assert_eq!(store.get("a/1").await.unwrap(), None);
        assert_eq!(store.get("a/2").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_scan_prefix_ordered() {
        let store = MemoryKvStore::new();
        store.put("b/2", vec![2]).await.unwrap();
        store.put("a/x", vec![9]).await.unwrap();
        store.put("b/1", vec![1]).await.unwrap();
        let keys: Vec<String> = store
            .scan_prefix("b/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["b/1", "b/2"]);
    }

    #[tokio::test]
    async fn test_scan_from_restartable() {
        let store = MemoryKvStore::new();
        for i in 0..5 {
            store.put(format!("q/{}", i).as_str(), vec![i]).await.unwrap();
        }
        let first = store.scan_from("q/", None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let last_key = first.last().map(|(k, _)| k.clone()).unwrap();
        let second = store.scan_from("q/", Some(&last_key), 2).await.unwrap();
        assert_eq!(
            second.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["q/2", "q/3"]
        );
    }

    #[tokio::test]
    async fn test_closed_store_rejects() {
        let store = MemoryKvStore::new();
        store.close().await.unwrap();
        assert!(matches!(store.get("x").await, Err(Error::Closed)));
    }
}
