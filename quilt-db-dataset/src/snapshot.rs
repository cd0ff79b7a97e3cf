//! Snapshot production and wire batches
//!
//! A snapshot is the bulk alternative to rev-up: the full data graph with
//! each triple's current TID set, plus the AllTids set, captured at a
//! journal tail. The producer materializes its read set while the caller
//! holds the transaction lock, then hands out bounded batches so the
//! transport is never outrun.

use serde::{Deserialize, Serialize};

use quilt_db_core::{Tid, TreeClock, Triple};

/// A reified snapshot quad: a triple with its asserting TIDs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotQuad {
    pub triple: Triple,
    pub tids: Vec<Tid>,
}

/// One streamed snapshot batch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotBatch {
    /// A page of the AllTids set
    Tids { tids: Vec<Tid> },
    /// A page of reified data quads
    Quads { quads: Vec<SnapshotQuad> },
}

/// Snapshot metadata: the journal tail at capture time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub last_time: TreeClock,
    pub last_hash: String,
}

/// Streams a captured snapshot as bounded batches
#[derive(Debug)]
pub struct SnapshotProducer {
    header: SnapshotHeader,
    all_tids: Vec<Tid>,
    quads: Vec<SnapshotQuad>,
    batch_size: usize,
    tid_cursor: usize,
    quad_cursor: usize,
}

impl SnapshotProducer {
    pub(crate) fn new(
        header: SnapshotHeader,
        all_tids: Vec<Tid>,
        quads: Vec<SnapshotQuad>,
        batch_size: usize,
    ) -> Self {
        Self {
            header,
            all_tids,
            quads,
            batch_size: batch_size.max(1),
            tid_cursor: 0,
            quad_cursor: 0,
        }
    }

    /// The journal tail this snapshot was captured at
    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    /// The next batch: TID pages first, then quad pages, then `None`
    pub fn next_batch(&mut self) -> Option<SnapshotBatch> {
        if self.tid_cursor < self.all_tids.len() {
            let end = (self.tid_cursor + self.batch_size).min(self.all_tids.len());
            let tids = self.all_tids[self.tid_cursor..end].to_vec();
            self.tid_cursor = end;
            return Some(SnapshotBatch::Tids { tids });
        }
        if self.quad_cursor < self.quads.len() {
            let end = (self.quad_cursor + self.batch_size).min(self.quads.len());
            let quads = self.quads[self.quad_cursor..end].to_vec();
            self.quad_cursor = end;
            return Some(SnapshotBatch::Quads { quads });
        }
        None
    }
}
