//! Transactional SU-SET quad store
//!
//! This crate implements the convergence core of a clone:
//!
//! - [`SuSetDataset`] - the single-writer transactional store producing and
//!   applying [`DeltaMessage`]s
//! - [`Journal`] - the hash-chained, tick-keyed log of applied deltas
//! - [`TidIndex`] - triple-to-TID mappings and the AllTids dedup set
//! - [`EncodedDelta`] / [`DeltaMessage`] - the version-1 delta wire codec
//! - [`SnapshotProducer`] / [`SnapshotBatch`] - bounded-batch bulk transfer

mod dataset;
mod delta;
mod error;
mod journal;
mod keys;
mod snapshot;
mod tid_index;

pub use dataset::{
    ApplyOutcome, DatasetOptions, DatasetStats, DatasetView, SuSetDataset,
    SNAPSHOT_BATCH_SIZE_DEFAULT,
};
pub use delta::{DeltaMessage, EncodedDelta, ReifiedDelete};
pub use error::{DatasetError, Result};
pub use journal::{genesis_hash, EntryWalker, Journal, JournalEntry, JournalState};
pub use snapshot::{SnapshotBatch, SnapshotHeader, SnapshotProducer, SnapshotQuad};
pub use tid_index::TidIndex;
