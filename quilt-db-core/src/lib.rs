//! Core data model for quilt
//!
//! This crate holds the building blocks shared by every layer of the
//! replication core:
//!
//! - [`Term`], [`Triple`], [`TripleId`], [`Patch`] - the RDF data model and
//!   canonical triple identity
//! - [`Tid`] - per-transaction ids used for tombstones and dedup
//! - [`TreeClock`] - the forkable causal clock
//! - [`BlankIdSource`] - collision-free blank node minting
//! - [`KvStore`] / [`MemoryKvStore`] / [`StoreLock`] - the ordered
//!   key-value storage seam with atomic batches
//! - [`GraphUpdate`] / [`GraphReader`] - the flattened-subject update form
//!   and the read seam consumed by constraints

mod blank;
mod clock;
mod error;
mod kv;
mod lock;
mod reader;
mod term;
mod tid;
mod triple;
mod update;

pub use blank::BlankIdSource;
pub use clock::{Branch, ClockNode, CompareMode, TreeClock};
pub use error::{Error, Result};
pub use kv::{KvBatch, KvOp, KvStore, MemoryKvStore};
pub use lock::StoreLock;
pub use reader::GraphReader;
pub use term::Term;
pub use tid::Tid;
pub use triple::{Patch, Triple, TripleId};
pub use update::{flatten_subjects, triples_from_subjects, GraphUpdate};
