//! Pub/sub remoting for quilt clones
//!
//! This crate carries everything between a clone and its domain peers:
//!
//! - [`PubSubTransport`] - the broker seam (wildcards, retained messages,
//!   last-will), with [`MemoryBroker`] as the in-process implementation
//! - [`Remotes`] - presence, genesis election, the operations broadcast
//!   with echo suppression, send/reply with deadlines and round-robin peer
//!   selection, and streamed snapshot/rev-up channels
//! - [`RemotesCallbacks`] - the seam the clone engine answers requests
//!   through, keeping the engine-to-remotes dependency one-directional

mod broker;
mod error;
mod messages;
mod remotes;
pub mod topics;
mod transport;

pub use broker::{MemoryBroker, MemoryTransport};
pub use error::{RemotesError, Result};
pub use messages::{
    ControlRequest, ControlResponse, HelloRecord, OperationEnvelope, PresenceRecord,
    ReplyEnvelope, StreamMessage,
};
pub use remotes::{
    OperationStream, Remotes, RemotesCallbacks, RemotesOptions, SnapshotAnswer,
    SnapshotIncoming, StreamReceiver, StreamSender, SEND_TIMEOUT_DEFAULT_MS,
};
pub use transport::{topic_matches, PubSubTransport, TransportMessage};
