//! The quilt clone engine
//!
//! A [`CloneEngine`] is one replica of a decentralized, eventually
//! consistent graph domain. It accepts local writes, exchanges deltas with
//! peers over pub/sub, bootstraps new replicas (genesis election, rev-up,
//! snapshot), and converges without a coordinator.
//!
//! ```ignore
//! let broker = MemoryBroker::new();
//! let genesis = CloneEngine::start(
//!     CloneConfig::new("a", "my.domain").with_genesis(),
//!     Arc::new(MemoryKvStore::new()),
//!     Arc::new(broker.client("a")),
//!     None,
//! )
//! .await?;
//! genesis.write_subject(&json!({ "@id": "fred", "name": "Fred" })).await?;
//! ```

mod config;
mod engine;
mod error;
pub mod json;

pub use config::CloneConfig;
pub use engine::{CloneEngine, CloneStatus};
pub use error::{CloneError, Result};
