//! Transaction identifiers
//!
//! A TID is minted once per transaction. It tags every triple the
//! transaction asserts (in the TID index), travels inside the delta so
//! remote retractions can name exactly which assertions they cancel, and
//! doubles as the duplicate-suppression token for broker redelivery.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A globally-unique transaction id
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tid(Uuid);

impl Tid {
    /// Mint a fresh transaction id
    pub fn mint() -> Self {
        Tid(Uuid::new_v4())
    }

    /// Parse from string form
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Tid(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_unique() {
        assert_ne!(Tid::mint(), Tid::mint());
    }

    #[test]
    fn test_parse_round_trip() {
        let tid = Tid::mint();
        assert_eq!(Tid::parse(&tid.to_string()).unwrap(), tid);
    }

    #[test]
    fn test_serde_transparent() {
        let tid = Tid::mint();
        let json = serde_json::to_string(&tid).unwrap();
        assert_eq!(json, format!("\"{}\"", tid));
        let back: Tid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tid);
    }
}
