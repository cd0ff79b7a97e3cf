//! Triples, triple identity, and patches
//!
//! A [`Triple`] is the replicated unit of data. Triple identity is the
//! SHA-256 of the canonical subject/predicate/object encoding; the TID index
//! and the data keyspace are both keyed by it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::term::Term;

/// A single RDF triple
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    /// Subject (IRI or blank)
    pub s: Term,
    /// Predicate (IRI)
    pub p: Term,
    /// Object (any term)
    pub o: Term,
}

impl Triple {
    /// Create a new triple
    pub fn new(s: Term, p: Term, o: Term) -> Self {
        Self { s, p, o }
    }

    /// Canonical encoding of the whole triple
    pub fn canonical(&self) -> String {
        format!(
            "{} {} {} .",
            self.s.canonical(),
            self.p.canonical(),
            self.o.canonical()
        )
    }

    /// Content identity of this triple
    pub fn id(&self) -> TripleId {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        TripleId(hasher.finalize().into())
    }
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// SHA-256 identity of a triple's canonical encoding
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TripleId([u8; 32]);

impl TripleId {
    /// URL-safe base64 rendering, used in storage keys
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for TripleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TripleId({})", self.to_base64())
    }
}

impl fmt::Display for TripleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// A proposed change set: triples to delete and triples to insert
///
/// This is the pre-transaction shape; TID bookkeeping and reification happen
/// inside the dataset when a patch is transacted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Triples to remove from the data graph
    pub deletes: Vec<Triple>,
    /// Triples to add to the data graph
    pub inserts: Vec<Triple>,
}

impl Patch {
    /// Create an empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// A patch that only inserts
    pub fn insert(inserts: Vec<Triple>) -> Self {
        Self {
            deletes: Vec::new(),
            inserts,
        }
    }

    /// A patch that only deletes
    pub fn delete(deletes: Vec<Triple>) -> Self {
        Self {
            deletes,
            inserts: Vec::new(),
        }
    }

    /// True when the patch changes nothing
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fred_name() -> Triple {
        Triple::new(
            Term::iri("http://test/fred"),
            Term::iri("http://test/#name"),
            Term::literal("Fred"),
        )
    }

    #[test]
    fn test_triple_id_stable() {
        assert_eq!(fred_name().id(), fred_name().id());
    }

    #[test]
    fn test_triple_id_discriminates() {
        let other = Triple::new(
            Term::iri("http://test/fred"),
            Term::iri("http://test/#name"),
            Term::literal("Flintstone"),
        );
        assert_ne!(fred_name().id(), other.id());
    }

    #[test]
    fn test_triple_id_base64_is_key_safe() {
        let key = fred_name().id().to_base64();
        assert!(!key.contains('/'));
        assert!(!key.contains('+'));
        assert!(!key.contains('='));
    }

    #[test]
    fn test_patch_helpers() {
        assert!(Patch::new().is_empty());
        assert!(!Patch::insert(vec![fred_name()]).is_empty());
        assert_eq!(Patch::delete(vec![fred_name()]).deletes.len(), 1);
    }
}
