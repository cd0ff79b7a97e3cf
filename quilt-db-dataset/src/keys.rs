//! Key layout over the ordered KV store
//!
//! Three logical keyspaces stand in for the named graphs:
//!
//! - `data/<s-hash>/<p-hash>/<o-hash>` → triple JSON (the default graph);
//!   the subject/predicate prefix structure makes `(s, p, *)` lookups a
//!   bounded prefix scan.
//! - `control/journal` and `control/entry/<tick>` → the journal.
//! - `tids/triple/<triple-hash>/<tid>` and `tids/all/<tid>` → the TID index
//!   and the AllTids set.
//!
//! Ticks are rendered zero-padded so key order equals numeric order.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use quilt_db_core::{Term, Tid, Triple, TripleId};

/// Prefix of the user data keyspace
pub const DATA_PREFIX: &str = "data/";
/// The journal state singleton key
pub const JOURNAL_KEY: &str = "control/journal";
/// Prefix of tick-keyed journal entries
pub const ENTRY_PREFIX: &str = "control/entry/";
/// Prefix of per-triple TID mappings
pub const TIDS_PREFIX: &str = "tids/triple/";
/// Prefix of the AllTids set
pub const ALL_TIDS_PREFIX: &str = "tids/all/";

fn term_hash(term: &Term) -> String {
    let mut hasher = Sha256::new();
    hasher.update(term.canonical().as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    URL_SAFE_NO_PAD.encode(&digest[..16])
}

/// Data key of a triple
pub fn data_key(triple: &Triple) -> String {
    format!(
        "{}{}/{}/{}",
        DATA_PREFIX,
        term_hash(&triple.s),
        term_hash(&triple.p),
        term_hash(&triple.o)
    )
}

/// Prefix covering every object of `(subject, predicate)`
pub fn data_sp_prefix(subject: &Term, predicate: &Term) -> String {
    format!("{}{}/{}/", DATA_PREFIX, term_hash(subject), term_hash(predicate))
}

/// Prefix covering every triple of a subject
pub fn data_s_prefix(subject: &Term) -> String {
    format!("{}{}/", DATA_PREFIX, term_hash(subject))
}

/// Journal entry key for a tick
pub fn entry_key(tick: u64) -> String {
    format!("{}{:020}", ENTRY_PREFIX, tick)
}

/// TID mapping key for a triple
pub fn tid_key(triple_id: &TripleId, tid: &Tid) -> String {
    format!("{}{}/{}", TIDS_PREFIX, triple_id.to_base64(), tid)
}

/// Prefix covering every TID of a triple
pub fn tids_prefix(triple_id: &TripleId) -> String {
    format!("{}{}/", TIDS_PREFIX, triple_id.to_base64())
}

/// AllTids membership key
pub fn all_tids_key(tid: &Tid) -> String {
    format!("{}{}", ALL_TIDS_PREFIX, tid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple() -> Triple {
        Triple::new(
            Term::iri("http://test/fred"),
            Term::iri("http://test/#name"),
            Term::literal("Fred"),
        )
    }

    #[test]
    fn test_data_key_under_sp_prefix() {
        let t = triple();
        assert!(data_key(&t).starts_with(&data_sp_prefix(&t.s, &t.p)));
    }

    #[test]
    fn test_entry_keys_order_numerically() {
        assert!(entry_key(2) < entry_key(10));
        assert!(entry_key(99) < entry_key(100));
    }

    #[test]
    fn test_tid_key_under_triple_prefix() {
        let t = triple();
        let tid = Tid::mint();
        assert!(tid_key(&t.id(), &tid).starts_with(&tids_prefix(&t.id())));
    }
}
