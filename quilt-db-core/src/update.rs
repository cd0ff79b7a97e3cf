//! Graph updates as flattened subjects
//!
//! Subscribers and the constraint engine see each committed change as a
//! [`GraphUpdate`]: the transaction's tick plus inserted and deleted triples
//! grouped into flattened JSON subject objects
//! (`{"@id": <subject>, <predicate>: [<value object>, ...]}`).
//!
//! Grouping is deterministic (subjects and values in canonical order) so an
//! update rendered at any replica is byte-identical for identical triples.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::term::Term;
use crate::triple::Triple;

/// A committed change, as seen by subscribers and constraints
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphUpdate {
    /// The local tick of the transaction that produced this update
    pub ticks: u64,
    /// Flattened subject array of inserted triples
    pub inserts: JsonValue,
    /// Flattened subject array of deleted triples
    pub deletes: JsonValue,
}

impl GraphUpdate {
    /// Build an update from triple lists
    pub fn new(ticks: u64, inserts: &[Triple], deletes: &[Triple]) -> Self {
        Self {
            ticks,
            inserts: flatten_subjects(inserts),
            deletes: flatten_subjects(deletes),
        }
    }

    /// The inserted triples, recovered from the flattened form
    pub fn insert_triples(&self) -> Result<Vec<Triple>> {
        triples_from_subjects(&self.inserts)
    }

    /// The deleted triples, recovered from the flattened form
    pub fn delete_triples(&self) -> Result<Vec<Triple>> {
        triples_from_subjects(&self.deletes)
    }

    /// True when the update changes nothing
    pub fn is_empty(&self) -> bool {
        let empty = |v: &JsonValue| v.as_array().map(|a| a.is_empty()).unwrap_or(true);
        empty(&self.inserts) && empty(&self.deletes)
    }
}

fn subject_id(term: &Term) -> String {
    match term {
        Term::Iri(iri) => iri.clone(),
        Term::Blank(label) => format!("_:{}", label),
        Term::Literal { .. } => term.canonical(),
    }
}

fn predicate_key(term: &Term) -> String {
    match term {
        Term::Iri(iri) => iri.clone(),
        other => other.canonical(),
    }
}

/// Group triples into a flattened, deterministically ordered subject array
pub fn flatten_subjects(triples: &[Triple]) -> JsonValue {
    let mut subjects: BTreeMap<String, BTreeMap<String, Vec<&Term>>> = BTreeMap::new();
    for triple in triples {
        subjects
            .entry(subject_id(&triple.s))
            .or_default()
            .entry(predicate_key(&triple.p))
            .or_default()
            .push(&triple.o);
    }

    let array: Vec<JsonValue> = subjects
        .into_iter()
        .map(|(sid, predicates)| {
            let mut obj = Map::new();
            obj.insert("@id".to_string(), json!(sid));
            for (predicate, mut objects) in predicates {
                objects.sort_by_key(|o| o.canonical());
                objects.dedup_by_key(|o| o.canonical());
                let values: Vec<JsonValue> =
                    objects.iter().map(|o| o.to_value_object()).collect();
                obj.insert(predicate, JsonValue::Array(values));
            }
            JsonValue::Object(obj)
        })
        .collect();
    JsonValue::Array(array)
}

/// Recover the triple list from a flattened subject array
pub fn triples_from_subjects(subjects: &JsonValue) -> Result<Vec<Triple>> {
    let array = subjects
        .as_array()
        .ok_or_else(|| Error::other("flattened update is not an array"))?;
    let mut triples = Vec::new();
    for subject in array {
        let obj = subject
            .as_object()
            .ok_or_else(|| Error::other("flattened subject is not an object"))?;
        let id = obj
            .get("@id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::other("flattened subject missing @id"))?;
        let s = Term::from_id_str(id);
        for (key, values) in obj {
            if key.starts_with('@') {
                continue;
            }
            let p = Term::iri(key.clone());
            let values = values
                .as_array()
                .ok_or_else(|| Error::other(format!("values of {} are not an array", key)))?;
            for value in values {
                triples.push(Triple::new(s.clone(), p.clone(), Term::from_value_object(value)?));
            }
        }
    }
    Ok(triples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triples() -> Vec<Triple> {
        vec![
            Triple::new(
                Term::iri("http://test/fred"),
                Term::iri("http://test/#name"),
                Term::literal("Fred"),
            ),
            Triple::new(
                Term::iri("http://test/fred"),
                Term::iri("http://test/#age"),
                Term::typed("40", quilt_vocab::xsd::INTEGER),
            ),
            Triple::new(
                Term::iri("http://test/wilma"),
                Term::iri("http://test/#name"),
                Term::literal("Wilma"),
            ),
        ]
    }

    #[test]
    fn test_flatten_groups_by_subject() {
        let flat = flatten_subjects(&triples());
        let arr = flat.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["@id"], "http://test/fred");
        assert_eq!(arr[1]["@id"], "http://test/wilma");
        assert_eq!(arr[0]["http://test/#name"][0]["@value"], "Fred");
    }

    #[test]
    fn test_flatten_round_trip() {
        let mut expected = triples();
        let mut back = triples_from_subjects(&flatten_subjects(&expected)).unwrap();
        expected.sort();
        back.sort();
        assert_eq!(back, expected);
    }

    #[test]
    fn test_flatten_is_deterministic() {
        let mut reversed = triples();
        reversed.reverse();
        assert_eq!(flatten_subjects(&triples()), flatten_subjects(&reversed));
    }

    #[test]
    fn test_update_is_empty() {
        assert!(GraphUpdate::new(1, &[], &[]).is_empty());
        assert!(!GraphUpdate::new(1, &triples(), &[]).is_empty());
    }
}
