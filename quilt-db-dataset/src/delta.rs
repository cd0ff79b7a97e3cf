//! Delta wire codec
//!
//! A delta is the atomic replicated change set: inserted triples plus
//! reified retractions naming the TIDs being tombstoned. On the wire it is
//!
//! ```json
//! { "tid": "<uuid>",
//!   "time": { "tree": ..., "path": [...] },
//!   "encoded": [1, <inserts>, <deletes>] }
//! ```
//!
//! `inserts` is a flattened subject array; `deletes` is one blank-node
//! identified reified statement per retracted triple, carrying the short
//! names of the fixed delta context (`s`/`p`/`o`/`tid`). Encoding is
//! deterministic so the journal hash chain is replica-independent.

use serde_json::{json, Map, Value as JsonValue};

use quilt_db_core::{flatten_subjects, triples_from_subjects, Term, Tid, TreeClock, Triple};
use quilt_vocab::delta as ctx;

use crate::error::{DatasetError, Result};

/// A retracted triple with the TIDs it tombstones
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReifiedDelete {
    pub triple: Triple,
    pub tids: Vec<Tid>,
}

impl ReifiedDelete {
    /// Create a reified delete, normalizing TID order
    pub fn new(triple: Triple, mut tids: Vec<Tid>) -> Self {
        tids.sort();
        tids.dedup();
        Self { triple, tids }
    }
}

/// Version-1 encoded delta body
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EncodedDelta {
    pub inserts: Vec<Triple>,
    pub deletes: Vec<ReifiedDelete>,
}

impl EncodedDelta {
    /// Create a delta body, normalizing delete order
    pub fn new(inserts: Vec<Triple>, mut deletes: Vec<ReifiedDelete>) -> Self {
        deletes.sort_by_key(|d| d.triple.canonical());
        Self { inserts, deletes }
    }

    /// True when the delta changes nothing
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }

    /// Encode as the `[version, inserts, deletes]` array
    pub fn to_json(&self) -> JsonValue {
        let deletes: Vec<JsonValue> = self
            .deletes
            .iter()
            .enumerate()
            .map(|(i, del)| {
                let mut obj = Map::new();
                obj.insert("@id".to_string(), json!(format!("_:d{}", i)));
                obj.insert(ctx::S.to_string(), del.triple.s.to_value_object());
                obj.insert(ctx::P.to_string(), del.triple.p.to_value_object());
                obj.insert(ctx::O.to_string(), del.triple.o.to_value_object());
                obj.insert(
                    ctx::TID.to_string(),
                    JsonValue::Array(
                        del.tids.iter().map(|t| json!(t.to_string())).collect(),
                    ),
                );
                JsonValue::Object(obj)
            })
            .collect();
        json!([ctx::VERSION, flatten_subjects(&self.inserts), deletes])
    }

    /// Decode from the wire array; anything malformed is a [`DatasetError::BadUpdate`]
    pub fn from_json(value: &JsonValue) -> Result<Self> {
        let parts = value
            .as_array()
            .ok_or_else(|| DatasetError::bad_update("encoded delta is not an array"))?;
        let [version, inserts, deletes] = parts.as_slice() else {
            return Err(DatasetError::bad_update(format!(
                "encoded delta has {} parts, expected 3",
                parts.len()
            )));
        };
        if version.as_u64() != Some(ctx::VERSION) {
            return Err(DatasetError::bad_update(format!(
                "unsupported delta version: {}",
                version
            )));
        }
        let inserts = triples_from_subjects(inserts)
            .map_err(|e| DatasetError::bad_update(format!("bad delta inserts: {}", e)))?;
        let deletes = deletes
            .as_array()
            .ok_or_else(|| DatasetError::bad_update("delta deletes are not an array"))?
            .iter()
            .map(decode_reified)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(inserts, deletes))
    }
}

fn decode_reified(value: &JsonValue) -> Result<ReifiedDelete> {
    let obj = value
        .as_object()
        .ok_or_else(|| DatasetError::bad_update("reified delete is not an object"))?;
    let term_at = |key: &str| -> Result<Term> {
        let v = obj
            .get(key)
            .ok_or_else(|| DatasetError::bad_update(format!("reified delete missing {}", key)))?;
        Term::from_value_object(v)
            .map_err(|e| DatasetError::bad_update(format!("bad reified {}: {}", key, e)))
    };
    let triple = Triple::new(term_at(ctx::S)?, term_at(ctx::P)?, term_at(ctx::O)?);
    let tids = obj
        .get(ctx::TID)
        .and_then(|v| v.as_array())
        .ok_or_else(|| DatasetError::bad_update("reified delete missing tid list"))?
        .iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| DatasetError::bad_update("tid is not a string"))
                .and_then(|s| {
                    Tid::parse(s).map_err(|e| DatasetError::bad_update(format!("bad tid: {}", e)))
                })
        })
        .collect::<Result<Vec<_>>>()?;
    if tids.is_empty() {
        return Err(DatasetError::bad_update("reified delete with no tids"));
    }
    Ok(ReifiedDelete::new(triple, tids))
}

/// The replicated unit: a delta body stamped with its transaction id and
/// causal time
#[derive(Clone, Debug, PartialEq)]
pub struct DeltaMessage {
    pub tid: Tid,
    pub time: TreeClock,
    pub delta: EncodedDelta,
}

impl DeltaMessage {
    /// Create a message
    pub fn new(tid: Tid, time: TreeClock, delta: EncodedDelta) -> Self {
        Self { tid, time, delta }
    }

    /// Encode to the wire object
    pub fn to_json(&self) -> Result<JsonValue> {
        Ok(json!({
            "tid": self.tid.to_string(),
            "time": serde_json::to_value(&self.time).map_err(quilt_db_core::Error::from)?,
            "encoded": self.delta.to_json(),
        }))
    }

    /// Decode from the wire object
    pub fn from_json(value: &JsonValue) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| DatasetError::bad_update("delta message is not an object"))?;
        let tid = obj
            .get("tid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DatasetError::bad_update("delta message missing tid"))?;
        let tid =
            Tid::parse(tid).map_err(|e| DatasetError::bad_update(format!("bad tid: {}", e)))?;
        let time = obj
            .get("time")
            .ok_or_else(|| DatasetError::bad_update("delta message missing time"))?;
        let time: TreeClock = serde_json::from_value(time.clone())
            .map_err(|e| DatasetError::bad_update(format!("bad time: {}", e)))?;
        let encoded = obj
            .get("encoded")
            .ok_or_else(|| DatasetError::bad_update("delta message missing encoded body"))?;
        Ok(Self::new(tid, time, EncodedDelta::from_json(encoded)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeltaMessage {
        let inserts = vec![Triple::new(
            Term::iri("http://test/fred"),
            Term::iri("http://test/#name"),
            Term::literal("Fred"),
        )];
        let deletes = vec![ReifiedDelete::new(
            Triple::new(
                Term::iri("http://test/fred"),
                Term::iri("http://test/#name"),
                Term::literal("Freddy"),
            ),
            vec![Tid::mint(), Tid::mint()],
        )];
        DeltaMessage::new(
            Tid::mint(),
            TreeClock::genesis().tick(),
            EncodedDelta::new(inserts, deletes),
        )
    }

    #[test]
    fn test_round_trip() {
        let msg = sample();
        let json = msg.to_json().unwrap();
        let back = DeltaMessage::from_json(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_wire_shape() {
        let msg = sample();
        let json = msg.to_json().unwrap();
        assert_eq!(json["encoded"][0], 1);
        assert!(json["encoded"][1].is_array());
        let del = &json["encoded"][2][0];
        assert_eq!(del["@id"], "_:d0");
        assert!(del["tid"].as_array().unwrap().len() == 2);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut json = sample().to_json().unwrap();
        json["encoded"][0] = json!(2);
        assert!(matches!(
            DeltaMessage::from_json(&json),
            Err(DatasetError::BadUpdate(_))
        ));
    }

    #[test]
    fn test_rejects_empty_tid_list() {
        let mut json = sample().to_json().unwrap();
        json["encoded"][2][0]["tid"] = json!([]);
        assert!(matches!(
            DeltaMessage::from_json(&json),
            Err(DatasetError::BadUpdate(_))
        ));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let msg = sample();
        let a = serde_json::to_string(&msg.to_json().unwrap()).unwrap();
        let b = serde_json::to_string(&msg.to_json().unwrap()).unwrap();
        assert_eq!(a, b);
    }
}
