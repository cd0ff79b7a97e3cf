//! The minimal JSON subject surface
//!
//! The full JSON-LD query front-end is an external collaborator; the engine
//! itself accepts and renders plain subject objects against the domain's
//! fixed bases: `{"@id": "fred", "name": "Fred"}` expands subjects against
//! `http://<domain>/` and properties against `http://<domain>/#`. A subject
//! without `@id` gets a blank node minted from the clone's random base.

use serde_json::{json, Map, Value as JsonValue};

use quilt_db_core::{BlankIdSource, Term, Triple};

use crate::error::{CloneError, Result};

fn looks_absolute(s: &str) -> bool {
    s.contains("://") || s.starts_with("urn:")
}

/// Resolve a subject or reference id against the domain base
pub fn resolve_id(id: &str, base: &str) -> Term {
    if let Some(label) = id.strip_prefix("_:") {
        Term::blank(label)
    } else if looks_absolute(id) {
        Term::iri(id)
    } else {
        Term::iri(format!("{}{}", base, id))
    }
}

/// Resolve a property name against the domain vocabulary
pub fn resolve_property(name: &str, vocab: &str) -> Term {
    if looks_absolute(name) {
        Term::iri(name)
    } else {
        Term::iri(format!("{}{}", vocab, name))
    }
}

fn value_term(value: &JsonValue, base: &str) -> Result<Term> {
    match value {
        JsonValue::Object(obj) => {
            if let Some(id) = obj.get("@id").and_then(|v| v.as_str()) {
                return Ok(resolve_id(id, base));
            }
            Term::from_value_object(value)
                .map_err(|e| CloneError::bad_subject(format!("bad value object: {}", e)))
        }
        scalar => Term::from_json_scalar(scalar)
            .ok_or_else(|| CloneError::bad_subject(format!("unsupported value: {}", scalar))),
    }
}

/// Expand one subject object into triples
pub fn subject_to_triples(
    subject: &JsonValue,
    base: &str,
    vocab: &str,
    blanks: &BlankIdSource,
) -> Result<Vec<Triple>> {
    let obj = subject
        .as_object()
        .ok_or_else(|| CloneError::bad_subject("subject is not an object"))?;
    let s = match obj.get("@id") {
        Some(JsonValue::String(id)) => resolve_id(id, base),
        Some(other) => {
            return Err(CloneError::bad_subject(format!("@id is not a string: {}", other)))
        }
        None => blanks.mint(),
    };

    let mut triples = Vec::new();
    for (key, value) in obj {
        if key.starts_with('@') {
            continue;
        }
        let p = resolve_property(key, vocab);
        let values: Vec<&JsonValue> = match value {
            JsonValue::Array(items) => items.iter().collect(),
            single => vec![single],
        };
        for value in values {
            triples.push(Triple::new(s.clone(), p.clone(), value_term(value, base)?));
        }
    }
    if triples.is_empty() {
        return Err(CloneError::bad_subject("subject has no properties"));
    }
    Ok(triples)
}

fn compact_iri(iri: &str, base: &str, vocab: &str) -> String {
    if let Some(rest) = iri.strip_prefix(vocab) {
        rest.to_string()
    } else if let Some(rest) = iri.strip_prefix(base) {
        rest.to_string()
    } else {
        iri.to_string()
    }
}

fn compact_term(term: &Term, base: &str, vocab: &str) -> JsonValue {
    match term {
        Term::Iri(iri) => json!({ "@id": compact_iri(iri, base, vocab) }),
        Term::Blank(label) => json!({ "@id": format!("_:{}", label) }),
        Term::Literal { .. } => match term {
            Term::Literal {
                value,
                datatype,
                lang: None,
            } if datatype == quilt_vocab::xsd::STRING => json!(value),
            Term::Literal {
                value,
                datatype,
                lang: None,
            } if datatype == quilt_vocab::xsd::INTEGER => value
                .parse::<i64>()
                .map(|n| json!(n))
                .unwrap_or_else(|_| json!(value)),
            Term::Literal {
                value,
                datatype,
                lang: None,
            } if datatype == quilt_vocab::xsd::BOOLEAN => value
                .parse::<bool>()
                .map(|b| json!(b))
                .unwrap_or_else(|_| json!(value)),
            other => other.to_value_object(),
        },
    }
}

/// Render a subject's triples back into a compact subject object
///
/// Single-valued properties render as scalars, multi-valued as arrays with
/// values in canonical order.
pub fn triples_to_subject(
    subject: &Term,
    triples: &[Triple],
    base: &str,
    vocab: &str,
) -> JsonValue {
    let mut obj = Map::new();
    let id = match subject {
        Term::Iri(iri) => compact_iri(iri, base, vocab),
        Term::Blank(label) => format!("_:{}", label),
        Term::Literal { .. } => subject.canonical(),
    };
    obj.insert("@id".to_string(), json!(id));
    let mut by_property: Vec<(&Term, Vec<&Term>)> = Vec::new();
    for triple in triples.iter().filter(|t| &t.s == subject) {
        match by_property.iter_mut().find(|(p, _)| *p == &triple.p) {
            Some((_, values)) => values.push(&triple.o),
            None => by_property.push((&triple.p, vec![&triple.o])),
        }
    }
    for (p, mut values) in by_property {
        let key = match p {
            Term::Iri(iri) => compact_iri(iri, base, vocab),
            other => other.canonical(),
        };
        values.sort_by_key(|v| v.canonical());
        let rendered: Vec<JsonValue> = values
            .iter()
            .map(|v| compact_term(v, base, vocab))
            .collect();
        let value = if rendered.len() == 1 {
            rendered.into_iter().next().unwrap_or(JsonValue::Null)
        } else {
            JsonValue::Array(rendered)
        };
        obj.insert(key, value);
    }
    JsonValue::Object(obj)
}
