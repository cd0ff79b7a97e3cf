//! RDF terms - the atoms of the data model
//!
//! A [`Term`] is an IRI, a blank node label, or a literal. Literals always
//! carry a datatype IRI and may carry a language tag. The canonical string
//! form (N-Triples shaped) is what triple identity hashing operates on, so
//! it must stay stable across releases.

use quilt_vocab::xsd;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::fmt;

use crate::error::{Error, Result};

/// An RDF term: IRI, blank node, or literal
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Term {
    /// An IRI reference
    Iri(String),
    /// A blank node label (without the `_:` prefix)
    Blank(String),
    /// A literal with datatype and optional language tag
    Literal {
        value: String,
        datatype: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        lang: Option<String>,
    },
}

impl Term {
    /// Create an IRI term
    pub fn iri(iri: impl Into<String>) -> Self {
        Term::Iri(iri.into())
    }

    /// Create a blank node term from its label
    pub fn blank(label: impl Into<String>) -> Self {
        Term::Blank(label.into())
    }

    /// Create an xsd:string literal
    pub fn literal(value: impl Into<String>) -> Self {
        Term::Literal {
            value: value.into(),
            datatype: xsd::STRING.to_string(),
            lang: None,
        }
    }

    /// Create a typed literal
    pub fn typed(value: impl Into<String>, datatype: impl Into<String>) -> Self {
        Term::Literal {
            value: value.into(),
            datatype: datatype.into(),
            lang: None,
        }
    }

    /// Create a language-tagged string literal
    pub fn lang_literal(value: impl Into<String>, lang: impl Into<String>) -> Self {
        Term::Literal {
            value: value.into(),
            datatype: xsd::STRING.to_string(),
            lang: Some(lang.into()),
        }
    }

    /// True for blank node terms
    pub fn is_blank(&self) -> bool {
        matches!(self, Term::Blank(_))
    }

    /// True for literal terms
    pub fn is_literal(&self) -> bool {
        matches!(self, Term::Literal { .. })
    }

    /// Canonical N-Triples-shaped encoding, used for triple identity
    pub fn canonical(&self) -> String {
        match self {
            Term::Iri(iri) => format!("<{}>", iri),
            Term::Blank(label) => format!("_:{}", label),
            Term::Literal {
                value,
                datatype,
                lang,
            } => match lang {
                Some(lang) => format!("{:?}@{}", value, lang),
                None => format!("{:?}^^<{}>", value, datatype),
            },
        }
    }

    /// Render as a JSON-LD value object
    ///
    /// IRIs and blanks become `{"@id": ...}`; literals become
    /// `{"@value": ..., "@type"?, "@language"?}`. Plain xsd:string literals
    /// drop the `@type` key.
    pub fn to_value_object(&self) -> JsonValue {
        match self {
            Term::Iri(iri) => json!({ "@id": iri }),
            Term::Blank(label) => json!({ "@id": format!("_:{}", label) }),
            Term::Literal {
                value,
                datatype,
                lang,
            } => {
                let mut obj = serde_json::Map::new();
                obj.insert("@value".to_string(), json!(value));
                if let Some(lang) = lang {
                    obj.insert("@language".to_string(), json!(lang));
                } else if datatype != xsd::STRING {
                    obj.insert("@type".to_string(), json!(datatype));
                }
                JsonValue::Object(obj)
            }
        }
    }

    /// Parse a JSON-LD value object (or a bare JSON scalar) back into a term
    pub fn from_value_object(value: &JsonValue) -> Result<Term> {
        if let Some(obj) = value.as_object() {
            if let Some(id) = obj.get("@id").and_then(|v| v.as_str()) {
                return Ok(Term::from_id_str(id));
            }
            if let Some(v) = obj.get("@value") {
                let value = match v {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if let Some(lang) = obj.get("@language").and_then(|v| v.as_str()) {
                    return Ok(Term::lang_literal(value, lang));
                }
                let datatype = obj
                    .get("@type")
                    .and_then(|v| v.as_str())
                    .unwrap_or(xsd::STRING);
                return Ok(Term::typed(value, datatype));
            }
            return Err(Error::other(format!(
                "value object has neither @id nor @value: {}",
                value
            )));
        }
        Term::from_json_scalar(value)
            .ok_or_else(|| Error::other(format!("cannot interpret JSON value as term: {}", value)))
    }

    /// Interpret an `@id` string, honoring the `_:` blank prefix
    pub fn from_id_str(id: &str) -> Term {
        match id.strip_prefix("_:") {
            Some(label) => Term::Blank(label.to_string()),
            None => Term::Iri(id.to_string()),
        }
    }

    /// Convert a bare JSON scalar into a typed literal
    pub fn from_json_scalar(value: &JsonValue) -> Option<Term> {
        match value {
            JsonValue::String(s) => Some(Term::literal(s.clone())),
            JsonValue::Bool(b) => Some(Term::typed(b.to_string(), xsd::BOOLEAN)),
            JsonValue::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    Some(Term::typed(n.to_string(), xsd::INTEGER))
                } else {
                    Some(Term::typed(n.to_string(), xsd::DOUBLE))
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_forms() {
        assert_eq!(Term::iri("http://a/b").canonical(), "<http://a/b>");
        assert_eq!(Term::blank("b0").canonical(), "_:b0");
        assert_eq!(
            Term::literal("fred").canonical(),
            format!("{:?}^^<{}>", "fred", xsd::STRING)
        );
        assert_eq!(
            Term::lang_literal("fred", "en").canonical(),
            format!("{:?}@en", "fred")
        );
    }

    #[test]
    fn test_value_object_round_trip() {
        for term in [
            Term::iri("http://a/b"),
            Term::blank("b1"),
            Term::literal("hello"),
            Term::typed("42", xsd::INTEGER),
            Term::lang_literal("bonjour", "fr"),
        ] {
            let obj = term.to_value_object();
            assert_eq!(Term::from_value_object(&obj).unwrap(), term);
        }
    }

    #[test]
    fn test_from_json_scalar() {
        assert_eq!(
            Term::from_json_scalar(&json!("x")),
            Some(Term::literal("x"))
        );
        assert_eq!(
            Term::from_json_scalar(&json!(7)),
            Some(Term::typed("7", xsd::INTEGER))
        );
        assert_eq!(
            Term::from_json_scalar(&json!(true)),
            Some(Term::typed("true", xsd::BOOLEAN))
        );
        assert_eq!(Term::from_json_scalar(&json!(null)), None);
    }

    #[test]
    fn test_literal_escaping_distinguishes_values() {
        let a = Term::literal("a\"b");
        let b = Term::literal("a b");
        assert_ne!(a.canonical(), b.canonical());
    }
}
