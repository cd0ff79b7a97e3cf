//! Pluggable graph invariants
//!
//! A [`Constraint`] guards the dataset two ways:
//!
//! - `check` vetoes a *local* write that would violate the invariant; the
//!   transaction aborts with no state change.
//! - `apply` repairs a *remote* delta that arrived in violation, producing a
//!   repair write that composes with the delta to restore the invariant.
//!
//! Repairs must be deterministic: given equal pre-state and an equal remote
//! delta, every replica computes a byte-identical repair at the triple
//! level, so the repaired replicas converge without further coordination.

mod checklist;
mod error;
mod single_valued;

pub use checklist::CheckList;
pub use error::{ConstraintError, Result};
pub use single_valued::SingleValued;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::fmt::Debug;
use std::sync::Arc;

use quilt_db_core::{GraphReader, GraphUpdate, Term, Triple};

/// A repair produced by [`Constraint::apply`]
///
/// Composed with the update that triggered it, the repair restores the
/// invariant. Deletes may name both pre-existing triples and triples the
/// triggering update inserted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RepairWrite {
    /// Triples to retract
    pub deletes: Vec<Triple>,
    /// Triples to assert
    pub inserts: Vec<Triple>,
}

impl RepairWrite {
    /// True when the repair changes nothing
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty()
    }

    /// Fold another repair into this one
    pub fn extend(&mut self, other: RepairWrite) {
        self.deletes.extend(other.deletes);
        self.inserts.extend(other.inserts);
    }
}

/// An invariant over graph state
#[async_trait]
pub trait Constraint: Debug + Send + Sync {
    /// Fail if the proposed update violates the invariant
    async fn check(&self, update: &GraphUpdate, read: &dyn GraphReader) -> Result<()>;

    /// Compute an optional repair for an already-decided remote update
    async fn apply(
        &self,
        update: &GraphUpdate,
        read: &dyn GraphReader,
    ) -> Result<Option<RepairWrite>>;
}

/// The permissive default: every update passes, nothing is repaired
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconstrained;

#[async_trait]
impl Constraint for Unconstrained {
    async fn check(&self, _update: &GraphUpdate, _read: &dyn GraphReader) -> Result<()> {
        Ok(())
    }

    async fn apply(
        &self,
        _update: &GraphUpdate,
        _read: &dyn GraphReader,
    ) -> Result<Option<RepairWrite>> {
        Ok(None)
    }
}

/// A reader that overlays an uncommitted repair on a base reader
///
/// Used by [`CheckList`] to thread each repair's resulting state into the
/// next constraint in the list.
pub(crate) struct OverlayReader<'a> {
    base: &'a dyn GraphReader,
    overlay: &'a RepairWrite,
}

impl<'a> OverlayReader<'a> {
    pub(crate) fn new(base: &'a dyn GraphReader, overlay: &'a RepairWrite) -> Self {
        Self { base, overlay }
    }
}

#[async_trait]
impl GraphReader for OverlayReader<'_> {
    async fn values(
        &self,
        subject: &Term,
        predicate: &Term,
    ) -> quilt_db_core::Result<Vec<Term>> {
        let mut values = self.base.values(subject, predicate).await?;
        values.retain(|v| {
            !self
                .overlay
                .deletes
                .iter()
                .any(|t| &t.s == subject && &t.p == predicate && &t.o == v)
        });
        for t in &self.overlay.inserts {
            if &t.s == subject && &t.p == predicate && !values.contains(&t.o) {
                values.push(t.o.clone());
            }
        }
        Ok(values)
    }
}

/// Build a constraint tree from its configuration value
///
/// The tree is `{"@type": "single-valued", "property": <name or IRI>}` or
/// `{"@type": "checklist", "list": [<constraint>, ...]}`. Bare property
/// names resolve against the domain vocabulary base.
pub fn build_constraint(spec: &JsonValue, vocab_base: &str) -> Result<Arc<dyn Constraint>> {
    let kind = spec
        .get("@type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ConstraintError::config("constraint spec missing @type"))?;
    match kind {
        "single-valued" => {
            let property = spec
                .get("property")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ConstraintError::config("single-valued constraint missing property")
                })?;
            let iri = if property.contains("://") {
                property.to_string()
            } else {
                format!("{}{}", vocab_base, property)
            };
            Ok(Arc::new(SingleValued::new(iri)))
        }
        "checklist" => {
            let list = spec
                .get("list")
                .and_then(|v| v.as_array())
                .ok_or_else(|| ConstraintError::config("checklist constraint missing list"))?;
            let constraints = list
                .iter()
                .map(|item| build_constraint(item, vocab_base))
                .collect::<Result<Vec<_>>>()?;
            Ok(Arc::new(CheckList::new(constraints)))
        }
        other => Err(ConstraintError::config(format!(
            "unknown constraint type: {}",
            other
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::RwLock;

    /// In-memory reader over a fixed triple set
    #[derive(Debug, Default)]
    pub struct FixedReader {
        triples: RwLock<Vec<Triple>>,
    }

    impl FixedReader {
        pub fn with(triples: Vec<Triple>) -> Self {
            Self {
                triples: RwLock::new(triples),
            }
        }
    }

    #[async_trait]
    impl GraphReader for FixedReader {
        async fn values(
            &self,
            subject: &Term,
            predicate: &Term,
        ) -> quilt_db_core::Result<Vec<Term>> {
            Ok(self
                .triples
                .read()
                .iter()
                .filter(|t| &t.s == subject && &t.p == predicate)
                .map(|t| t.o.clone())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_single_valued_resolves_short_name() {
        let spec = serde_json::json!({ "@type": "single-valued", "property": "name" });
        let constraint = build_constraint(&spec, "http://test/#").unwrap();
        assert!(format!("{:?}", constraint).contains("http://test/#name"));
    }

    #[test]
    fn test_build_checklist() {
        let spec = serde_json::json!({
            "@type": "checklist",
            "list": [
                { "@type": "single-valued", "property": "name" },
                { "@type": "single-valued", "property": "http://test/#height" },
            ]
        });
        let constraint = build_constraint(&spec, "http://test/#").unwrap();
        let debug = format!("{:?}", constraint);
        assert!(debug.contains("http://test/#name"));
        assert!(debug.contains("http://test/#height"));
    }

    #[test]
    fn test_build_rejects_unknown_type() {
        let spec = serde_json::json!({ "@type": "mystery" });
        assert!(matches!(
            build_constraint(&spec, "http://test/#"),
            Err(ConstraintError::Config(_))
        ));
    }
}
