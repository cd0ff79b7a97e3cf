//! The single-valued property constraint
//!
//! Guarantees at most one value of a given property per subject. Local
//! writes that would leave a subject with several values are rejected;
//! remote deltas that do so (typically concurrent writers picking different
//! values) are repaired by deleting every value except the
//! lexicographically-least, which all replicas select identically.

use async_trait::async_trait;
use std::collections::BTreeMap;

use quilt_db_core::{GraphReader, GraphUpdate, Term, Triple};

use crate::error::{ConstraintError, Result};
use crate::{Constraint, RepairWrite};

/// At most one value of `property` per subject
#[derive(Debug, Clone)]
pub struct SingleValued {
    property: Term,
}

impl SingleValued {
    /// Create the constraint for a property IRI
    pub fn new(property_iri: impl Into<String>) -> Self {
        Self {
            property: Term::iri(property_iri),
        }
    }

    /// The constrained property
    pub fn property(&self) -> &Term {
        &self.property
    }

    /// Resulting values of the property per touched subject, were the
    /// update applied: (existing - deleted) ∪ inserted
    async fn resulting_values(
        &self,
        update: &GraphUpdate,
        read: &dyn GraphReader,
    ) -> Result<BTreeMap<Term, Vec<Term>>> {
        let inserts = update.insert_triples()?;
        let deletes = update.delete_triples()?;

        let mut by_subject: BTreeMap<Term, Vec<Term>> = BTreeMap::new();
        for triple in inserts.iter().filter(|t| t.p == self.property) {
            by_subject
                .entry(triple.s.clone())
                .or_default()
                .push(triple.o.clone());
        }

        for (subject, values) in by_subject.iter_mut() {
            let existing = read.values(subject, &self.property).await?;
            for value in existing {
                let deleted = deletes
                    .iter()
                    .any(|t| &t.s == subject && t.p == self.property && t.o == value);
                if !deleted && !values.contains(&value) {
                    values.push(value);
                }
            }
            values.sort_by_key(|v| v.canonical());
            values.dedup_by_key(|v| v.canonical());
        }
        Ok(by_subject)
    }
}

#[async_trait]
impl Constraint for SingleValued {
    async fn check(&self, update: &GraphUpdate, read: &dyn GraphReader) -> Result<()> {
        for (subject, values) in self.resulting_values(update, read).await? {
            if values.len() > 1 {
                return Err(ConstraintError::failed(format!(
                    "{} has {} values of single-valued {}",
                    subject,
                    values.len(),
                    self.property
                )));
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        update: &GraphUpdate,
        read: &dyn GraphReader,
    ) -> Result<Option<RepairWrite>> {
        let mut repair = RepairWrite::default();
        for (subject, values) in self.resulting_values(update, read).await? {
            // Values are in canonical order; the least survives everywhere.
            for value in values.into_iter().skip(1) {
                repair
                    .deletes
                    .push(Triple::new(subject.clone(), self.property.clone(), value));
            }
        }
        if repair.is_empty() {
            Ok(None)
        } else {
            tracing::debug!(
                property = %self.property,
                deletes = repair.deletes.len(),
                "single-valued repair"
            );
            Ok(Some(repair))
        }
    }
}
