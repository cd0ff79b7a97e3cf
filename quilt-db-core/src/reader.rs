//! Read access to the current graph state
//!
//! Constraints and the engine's query surface read pre-state through this
//! seam rather than holding the dataset directly, which keeps the
//! constraint crate independent of storage.

use async_trait::async_trait;

use crate::error::Result;
use crate::term::Term;
use crate::triple::Triple;

/// Read-only view of the user data graph
#[async_trait]
pub trait GraphReader: Send + Sync {
    /// All object values currently asserted for `(subject, predicate)`
    async fn values(&self, subject: &Term, predicate: &Term) -> Result<Vec<Term>>;

    /// Whether the triple is currently asserted
    async fn contains(&self, triple: &Triple) -> Result<bool> {
        let values = self.values(&triple.s, &triple.p).await?;
        Ok(values.contains(&triple.o))
    }
}
