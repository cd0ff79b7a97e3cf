//! Ordered constraint composition

use async_trait::async_trait;
use std::sync::Arc;

use quilt_db_core::{GraphReader, GraphUpdate};

use crate::error::Result;
use crate::{Constraint, OverlayReader, RepairWrite};

/// An ordered list of constraints
///
/// `check` fails on the first failing member. `apply` composes repairs
/// sequentially: each member sees the state as already repaired by the
/// members before it.
#[derive(Debug, Clone)]
pub struct CheckList {
    list: Vec<Arc<dyn Constraint>>,
}

impl CheckList {
    /// Create from an ordered constraint list
    pub fn new(list: Vec<Arc<dyn Constraint>>) -> Self {
        Self { list }
    }
}

#[async_trait]
impl Constraint for CheckList {
    async fn check(&self, update: &GraphUpdate, read: &dyn GraphReader) -> Result<()> {
        for constraint in &self.list {
            constraint.check(update, read).await?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        update: &GraphUpdate,
        read: &dyn GraphReader,
    ) -> Result<Option<RepairWrite>> {
        let mut combined = RepairWrite::default();
        for constraint in &self.list {
            let threaded = OverlayReader::new(read, &combined);
            if let Some(repair) = constraint.apply(update, &threaded).await? {
                combined.extend(repair);
            }
        }
        if combined.is_empty() {
            Ok(None)
        } else {
            Ok(Some(combined))
        }
    }
}
