//! Index Ingestor: reconcile the search index schema, then import an
//! export artifact.
//!
//! Records are imported in batches, each as its own incremental import
//! operation polled to completion. Any import failure is fatal for the
//! run; re-running is safe because imports upsert by record id. Record ids
//! the processing run pruned are then deleted from the index.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::export::{read_artifact, read_removed_ids};
use crate::index::{IndexSchema, SearchIndex};
use crate::reconcile::{wait_for_operation, PollPolicy, ReconcileOutcome, SchemaReconciler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub schema: ReconcileOutcome,
    pub documents: usize,
    pub operations: Vec<String>,
    /// Stale record ids removed from the index.
    pub deleted: usize,
}

pub struct IndexIngestor {
    index: Arc<dyn SearchIndex>,
    schema: IndexSchema,
    poll: PollPolicy,
    batch_size: usize,
}

impl IndexIngestor {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        schema: IndexSchema,
        poll: PollPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            index,
            schema,
            poll,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn ingest(&self, artifact: &Path) -> Result<IngestReport> {
        let records = read_artifact(artifact)?;
        let removed = read_removed_ids(artifact)?;
        info!(path = %artifact.display(), records = records.len(), "ingesting export artifact");

        let schema = SchemaReconciler::new(self.index.as_ref(), self.poll)
            .reconcile(&self.schema)
            .await?;
        info!(outcome = ?schema, "schema reconciled");

        let mut operations = Vec::new();
        for (n, batch) in records.chunks(self.batch_size).enumerate() {
            let op = self.index.import_documents(batch).await?;
            let op = wait_for_operation(self.index.as_ref(), op, &self.poll).await?;
            info!(batch = n + 1, documents = batch.len(), operation = %op.name, "import finished");
            operations.push(op.name);
        }

        let deleted = if removed.is_empty() {
            0
        } else {
            let deleted = self.index.delete_documents(&removed).await?;
            info!(requested = removed.len(), deleted, "stale documents removed");
            deleted
        };

        Ok(IngestReport {
            schema,
            documents: records.len(),
            operations,
            deleted,
        })
    }
}
