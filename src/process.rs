//! Document Processor: drive listing → change detection → extraction →
//! chunking → embeddings → warehouse + export artifact.
//!
//! Per-file work up to chunking runs with bounded concurrency. Embedding
//! requests are then batched across every file of the run. A file is
//! committed to the ledger only once all of its chunks are in the warehouse
//! and the export artifact is finalized; anything less leaves it to be
//! retried on the next run.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::change::{ChangeDetector, ChangeKind, Decision, DetectionStats, SkipReason};
use crate::chunk::{chunk_text, ChunkerConfig};
use crate::drive::DriveSource;
use crate::embedding::EmbeddingRequester;
use crate::error::{PipelineError, Result};
use crate::export::{ExportArtifact, ExportWriter};
use crate::extract::Extractor;
use crate::ledger::{Ledger, LedgerLocks};
use crate::models::{ChunkRecord, FetchedContent, FileFormat, LedgerEntry, SourceFile};
use crate::warehouse::WarehouseSink;

/// Run-level knobs for [`DocumentProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub folder_id: String,
    pub chunker: ChunkerConfig,
    pub export_dir: PathBuf,
    pub concurrency: usize,
}

/// A file that failed for this run and was left out of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub file_id: String,
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub started_at: DateTime<Utc>,
    pub listed: usize,
    pub detection: DetectionStats,
    /// Files recorded in the ledger by this run.
    pub committed: usize,
    /// Files with at least one chunk missing after embedding.
    pub incomplete: usize,
    pub failures: Vec<FileFailure>,
    pub chunks_written: usize,
    pub chunks_missing: usize,
    pub failed_batches: usize,
    pub artifact: ExportArtifact,
}

/// A changed file, extracted and chunked, waiting for embeddings.
struct PreparedFile {
    order: usize,
    file: SourceFile,
    format: FileFormat,
    content_hash: String,
    chunks: Vec<String>,
}

enum FileOutcome {
    Skipped(SkipReason),
    Failed(FileFailure, Option<ChangeKind>),
    Prepared(PreparedFile, ChangeKind),
}

pub struct DocumentProcessor {
    drive: Arc<dyn DriveSource>,
    ledger: Arc<dyn Ledger>,
    locks: Arc<LedgerLocks>,
    detector: ChangeDetector,
    extractor: Extractor,
    embedder: EmbeddingRequester,
    warehouse: Arc<dyn WarehouseSink>,
    settings: ProcessorSettings,
}

impl DocumentProcessor {
    pub fn new(
        drive: Arc<dyn DriveSource>,
        ledger: Arc<dyn Ledger>,
        extractor: Extractor,
        embedder: EmbeddingRequester,
        warehouse: Arc<dyn WarehouseSink>,
        settings: ProcessorSettings,
    ) -> Self {
        let locks = Arc::new(LedgerLocks::new());
        let detector = ChangeDetector::new(drive.clone(), ledger.clone(), locks.clone());
        Self {
            drive,
            ledger,
            locks,
            detector,
            extractor,
            embedder,
            warehouse,
            settings,
        }
    }

    pub async fn run(&self) -> Result<ProcessReport> {
        let started_at = Utc::now();

        // Without a listing there is nothing to do; failure here ends the run.
        let files = self.drive.list_files(&self.settings.folder_id).await?;
        let listed = files.len();
        info!(files = listed, folder_id = %self.settings.folder_id, "processing drive listing");

        let outcomes: Vec<Result<FileOutcome>> = stream::iter(files.into_iter().enumerate())
            .map(|(order, file)| self.prepare(order, file))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut detection = DetectionStats::default();
        let mut failures = Vec::new();
        let mut prepared = Vec::new();
        for outcome in outcomes {
            match outcome? {
                FileOutcome::Skipped(reason) => detection.record_skip(reason),
                FileOutcome::Failed(failure, kind) => {
                    if let Some(kind) = kind {
                        detection.record_change(kind);
                    }
                    failures.push(failure);
                }
                FileOutcome::Prepared(file, kind) => {
                    detection.record_change(kind);
                    prepared.push(file);
                }
            }
        }
        prepared.sort_by_key(|p| p.order);

        let texts: Vec<String> = prepared
            .iter()
            .flat_map(|p| p.chunks.iter().cloned())
            .collect();
        let embedded = self.embedder.embed_all(&texts).await;
        let mut vectors = embedded.vectors.into_iter();

        let mut writer = ExportWriter::create(&self.settings.export_dir, started_at)?;
        let mut to_commit: Vec<(String, LedgerEntry)> = Vec::new();
        let mut incomplete = 0;
        let mut chunks_written = 0;
        let mut chunks_missing = 0;

        for doc in prepared {
            let mut records = Vec::with_capacity(doc.chunks.len());
            for (index, text) in doc.chunks.iter().enumerate() {
                match vectors.next().flatten() {
                    Some(embedding) => {
                        records.push(chunk_record(&doc, index as i64, text, embedding))
                    }
                    None => chunks_missing += 1,
                }
            }
            let complete = records.len() == doc.chunks.len();

            let removed = match self.write_document(&doc, &records, complete).await {
                Ok(removed) => removed,
                Err(e) => {
                    warn!(file_id = %doc.file.id, error = %e, "warehouse write failed, file dropped for this run");
                    failures.push(FileFailure {
                        file_id: doc.file.id.clone(),
                        name: doc.file.name.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            if !removed.is_empty() {
                debug!(file_id = %doc.file.id, removed = removed.len(), "pruned trailing chunks");
            }

            writer.write_all(&records)?;
            writer.record_removed(removed);
            chunks_written += records.len();

            if complete {
                to_commit.push((
                    doc.file.id.clone(),
                    LedgerEntry {
                        modified_time: doc.file.modified_time,
                        content_hash: doc.content_hash.clone(),
                    },
                ));
            } else {
                incomplete += 1;
                warn!(
                    file_id = %doc.file.id,
                    written = records.len(),
                    total = doc.chunks.len(),
                    "embeddings incomplete, ledger not updated"
                );
            }
        }

        let artifact = writer.finish()?;
        info!(
            path = %artifact.path.display(),
            records = artifact.records,
            removed = artifact.removed,
            "export artifact written"
        );

        for (file_id, entry) in &to_commit {
            let _guard = self.locks.lock(file_id).await;
            self.ledger.record(file_id, entry).await?;
        }

        Ok(ProcessReport {
            started_at,
            listed,
            detection,
            committed: to_commit.len(),
            incomplete,
            failures,
            chunks_written,
            chunks_missing,
            failed_batches: embedded.failed_batches.len(),
            artifact,
        })
    }

    /// Detect, fetch, extract, and chunk one file.
    ///
    /// Per-file problems become [`FileOutcome::Failed`]; only ledger storage
    /// errors propagate.
    async fn prepare(&self, order: usize, file: SourceFile) -> Result<FileOutcome> {
        let failed = |file: &SourceFile, e: PipelineError, kind: Option<ChangeKind>| {
            if e.is_per_file() {
                warn!(file_id = %file.id, name = %file.name, error = %e, "skipping file");
            } else {
                warn!(file_id = %file.id, name = %file.name, error = %e, "file failed, retried next run");
            }
            FileOutcome::Failed(
                FileFailure {
                    file_id: file.id.clone(),
                    name: file.name.clone(),
                    error: e.to_string(),
                },
                kind,
            )
        };

        let format = match FileFormat::resolve(&file.mime_type, &file.name) {
            Ok(format) => format,
            Err(e) => return Ok(failed(&file, e, None)),
        };

        let plan = match self.detector.detect(&file, format).await {
            Ok(Decision::Skip(reason)) => {
                debug!(file_id = %file.id, ?reason, "skipped");
                return Ok(FileOutcome::Skipped(reason));
            }
            Ok(Decision::Process(plan)) => plan,
            Err(e @ PipelineError::Storage(_)) => return Err(e),
            Err(e) => return Ok(failed(&file, e, None)),
        };
        let kind = plan.kind;

        let bytes = match plan.prefetched {
            Some(bytes) => bytes,
            None => match self.drive.fetch_content(&file, format).await {
                Ok(bytes) => bytes,
                Err(e) => return Ok(failed(&file, e, Some(kind))),
            },
        };

        let text = match self.extractor.extract(FetchedContent { bytes, format }).await {
            Ok(text) => text,
            Err(e) => return Ok(failed(&file, e, Some(kind))),
        };

        let chunks = chunk_text(&text, &self.settings.chunker);
        debug!(file_id = %file.id, chunks = chunks.len(), chars = text.chars().count(), "chunked");

        Ok(FileOutcome::Prepared(
            PreparedFile {
                order,
                file,
                format,
                content_hash: plan.content_hash,
                chunks,
            },
            kind,
        ))
    }

    /// Upsert the records, then prune what a complete document no longer
    /// has. Returns the pruned record ids.
    async fn write_document(
        &self,
        doc: &PreparedFile,
        records: &[ChunkRecord],
        complete: bool,
    ) -> Result<Vec<String>> {
        if !records.is_empty() {
            self.warehouse.upsert_chunks(records).await?;
        }
        // Only a complete document defines the new chunk count.
        if !complete {
            return Ok(Vec::new());
        }
        self.warehouse
            .prune_document(&doc.file.id, doc.chunks.len() as i64)
            .await
    }
}

fn chunk_record(doc: &PreparedFile, index: i64, text: &str, embedding: Vec<f32>) -> ChunkRecord {
    ChunkRecord {
        id: ChunkRecord::record_id(&doc.file.id, index),
        document_id: doc.file.id.clone(),
        chunk_index: index,
        chunk_text: text.to_string(),
        embedding,
        document_type: doc.format.display_name().to_string(),
        source_name: doc.file.name.clone(),
        web_link: doc.file.web_link.clone(),
        document_path: doc.file.path.clone(),
        file_mtime: doc.file.modified_time,
        content_hash: doc.content_hash.clone(),
        chunk_size: text.chars().count() as i64,
    }
}
