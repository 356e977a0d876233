//! Wiring of the live pipeline from configuration, and the two stages run
//! back to back.
//!
//! Library consumers that want fakes construct [`DocumentProcessor`] and
//! [`IndexIngestor`] directly; the CLI goes through the `build_*` and
//! `run_*` functions here.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::chunk::ChunkerConfig;
use crate::config::Config;
use crate::db;
use crate::drive::GoogleDriveClient;
use crate::embedding::{EmbeddingRequester, VertexEmbedder};
use crate::export::ExportArtifact;
use crate::extract::Extractor;
use crate::gcp::{EnvTokenSource, GcpHttp, TokenSource};
use crate::index::{DiscoveryEngineIndex, IndexSchema};
use crate::ingest::{IndexIngestor, IngestReport};
use crate::ledger::SqliteLedger;
use crate::migrate;
use crate::ocr::{CloudVisionOcr, OcrEngine};
use crate::process::{DocumentProcessor, ProcessReport, ProcessorSettings};
use crate::reconcile::PollPolicy;
use crate::retry::RetryPolicy;
use crate::warehouse::{BigQueryWarehouse, SqliteWarehouse, WarehouseSink};

/// Command-line overrides accepted by `run`.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub project_id: Option<String>,
    pub location: Option<String>,
    pub drive_folder_id: Option<String>,
    pub impersonation_user: Option<String>,
}

impl RunOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(project_id) = &self.project_id {
            config.gcp.project_id = project_id.clone();
        }
        if let Some(location) = &self.location {
            config.gcp.location = location.clone();
        }
        if let Some(folder_id) = &self.drive_folder_id {
            config.drive.folder_id = folder_id.clone();
        }
        if let Some(user) = &self.impersonation_user {
            config.drive.impersonation_user = Some(user.clone());
        }
    }
}

/// Result of `run`: both stages under one run handle.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub process: ProcessReport,
    pub ingest: IngestReport,
}

/// Connect to the pipeline database, creating tables if needed.
pub async fn open_store(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(&config.db.path)
        .await
        .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
    migrate::run_migrations(&pool).await?;
    Ok(pool)
}

fn token_source(config: &Config) -> Arc<dyn TokenSource> {
    Arc::new(EnvTokenSource::new(config.gcp.token_env.clone()))
}

pub fn build_processor(config: &Config, pool: &SqlitePool) -> Result<DocumentProcessor> {
    let tokens = token_source(config);
    let retry = RetryPolicy::default();

    if let Some(user) = &config.drive.impersonation_user {
        info!(%user, "drive access token is expected to be delegated for this user");
    }

    let drive = GoogleDriveClient::new(
        GcpHttp::new(&config.gcp, tokens.clone(), "drive")?,
        config.drive.page_size,
        retry,
    );

    let ocr: Option<Arc<dyn OcrEngine>> = if config.ocr.is_enabled() {
        Some(Arc::new(CloudVisionOcr::new(
            GcpHttp::new(&config.gcp, tokens.clone(), "vision")?,
            retry,
        )))
    } else {
        None
    };

    let embedder = VertexEmbedder::new(
        GcpHttp::new(&config.gcp, tokens.clone(), "vertex")?,
        config.gcp.project_id.clone(),
        config.gcp.location.clone(),
        &config.embedding,
    );
    let requester = EmbeddingRequester::new(Arc::new(embedder), &config.embedding);

    let warehouse: Arc<dyn WarehouseSink> = match config.warehouse.kind.as_str() {
        "bigquery" => Arc::new(BigQueryWarehouse::new(
            GcpHttp::new(&config.gcp, tokens, "bigquery")?,
            config.gcp.project_id.clone(),
            config.warehouse.dataset.clone(),
            config.warehouse.table.clone(),
            retry,
        )),
        _ => Arc::new(SqliteWarehouse::new(pool.clone())),
    };

    let settings = ProcessorSettings {
        folder_id: config.drive.folder_id.clone(),
        chunker: ChunkerConfig::new(config.chunking.chunk_size, config.chunking.chunk_overlap)?,
        export_dir: config.export.dir.clone(),
        concurrency: config.processing.concurrency,
    };

    Ok(DocumentProcessor::new(
        Arc::new(drive),
        Arc::new(SqliteLedger::new(pool.clone())),
        Extractor::new(ocr),
        requester,
        warehouse,
        settings,
    ))
}

pub fn build_ingestor(config: &Config) -> Result<IndexIngestor> {
    let search = &config.search_index;
    let index = DiscoveryEngineIndex::new(
        GcpHttp::new(&config.gcp, token_source(config), "discoveryengine")?,
        &config.gcp.project_id,
        &search.location,
        &search.data_store_id,
        search.embedding_field.clone(),
        RetryPolicy::default(),
    );
    Ok(IndexIngestor::new(
        Arc::new(index),
        IndexSchema::for_chunk_records(&search.embedding_field),
        PollPolicy::new(
            Duration::from_secs(search.poll_interval_secs),
            search.max_polls,
        ),
        search.import_batch_size,
    ))
}

pub async fn run_process(config: &Config) -> Result<ProcessReport> {
    let pool = open_store(config).await?;
    let processor = build_processor(config, &pool)?;
    let report = processor.run().await.context("Document processing failed")?;
    pool.close().await;
    Ok(report)
}

pub async fn run_ingest(config: &Config, artifact: &Path) -> Result<IngestReport> {
    let ingestor = build_ingestor(config)?;
    let report = ingestor
        .ingest(artifact)
        .await
        .with_context(|| format!("Import of {} failed", artifact.display()))?;
    Ok(report)
}

/// Process, then ingest the artifact the processing stage produced.
pub async fn run_pipeline(config: &Config, run_id: Uuid) -> Result<RunSummary> {
    info!(%run_id, "pipeline run started");
    let process = run_process(config).await?;
    let ExportArtifact { path, .. } = &process.artifact;
    let ingest = run_ingest(config, path).await?;
    info!(%run_id, "pipeline run finished");
    Ok(RunSummary {
        run_id,
        process,
        ingest,
    })
}
