use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub gcp: GcpConfig,
    pub drive: DriveConfig,
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub search_index: SearchIndexConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GcpConfig {
    pub project_id: String,
    #[serde(default = "default_location")]
    pub location: String,
    /// Environment variable holding a bearer token for Google APIs.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_location() -> String {
    "us-central1".to_string()
}
fn default_token_env() -> String {
    "GOOGLE_OAUTH_ACCESS_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveConfig {
    pub folder_id: String,
    /// Principal the access token was minted for (domain-wide delegation).
    #[serde(default)]
    pub impersonation_user: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_chunk_size() -> usize {
    1500
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on the summed characters of one request.
    #[serde(default = "default_max_batch_chars")]
    pub max_batch_chars: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_batch_chars: default_max_batch_chars(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
        }
    }
}

fn default_provider() -> String {
    "vertex".to_string()
}
fn default_model() -> String {
    "text-embedding-005".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_batch_size() -> usize {
    250
}
fn default_max_batch_chars() -> usize {
    60_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_provider")]
    pub provider: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: default_ocr_provider(),
        }
    }
}

fn default_ocr_provider() -> String {
    "vision".to_string()
}

impl OcrConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WarehouseConfig {
    #[serde(default = "default_warehouse_kind")]
    pub kind: String,
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_table")]
    pub table: String,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            kind: default_warehouse_kind(),
            dataset: default_dataset(),
            table: default_table(),
        }
    }
}

fn default_warehouse_kind() -> String {
    "sqlite".to_string()
}
fn default_dataset() -> String {
    "incident_response_rag".to_string()
}
fn default_table() -> String {
    "incident_response_embeddings".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_export_dir")]
    pub dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: default_export_dir(),
        }
    }
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("./data/exports")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchIndexConfig {
    #[serde(default = "default_index_location")]
    pub location: String,
    #[serde(default = "default_data_store_id")]
    pub data_store_id: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_import_batch_size")]
    pub import_batch_size: usize,
    /// Document property holding the embedding vector.
    #[serde(default = "default_embedding_field")]
    pub embedding_field: String,
}

impl Default for SearchIndexConfig {
    fn default() -> Self {
        Self {
            location: default_index_location(),
            data_store_id: default_data_store_id(),
            poll_interval_secs: default_poll_interval_secs(),
            max_polls: default_max_polls(),
            import_batch_size: default_import_batch_size(),
            embedding_field: default_embedding_field(),
        }
    }
}

fn default_index_location() -> String {
    "global".to_string()
}
fn default_data_store_id() -> String {
    "incident-response-datastore".to_string()
}
fn default_poll_interval_secs() -> u64 {
    10
}
fn default_max_polls() -> u32 {
    30
}
fn default_import_batch_size() -> usize {
    100
}
fn default_embedding_field() -> String {
    "embedding".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    8
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.gcp.project_id.trim().is_empty() {
        anyhow::bail!("gcp.project_id must not be empty");
    }
    if config.drive.folder_id.trim().is_empty() {
        anyhow::bail!("drive.folder_id must not be empty");
    }

    // Validate chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!(
            "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.chunk_overlap,
            config.chunking.chunk_size
        );
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "vertex" => {}
        other => anyhow::bail!("Unknown embedding provider: '{}'. Must be vertex.", other),
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.ocr.provider.as_str() {
        "vision" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown OCR provider: '{}'. Must be vision or disabled.",
            other
        ),
    }

    match config.warehouse.kind.as_str() {
        "sqlite" | "bigquery" => {}
        other => anyhow::bail!(
            "Unknown warehouse kind: '{}'. Must be sqlite or bigquery.",
            other
        ),
    }

    if config.search_index.import_batch_size == 0 || config.search_index.import_batch_size > 100
    {
        anyhow::bail!("search_index.import_batch_size must be in [1, 100]");
    }
    if config.search_index.embedding_field.trim().is_empty() {
        anyhow::bail!("search_index.embedding_field must not be empty");
    }
    if config.search_index.max_polls == 0 {
        anyhow::bail!("search_index.max_polls must be >= 1");
    }

    if config.processing.concurrency == 0 {
        anyhow::bail!("processing.concurrency must be >= 1");
    }

    Ok(())
}
