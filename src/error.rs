//! Error taxonomy shared by every pipeline stage.
//!
//! Per-file failures ([`PipelineError::UnsupportedFormat`],
//! [`PipelineError::Extraction`]) are logged and skipped by the processor.
//! Remote failures are split into retryable ([`PipelineError::RateLimited`],
//! [`PipelineError::TransientNetwork`]) and terminal
//! ([`PipelineError::Remote`]) so [`crate::retry`] can decide whether to
//! back off or give up.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("rate limited by {service}: {message}")]
    RateLimited { service: String, message: String },

    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    #[error("transient network error from {service}: {message}")]
    TransientNetwork { service: String, message: String },

    #[error("{service} returned {status}: {message}")]
    Remote {
        service: String,
        status: u16,
        message: String,
    },

    #[error("operation {name} failed: {message}")]
    OperationFailed { name: String, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether the failed call may succeed if repeated after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimited { .. } | PipelineError::TransientNetwork { .. }
        )
    }

    /// Per-file errors skip the file for this run without aborting it.
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsupportedFormat(_) | PipelineError::Extraction(_)
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
