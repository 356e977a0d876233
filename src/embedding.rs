//! Embedding service abstraction, the Vertex AI implementation, and the
//! batching requester used by the processor.
//!
//! # Batching
//!
//! [`EmbeddingRequester`] splits its input into batches bounded both by
//! count (`batch_size`, capped at the service maximum) and by total
//! characters (`max_batch_chars`, a proxy for the per-request token limit).
//! A single text larger than the character bound travels alone.
//!
//! # Retry Strategy
//!
//! Each batch is retried with [`RetryPolicy`]:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//!
//! A batch that still fails leaves `None` at each of its positions and is
//! reported in [`EmbeddingOutcome::failed_batches`]. It is never replaced
//! with placeholder vectors.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};
use crate::gcp::GcpHttp;
use crate::retry::{with_retry, RetryPolicy};

/// Vertex AI accepts at most this many instances per `:predict` call.
pub const VERTEX_MAX_BATCH: usize = 250;

const TASK_TYPE: &str = "RETRIEVAL_DOCUMENT";

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-005"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `768`).
    fn dims(&self) -> usize;
    /// Largest number of texts one request may carry.
    fn max_batch_size(&self) -> usize;
    /// One vector per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Vertex AI text embeddings through the publisher model `:predict` endpoint.
pub struct VertexEmbedder {
    http: GcpHttp,
    project_id: String,
    location: String,
    model: String,
    dims: usize,
}

impl VertexEmbedder {
    pub fn new(
        http: GcpHttp,
        project_id: impl Into<String>,
        location: impl Into<String>,
        config: &EmbeddingConfig,
    ) -> Self {
        Self {
            http,
            project_id: project_id.into(),
            location: location.into(),
            model: config.model.clone(),
            dims: config.dims,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "https://{}-aiplatform.googleapis.com/v1/projects/{}/locations/{}/publishers/google/models/{}:predict",
            self.location, self.project_id, self.location, self.model
        )
    }
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    instances: Vec<PredictInstance<'a>>,
}

#[derive(Serialize)]
struct PredictInstance<'a> {
    content: &'a str,
    task_type: &'static str,
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
struct Prediction {
    embeddings: EmbeddingValues,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[async_trait]
impl EmbeddingService for VertexEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_batch_size(&self) -> usize {
        VERTEX_MAX_BATCH
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = PredictRequest {
            instances: texts
                .iter()
                .map(|t| PredictInstance {
                    content: t,
                    task_type: TASK_TYPE,
                })
                .collect(),
        };
        let response: PredictResponse = self
            .http
            .send_json(Method::POST, &self.endpoint(), &[], &request)
            .await?;
        Ok(response
            .predictions
            .into_iter()
            .map(|p| p.embeddings.values)
            .collect())
    }
}

/// A batch that exhausted its retries.
#[derive(Debug, Clone)]
pub struct FailedBatch {
    /// Positions in the requester's input.
    pub range: Range<usize>,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct EmbeddingOutcome {
    /// Aligned 1:1 with the input texts.
    pub vectors: Vec<Option<Vec<f32>>>,
    pub failed_batches: Vec<FailedBatch>,
}

impl EmbeddingOutcome {
    pub fn embedded_count(&self) -> usize {
        self.vectors.iter().filter(|v| v.is_some()).count()
    }
}

pub struct EmbeddingRequester {
    service: Arc<dyn EmbeddingService>,
    batch_size: usize,
    max_batch_chars: usize,
    retry: RetryPolicy,
}

impl EmbeddingRequester {
    pub fn new(service: Arc<dyn EmbeddingService>, config: &EmbeddingConfig) -> Self {
        let batch_size = config.batch_size.clamp(1, service.max_batch_size().max(1));
        Self {
            service,
            batch_size,
            max_batch_chars: config.max_batch_chars.max(1),
            retry: RetryPolicy::from_config(config),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Split `texts` into contiguous index ranges honoring both bounds.
    pub fn plan_batches(&self, texts: &[String]) -> Vec<Range<usize>> {
        let mut batches = Vec::new();
        let mut start = 0;
        let mut chars = 0;
        for (i, text) in texts.iter().enumerate() {
            let len = text.chars().count();
            let count = i - start;
            if count > 0 && (count >= self.batch_size || chars + len > self.max_batch_chars) {
                batches.push(start..i);
                start = i;
                chars = 0;
            }
            chars += len;
        }
        if start < texts.len() {
            batches.push(start..texts.len());
        }
        batches
    }

    /// Embed every text, batch by batch.
    pub async fn embed_all(&self, texts: &[String]) -> EmbeddingOutcome {
        let mut outcome = EmbeddingOutcome {
            vectors: vec![None; texts.len()],
            failed_batches: Vec::new(),
        };
        let batches = self.plan_batches(texts);
        let total = batches.len();

        for (n, range) in batches.into_iter().enumerate() {
            let batch = &texts[range.clone()];
            let result = with_retry(&self.retry, "embedding.batch", || {
                self.service.embed_batch(batch)
            })
            .await
            .and_then(|vectors| self.validate(batch.len(), vectors));

            match result {
                Ok(vectors) => {
                    info!(batch = n + 1, of = total, size = batch.len(), "embedded batch");
                    for (slot, vector) in outcome.vectors[range].iter_mut().zip(vectors) {
                        *slot = Some(vector);
                    }
                }
                Err(e) => {
                    warn!(batch = n + 1, of = total, size = batch.len(), error = %e, "embedding batch failed");
                    outcome.failed_batches.push(FailedBatch {
                        range,
                        error: e.to_string(),
                    });
                }
            }
        }
        outcome
    }

    fn validate(&self, expected: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        let invalid = |message: String| PipelineError::Remote {
            service: self.service.model_name().to_string(),
            status: 200,
            message,
        };
        if vectors.len() != expected {
            return Err(invalid(format!(
                "returned {} vectors for {} inputs",
                vectors.len(),
                expected
            )));
        }
        let dims = self.service.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(invalid(format!(
                "returned a {}-dim vector, expected {}",
                bad.len(),
                dims
            )));
        }
        Ok(vectors)
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use drive_ingest::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns `[len, 0, 0]` per text; fails calls whose first text starts with "!".
    struct ScriptedService {
        calls: AtomicUsize,
        sizes: Mutex<Vec<usize>>,
        dims: usize,
    }

    impl ScriptedService {
        fn new(dims: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                sizes: Mutex::new(Vec::new()),
                dims,
            }
        }
    }

    #[async_trait]
    impl EmbeddingService for ScriptedService {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        fn max_batch_size(&self) -> usize {
            4
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sizes.lock().unwrap().push(texts.len());
            if texts[0].starts_with('!') {
                return Err(PipelineError::RateLimited {
                    service: "scripted".into(),
                    message: "quota".into(),
                });
            }
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 0.0, 0.0])
                .collect())
        }
    }

    fn config(batch_size: usize, max_batch_chars: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            batch_size,
            max_batch_chars,
            ..EmbeddingConfig::default()
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_batch_size_capped_by_service() {
        let requester =
            EmbeddingRequester::new(Arc::new(ScriptedService::new(3)), &config(250, 10_000));
        let input = texts(&["a"; 10]);
        assert_eq!(requester.plan_batches(&input), vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn test_batches_split_on_characters() {
        let requester =
            EmbeddingRequester::new(Arc::new(ScriptedService::new(3)), &config(4, 10));
        let input = texts(&["aaaa", "bbbb", "cccc", "dddddddddddddddd", "e"]);
        // 4+4 fits, +4 would exceed 10; the oversized text travels alone.
        assert_eq!(requester.plan_batches(&input), vec![0..2, 2..3, 3..4, 4..5]);
    }

    #[test]
    fn test_empty_input_has_no_batches() {
        let requester =
            EmbeddingRequester::new(Arc::new(ScriptedService::new(3)), &config(4, 10));
        assert!(requester.plan_batches(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_outcome_is_aligned_with_input() {
        let service = Arc::new(ScriptedService::new(3));
        let requester = EmbeddingRequester::new(service.clone(), &config(2, 10_000))
            .with_retry_policy(RetryPolicy::immediate(3));
        let input = texts(&["a", "bb", "ccc", "dddd", "eeeee"]);
        let outcome = requester.embed_all(&input).await;
        assert!(outcome.failed_batches.is_empty());
        let firsts: Vec<f32> = outcome
            .vectors
            .iter()
            .map(|v| v.as_ref().unwrap()[0])
            .collect();
        assert_eq!(firsts, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(*service.sizes.lock().unwrap(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_exhausted_batch_leaves_gaps_only_for_its_positions() {
        let service = Arc::new(ScriptedService::new(3));
        let requester = EmbeddingRequester::new(service.clone(), &config(2, 10_000))
            .with_retry_policy(RetryPolicy::immediate(3));
        let input = texts(&["a", "b", "!c", "d", "e"]);
        let outcome = requester.embed_all(&input).await;

        assert_eq!(outcome.failed_batches.len(), 1);
        assert_eq!(outcome.failed_batches[0].range, 2..4);
        assert!(outcome.vectors[2].is_none() && outcome.vectors[3].is_none());
        assert_eq!(outcome.embedded_count(), 3);
        // 1 + 3 attempts + 1
        assert_eq!(service.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_wrong_dimension_fails_the_batch() {
        let service = Arc::new(ScriptedService::new(768));
        let requester = EmbeddingRequester::new(service, &config(4, 10_000))
            .with_retry_policy(RetryPolicy::immediate(1));
        let outcome = requester.embed_all(&texts(&["a"])).await;
        assert_eq!(outcome.failed_batches.len(), 1);
        assert!(outcome.vectors[0].is_none());
    }

    #[test]
    fn test_predict_request_shape() {
        let request = PredictRequest {
            instances: vec![PredictInstance {
                content: "hello",
                task_type: TASK_TYPE,
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["instances"][0]["content"], "hello");
        assert_eq!(json["instances"][0]["task_type"], "RETRIEVAL_DOCUMENT");
    }

    #[test]
    fn test_predict_response_parsing() {
        let json = r#"{"predictions": [{"embeddings": {"values": [0.1, 0.2], "statistics": {"token_count": 2}}}]}"#;
        let response: PredictResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.predictions[0].embeddings.values, vec![0.1f32, 0.2]);
    }
}
