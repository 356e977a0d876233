//! Optical character recognition for image files.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::Method;
use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::gcp::GcpHttp;
use crate::retry::{with_retry, RetryPolicy};

const VISION_ANNOTATE_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognized text of a PNG or JPEG image. Images without text yield "".
    async fn recognize(&self, image: &[u8]) -> Result<String>;
}

/// Cloud Vision `images:annotate` with `DOCUMENT_TEXT_DETECTION`.
pub struct CloudVisionOcr {
    http: GcpHttp,
    retry: RetryPolicy,
}

impl CloudVisionOcr {
    pub fn new(http: GcpHttp, retry: RetryPolicy) -> Self {
        Self { http, retry }
    }
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<Status>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

fn annotate_text(response: AnnotateResponse) -> Result<String> {
    let Some(first) = response.responses.into_iter().next() else {
        return Ok(String::new());
    };
    if let Some(status) = first.error {
        return Err(PipelineError::Extraction(format!("OCR: {}", status.message)));
    }
    Ok(first
        .full_text_annotation
        .map(|a| a.text)
        .unwrap_or_default())
}

#[async_trait]
impl OcrEngine for CloudVisionOcr {
    async fn recognize(&self, image: &[u8]) -> Result<String> {
        let body = serde_json::json!({
            "requests": [{
                "image": { "content": BASE64.encode(image) },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
            }]
        });

        tracing::debug!(bytes = image.len(), "sending image to Cloud Vision");

        let response: AnnotateResponse = with_retry(&self.retry, "vision.images.annotate", || {
            self.http
                .send_json(Method::POST, VISION_ANNOTATE_URL, &[], &body)
        })
        .await?;

        annotate_text(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_text_annotation() {
        let json = r#"{"responses": [{"fullTextAnnotation": {"text": "SEV-1\nPage the on-call\n"}}]}"#;
        let response: AnnotateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(annotate_text(response).unwrap(), "SEV-1\nPage the on-call\n");
    }

    #[test]
    fn test_image_without_text() {
        let response: AnnotateResponse = serde_json::from_str(r#"{"responses": [{}]}"#).unwrap();
        assert_eq!(annotate_text(response).unwrap(), "");
    }

    #[test]
    fn test_per_image_error_is_extraction_failure() {
        let json = r#"{"responses": [{"error": {"code": 3, "message": "Bad image data."}}]}"#;
        let response: AnnotateResponse = serde_json::from_str(json).unwrap();
        let err = annotate_text(response).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
    }
}
