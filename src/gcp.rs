//! Shared HTTP plumbing for Google Cloud REST APIs.
//!
//! Obtaining credentials is out of scope: a [`TokenSource`] hands out an
//! already-minted bearer token (by default read from the environment
//! variable named in `[gcp].token_env`). [`GcpHttp`] attaches it to every
//! request and maps HTTP failures onto the pipeline error taxonomy:
//!
//! | Response                  | Error                                   |
//! |---------------------------|-----------------------------------------|
//! | 429                       | [`PipelineError::RateLimited`]          |
//! | 5xx, timeout, connection  | [`PipelineError::TransientNetwork`]     |
//! | any other non-2xx         | [`PipelineError::Remote`]               |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::GcpConfig;
use crate::error::{PipelineError, Result};

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Reads the bearer token from an environment variable on every call, so a
/// sidecar can refresh it between requests.
pub struct EnvTokenSource {
    var: String,
}

impl EnvTokenSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenSource for EnvTokenSource {
    async fn token(&self) -> Result<String> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(PipelineError::Config(format!(
                "{} environment variable not set",
                self.var
            ))),
        }
    }
}

pub struct StaticTokenSource(pub String);

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Authorized JSON client for one Google service.
#[derive(Clone)]
pub struct GcpHttp {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    service: &'static str,
}

impl GcpHttp {
    pub fn new(
        config: &GcpConfig,
        tokens: Arc<dyn TokenSource>,
        service: &'static str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            tokens,
            service,
        })
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.tokens.token().await?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(|e| self.network_error(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(self.service, status.as_u16(), body))
    }

    fn network_error(&self, e: reqwest::Error) -> PipelineError {
        PipelineError::TransientNetwork {
            service: self.service.to_string(),
            message: e.to_string(),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let builder = self.request(Method::GET, url).await?.query(query);
        let response = self.send(builder).await?;
        response.json().await.map_err(|e| self.network_error(e))
    }

    pub async fn get_bytes(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<u8>> {
        let builder = self.request(Method::GET, url).await?.query(query);
        let response = self.send(builder).await?;
        let bytes = response.bytes().await.map_err(|e| self.network_error(e))?;
        Ok(bytes.to_vec())
    }

    /// `DELETE url`, discarding any response body.
    pub async fn delete(&self, url: &str) -> Result<()> {
        let builder = self.request(Method::DELETE, url).await?;
        self.send(builder).await?;
        Ok(())
    }

    pub async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> Result<T> {
        let builder = self.request(method, url).await?.query(query).json(body);
        let response = self.send(builder).await?;
        response.json().await.map_err(|e| self.network_error(e))
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub fn classify_status(service: &str, status: u16, body: String) -> PipelineError {
    match status {
        429 => PipelineError::RateLimited {
            service: service.to_string(),
            message: body,
        },
        500..=599 => PipelineError::TransientNetwork {
            service: service.to_string(),
            message: format!("HTTP {}: {}", status, body),
        },
        _ => PipelineError::Remote {
            service: service.to_string(),
            status,
            message: body,
        },
    }
}
