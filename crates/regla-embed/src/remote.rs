//! HTTP embedding providers speaking the OpenAI embeddings protocol.
//!
//! Azure OpenAI and OpenAI differ only in URL shape and auth header, so both
//! are served by one [`RemoteProvider`] built from a [`RemoteEndpoint`].

use std::time::Duration;

use async_trait::async_trait;
use regla_core::{AzureConfig, OpenAiConfig, ProviderKind, ReglaError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::{normalize, EmbeddingProvider};

/// Texts sent per HTTP request.
const REQUEST_BATCH: usize = 64;
/// Minimum plausible API key length.
const MIN_KEY_LEN: usize = 10;
/// Values shipped in sample `.env` files that must never reach the API.
const PLACEHOLDER_KEYS: &[&str] = &["tu_clave_openai_aqui", "your-api-key", "changeme"];
/// Input embedded by the startup health probe.
const PROBE_INPUT: &str = "test";

#[derive(Serialize)]
struct EmbedRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDataItem>,
}

#[derive(Deserialize)]
struct EmbedDataItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Where and how to call a remote embeddings API.
///
/// Construction validates credentials, so a returned endpoint is worth
/// probing.
pub struct RemoteEndpoint {
    kind: ProviderKind,
    url: String,
    auth_header: &'static str,
    auth_value: String,
    model: String,
    send_model: bool,
}

impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl RemoteEndpoint {
    /// Azure OpenAI deployment, falling back to `AZURE_OPENAI_*` env vars.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::Config`] if the endpoint does not start with
    /// `http`, the key is missing or implausible, or no deployment is set.
    ///
    /// # Examples
    ///
    /// ```
    /// use regla_core::AzureConfig;
    /// use regla_embed::RemoteEndpoint;
    ///
    /// let config = AzureConfig {
    ///     endpoint: Some("https://legal.openai.azure.com/".into()),
    ///     api_key: Some("0123456789abcdef".into()),
    ///     deployment: Some("embed-small".into()),
    ///     ..AzureConfig::default()
    /// };
    /// let endpoint = RemoteEndpoint::azure(&config).unwrap();
    /// assert_eq!(
    ///     endpoint.url(),
    ///     "https://legal.openai.azure.com/openai/deployments/embed-small/embeddings?api-version=2024-12-01-preview"
    /// );
    /// ```
    pub fn azure(config: &AzureConfig) -> Result<Self> {
        let endpoint = setting(config.endpoint.as_deref(), "AZURE_OPENAI_ENDPOINT")
            .ok_or_else(|| ReglaError::Config("Azure endpoint not set".into()))?;
        if !endpoint.starts_with("http") {
            return Err(ReglaError::Config(format!(
                "Azure endpoint must start with http(s), got '{endpoint}'"
            )));
        }
        let api_key = usable_key(setting(config.api_key.as_deref(), "AZURE_OPENAI_KEY"))
            .ok_or_else(|| ReglaError::Config("Azure API key missing or invalid".into()))?;
        let deployment = setting(
            config.deployment.as_deref(),
            "AZURE_OPENAI_EMBEDDING_DEPLOYMENT",
        )
        .ok_or_else(|| ReglaError::Config("Azure embedding deployment not set".into()))?;
        let api_version = if config.api_version == AzureConfig::default().api_version {
            setting(None, "AZURE_OPENAI_API_VERSION").unwrap_or_else(|| config.api_version.clone())
        } else {
            config.api_version.clone()
        };

        Ok(Self {
            kind: ProviderKind::Azure,
            url: format!(
                "{}/openai/deployments/{deployment}/embeddings?api-version={api_version}",
                endpoint.trim_end_matches('/')
            ),
            auth_header: "api-key",
            auth_value: api_key,
            model: deployment,
            send_model: false,
        })
    }

    /// OpenAI (or compatible) API, falling back to `OPENAI_API_KEY` and
    /// `MODEL_EMBED`.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::Config`] if no usable key is available.
    ///
    /// # Examples
    ///
    /// ```
    /// use regla_core::OpenAiConfig;
    /// use regla_embed::RemoteEndpoint;
    ///
    /// let placeholder = OpenAiConfig {
    ///     api_key: Some("tu_clave_openai_aqui".into()),
    ///     ..OpenAiConfig::default()
    /// };
    /// assert!(RemoteEndpoint::openai(&placeholder).is_err());
    /// ```
    pub fn openai(config: &OpenAiConfig) -> Result<Self> {
        let api_key = usable_key(setting(config.api_key.as_deref(), "OPENAI_API_KEY"))
            .ok_or_else(|| ReglaError::Config("OpenAI API key missing or placeholder".into()))?;
        let model = if config.model == OpenAiConfig::default().model {
            setting(None, "MODEL_EMBED").unwrap_or_else(|| config.model.clone())
        } else {
            config.model.clone()
        };

        Ok(Self {
            kind: ProviderKind::OpenAi,
            url: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            auth_header: "Authorization",
            auth_value: format!("Bearer {api_key}"),
            model,
            send_model: true,
        })
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn build_request(&self, input: Vec<String>) -> EmbedRequest {
        EmbedRequest {
            model: self.send_model.then(|| self.model.clone()),
            input,
        }
    }
}

/// Config value, else a non-empty environment variable.
fn setting(configured: Option<&str>, env_var: &str) -> Option<String> {
    configured
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn usable_key(key: Option<String>) -> Option<String> {
    key.filter(|k| k.len() >= MIN_KEY_LEN && !PLACEHOLDER_KEYS.contains(&k.as_str()))
}

/// A probed remote provider with a known output dimension.
pub struct RemoteProvider {
    endpoint: RemoteEndpoint,
    client: reqwest::Client,
    dimension: usize,
    timeout: Duration,
}

impl std::fmt::Debug for RemoteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProvider")
            .field("endpoint", &self.endpoint)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl RemoteProvider {
    /// Probe `endpoint` with a single test embedding and record its dimension.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::Timeout`] or [`ReglaError::Provider`] if the probe
    /// call fails or returns no usable vector.
    pub async fn connect(endpoint: RemoteEndpoint, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReglaError::Config(format!("failed to build HTTP client: {e}")))?;

        let mut provider = Self {
            endpoint,
            client,
            dimension: 0,
            timeout,
        };

        let probe = provider.request(vec![PROBE_INPUT.to_string()]).await?;
        let dimension = probe.first().map(Vec::len).unwrap_or(0);
        if dimension == 0 {
            return Err(ReglaError::Provider(format!(
                "{} probe returned an empty embedding",
                provider.endpoint.kind
            )));
        }
        provider.dimension = dimension;
        Ok(provider)
    }

    async fn request(&self, input: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = input.len();
        let request = self.endpoint.build_request(input);

        let response = self
            .client
            .post(&self.endpoint.url)
            .header(self.endpoint.auth_header, &self.endpoint.auth_value)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read response body".into());
            return Err(ReglaError::Provider(format!(
                "{} API returned {status}: {body}",
                self.endpoint.kind
            )));
        }

        let embed_response: EmbedResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;

        let mut data = embed_response.data;
        if data.len() != expected {
            return Err(ReglaError::Provider(format!(
                "{} API returned {} embeddings for {expected} inputs",
                self.endpoint.kind,
                data.len()
            )));
        }
        data.sort_by_key(|item| item.index);

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let mut vector = item.embedding;
            if self.dimension != 0 && vector.len() != self.dimension {
                return Err(ReglaError::DimensionMismatch {
                    index: self.dimension,
                    provider: vector.len(),
                });
            }
            normalize(&mut vector);
            vectors.push(vector);
        }
        Ok(vectors)
    }

    fn transport_error(&self, e: reqwest::Error) -> ReglaError {
        if e.is_timeout() {
            ReglaError::Timeout {
                provider: self.endpoint.kind.to_string(),
                millis: self.timeout.as_millis() as u64,
            }
        } else {
            ReglaError::Provider(format!("{} request failed: {e}", self.endpoint.kind))
        }
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteProvider {
    fn kind(&self) -> ProviderKind {
        self.endpoint.kind
    }

    fn model(&self) -> &str {
        &self.endpoint.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.request(vec![text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ReglaError::Provider("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(REQUEST_BATCH) {
            debug!(
                provider = %self.endpoint.kind,
                size = batch.len(),
                "embedding batch"
            );
            all.extend(self.request(batch.to_vec()).await?);
        }
        Ok(all)
    }
}
