//! Client for text-embeddings-inference style `/embed` endpoints.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::embedder::Embedder;
use crate::error::IngestError;
use crate::metrics::Metrics;

/// Exponential backoff envelope for inference calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Calls per sub-batch, first attempt included.
    pub max_attempts: usize,
    /// Sleep after the first failure; doubled after each later one.
    pub base_delay: Duration,
    /// Upper bound on a single sleep.
    pub max_delay: Duration,
    /// Stop retrying once the next sleep would cross this budget.
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(32),
            max_elapsed: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Async embeddings client that talks to a TEI-compatible `/embed` endpoint.
#[derive(Clone)]
pub struct TeiEmbedder {
    client: Client,
    endpoint: String,
    max_batch: usize,
    expected_dim: usize,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl TeiEmbedder {
    /// Builds a client for `{base_url}/embed`.
    pub fn new(
        base_url: &str,
        max_batch: usize,
        expected_dim: usize,
        timeout: Duration,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "TEI base URL must be an http(s) URL"
        );
        anyhow::ensure!(expected_dim > 0, "expected embedding dimension must be positive");
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build TEI HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/embed", base_url.trim_end_matches('/')),
            max_batch: max_batch.max(1),
            expected_dim,
            retry: RetryPolicy {
                max_attempts: retry.max_attempts.max(1),
                ..retry
            },
            metrics,
        })
    }

    /// Maximum texts sent per HTTP call.
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    async fn embed_chunk(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let message = match self.post(inputs, attempt).await {
                Ok(vectors) => return self.validate(vectors, inputs.len()),
                Err(CallError::Fatal(err)) => return Err(err),
                Err(CallError::Retryable(message)) => message,
            };
            let backoff = self.retry.delay(attempt);
            if attempt >= self.retry.max_attempts
                || started.elapsed() + backoff > self.retry.max_elapsed
            {
                return Err(IngestError::Inference {
                    attempts: attempt,
                    message,
                });
            }
            warn!(
                event = "tei_retry",
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %message,
                "retrying embedding call"
            );
            sleep(backoff).await;
        }
    }

    async fn post(&self, inputs: &[String], attempt: usize) -> Result<Vec<Vec<f32>>, CallError> {
        self.metrics.record_inference_call();
        let request = EmbedRequest { inputs };
        let response = match self.client.post(&self.endpoint).json(&request).send().await {
            Ok(response) => response,
            Err(err) if is_retryable_error(&err) => return Err(CallError::Retryable(err.to_string())),
            Err(err) => {
                return Err(CallError::Fatal(IngestError::Inference {
                    attempts: attempt,
                    message: err.to_string(),
                }))
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            let message = format!("TEI request failed ({status}): {body}");
            if should_retry(status) {
                return Err(CallError::Retryable(message));
            }
            return Err(CallError::Fatal(IngestError::Inference {
                attempts: attempt,
                message,
            }));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| CallError::Retryable(format!("failed to read TEI response: {err}")))?;
        let parsed: EmbedResponse = serde_json::from_slice(&bytes).map_err(|_| {
            CallError::Fatal(IngestError::validation(format!(
                "unexpected TEI response shape: {}",
                snippet(&bytes)
            )))
        })?;
        Ok(parsed.into_vectors())
    }

    fn validate(
        &self,
        vectors: Vec<Vec<f32>>,
        expected_len: usize,
    ) -> Result<Vec<Vec<f32>>, IngestError> {
        if vectors.len() != expected_len {
            return Err(IngestError::validation(format!(
                "TEI returned {} embeddings for {} inputs",
                vectors.len(),
                expected_len
            )));
        }
        if let Some((index, vector)) = vectors
            .iter()
            .enumerate()
            .find(|(_, vector)| vector.len() != self.expected_dim)
        {
            return Err(IngestError::validation(format!(
                "embedding {} has dimension {}, expected {}",
                index,
                vector.len(),
                self.expected_dim
            )));
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for TeiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (index, chunk) in texts.chunks(self.max_batch).enumerate() {
            let start = index * self.max_batch;
            debug!(
                from = start,
                to = start + chunk.len(),
                "embedding sub-batch"
            );
            vectors.extend(self.embed_chunk(chunk).await?);
        }
        Ok(vectors)
    }
}

enum CallError {
    Retryable(String),
    Fatal(IngestError),
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

fn snippet(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.chars().take(200).collect()
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
}

/// The shapes TEI-compatible servers are known to answer with.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbedResponse {
    Vectors(Vec<Vec<f32>>),
    Objects(Vec<EmbeddingData>),
    Wrapped { embeddings: Vec<Vec<f32>> },
    Data { data: Vec<EmbeddingData> },
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl EmbedResponse {
    fn into_vectors(self) -> Vec<Vec<f32>> {
        match self {
            Self::Vectors(vectors) | Self::Wrapped { embeddings: vectors } => vectors,
            Self::Objects(mut data) | Self::Data { mut data } => {
                if data.iter().all(|entry| entry.index.is_some()) {
                    data.sort_by_key(|entry| entry.index);
                }
                data.into_iter().map(|entry| entry.embedding).collect()
            }
        }
    }
}
