//! Embedding client (C1): turns text into a fixed-dimension vector via one of
//! an ordered list of OpenAI-compatible endpoints.
//!
//! Grounded on `embedding_service.rs`'s request/response shapes and its
//! `Limiters::acquire_timed` wait-then-exec logging, generalized to the
//! fallback-ordered, no-cache shape the retriever needs. `embed` is exposed
//! through the `EmbeddingPort` trait so the retriever can be tested against
//! a `mockall` fake instead of real HTTP endpoints.

use crate::config::EmbeddingConfig;
use crate::scope::RequestScope;
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    async fn embed(&self, scope: &RequestScope, text: &str) -> Result<Vec<f32>, ApiError>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct EmbeddingClient {
    client: Client,
    endpoints: Vec<String>,
    model: String,
    dimension: usize,
    max_input_chars: usize,
    limiters: Arc<Limiters>,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig, limiters: Arc<Limiters>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            endpoints: config.endpoints.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
            max_input_chars: config.max_input_chars,
            limiters,
        }
    }

    /// Tries each configured endpoint in order; the first success wins. A
    /// 4xx response is fatal (the input itself is rejected, no point
    /// retrying against a different endpoint); connection errors and 5xx
    /// fall through to the next endpoint. No client-side L2 normalization —
    /// the store computes cosine distance over raw vectors (§9 open question).
    pub async fn embed(&self, scope: &RequestScope, text: &str) -> Result<Vec<f32>, ApiError> {
        if self.endpoints.is_empty() {
            return Err(ApiError::EmbeddingUnavailable("no endpoints configured".into()));
        }

        let truncated = truncate_chars(text, self.max_input_chars);

        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.embedding.clone(),
            self.limiters.acquire_timeout,
            "embedding",
        )
        .await
        .map_err(|e| ApiError::EmbeddingUnavailable(e.to_string()))?;
        debug!(wait_ms = wait.as_millis() as u64, op = "embedding", "wait_queue");

        let mut last_error = String::new();

        for endpoint in &self.endpoints {
            let exec_start = Instant::now();
            let attempt = scope
                .run(async {
                    Ok::<_, ApiError>(self.call_endpoint(endpoint, &truncated).await)
                })
                .await?;

            match attempt {
                Ok(vector) => {
                    debug!(
                        exec_ms = exec_start.elapsed().as_millis() as u64,
                        endpoint, "embedding success"
                    );
                    return Ok(vector);
                }
                Err(EndpointOutcome::Fatal(msg)) => {
                    return Err(ApiError::EmbeddingUnavailable(msg));
                }
                Err(EndpointOutcome::Transient(msg)) => {
                    warn!(endpoint, error = %msg, "embedding endpoint failed, trying next");
                    last_error = msg;
                }
            }
        }

        Err(ApiError::EmbeddingUnavailable(format!(
            "all endpoints exhausted: {last_error}"
        )))
    }

    async fn call_endpoint(&self, endpoint: &str, text: &str) -> Result<Vec<f32>, EndpointOutcome> {
        let url = format!("{}/embeddings", endpoint.trim_end_matches('/'));
        let request = EmbeddingRequest {
            input: text,
            model: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EndpointOutcome::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(EndpointOutcome::Fatal(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EndpointOutcome::Transient(format!("{status}: {body}")));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EndpointOutcome::Transient(format!("malformed response: {e}")))?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| EndpointOutcome::Transient("empty data array".into()))?
            .embedding;

        if embedding.len() != self.dimension {
            return Err(EndpointOutcome::Fatal(format!(
                "dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }

        Ok(embedding)
    }
}

#[async_trait]
impl EmbeddingPort for EmbeddingClient {
    async fn embed(&self, scope: &RequestScope, text: &str) -> Result<Vec<f32>, ApiError> {
        EmbeddingClient::embed(self, scope, text).await
    }
}

enum EndpointOutcome {
    Transient(String),
    Fatal(String),
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_is_a_noop_under_the_limit() {
        assert_eq!(truncate_chars("hello", 10), "hello");
    }

    #[test]
    fn truncate_chars_cuts_at_the_char_boundary() {
        let text = "a".repeat(20);
        assert_eq!(truncate_chars(&text, 5).chars().count(), 5);
    }
}
