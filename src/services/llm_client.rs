//! Chat completion client: drives the generation service's streaming
//! `/chat/completions` endpoint and yields content deltas one at a time.
//!
//! Grounded on `llm_service.rs`'s request/response shapes; the inline SSE
//! line-splitting there is replaced with `utils::sse::SseLineParser` so the
//! parsing logic is shared with the client-facing stream (§9 design notes).

use crate::config::ChatConfig;
use crate::utils::error::ApiError;
use crate::utils::sse::{SseLine, SseLineParser};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// Lets the orchestrator (C5) be tested against a `mockall` fake instead of
/// a real generation endpoint.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait ChatClientPort: Send + Sync {
    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<ContentStream, ApiError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

pub type ContentStream = Pin<Box<dyn Stream<Item = Result<String, ApiError>> + Send>>;

pub struct LlmClient {
    client: Client,
    endpoint: String,
    model: String,
    max_tokens: usize,
    temperature: f32,
}

impl LlmClient {
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    /// Opens the streaming chat completion; the returned stream yields each
    /// non-empty content delta in arrival order. A connection or non-2xx
    /// failure before any bytes are read maps to `generation_unavailable`;
    /// an error mid-stream maps to `generation_interrupted`.
    pub async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<ContentStream, ApiError> {
        debug!(n_messages = messages.len(), model = %self.model, "starting chat stream");

        let request = ChatCompletionRequest {
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: true,
        };

        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::GenerationUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::GenerationUnavailable(format!("{status}: {body}")));
        }

        let mut byte_stream = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut parser = SseLineParser::new();
            loop {
                let chunk = match byte_stream.next().await {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        yield Err(ApiError::GenerationInterrupted(e.to_string()));
                        return;
                    }
                    None => return,
                };

                for line in parser.push(&chunk) {
                    match line {
                        SseLine::Done => return,
                        SseLine::Data(payload) => {
                            match serde_json::from_str::<ChatCompletionChunk>(&payload) {
                                Ok(parsed) => {
                                    if let Some(content) = parsed
                                        .choices
                                        .first()
                                        .and_then(|c| c.delta.content.clone())
                                    {
                                        if !content.is_empty() {
                                            yield Ok(content);
                                        }
                                    }
                                }
                                Err(e) => {
                                    yield Err(ApiError::GenerationInterrupted(format!(
                                        "malformed chunk: {e}"
                                    )));
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ChatClientPort for LlmClient {
    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<ContentStream, ApiError> {
        LlmClient::chat_stream(self, messages).await
    }
}
