//! Request/response shapes for the chat surface (C6). Payload field names
//! follow the external HTTP contract verbatim; internal types use the
//! richer `Source`/`RetrievedContext` shapes from `services`.

use crate::services::context_formatter::Source;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub conversation_id: Option<Uuid>,
    pub collection_id: i32,
}

/// `info` — exactly one, emitted before any `chat` event.
#[derive(Debug, Serialize)]
pub struct SseInfoEvent {
    pub sources: Vec<Source>,
}

/// `chat` — zero or more, one per forwarded content delta.
#[derive(Debug, Serialize)]
pub struct SseChatEvent {
    pub content: String,
    pub message_id: Uuid,
}

/// `done` — terminal event on success.
#[derive(Debug, Serialize)]
pub struct SseDoneEvent {
    pub message_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<usize>,
}

/// `error` — terminal event on failure (stream already opened).
#[derive(Debug, Serialize)]
pub struct SseErrorEvent {
    pub error: String,
    pub kind: &'static str,
}
