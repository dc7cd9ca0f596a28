use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Closed error-kind set from the spec's error handling design (§7). `kind()`
/// is emitted verbatim as the SSE `error` event's `kind` field; `user_message()`
/// is the client-safe text shown alongside it.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("generation service unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("generation interrupted: {0}")]
    GenerationInterrupted(String),

    /// Local backpressure — the client is not draining the stream fast
    /// enough. Part of the closed kind set (§7) even though the current
    /// forwarding loop never constructs it: each `chat` delta is handed
    /// straight to the SSE body without an intermediate queue, so the
    /// generator only pulls the next delta once axum has actually written
    /// the previous one — a slow client stalls that write and transitively
    /// stalls the upstream read, rather than letting unsent bytes pile up.
    /// There is no unbounded buffer for this to ever need to detect.
    #[error("client too slow")]
    ClientSlow,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Any store-level failure: a failed vector channel during retrieval, or
    /// a failed write during persistence. The closed kind set has no
    /// dedicated "persistence failed" kind, so both map to
    /// `retrieval_unavailable` as the closest available cause; callers
    /// should not relabel this under a more specific kind.
    #[error("database error: {0}")]
    Database(String),

    /// Internal scope signal — a `DELETE /chat/abort` or client disconnect.
    /// Never surfaced as an SSE `error` event (the stream just closes).
    #[error("request cancelled")]
    Cancelled,

    /// Internal scope signal — the request-wide deadline (§4.7) elapsed.
    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl ApiError {
    /// The value emitted verbatim as `error.kind` in the SSE error event.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::EmbeddingUnavailable(_) => "embedding_unavailable",
            ApiError::RetrievalUnavailable(_) | ApiError::Database(_) => "retrieval_unavailable",
            ApiError::GenerationUnavailable(_) => "generation_unavailable",
            ApiError::GenerationInterrupted(_) => "generation_interrupted",
            ApiError::ClientSlow => "client_slow",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Cancelled | ApiError::DeadlineExceeded => "embedding_unavailable",
        }
    }

    /// User-safe message for the SSE error event (§7 table). `client_slow`
    /// is silent by design — the connection is simply closed.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            ApiError::EmbeddingUnavailable(_)
            | ApiError::RetrievalUnavailable(_)
            | ApiError::Database(_) => Some("Temporary retrieval failure, please retry."),
            ApiError::GenerationUnavailable(_) => Some("Temporary retrieval failure, please retry."),
            ApiError::GenerationInterrupted(_) => Some("Answer incomplete; please retry."),
            ApiError::ClientSlow => None,
            ApiError::InvalidRequest(_) | ApiError::NotFound(_) => None,
            ApiError::Cancelled | ApiError::DeadlineExceeded => {
                Some("Temporary retrieval failure, please retry.")
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

/// Used only for errors returned *before* the SSE stream starts (§7 policy):
/// bad JSON, unknown collection, or anything failing ahead of `info`.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.kind()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.kind()),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.kind()),
        };

        tracing::warn!(kind, error = %self, "request failed before stream start");

        let body = Json(ErrorResponse {
            error: kind.to_string(),
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_slow_has_no_user_message() {
        assert_eq!(ApiError::ClientSlow.user_message(), None);
        assert_eq!(ApiError::ClientSlow.kind(), "client_slow");
    }

    #[test]
    fn database_error_maps_to_retrieval_unavailable_kind() {
        assert_eq!(
            ApiError::Database("connection reset".into()).kind(),
            "retrieval_unavailable"
        );
    }

    #[test]
    fn generation_interrupted_message_matches_spec() {
        assert_eq!(
            ApiError::GenerationInterrupted("stream dropped".into()).user_message(),
            Some("Answer incomplete; please retry.")
        );
    }
}
