use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::chat::ChatRequest;
use crate::scope::RequestScope;
use crate::state::{AppState, ScopeGuard};
use crate::utils::error::ApiError;

/// `POST /api/chat` — opens the SSE stream described in §4.6. Validation
/// that can be answered before any event is emitted (empty message, unknown
/// collection) is rejected as a plain HTTP error; everything else surfaces
/// as an in-stream `error` event via the orchestrator.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::InvalidRequest("message must not be empty".into()));
    }

    if !state.repository.collection_exists(&RequestScope::new(Duration::from_secs(5)), req.collection_id).await? {
        return Err(ApiError::NotFound(format!("collection {} not found", req.collection_id)));
    }

    let scope = RequestScope::new(Duration::from_secs(state.settings.server.request_deadline_secs));

    let conversation_id = match req.conversation_id {
        Some(id) => id,
        None => {
            state
                .repository
                .create_conversation(&scope, req.collection_id, "anonymous", None)
                .await?
                .id
        }
    };

    let guard = ScopeGuard::register(state.active_scopes.clone(), conversation_id, scope.clone());

    let inner = state.orchestrator.clone().run(
        scope,
        conversation_id,
        req.collection_id,
        req.message,
        state.settings.retrieval.clone(),
    );

    let guarded = async_stream::stream! {
        let _guard = guard;
        futures::pin_mut!(inner);
        while let Some(event) = inner.next().await {
            yield Ok(event);
        }
    };

    Ok(Sse::new(guarded).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
pub struct AbortParams {
    pub conversation_id: Uuid,
}

/// `DELETE /api/chat/abort` — cancels only the caller's own stream, looked
/// up by `conversation_id` (§4.6: "MUST NOT cancel other users' streams").
pub async fn abort_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AbortParams>,
) -> axum::http::StatusCode {
    if let Some(scope) = state.active_scopes.get(&params.conversation_id) {
        scope.cancel();
    }
    axum::http::StatusCode::NO_CONTENT
}
