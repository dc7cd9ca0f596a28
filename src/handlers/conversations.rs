use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::conversation::{ConversationResponse, CreateConversationRequest, UpdateConversationRequest};
use crate::scope::RequestScope;
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ListConversationsParams {
    pub collection_id: i32,
    pub user_id: String,
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListConversationsParams>,
) -> Result<Json<Vec<ConversationResponse>>, ApiError> {
    let scope = RequestScope::new(Duration::from_secs(state.settings.server.request_deadline_secs));
    let conversations = state
        .repository
        .list_conversations(&scope, params.collection_id, &params.user_id)
        .await?;

    Ok(Json(conversations.into_iter().map(ConversationResponse::from).collect()))
}

pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let scope = RequestScope::new(Duration::from_secs(state.settings.server.request_deadline_secs));
    let conversation = state
        .repository
        .create_conversation(&scope, req.collection_id, &req.user_id, req.title.as_deref())
        .await?;

    Ok(Json(conversation.into()))
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let scope = RequestScope::new(Duration::from_secs(state.settings.server.request_deadline_secs));
    let conversation = state
        .repository
        .get_conversation(&scope, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("conversation {id} not found")))?;

    Ok(Json(conversation.into()))
}

pub async fn update_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateConversationRequest>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let scope = RequestScope::new(Duration::from_secs(state.settings.server.request_deadline_secs));
    let conversation = state
        .repository
        .update_conversation_title(&scope, id, &req.title)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("conversation {id} not found")))?;

    Ok(Json(conversation.into()))
}

pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let scope = RequestScope::new(Duration::from_secs(state.settings.server.request_deadline_secs));
    let deleted = state.repository.delete_conversation(&scope, id).await?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("conversation {id} not found")))
    }
}
