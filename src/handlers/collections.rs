use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::scope::RequestScope;
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Serialize)]
pub struct CollectionResponse {
    pub id: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub file_count: i64,
}

/// `GET /api/collections` (§6).
pub async fn list_collections(State(state): State<Arc<AppState>>) -> Result<Json<Vec<CollectionResponse>>, ApiError> {
    let scope = RequestScope::new(Duration::from_secs(state.settings.server.request_deadline_secs));
    let collections = state.repository.list_collections(&scope).await?;

    Ok(Json(
        collections
            .into_iter()
            .map(|c| CollectionResponse {
                id: c.id,
                name: c.name,
                kind: "graphrag",
                file_count: c.file_count,
            })
            .collect(),
    ))
}
