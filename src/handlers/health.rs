use crate::state::AppState;
use axum::{extract::State, http::StatusCode};
use std::sync::Arc;

/// `GET /api/health` — 200 only if the store is actually reachable (§6).
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(state.db_pool.get_pool()).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
