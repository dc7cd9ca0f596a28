use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;

use crate::scope::RequestScope;
use crate::state::AppState;
use crate::utils::error::ApiError;

/// `GET /api/documents/{id}/pdf` — streams the backing PDF for inline
/// viewing (§6). Source storage/serving is otherwise out of scope; this
/// handler only resolves the stored path and streams it.
pub async fn stream_pdf(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<Response, ApiError> {
    let scope = RequestScope::new(Duration::from_secs(state.settings.server.request_deadline_secs));
    let document = state
        .repository
        .get_document(&scope, &document_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("document {document_id} not found")))?;

    let file = tokio::fs::File::open(&document.pdf_path)
        .await
        .map_err(|e| ApiError::NotFound(format!("pdf not found on disk: {e}")))?;

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/pdf")
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", document.original_filename),
        )
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());

    Ok(response)
}
