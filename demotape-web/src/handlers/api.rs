//! JSON API handlers for format processing, notices, demos and plays

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use demotape_core::catalog::ProductId;
use demotape_core::formats::{EnqueueOutcome, FormatError, Notice};
use demotape_core::metadata::{FORMATS_GENERATED_AT, MetadataError, available_formats};
use serde::Serialize;
use serde_json::json;

use crate::server::AppState;

/// Failures surfaced by the JSON API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Format worker unavailable: {0}")]
    Worker(#[from] FormatError),

    #[error("Metadata unavailable: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Demo purge failed: {0}")]
    Purge(#[from] std::io::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Worker(_) | ApiError::Metadata(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Purge(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!("API request failed: {}", self);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct SavedResponse {
    pub product_id: ProductId,
    pub outcome: &'static str,
}

/// `POST /api/products/{product_id}/saved`
///
/// # Errors
///
/// - `ApiError::Worker` - Format worker has shut down
pub async fn api_product_saved(
    State(state): State<AppState>,
    Path(product_id): Path<ProductId>,
) -> Result<(StatusCode, Json<SavedResponse>), ApiError> {
    let outcome = match state.worker.enqueue(product_id).await? {
        EnqueueOutcome::Queued => "queued",
        EnqueueOutcome::AlreadyQueued => "already_queued",
        EnqueueOutcome::RerunScheduled => "rerun_scheduled",
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(SavedResponse {
            product_id,
            outcome,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct FormatsResponse {
    pub product_id: ProductId,
    pub formats: Vec<&'static str>,
    pub generated_at: Option<String>,
}

/// `GET /api/products/{product_id}/formats`
///
/// # Errors
///
/// - `ApiError::Metadata` - Metadata store unreadable or corrupt
pub async fn api_formats(
    State(state): State<AppState>,
    Path(product_id): Path<ProductId>,
) -> Result<Json<FormatsResponse>, ApiError> {
    let formats = available_formats(state.metadata.as_ref(), product_id).await?;
    let generated_at = state.metadata.get(product_id, FORMATS_GENERATED_AT).await?;

    Ok(Json(FormatsResponse {
        product_id,
        formats: formats.iter().map(|f| f.extension()).collect(),
        generated_at,
    }))
}

/// `GET /api/products/{product_id}/notices`
pub async fn api_notices(
    State(state): State<AppState>,
    Path(product_id): Path<ProductId>,
) -> Json<Vec<Notice>> {
    Json(state.notices.for_product(product_id))
}

/// `POST /api/demos/purge`
///
/// # Errors
///
/// - `ApiError::Purge` - Demo directory could not be listed
pub async fn api_purge_demos(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.controller.cache().purge().await?;
    tracing::info!("Purged {} cached demos", removed);
    Ok(Json(json!({ "removed": removed })))
}

/// `GET /api/plays`
pub async fn api_plays(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "plays": state.plays.snapshot() }))
}

/// `GET /health`
pub async fn api_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "transcoder": state.transcoder_available,
        "uptime_seconds": state.server_started_at.elapsed().as_secs(),
    }))
}
