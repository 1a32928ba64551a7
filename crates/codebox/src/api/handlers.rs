//! API request handlers.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use tracing::instrument;

use crate::container::validate_container_name;
use crate::session::SessionInfo;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// List live sessions.
#[instrument(skip(state))]
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list_sessions())
}

/// Get the live session of one project.
#[instrument(skip(state))]
pub async fn get_session(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    validate_container_name(&project_id).map_err(|e| ApiError::bad_request(e.to_string()))?;

    state
        .sessions
        .list_sessions()
        .into_iter()
        .find(|session| session.project_id == project_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no live session for {}", project_id)))
}
