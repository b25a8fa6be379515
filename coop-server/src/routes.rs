//! Plain HTTP surface: health probe and metrics exposition.

use crate::error::ServerResult;
use crate::AppState;
use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;

fn authorize(state: &AppState, headers: &HeaderMap, path: &str) -> ServerResult<()> {
    if state.auth.can_access_without_auth(path) {
        return Ok(());
    }
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state.auth.authenticate(auth_header)?;
    Ok(())
}

/// `GET /health`. Accessible without credentials unless the carve-out
/// is disabled.
pub async fn health(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ServerResult<impl IntoResponse> {
    authorize(&state, &headers, "/health")?;
    Ok(Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "storageConnected": state.storage.is_connected(),
        "agents": state.registry.count(),
    })))
}

/// `GET /metrics`. Text exposition of every recorded series.
pub async fn metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ServerResult<impl IntoResponse> {
    authorize(&state, &headers, "/metrics")?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export(),
    ))
}
