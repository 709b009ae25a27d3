//! Shared API error type and service endpoints.

use crate::AppState;
use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use talos_audit::StoreError;

/// Errors returned by the REST handlers as `{"error": ...}` bodies.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidCursor(e) => ApiError::BadRequest(format!("invalid cursor: {e}")),
            other => {
                tracing::error!(error = %other, "audit store query failed");
                ApiError::InternalServerError(other.to_string())
            }
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::InternalServerError(format!("task join error: {e}"))
    }
}

/// Handler for `GET /health`.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Body of `GET /api/gateway/status`.
#[derive(Debug, Serialize)]
pub struct GatewayStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub region: String,
    pub run_id: String,
    pub sessions: usize,
    pub queue_capacity: usize,
    pub forwarded: u64,
    pub forward_failures: u64,
}

/// Handler for `GET /api/gateway/status`.
pub async fn status_handler(Extension(state): Extension<Arc<AppState>>) -> Json<GatewayStatus> {
    let counts = state.forward_stats.counts();
    Json(GatewayStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        region: state.config.server.region.clone(),
        run_id: state.run_id.clone(),
        sessions: state.registry.len(),
        queue_capacity: state.registry.capacity(),
        forwarded: counts.forwarded,
        forward_failures: counts.forward_failures,
    })
}
