//! REST handlers for producing and reading audit events.

use crate::api::ApiError;
use crate::{publish, AppState};
use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use talos_audit::{AuditStats, ListFilter, ListQuery, StatsRange, DEFAULT_LIST_LIMIT};
use talos_integrity::{build_envelope, millis_to_timestamp, now_unix_millis};
use talos_types::{Envelope, EnvelopeFields, Outcome};

/// Largest page `GET /events` returns.
const MAX_LIST_LIMIT: usize = 1_000;

/// Default stats window.
const DEFAULT_WINDOW_HOURS: u32 = 24;

/// Longest stats window accepted (30 days).
const MAX_WINDOW_HOURS: u32 = 24 * 30;

/// Handler for `POST /events`.
///
/// Seals the body into an envelope, broadcasts it to live sessions, and
/// queues it for the audit store. Responds with the sealed envelope.
pub async fn create_event_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(fields): Json<EnvelopeFields>,
) -> Result<(StatusCode, Json<Arc<Envelope>>), ApiError> {
    if fields.event_type.trim().is_empty() {
        return Err(ApiError::BadRequest("event_type must not be empty".to_string()));
    }

    let envelope = build_envelope(fields).map_err(|e| {
        tracing::error!(error = %e, "failed to seal envelope");
        ApiError::InternalServerError(e.to_string())
    })?;

    let published = publish(&state, envelope);
    Ok((StatusCode::CREATED, Json(published.envelope)))
}

/// Query parameters for `GET /events`.
#[derive(Debug, Default, Deserialize)]
pub struct ListEventsQuery {
    /// Cursor of the oldest event already seen.
    pub before: Option<String>,
    pub limit: Option<usize>,
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
    /// `OK`, `DENY`, `ERROR`, or `PENDING`.
    pub outcome: Option<String>,
}

/// Response for `GET /events`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListEventsResponse {
    pub events: Vec<Envelope>,
    pub next_cursor: Option<String>,
    pub count: usize,
}

/// Handler for `GET /events`.
///
/// Pages backwards through the audit store; each page is chronological.
pub async fn list_events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<ListEventsQuery>,
) -> Result<Json<ListEventsResponse>, ApiError> {
    let outcome = match params.outcome.as_deref().filter(|o| !o.is_empty()) {
        Some(raw) => Some(
            raw.parse::<Outcome>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        ),
        None => None,
    };

    let query = ListQuery {
        before: params.before.filter(|c| !c.is_empty()),
        limit: params
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT),
        filter: ListFilter {
            session_id: params.session_id,
            correlation_id: params.correlation_id,
            outcome,
        },
    };

    let store = state.store.clone();
    let page = tokio::task::spawn_blocking(move || store.list(&query)).await??;

    let count = page.events.len();
    Ok(Json(ListEventsResponse {
        events: page.events,
        next_cursor: page.next_cursor,
        count,
    }))
}

/// Query parameters for `GET /admin/v1/audit/stats`.
#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub window_hours: Option<u32>,
}

/// Response for `GET /admin/v1/audit/stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub window_hours: u32,
    #[serde(flatten)]
    pub stats: AuditStats,
}

/// Handler for `GET /admin/v1/audit/stats`.
///
/// Aggregates the trailing `window_hours` (default 24) of the audit log.
pub async fn stats_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let window_hours = params
        .window_hours
        .unwrap_or(DEFAULT_WINDOW_HOURS)
        .clamp(1, MAX_WINDOW_HOURS);
    let range = StatsRange::trailing_hours(millis_to_timestamp(now_unix_millis()), window_hours);

    let store = state.store.clone();
    let stats = tokio::task::spawn_blocking(move || store.stats(range)).await??;

    Ok(Json(StatsResponse {
        window_hours,
        stats,
    }))
}
