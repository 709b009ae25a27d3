//! Talos gateway library logic.

pub mod api;
pub mod api_events;
pub mod api_sse;
pub mod api_ws;
pub mod config;
pub mod forward;
pub mod middleware;

use axum::{
    extract::DefaultBodyLimit,
    routing::get,
    Extension, Router,
};
use std::sync::Arc;
use talos_audit::AuditStore;
use talos_stream::{ConnectionRegistry, Dispatcher, ReplayGuard};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::forward::ForwardStats;

pub use forward::{publish, Published};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live sessions and their queues.
    pub registry: ConnectionRegistry,
    /// Fan-out over `registry`.
    pub dispatcher: Dispatcher,
    /// Nonces seen during handshakes, shared by every connection.
    pub replay_guard: Arc<ReplayGuard>,
    /// Durable audit log.
    pub store: Arc<dyn AuditStore>,
    /// Outcome counters for background store appends.
    pub forward_stats: Arc<ForwardStats>,
    pub config: Arc<Config>,
    /// Identifies this process in status output.
    pub run_id: String,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn AuditStore>) -> Self {
        let registry = ConnectionRegistry::new(&config.stream);
        let replay_guard = Arc::new(ReplayGuard::new(
            config.stream.max_clock_skew(),
            config.stream.nonce_ceiling,
        ));

        Self {
            dispatcher: Dispatcher::new(registry.clone()),
            registry,
            replay_guard,
            store,
            forward_stats: Arc::new(ForwardStats::default()),
            config: Arc::new(config),
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Maximum request body size (1 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/admin/v1/audit/stats", get(api_events::stats_handler))
        .layer(axum::middleware::from_fn(middleware::admin_auth_middleware));

    Router::new()
        .route("/health", get(api::health))
        .route("/api/gateway/status", get(api::status_handler))
        .route(
            "/events",
            get(api_events::list_events_handler).post(api_events::create_event_handler),
        )
        .route("/api/events/stream", get(api_ws::ws_handler))
        .route("/api/events/sse", get(api_sse::sse_handler))
        .merge(admin_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
