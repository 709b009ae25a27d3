//! Talos gateway binary.
//!
//! Starts an axum HTTP server with structured logging, the configured audit
//! store, and graceful shutdown on SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;

use talos_audit::{AuditStore, MemoryAuditStore, SqliteAuditStore};
use talos_gateway::config::{self, Config, ConfigError, StorageKind};
use talos_gateway::{app, AppState};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open audit database: {0}")]
    Database(#[from] talos_db::PoolError),

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("TALOS_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn open_store(config: &Config) -> Result<Arc<dyn AuditStore>, StartupError> {
    match config.storage.kind {
        StorageKind::Memory => {
            tracing::warn!("using in-memory audit store; events are lost on restart");
            Ok(Arc::new(MemoryAuditStore::new()))
        }
        StorageKind::Sqlite => {
            let pool =
                talos_db::open_migrated(&config.storage.path, config.storage.runtime_settings())?;
            tracing::info!(path = %config.storage.path, "opened sqlite audit store");
            Ok(Arc::new(SqliteAuditStore::new(pool)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)?;

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );
    if config.auth.dev_mode {
        tracing::warn!("dev mode enabled: admin routes accept any bearer token");
    }

    let store = open_store(&config)?;
    let addr = SocketAddr::new(config.server.host, config.server.port);
    let state = AppState::new(config, store);
    tracing::info!(
        run_id = %state.run_id,
        region = %state.config.server.region,
        queue_capacity = state.config.stream.queue_capacity,
        "gateway state initialized"
    );

    let app = app(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "starting talos gateway");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("talos gateway shut down");
    Ok(())
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_check_returns_ok() {
        let state = AppState::new(Config::default(), Arc::new(MemoryAuditStore::new()));
        let response = app(state)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn sqlite_storage_opens_with_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.kind = StorageKind::Sqlite;
        config.storage.path = dir.path().join("audit.db").to_string_lossy().into_owned();

        let store = open_store(&config).unwrap();
        let page = store.list(&talos_audit::ListQuery::default()).unwrap();
        assert!(page.events.is_empty());
    }
}
