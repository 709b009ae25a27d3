//! Gateway configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use talos_stream::StreamSettings;
use thiserror::Error;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Live delivery tunables.
    #[serde(default)]
    pub stream: StreamSettings,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Deployment region reported by the status endpoint.
    #[serde(default = "default_region")]
    pub region: String,
}

/// Which audit store backs the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Process memory; nothing survives a restart.
    #[default]
    Memory,
    /// SQLite file at `storage.path`.
    Sqlite,
}

impl std::str::FromStr for StorageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(ConfigError::InvalidValue {
                key: "storage.kind",
                value: s.to_string(),
            }),
        }
    }
}

/// Audit store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,

    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled SQLite connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "talos_gateway=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Admin API authentication.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Bearer token accepted on admin routes. Without one, admin routes
    /// refuse every request unless `dev_mode` is on.
    #[serde(default)]
    pub admin_token: Option<String>,

    /// Accept any bearer token on admin routes.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_region() -> String {
    "local".to_string()
}

fn default_db_path() -> String {
    "talos_audit.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    talos_db::DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    talos_db::DbRuntimeSettings::default().pool_max_size
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl StorageConfig {
    pub fn runtime_settings(&self) -> talos_db::DbRuntimeSettings {
        talos_db::DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An override named a value the gateway does not understand.
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides (see [`apply_overrides`]).
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or an override is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

fn flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Applies overrides looked up through `var`:
/// - `TALOS_HOST`, `TALOS_PORT`, `TALOS_REGION` override `[server]`
/// - `TALOS_STORAGE_TYPE` (`memory` | `sqlite`), `TALOS_DB_PATH` override `[storage]`
/// - `TALOS_LOG_LEVEL`, `TALOS_LOG_JSON` override `[logging]`
/// - `TALOS_QUEUE_CAPACITY`, `TALOS_HEARTBEAT_INTERVAL_MS` override `[stream]`
/// - `TALOS_ADMIN_TOKEN`, `TALOS_DEV_MODE` override `[auth]`; `MODE=dev`
///   also turns on dev mode
///
/// Unparseable numbers and addresses are ignored.
///
/// # Errors
///
/// Returns `ConfigError::InvalidValue` for an unknown storage type.
pub fn apply_overrides<F>(config: &mut Config, var: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(parsed) = var("TALOS_HOST").and_then(|v| v.parse().ok()) {
        config.server.host = parsed;
    }
    if let Some(parsed) = var("TALOS_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = parsed;
    }
    if let Some(region) = var("TALOS_REGION") {
        config.server.region = region;
    }

    if let Some(kind) = var("TALOS_STORAGE_TYPE") {
        config.storage.kind = kind.parse()?;
    }
    if let Some(path) = var("TALOS_DB_PATH") {
        config.storage.path = path;
    }

    if let Some(level) = var("TALOS_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("TALOS_LOG_JSON") {
        config.logging.json = flag(&json);
    }

    if let Some(parsed) = var("TALOS_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
        config.stream.queue_capacity = parsed;
    }
    if let Some(parsed) = var("TALOS_HEARTBEAT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.stream.heartbeat_interval_ms = parsed;
    }

    if let Some(token) = var("TALOS_ADMIN_TOKEN").filter(|t| !t.is_empty()) {
        config.auth.admin_token = Some(token);
    }
    if let Some(dev) = var("TALOS_DEV_MODE") {
        config.auth.dev_mode = flag(&dev);
    }
    if let Some(mode) = var("MODE") {
        let mode = mode.to_ascii_lowercase();
        if mode == "dev" || mode == "development" {
            config.auth.dev_mode = true;
        }
    }

    Ok(())
}
