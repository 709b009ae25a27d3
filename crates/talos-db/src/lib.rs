//! Database layer for the Talos gateway.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations for the durable audit log. The audit store
//! adapter in `talos-audit` is the only consumer.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, open_migrated, DbPool, DbRuntimeSettings, PoolError};
