//! Durable audit log for the Talos gateway.
//!
//! The live fan-out in `talos-stream` only makes events *visible*; this
//! crate makes them *durable*. It defines the [`AuditStore`] port the
//! gateway forwards envelopes to, and two adapters:
//!
//! | Adapter | Backing | Use |
//! |---------|---------|-----|
//! | [`MemoryAuditStore`] | process memory | development, tests |
//! | [`SqliteAuditStore`] | SQLite via `talos-db` | single-node deployments |
//!
//! Both adapters share the same semantics: `append` is idempotent by
//! `event_id`, `list` pages newest-first by `(timestamp, event_id)` and
//! returns each page in chronological order, and `stats` aggregates
//! outcomes over a time range in hourly buckets.

mod error;
mod memory;
mod port;
mod sqlite;

pub use error::StoreError;
pub use memory::MemoryAuditStore;
pub use port::{
    AuditStats, AuditStore, EventPage, ListFilter, ListQuery, StatsRange, VolumeBucket,
    DEFAULT_LIST_LIMIT, DENIAL_REASON_KEY,
};
pub use sqlite::SqliteAuditStore;
