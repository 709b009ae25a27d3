//! Error types for the audit store.

/// Errors that can occur during audit store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database operation failed.
    #[error("audit database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection was available.
    #[error("audit database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization or deserialization failed.
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The `before` cursor could not be decoded.
    #[error("invalid cursor: {0}")]
    InvalidCursor(#[from] talos_integrity::CursorError),

    /// A stored row no longer maps onto an envelope.
    #[error("corrupt audit row {event_id}: {reason}")]
    Corrupt { event_id: String, reason: String },
}
