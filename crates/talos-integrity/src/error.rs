//! Error types for envelope sealing and cursor decoding.

/// Errors raised while sealing or verifying an envelope.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    /// A field could not be converted to JSON.
    #[error("envelope serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The recomputed hash does not match the recorded one.
    #[error("integrity hash mismatch: recorded {recorded}, computed {computed}")]
    Mismatch {
        /// The hash stored on the envelope.
        recorded: String,
        /// The hash recomputed from the envelope's fields.
        computed: String,
    },
}

/// Errors raised while decoding a pagination cursor.
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("cursor is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("cursor is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// The decoded text lacks the `<timestamp>:<event_id>` shape.
    #[error("malformed cursor: {0}")]
    Malformed(String),
}
