//! Opaque pagination cursors.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::CursorError;

/// Derives the cursor for an envelope from its timestamp and identifier.
pub fn derive_cursor(timestamp: impl std::fmt::Display, event_id: impl std::fmt::Display) -> String {
    URL_SAFE_NO_PAD.encode(format!("{timestamp}:{event_id}").as_bytes())
}

/// The two halves of a decoded cursor, exactly as they were encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorParts {
    pub timestamp: String,
    pub event_id: String,
}

impl CursorParts {
    /// Parses the timestamp half as fractional Unix seconds.
    pub fn timestamp_secs(&self) -> Result<f64, CursorError> {
        self.timestamp
            .parse()
            .map_err(|_| CursorError::Malformed(format!("bad timestamp: {}", self.timestamp)))
    }
}

impl std::fmt::Display for CursorParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.event_id)
    }
}

/// Reverses [`derive_cursor`].
///
/// # Errors
///
/// Returns [`CursorError`] if the cursor is not base64, not UTF-8, or has no
/// `:` separator between two non-empty halves.
pub fn decode_cursor(cursor: &str) -> Result<CursorParts, CursorError> {
    let bytes = URL_SAFE_NO_PAD.decode(cursor.as_bytes())?;
    let text = String::from_utf8(bytes)?;

    match text.split_once(':') {
        Some((ts, id)) if !ts.is_empty() && !id.is_empty() => Ok(CursorParts {
            timestamp: ts.to_string(),
            event_id: id.to_string(),
        }),
        _ => Err(CursorError::Malformed(text)),
    }
}
