//! Envelope construction and integrity hashing.
//!
//! Every audit event published by the gateway is sealed here before it is
//! stored or fanned out. Sealing assigns three derived properties:
//!
//! | Property | Derivation |
//! |----------|------------|
//! | `event_id` | 48-bit big-endian Unix milliseconds, version 7, RFC 4122 variant, random tail |
//! | `cursor` | URL-safe base64 (no padding) of `"<timestamp>:<event_id>"` |
//! | `integrity_hash` | SHA-256 of the canonical JSON of every other field |
//!
//! Canonical JSON sorts object keys at every depth and carries no
//! insignificant whitespace, so two envelopes with equal field values always
//! hash identically regardless of how their maps were assembled.
//!
//! # Usage
//!
//! ```rust,ignore
//! use talos_integrity::{build_envelope, verify_envelope};
//! use talos_types::EnvelopeFields;
//!
//! let envelope = build_envelope(EnvelopeFields::new("CHAT_REQUEST_RECEIVED"))?;
//! verify_envelope(&envelope)?;
//! ```

mod canonical;
mod cursor;
mod error;
mod id;
mod seal;

pub use canonical::{canonical_hash, canonical_hash_hex, canonical_hash_of, canonical_json};
pub use cursor::{decode_cursor, derive_cursor, CursorParts};
pub use error::{CursorError, IntegrityError};
pub use id::{generate_id, generate_id_at, id_unix_millis, millis_to_timestamp, now_unix_millis};
pub use seal::{
    build_envelope, seal, verify_envelope, CANONICALIZATION, HASH_ALGORITHM, INTEGRITY_HASH_FIELD,
};
