//! Time-ordered event identifiers.

use rand::RngCore;
use uuid::Uuid;

/// Current wall-clock time in Unix milliseconds.
///
/// Clocks set before the epoch collapse to zero.
pub fn now_unix_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Converts Unix milliseconds to the fractional seconds used in envelopes.
pub fn millis_to_timestamp(millis: u64) -> f64 {
    millis as f64 / 1000.0
}

/// Generates a new identifier stamped with the current time.
pub fn generate_id() -> Uuid {
    generate_id_at(now_unix_millis(), &mut rand::thread_rng())
}

/// Generates an identifier for the given millisecond timestamp.
///
/// Layout: bytes 0..6 hold the big-endian timestamp (only the low 48 bits
/// are kept), the high nibble of byte 6 is the version (7), the top two
/// bits of byte 8 are the RFC 4122 variant, and every other bit comes from
/// `rng`. Identifiers minted in the same millisecond order arbitrarily.
pub fn generate_id_at<R: RngCore + ?Sized>(unix_millis: u64, rng: &mut R) -> Uuid {
    let mut random = [0u8; 10];
    rng.fill_bytes(&mut random);
    uuid::Builder::from_unix_timestamp_millis(unix_millis, &random).into_uuid()
}

/// Extracts the embedded millisecond timestamp from an identifier.
pub fn id_unix_millis(id: &Uuid) -> u64 {
    let bytes = id.as_bytes();
    bytes[..6]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}
