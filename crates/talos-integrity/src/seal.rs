//! Envelope sealing and verification.

use serde_json::Value;
use talos_types::{Envelope, EnvelopeFields, SCHEMA_VERSION};

use crate::canonical::canonical_hash_hex;
use crate::cursor::derive_cursor;
use crate::error::IntegrityError;
use crate::id::{generate_id_at, millis_to_timestamp, now_unix_millis};

/// Field excluded from the integrity hash.
pub const INTEGRITY_HASH_FIELD: &str = "integrity_hash";

/// Digest recorded in the envelope's integrity descriptor.
pub const HASH_ALGORITHM: &str = "sha256";

/// Serialization recorded in the envelope's integrity descriptor.
pub const CANONICALIZATION: &str = "json-sorted-keys-compact";

/// Seals `fields` into a new envelope stamped with a fresh id and the
/// current time.
///
/// # Errors
///
/// Returns [`IntegrityError::Serialization`] only if a field cannot be
/// represented as JSON.
pub fn build_envelope(fields: EnvelopeFields) -> Result<Envelope, IntegrityError> {
    let millis = now_unix_millis();
    let event_id = generate_id_at(millis, &mut rand::thread_rng());
    seal(fields, &event_id.to_string(), millis_to_timestamp(millis))
}

/// Seals `fields` with a caller-chosen identity and timestamp.
///
/// `request_hash` covers the producer fields without any hash fields; the
/// integrity hash is computed last over everything else. Equal inputs
/// always produce equal envelopes.
///
/// # Errors
///
/// Returns [`IntegrityError::Serialization`] only if a field cannot be
/// represented as JSON.
pub fn seal(
    fields: EnvelopeFields,
    event_id: &str,
    timestamp: f64,
) -> Result<Envelope, IntegrityError> {
    let mut request = serde_json::to_value(&fields)?;
    if let Value::Object(map) = &mut request {
        map.remove("hashes");
        map.remove(INTEGRITY_HASH_FIELD);
    }
    let request_hash = canonical_hash_hex(&request);

    let EnvelopeFields {
        event_type,
        outcome,
        session_id,
        correlation_id,
        agent_id,
        peer_id,
        tool,
        method,
        resource,
        metadata,
        metrics,
        mut hashes,
        mut integrity,
    } = fields;

    hashes.insert("request_hash".to_string(), request_hash);
    integrity.insert(
        "algorithm".to_string(),
        Value::String(HASH_ALGORITHM.to_string()),
    );
    integrity.insert(
        "canonicalization".to_string(),
        Value::String(CANONICALIZATION.to_string()),
    );

    let mut envelope = Envelope {
        event_id: event_id.to_string(),
        schema_version: SCHEMA_VERSION.to_string(),
        timestamp,
        cursor: derive_cursor(timestamp, event_id),
        event_type,
        outcome,
        session_id,
        correlation_id,
        agent_id,
        peer_id,
        tool,
        method,
        resource,
        metadata,
        metrics,
        hashes,
        integrity,
        integrity_hash: String::new(),
    };

    envelope.integrity_hash = canonical_hash_hex(&serde_json::to_value(&envelope)?);
    Ok(envelope)
}

/// Recomputes the integrity hash of `envelope` and compares it with the
/// recorded one.
///
/// # Errors
///
/// Returns [`IntegrityError::Mismatch`] if any field changed after sealing.
pub fn verify_envelope(envelope: &Envelope) -> Result<(), IntegrityError> {
    let computed = canonical_hash_hex(&serde_json::to_value(envelope)?);
    if computed == envelope.integrity_hash {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch {
            recorded: envelope.integrity_hash.clone(),
            computed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::decode_cursor;
    use crate::id::id_unix_millis;
    use talos_types::Outcome;

    const ID: &str = "0190f5c2-7a10-7cc3-9a2b-5d4c3b2a1f00";

    fn sample_fields() -> EnvelopeFields {
        let mut fields = EnvelopeFields::new("TOOL_CALL");
        fields.outcome = Outcome::Deny;
        fields.session_id = Some("s1".to_string());
        fields.tool = Some("git".to_string());
        fields
            .metadata
            .insert("reason".to_string(), Value::String("policy".to_string()));
        fields.metrics.insert("latency_ms".to_string(), 12.5);
        fields
    }

    #[test]
    fn equal_fields_seal_to_equal_hashes() {
        let a = seal(sample_fields(), ID, 1767225600.5).expect("seal");
        let b = seal(sample_fields(), ID, 1767225600.5).expect("seal");

        assert_eq!(a.integrity_hash, b.integrity_hash);
        assert_eq!(a.integrity_hash.len(), 64);
        assert_eq!(a, b);
    }

    #[test]
    fn any_field_change_changes_the_hash() {
        let base = seal(sample_fields(), ID, 1767225600.5).expect("seal");

        let mut other = sample_fields();
        other.tool = Some("weather".to_string());
        let changed = seal(other, ID, 1767225600.5).expect("seal");
        assert_ne!(base.integrity_hash, changed.integrity_hash);

        let later = seal(sample_fields(), ID, 1767225600.6).expect("seal");
        assert_ne!(base.integrity_hash, later.integrity_hash);
    }

    #[test]
    fn request_hash_ignores_caller_hashes() {
        let plain = seal(sample_fields(), ID, 1.0).expect("seal");

        let mut with_hash = sample_fields();
        with_hash
            .hashes
            .insert("response_hash".to_string(), "abc".to_string());
        let hashed = seal(with_hash, ID, 1.0).expect("seal");

        assert_eq!(plain.request_hash(), hashed.request_hash());
        assert_eq!(hashed.hashes["response_hash"], "abc");
        assert_ne!(plain.integrity_hash, hashed.integrity_hash);
    }

    #[test]
    fn records_descriptor_and_cursor() {
        let envelope = seal(sample_fields(), ID, 1767225600.5).expect("seal");

        assert_eq!(envelope.integrity["algorithm"], HASH_ALGORITHM);
        assert_eq!(envelope.integrity["canonicalization"], CANONICALIZATION);
        assert_eq!(envelope.schema_version, SCHEMA_VERSION);

        let parts = decode_cursor(&envelope.cursor).expect("cursor");
        assert_eq!(parts.to_string(), format!("1767225600.5:{ID}"));
    }

    #[test]
    fn verify_detects_tampering() {
        let envelope = seal(sample_fields(), ID, 1.0).expect("seal");
        verify_envelope(&envelope).expect("fresh envelope verifies");

        let mut tampered = envelope.clone();
        tampered.outcome = Outcome::Ok;
        assert!(matches!(
            verify_envelope(&tampered),
            Err(IntegrityError::Mismatch { .. })
        ));
    }

    #[test]
    fn verify_survives_json_round_trip() {
        let envelope = build_envelope(sample_fields()).expect("build");
        let json = serde_json::to_string(&envelope).expect("serialize");
        let restored: Envelope = serde_json::from_str(&json).expect("deserialize");
        verify_envelope(&restored).expect("restored envelope verifies");
    }

    #[test]
    fn built_envelopes_embed_their_timestamp_in_the_id() {
        let envelope = build_envelope(EnvelopeFields::new("X")).expect("build");
        let id = uuid::Uuid::parse_str(&envelope.event_id).expect("uuid text");
        assert_eq!(millis_to_timestamp(id_unix_millis(&id)), envelope.timestamp);
    }
}
