//! Audit event records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Schema version stamped on every envelope.
pub const SCHEMA_VERSION: &str = "1";

/// Outcome of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Outcome {
    /// The action completed.
    #[default]
    #[serde(rename = "OK")]
    Ok,
    /// The action was refused by policy.
    #[serde(rename = "DENY")]
    Deny,
    /// The action failed.
    #[serde(rename = "ERROR")]
    Error,
    /// The action has not resolved yet.
    #[serde(rename = "PENDING")]
    Pending,
}

impl Outcome {
    /// Returns the canonical string label for this outcome.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Deny => "DENY",
            Self::Error => "ERROR",
            Self::Pending => "PENDING",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = ParseOutcomeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(Self::Ok),
            "DENY" => Ok(Self::Deny),
            "ERROR" => Ok(Self::Error),
            "PENDING" => Ok(Self::Pending),
            _ => Err(ParseOutcomeError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown outcome string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown outcome: {0}")]
pub struct ParseOutcomeError(pub String);

/// Producer-supplied portion of an audit event.
///
/// Everything the producer knows before the event is sealed. Identity,
/// timing, cursor, and integrity fields are assigned by the envelope
/// builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeFields {
    /// Event type label (e.g. `CHAT_REQUEST_RECEIVED`).
    pub event_type: String,
    #[serde(default)]
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Free-form context attached by the producer.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Numeric measurements (latency, token counts, ...). Values must be finite.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Caller-provided digests. `request_hash` is always overwritten on seal.
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    /// Integrity descriptor entries. The builder adds its own keys.
    #[serde(default)]
    pub integrity: BTreeMap<String, Value>,
}

impl EnvelopeFields {
    /// Shorthand for fields carrying only an event type.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Self::default()
        }
    }
}

/// A sealed, immutable audit event.
///
/// Once built, `integrity_hash` covers every other field. Mutating a field
/// after the fact makes [`Envelope`] fail verification in
/// `talos-integrity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Time-ordered 128-bit identifier, hyphenated hex.
    pub event_id: String,
    pub schema_version: String,
    /// Unix seconds with millisecond precision, equal to the id's embedded time.
    pub timestamp: f64,
    /// Opaque pagination token derived from `timestamp` and `event_id`.
    pub cursor: String,
    pub event_type: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub integrity: BTreeMap<String, Value>,
    /// Lowercase hex SHA-256 over the canonical form of every other field.
    pub integrity_hash: String,
}

impl Envelope {
    /// Returns the `request_hash` recorded at seal time, if any.
    pub fn request_hash(&self) -> Option<&str> {
        self.hashes.get("request_hash").map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_round_trip() {
        for outcome in [Outcome::Ok, Outcome::Deny, Outcome::Error, Outcome::Pending] {
            let parsed: Outcome = outcome.as_str().parse().expect("label should parse");
            assert_eq!(parsed, outcome);

            let json = serde_json::to_string(&outcome).expect("serialize");
            assert_eq!(json, format!("\"{}\"", outcome.as_str()));
        }
    }

    #[test]
    fn outcome_rejects_unknown_label() {
        let err = "MAYBE".parse::<Outcome>().unwrap_err();
        assert_eq!(err.to_string(), "unknown outcome: MAYBE");
    }

    #[test]
    fn fields_deserialize_with_defaults() {
        let fields: EnvelopeFields =
            serde_json::from_str(r#"{"event_type":"TOOL_CALL"}"#).expect("minimal body");
        assert_eq!(fields.event_type, "TOOL_CALL");
        assert_eq!(fields.outcome, Outcome::Ok);
        assert!(fields.session_id.is_none());
        assert!(fields.metadata.is_empty());
    }

    #[test]
    fn unset_optionals_are_absent_from_json() {
        let fields = EnvelopeFields::new("X");
        let json = serde_json::to_value(&fields).expect("serialize");
        assert!(json.get("session_id").is_none());
        assert!(json.get("tool").is_none());
        assert_eq!(json["outcome"], "OK");
    }
}
