//! Tagged JSON frames for live subscribers.
//!
//! Every frame carries a `type` discriminant. Clients send exactly one
//! `init` frame; everything else flows server to client.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Envelope;

/// The only handshake protocol version this gateway speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Subscriber filter: envelope field name to required value.
pub type Filters = BTreeMap<String, Value>;

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Init(InitMessage),
}

/// Session opening request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    #[serde(default = "default_protocol_version")]
    pub version: u32,
    /// Scope string asserting read access.
    pub capability: String,
    /// Single-use value; replays are refused.
    pub nonce: String,
    /// Client clock, ISO 8601.
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
}

/// Machine-readable error codes carried in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    CapabilityExpired,
    InvalidMessage,
    RateLimited,
    SlowConsumer,
    InternalError,
}

impl ErrorCode {
    /// The close code sent alongside this error when it ends the session.
    pub fn close_code(self) -> CloseCode {
        match self {
            Self::AuthFailed => CloseCode::AuthFailed,
            Self::CapabilityExpired => CloseCode::CapabilityExpired,
            Self::InvalidMessage => CloseCode::InvalidFormat,
            Self::RateLimited => CloseCode::PolicyViolation,
            Self::SlowConsumer => CloseCode::SlowConsumer,
            Self::InternalError => CloseCode::InternalError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::CapabilityExpired => "CAPABILITY_EXPIRED",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::RateLimited => "RATE_LIMITED",
            Self::SlowConsumer => "SLOW_CONSUMER",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application close codes for the push transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    SlowConsumer = 4000,
    AuthFailed = 4001,
    /// Reserved.
    CapabilityExpired = 4002,
    InvalidFormat = 4003,
    InternalError = 4004,
    /// Reserved.
    PolicyViolation = 4005,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Short human-readable reason sent in the close frame.
    pub fn reason(self) -> &'static str {
        match self {
            Self::SlowConsumer => "slow consumer",
            Self::AuthFailed => "authentication failed",
            Self::CapabilityExpired => "capability expired",
            Self::InvalidFormat => "invalid message format",
            Self::InternalError => "internal error",
            Self::PolicyViolation => "policy violation",
        }
    }
}

/// Frames the gateway sends to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    InitAck {
        session_id: String,
        heartbeat_interval_ms: u64,
    },
    Event {
        event: Arc<Envelope>,
        cursor: String,
        server_time: String,
    },
    Heartbeat {
        last_cursor: Option<String>,
        interval_ms: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Returns the cursor carried by an `event` frame.
    pub fn cursor(&self) -> Option<&str> {
        match self {
            Self::Event { cursor, .. } => Some(cursor),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_parses_with_default_version() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"init","capability":"allow","nonce":"n1","ts":"2026-01-01T00:00:00Z"}"#,
        )
        .expect("valid init");
        let ClientMessage::Init(init) = msg;
        assert_eq!(init.version, PROTOCOL_VERSION);
        assert!(init.filters.is_none());
    }

    #[test]
    fn non_init_frames_do_not_parse_as_client_messages() {
        let err = serde_json::from_str::<ClientMessage>(
            r#"{"type":"heartbeat","last_cursor":null,"interval_ms":1}"#,
        );
        assert!(err.is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"capability":"allow"}"#).is_err());
    }

    #[test]
    fn error_frame_shape() {
        let json = serde_json::to_value(ServerMessage::error(ErrorCode::SlowConsumer, "too slow"))
            .expect("serialize");
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "SLOW_CONSUMER");
        assert_eq!(json["message"], "too slow");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn init_ack_frame_shape() {
        let json = serde_json::to_value(ServerMessage::InitAck {
            session_id: "ws-1-abcdef".to_string(),
            heartbeat_interval_ms: 30_000,
        })
        .expect("serialize");
        assert_eq!(json["type"], "init_ack");
        assert_eq!(json["session_id"], "ws-1-abcdef");
        assert_eq!(json["heartbeat_interval_ms"], 30_000);
    }

    #[test]
    fn close_codes_map_from_errors() {
        assert_eq!(CloseCode::SlowConsumer.as_u16(), 4000);
        assert_eq!(CloseCode::PolicyViolation.as_u16(), 4005);
        assert_eq!(ErrorCode::SlowConsumer.close_code().as_u16(), 4000);
        assert_eq!(ErrorCode::AuthFailed.close_code().as_u16(), 4001);
        assert_eq!(ErrorCode::InvalidMessage.close_code().as_u16(), 4003);
        assert_eq!(ErrorCode::InternalError.close_code().as_u16(), 4004);
    }
}
