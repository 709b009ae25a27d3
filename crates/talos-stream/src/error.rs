//! Error kinds for live delivery.

use serde_json::Value;
use talos_types::{CloseCode, ErrorCode, ServerMessage};

/// Failure classes of the live pipeline and how each ends a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamErrorKind {
    /// Malformed or unsupported `init`.
    ProtocolViolation,
    /// Replayed nonce, clock skew, or missing capability scope.
    AuthFailure,
    /// The session's queue filled up.
    SlowConsumer,
    /// Fault inside the gateway during handshake or delivery.
    InternalError,
    /// Writing to the client failed mid-stream.
    TransportError,
    /// The durable store rejected an envelope.
    DurableForwardFailure,
}

impl StreamErrorKind {
    /// Close code sent to the client, if this kind closes the connection
    /// with one. Transport and forward failures never do.
    pub fn close_code(self) -> Option<CloseCode> {
        match self {
            Self::ProtocolViolation => Some(CloseCode::InvalidFormat),
            Self::AuthFailure => Some(CloseCode::AuthFailed),
            Self::SlowConsumer => Some(CloseCode::SlowConsumer),
            Self::InternalError => Some(CloseCode::InternalError),
            Self::TransportError | Self::DurableForwardFailure => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolViolation => "protocol_violation",
            Self::AuthFailure => "auth_failure",
            Self::SlowConsumer => "slow_consumer",
            Self::InternalError => "internal_error",
            Self::TransportError => "transport_error",
            Self::DurableForwardFailure => "durable_forward_failure",
        }
    }
}

impl std::fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a handshake was refused. Sent to the client as an `error` frame
/// before the connection is closed with [`HandshakeRejection::close_code`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HandshakeRejection {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl HandshakeRejection {
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidMessage,
            message: message.into(),
            details: None,
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::AuthFailed,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn kind(&self) -> StreamErrorKind {
        match self.code {
            ErrorCode::InvalidMessage => StreamErrorKind::ProtocolViolation,
            ErrorCode::AuthFailed | ErrorCode::CapabilityExpired => StreamErrorKind::AuthFailure,
            ErrorCode::SlowConsumer => StreamErrorKind::SlowConsumer,
            ErrorCode::RateLimited | ErrorCode::InternalError => StreamErrorKind::InternalError,
        }
    }

    pub fn close_code(&self) -> CloseCode {
        self.code.close_code()
    }

    /// The `error` frame describing this rejection.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code,
            message: self.message.clone(),
            details: self.details.clone(),
        }
    }
}

/// Failure writing to a client transport.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The peer is gone.
    #[error("transport closed")]
    Closed,

    /// The transport reported an I/O or protocol error.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SinkError {
    pub fn kind(&self) -> StreamErrorKind {
        match self {
            Self::Closed | Self::Transport(_) => StreamErrorKind::TransportError,
            Self::Encode(_) => StreamErrorKind::InternalError,
        }
    }
}

/// Why a handshake did not produce a session.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The client was told why and the connection was closed.
    #[error("handshake rejected: {0}")]
    Rejected(HandshakeRejection),

    /// The client went away before sending `init`.
    #[error("transport closed before init")]
    Disconnected,

    /// Writing the acknowledgement or rejection failed.
    #[error(transparent)]
    Transport(#[from] SinkError),
}
