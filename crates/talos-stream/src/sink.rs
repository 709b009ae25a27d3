//! The write half of a client transport.

use async_trait::async_trait;
use talos_types::{CloseCode, ServerMessage};

use crate::error::SinkError;

/// Where a session's frames go. WebSocket connections implement this in
/// the gateway; tests use in-memory recorders.
#[async_trait]
pub trait SessionSink: Send + 'static {
    /// Writes one frame.
    async fn send(&mut self, message: &ServerMessage) -> Result<(), SinkError>;

    /// Closes the transport with an application close code.
    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), SinkError>;
}
