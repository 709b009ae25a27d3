//! WebSocket push transport at `/api/events/stream`.

use crate::AppState;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use talos_stream::{Accepted, HandshakeController, HandshakeError, SessionSink, SinkError};
use talos_types::{CloseCode, ServerMessage};

/// Writes frames to the outbound half of a socket.
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl SessionSink for WsSink {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), SinkError> {
        let json = serde_json::to_string(message)?;
        self.inner
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), SinkError> {
        let frame = CloseFrame {
            code: code.as_u16(),
            reason: reason.to_string().into(),
        };
        self.inner
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }
}

/// Handler for `GET /api/events/stream`.
///
/// The client must send an `init` frame first; see
/// [`HandshakeController`].
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();
    let mut sink = WsSink { inner: sender };

    let Some(accepted) = negotiate(&state, &mut sink, first_frame(&mut receiver)).await else {
        return;
    };

    let session_id = accepted.session_id;
    let mut session = state
        .registry
        .register(session_id.clone(), sink, accepted.filters);

    // Clients send nothing after `init`; keep reading only to notice the
    // close, and stop early if the delivery task ends the session.
    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(session_id = %session_id, error = %e, "websocket read error");
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(_)) => {
                    tracing::debug!(session_id = %session_id, "ignoring client frame after init");
                }
            },
            joined = &mut session.task => {
                if let Err(e) = joined {
                    tracing::error!(session_id = %session_id, error = %e, "delivery task panicked");
                }
                break;
            }
        }
    }

    // A client that reused this id may own the entry by now.
    state
        .registry
        .deregister_if_current(&session_id, session.generation);
    tracing::info!(session_id = %session_id, "websocket session ended");
}

/// Runs the handshake over `sink`. If the `init_ack` write fails the
/// connection gets a best-effort internal-error close.
async fn negotiate<S, F>(state: &AppState, sink: &mut S, first_frame: F) -> Option<Accepted>
where
    S: SessionSink,
    F: Future<Output = Option<String>>,
{
    let mut controller =
        HandshakeController::new(state.replay_guard.clone(), &state.config.stream);
    match controller.run(sink, first_frame).await {
        Ok(accepted) => Some(accepted),
        Err(HandshakeError::Rejected(_) | HandshakeError::Disconnected) => None,
        Err(HandshakeError::Transport(e)) => {
            tracing::warn!(kind = %e.kind(), error = %e, "handshake write failed");
            let code = CloseCode::InternalError;
            if let Err(e) = sink.close(code, code.reason()).await {
                tracing::debug!(error = %e, "could not close after failed handshake");
            }
            None
        }
    }
}

/// Resolves to the first data frame as text, or `None` if the socket closes
/// first. Binary frames are read as lossy UTF-8 so they fail validation.
async fn first_frame(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Binary(bytes)) => return Some(String::from_utf8_lossy(&bytes).into_owned()),
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use talos_audit::MemoryAuditStore;

    /// Refuses every frame but records close codes.
    #[derive(Default)]
    struct RefusingSink {
        closes: Vec<CloseCode>,
    }

    #[async_trait]
    impl SessionSink for RefusingSink {
        async fn send(&mut self, _message: &ServerMessage) -> Result<(), SinkError> {
            Err(SinkError::Transport("connection reset".to_string()))
        }

        async fn close(&mut self, code: CloseCode, _reason: &str) -> Result<(), SinkError> {
            self.closes.push(code);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_init_ack_closes_with_internal_error() {
        let state = AppState::new(Config::default(), Arc::new(MemoryAuditStore::new()));
        let mut sink = RefusingSink::default();
        let init = serde_json::json!({
            "type": "init",
            "version": 1,
            "capability": "talos_read_allow",
            "nonce": "ackfail1",
            "ts": chrono::Utc::now().to_rfc3339(),
        })
        .to_string();

        let accepted = negotiate(&state, &mut sink, async { Some(init) }).await;

        assert!(accepted.is_none());
        assert_eq!(sink.closes, vec![CloseCode::InternalError]);
        assert!(state.registry.is_empty());
    }
}
