//! The `init` handshake that turns a raw connection into a session.
//!
//! A [`HandshakeController`] lives for one connection. It waits for exactly
//! one frame, validates it, and either acknowledges with `init_ack` or sends
//! an `error` frame and closes. Once it reaches
//! [`HandshakeState::Established`] or [`HandshakeState::Rejected`] it does
//! not move again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use talos_types::{ClientMessage, Filters, ServerMessage, PROTOCOL_VERSION};

use crate::error::{HandshakeError, HandshakeRejection};
use crate::replay::ReplayGuard;
use crate::settings::StreamSettings;
use crate::sink::SessionSink;

/// Capability substrings that grant read access to the stream.
pub const CAPABILITY_MARKERS: [&str; 2] = ["talos_read", "allow"];

/// Characters of the nonce carried into the session id.
const SESSION_NONCE_CHARS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitInit,
    Validating,
    Established,
    Rejected,
}

/// A successfully negotiated session, ready to register.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub session_id: String,
    pub filters: Filters,
}

pub struct HandshakeController {
    guard: Arc<ReplayGuard>,
    timeout: Duration,
    heartbeat_interval_ms: u64,
    state: HandshakeState,
}

impl HandshakeController {
    pub fn new(guard: Arc<ReplayGuard>, settings: &StreamSettings) -> Self {
        Self {
            guard,
            timeout: settings.handshake_timeout(),
            heartbeat_interval_ms: settings.heartbeat_interval().as_millis() as u64,
            state: HandshakeState::AwaitInit,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Runs the handshake over `sink`, reading the client's first frame from
    /// `first_frame` (which resolves to `None` if the transport closes).
    ///
    /// On success the `init_ack` has already been written. On rejection the
    /// `error` frame and close have already been written.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::Rejected`] if the client failed validation or timed
    /// out, [`HandshakeError::Disconnected`] if it left first, and
    /// [`HandshakeError::Transport`] if a write failed.
    pub async fn run<S, F>(&mut self, sink: &mut S, first_frame: F) -> Result<Accepted, HandshakeError>
    where
        S: SessionSink + ?Sized,
        F: Future<Output = Option<String>>,
    {
        let raw = match tokio::time::timeout(self.timeout, first_frame).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.state = HandshakeState::Rejected;
                tracing::debug!("connection closed before init");
                return Err(HandshakeError::Disconnected);
            }
            Err(_) => {
                self.state = HandshakeState::Rejected;
                let rejection = HandshakeRejection::invalid_message(format!(
                    "no init received within {}ms",
                    self.timeout.as_millis()
                ));
                return Err(reject(sink, rejection).await);
            }
        };

        match self.evaluate(&raw, Utc::now()) {
            Ok(accepted) => {
                let ack = ServerMessage::InitAck {
                    session_id: accepted.session_id.clone(),
                    heartbeat_interval_ms: self.heartbeat_interval_ms,
                };
                if let Err(e) = sink.send(&ack).await {
                    self.state = HandshakeState::Rejected;
                    return Err(e.into());
                }
                tracing::info!(session_id = %accepted.session_id, "stream session established");
                Ok(accepted)
            }
            Err(rejection) => Err(reject(sink, rejection).await),
        }
    }

    /// Validates one raw `init` frame against the clock `now`.
    ///
    /// Pure apart from consuming the nonce in the replay guard.
    ///
    /// # Errors
    ///
    /// Returns the [`HandshakeRejection`] to send to the client.
    pub fn evaluate(&mut self, raw: &str, now: DateTime<Utc>) -> Result<Accepted, HandshakeRejection> {
        if self.state != HandshakeState::AwaitInit {
            return Err(HandshakeRejection::invalid_message("handshake already completed"));
        }
        self.state = HandshakeState::Validating;

        let result = self.validate(raw, now);
        self.state = match &result {
            Ok(_) => HandshakeState::Established,
            Err(_) => HandshakeState::Rejected,
        };
        result
    }

    fn validate(&self, raw: &str, now: DateTime<Utc>) -> Result<Accepted, HandshakeRejection> {
        let ClientMessage::Init(init) = serde_json::from_str::<ClientMessage>(raw).map_err(|e| {
            HandshakeRejection::invalid_message("First message must be valid 'init'")
                .with_details(serde_json::json!({ "error": e.to_string() }))
        })?;

        if init.version != PROTOCOL_VERSION {
            return Err(HandshakeRejection::invalid_message(format!(
                "unsupported protocol version {}",
                init.version
            )));
        }
        if init.nonce.trim().is_empty() {
            return Err(HandshakeRejection::invalid_message("nonce must not be empty"));
        }

        if !self.guard.validate_and_consume_at(&init.nonce, &init.ts, now) {
            return Err(HandshakeRejection::auth_failed(
                "Invalid nonce or timestamp skew",
            ));
        }

        if !has_read_capability(&init.capability) {
            return Err(HandshakeRejection::auth_failed(
                "Missing required capability scope",
            ));
        }

        Ok(Accepted {
            session_id: session_id_for(&init.nonce, now, &mut rand::thread_rng()),
            filters: init.filters.unwrap_or_default(),
        })
    }
}

/// Writes the rejection frame and close, logging the outcome.
async fn reject<S>(sink: &mut S, rejection: HandshakeRejection) -> HandshakeError
where
    S: SessionSink + ?Sized,
{
    tracing::warn!(
        kind = %rejection.kind(),
        code = %rejection.code,
        message = %rejection.message,
        "handshake rejected"
    );

    let frame = rejection.to_message();
    let close = rejection.close_code();
    if let Err(e) = sink.send(&frame).await {
        tracing::debug!(error = %e, "could not deliver handshake rejection");
    }
    if let Err(e) = sink.close(close, close.reason()).await {
        tracing::debug!(error = %e, "could not close rejected connection");
    }
    HandshakeError::Rejected(rejection)
}

/// Placeholder scope check until capabilities are verified cryptographically.
pub fn has_read_capability(capability: &str) -> bool {
    CAPABILITY_MARKERS.iter().any(|m| capability.contains(m))
}

/// `ws-<unix seconds>-<6 chars>`, taking the first alphanumeric characters
/// of the nonce and topping up with random ones when there are too few.
pub fn session_id_for<R: Rng + ?Sized>(nonce: &str, now: DateTime<Utc>, rng: &mut R) -> String {
    let mut tail: String = nonce
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(SESSION_NONCE_CHARS)
        .collect();
    while tail.len() < SESSION_NONCE_CHARS {
        tail.push(char::from(rng.sample(Alphanumeric)));
    }
    format!("ws-{}-{tail}", now.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::test_support::{Frame, RecordingSink};
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use talos_types::{CloseCode, ErrorCode};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).single().expect("valid date")
    }

    fn controller() -> HandshakeController {
        let settings = StreamSettings::default();
        let guard = Arc::new(ReplayGuard::new(settings.max_clock_skew(), settings.nonce_ceiling));
        HandshakeController::new(guard, &settings)
    }

    fn init(nonce: &str, ts: &str, capability: &str) -> String {
        serde_json::json!({
            "type": "init",
            "version": 1,
            "capability": capability,
            "nonce": nonce,
            "ts": ts,
        })
        .to_string()
    }

    fn is_session_id(id: &str) -> bool {
        let mut parts = id.splitn(3, '-');
        parts.next() == Some("ws")
            && parts
                .next()
                .is_some_and(|secs| !secs.is_empty() && secs.chars().all(|c| c.is_ascii_digit()))
            && parts
                .next()
                .is_some_and(|tail| tail.len() == 6 && tail.chars().all(|c| c.is_ascii_alphanumeric()))
    }

    #[test]
    fn valid_init_is_established() {
        let mut c = controller();
        let accepted = c
            .evaluate(&init("n1", "2026-01-01T12:00:00Z", "talos_read_allow"), now())
            .expect("should accept");
        assert_eq!(c.state(), HandshakeState::Established);
        assert!(is_session_id(&accepted.session_id), "{}", accepted.session_id);
        assert!(accepted.session_id.starts_with("ws-1767268800-n1"));
        assert!(accepted.filters.is_empty());
    }

    #[test]
    fn filters_are_carried_through() {
        let mut c = controller();
        let raw = serde_json::json!({
            "type": "init",
            "capability": "allow",
            "nonce": "abc",
            "ts": "2026-01-01T12:00:00Z",
            "filters": {"event_type": "X"},
        })
        .to_string();
        let accepted = c.evaluate(&raw, now()).expect("should accept");
        assert_eq!(accepted.filters["event_type"], "X");
    }

    #[test]
    fn replayed_nonce_fails_auth() {
        let settings = StreamSettings::default();
        let guard = Arc::new(ReplayGuard::new(settings.max_clock_skew(), settings.nonce_ceiling));

        let mut first = HandshakeController::new(guard.clone(), &settings);
        first
            .evaluate(&init("n1", "2026-01-01T12:00:00Z", "allow"), now())
            .expect("first use");

        let mut second = HandshakeController::new(guard, &settings);
        let rejection = second
            .evaluate(&init("n1", "2026-01-01T12:00:00Z", "allow"), now())
            .expect_err("replay");
        assert_eq!(rejection.code, ErrorCode::AuthFailed);
        assert_eq!(rejection.close_code(), CloseCode::AuthFailed);
        assert_eq!(second.state(), HandshakeState::Rejected);
    }

    #[test]
    fn schema_violations_are_invalid_messages() {
        let cases = [
            "not json".to_string(),
            r#"{"type":"heartbeat"}"#.to_string(),
            r#"{"type":"init","capability":"allow","ts":"2026-01-01T12:00:00Z"}"#.to_string(),
            serde_json::json!({
                "type": "init", "version": 2, "capability": "allow",
                "nonce": "n", "ts": "2026-01-01T12:00:00Z",
            })
            .to_string(),
            init("   ", "2026-01-01T12:00:00Z", "allow"),
        ];

        for raw in cases {
            let mut c = controller();
            let rejection = c.evaluate(&raw, now()).expect_err("should reject");
            assert_eq!(rejection.code, ErrorCode::InvalidMessage, "{raw}");
            assert_eq!(rejection.close_code(), CloseCode::InvalidFormat);
        }
    }

    #[test]
    fn skewed_or_garbled_timestamp_fails_auth() {
        for ts in ["2026-01-01T11:54:00Z", "noon"] {
            let mut c = controller();
            let rejection = c.evaluate(&init("n", ts, "allow"), now()).expect_err("reject");
            assert_eq!(rejection.code, ErrorCode::AuthFailed, "{ts}");
        }
    }

    #[test]
    fn missing_capability_marker_fails_auth() {
        let mut c = controller();
        let rejection = c
            .evaluate(&init("n", "2026-01-01T12:00:00Z", "talos_write"), now())
            .expect_err("reject");
        assert_eq!(rejection.code, ErrorCode::AuthFailed);
        assert_eq!(rejection.message, "Missing required capability scope");
    }

    #[test]
    fn terminal_states_are_final() {
        let mut c = controller();
        c.evaluate(&init("n1", "2026-01-01T12:00:00Z", "allow"), now())
            .expect("accept");
        let again = c.evaluate(&init("n2", "2026-01-01T12:00:00Z", "allow"), now());
        assert!(again.is_err());
        assert_eq!(c.state(), HandshakeState::Established);
    }

    #[test]
    fn session_id_pads_short_nonces_and_skips_symbols() {
        let mut rng = StdRng::seed_from_u64(7);
        let id = session_id_for("a-b_c", now(), &mut rng);
        assert!(is_session_id(&id), "{id}");
        assert!(id.starts_with("ws-1767268800-abc"));

        let id = session_id_for("abcdefghij", now(), &mut rng);
        assert_eq!(id, "ws-1767268800-abcdef");
    }

    #[tokio::test]
    async fn run_sends_ack_on_success() {
        let mut c = controller();
        let mut sink = RecordingSink::default();
        let ts = Utc::now().to_rfc3339();

        let accepted = c
            .run(&mut sink, async { Some(init("n1", &ts, "talos_read")) })
            .await
            .expect("should accept");

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Message(ServerMessage::InitAck {
                session_id,
                heartbeat_interval_ms,
            }) => {
                assert_eq!(session_id, &accepted.session_id);
                assert_eq!(*heartbeat_interval_ms, 30_000);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_sends_error_then_close_on_rejection() {
        let mut c = controller();
        let mut sink = RecordingSink::default();

        let err = c
            .run(&mut sink, async { Some("{}".to_string()) })
            .await
            .expect_err("should reject");
        assert!(matches!(err, HandshakeError::Rejected(_)));

        let frames = sink.frames();
        assert!(matches!(
            &frames[0],
            Frame::Message(ServerMessage::Error { code: ErrorCode::InvalidMessage, .. })
        ));
        assert_eq!(frames[1], Frame::Close(CloseCode::InvalidFormat));
    }

    #[tokio::test(start_paused = true)]
    async fn run_times_out_waiting_for_init() {
        let mut c = controller();
        let mut sink = RecordingSink::default();

        let err = c
            .run(&mut sink, std::future::pending::<Option<String>>())
            .await
            .expect_err("should time out");
        assert!(matches!(err, HandshakeError::Rejected(ref r) if r.close_code() == CloseCode::InvalidFormat));
        assert_eq!(c.state(), HandshakeState::Rejected);
        assert_eq!(sink.frames().last(), Some(&Frame::Close(CloseCode::InvalidFormat)));
    }

    #[tokio::test]
    async fn run_reports_early_disconnect() {
        let mut c = controller();
        let mut sink = RecordingSink::default();

        let err = c
            .run(&mut sink, async { None })
            .await
            .expect_err("should fail");
        assert!(matches!(err, HandshakeError::Disconnected));
        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn run_reports_ack_write_failure() {
        let mut c = controller();
        let mut sink = RecordingSink::failing();
        let ts = Utc::now().to_rfc3339();

        let err = c
            .run(&mut sink, async { Some(init("n1", &ts, "allow")) })
            .await
            .expect_err("should fail");
        assert!(matches!(err, HandshakeError::Transport(SinkError::Closed)));
        assert_eq!(c.state(), HandshakeState::Rejected);
    }
}
