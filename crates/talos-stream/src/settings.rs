//! Tunables for live delivery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Live-stream settings, deserialized from the `[stream]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Pending messages a session may hold before it is evicted.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Idle time after which a stream session receives a heartbeat frame.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long a new connection may take to send its `init` frame.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Largest accepted distance between client and server clocks.
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u64,

    /// Remembered nonces above which the replay cache is reset.
    #[serde(default = "default_nonce_ceiling")]
    pub nonce_ceiling: usize,

    /// Idle time after which an SSE stream emits a keep-alive comment.
    #[serde(default = "default_sse_keepalive_secs")]
    pub sse_keepalive_secs: u64,
}

fn default_queue_capacity() -> usize {
    1_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_max_clock_skew_secs() -> u64 {
    300
}

fn default_nonce_ceiling() -> usize {
    10_000
}

fn default_sse_keepalive_secs() -> u64 {
    15
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_clock_skew_secs: default_max_clock_skew_secs(),
            nonce_ceiling: default_nonce_ceiling(),
            sse_keepalive_secs: default_sse_keepalive_secs(),
        }
    }
}

impl StreamSettings {
    /// Never shorter than 1ms, so an idle session cannot spin.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }

    pub fn sse_keepalive(&self) -> Duration {
        Duration::from_secs(self.sse_keepalive_secs)
    }
}
