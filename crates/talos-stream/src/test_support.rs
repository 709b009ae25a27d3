//! In-memory sinks for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use talos_types::{CloseCode, ServerMessage};

use crate::error::SinkError;
use crate::sink::SessionSink;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(ServerMessage),
    Close(CloseCode),
}

/// Records every frame written to it. Clones share the same record.
#[derive(Clone, Default)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<Frame>>>,
    delay: Option<Duration>,
    fail: bool,
}

impl RecordingSink {
    /// A sink that sleeps before every write.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// A sink whose peer is already gone.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().expect("frames lock").clone()
    }

    /// Cursors of the `event` frames written so far, in order.
    pub fn event_cursors(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Message(m) => m.cursor().map(str::to_string),
                Frame::Close(_) => None,
            })
            .collect()
    }

    /// Waits until at least `n` frames were written, or panics after 5s.
    pub async fn wait_for(&self, n: usize) -> Vec<Frame> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let frames = self.frames();
            if frames.len() >= n {
                return frames;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {n} frames, got {frames:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl SessionSink for RecordingSink {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Closed);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.frames
            .lock()
            .expect("frames lock")
            .push(Frame::Message(message.clone()));
        Ok(())
    }

    async fn close(&mut self, code: CloseCode, _reason: &str) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Closed);
        }
        self.frames.lock().expect("frames lock").push(Frame::Close(code));
        Ok(())
    }
}

/// A sink whose writes never complete, like a peer that stopped reading.
#[derive(Clone, Default)]
pub struct StuckSink {
    blocked: Arc<AtomicUsize>,
}

impl StuckSink {
    /// Waits until a write is hanging, or panics after 5s.
    pub async fn wait_until_blocked(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.blocked.load(Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline, "no write started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl SessionSink for StuckSink {
    async fn send(&mut self, _message: &ServerMessage) -> Result<(), SinkError> {
        self.blocked.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn close(&mut self, _code: CloseCode, _reason: &str) -> Result<(), SinkError> {
        std::future::pending().await
    }
}
