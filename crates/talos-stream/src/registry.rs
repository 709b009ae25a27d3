//! Live session bookkeeping and per-session delivery.
//!
//! Every session owns a bounded FIFO. Producers append with
//! [`ConnectionRegistry::enqueue`], which never waits: a full queue evicts
//! the session instead. Stream sessions get a dedicated delivery task that
//! is the only writer to the transport; poll sessions hand their queue to
//! the caller as a [`Mailbox`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use talos_types::{CloseCode, ErrorCode, Filters, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::SinkError;
use crate::settings::StreamSettings;
use crate::sink::SessionSink;

/// Upper bound on writing the notice and close to an evicted session.
const EVICTION_NOTICE_TIMEOUT: Duration = Duration::from_secs(2);

/// How a session's queue is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Pushed by a delivery task (WebSocket).
    Stream,
    /// Pulled by the caller through a [`Mailbox`] (SSE).
    Poll,
}

/// Why the registry ended a session on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The queue reached `limit` pending messages.
    SlowConsumer { limit: usize },
}

/// Result of [`ConnectionRegistry::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The message is waiting in the session's queue.
    Queued,
    /// The queue was full; the session has been removed and told why.
    Evicted,
    /// No such session. Nothing happened.
    UnknownSession,
}

/// A registered push session.
#[derive(Debug)]
pub struct StreamSession {
    /// Identifies this registration among sessions that reused the same id.
    pub generation: u64,
    /// The delivery task. It ends when the session is removed, evicted, or
    /// its transport fails.
    pub task: JoinHandle<()>,
}

struct SessionEntry {
    kind: TransportKind,
    generation: u64,
    filters: Arc<Filters>,
    tx: mpsc::Sender<Arc<ServerMessage>>,
    stop: oneshot::Sender<Termination>,
    registered_at: Instant,
}

struct Shared {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    next_generation: AtomicU64,
    capacity: usize,
    heartbeat_interval: Duration,
}

/// All live sessions, keyed by session id. Cheap to clone.
///
/// The map is behind a synchronous lock that is never held across an
/// `.await`.
#[derive(Clone)]
pub struct ConnectionRegistry {
    shared: Arc<Shared>,
}

impl ConnectionRegistry {
    pub fn new(settings: &StreamSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                sessions: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                capacity: settings.queue_capacity.max(1),
                heartbeat_interval: settings.heartbeat_interval(),
            }),
        }
    }

    /// Per-session queue capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Registers a push session and spawns its delivery task, which owns
    /// `sink` from now on. Must be called inside a Tokio runtime.
    ///
    /// An existing session with the same id is replaced; its delivery task
    /// winds down without touching its transport again. Callers tearing the
    /// session down should use [`deregister_if_current`](Self::deregister_if_current)
    /// with the returned generation.
    pub fn register<S: SessionSink>(
        &self,
        session_id: impl Into<String>,
        sink: S,
        filters: Filters,
    ) -> StreamSession {
        let session_id = session_id.into();
        let (generation, rx, stop) = self.insert(&session_id, TransportKind::Stream, filters);

        let task = tokio::spawn(deliver(
            self.clone(),
            session_id,
            generation,
            sink,
            rx,
            stop,
        ));
        StreamSession { generation, task }
    }

    /// Registers a pull session and returns its queue. Dropping the
    /// [`Mailbox`] deregisters the session.
    pub fn register_poll(&self, session_id: impl Into<String>, filters: Filters) -> Mailbox {
        let session_id = session_id.into();
        let (generation, rx, stop) = self.insert(&session_id, TransportKind::Poll, filters);

        Mailbox {
            registry: self.clone(),
            session_id,
            generation,
            rx,
            stop,
            finished: false,
        }
    }

    fn insert(
        &self,
        session_id: &str,
        kind: TransportKind,
        filters: Filters,
    ) -> (
        u64,
        mpsc::Receiver<Arc<ServerMessage>>,
        oneshot::Receiver<Termination>,
    ) {
        let (tx, rx) = mpsc::channel(self.shared.capacity);
        let (stop_tx, stop_rx) = oneshot::channel();
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);

        let entry = SessionEntry {
            kind,
            generation,
            filters: Arc::new(filters),
            tx,
            stop: stop_tx,
            registered_at: Instant::now(),
        };

        let replaced = self.write().insert(session_id.to_string(), entry);
        if let Some(old) = replaced {
            tracing::warn!(
                session_id,
                old_kind = ?old.kind,
                "session id reused; replacing existing session"
            );
        }
        tracing::info!(session_id, kind = ?kind, generation, "session registered");

        (generation, rx, stop_rx)
    }

    /// Appends `message` to the session's queue without waiting.
    pub fn enqueue(&self, session_id: &str, message: ServerMessage) -> EnqueueOutcome {
        self.enqueue_shared(session_id, Arc::new(message))
    }

    /// [`enqueue`](Self::enqueue) for a message shared between sessions.
    pub fn enqueue_shared(&self, session_id: &str, message: Arc<ServerMessage>) -> EnqueueOutcome {
        let generation = {
            let sessions = self.read();
            let Some(entry) = sessions.get(session_id) else {
                return EnqueueOutcome::UnknownSession;
            };
            match entry.tx.try_send(message) {
                Ok(()) => return EnqueueOutcome::Queued,
                // The receiver is gone; the session is already shutting down.
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return EnqueueOutcome::UnknownSession
                }
                Err(mpsc::error::TrySendError::Full(_)) => entry.generation,
            }
        };

        if self.evict(session_id, generation) {
            EnqueueOutcome::Evicted
        } else {
            // Another producer evicted it first.
            EnqueueOutcome::UnknownSession
        }
    }

    fn evict(&self, session_id: &str, generation: u64) -> bool {
        let Some(entry) = self.take_if_current(session_id, generation) else {
            return false;
        };
        let limit = self.shared.capacity;
        tracing::warn!(
            session_id,
            kind = ?entry.kind,
            limit,
            connected_for_ms = entry.registered_at.elapsed().as_millis() as u64,
            "evicting slow consumer"
        );
        // The receiver may already be gone if the transport died meanwhile.
        let _ = entry.stop.send(Termination::SlowConsumer { limit });
        true
    }

    /// Removes a session whatever its generation. Removing an unknown
    /// session is a no-op. A write in progress on the session's transport
    /// is abandoned.
    pub fn deregister(&self, session_id: &str) -> bool {
        let removed = self.write().remove(session_id);
        if removed.is_some() {
            tracing::info!(session_id, "session deregistered");
        }
        removed.is_some()
    }

    /// Removes the session only if it is still the registration identified
    /// by `generation`, so a finished task cannot remove its replacement.
    pub fn deregister_if_current(&self, session_id: &str, generation: u64) -> bool {
        let removed = self.take_if_current(session_id, generation).is_some();
        if removed {
            tracing::info!(session_id, "session deregistered");
        }
        removed
    }

    fn take_if_current(&self, session_id: &str, generation: u64) -> Option<SessionEntry> {
        let mut sessions = self.write();
        match sessions.get(session_id) {
            Some(entry) if entry.generation == generation => sessions.remove(session_id),
            _ => None,
        }
    }

    /// Ids and filters of every live session, captured atomically.
    pub fn snapshot(&self) -> Vec<(String, Arc<Filters>)> {
        self.read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.filters.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.read().contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SessionEntry>> {
        self.shared.sessions.read().unwrap_or_else(|poisoned| {
            tracing::warn!("session registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionEntry>> {
        self.shared.sessions.write().unwrap_or_else(|poisoned| {
            tracing::warn!("session registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// The `error` frame sent to an evicted client.
pub fn slow_consumer_message(limit: usize) -> ServerMessage {
    ServerMessage::Error {
        code: ErrorCode::SlowConsumer,
        message: "Client too slow, queue full".to_string(),
        details: Some(serde_json::json!({ "limit": limit })),
    }
}

/// Drains one stream session into its transport until the session is
/// removed, evicted, or the transport fails.
///
/// Every write races the stop signal, so a transport that never drains
/// cannot keep the task alive after eviction.
async fn deliver<S: SessionSink>(
    registry: ConnectionRegistry,
    session_id: String,
    generation: u64,
    mut sink: S,
    mut rx: mpsc::Receiver<Arc<ServerMessage>>,
    mut stop: oneshot::Receiver<Termination>,
) {
    let heartbeat = registry.shared.heartbeat_interval;
    let interval_ms = heartbeat.as_millis() as u64;
    let mut last_cursor: Option<String> = None;

    loop {
        let message = tokio::select! {
            biased;

            stop = &mut stop => {
                farewell(&mut sink, &session_id, stop).await;
                break;
            }

            next = rx.recv() => match next {
                Some(message) => message,
                None => break,
            },

            () = tokio::time::sleep(heartbeat) => Arc::new(ServerMessage::Heartbeat {
                last_cursor: last_cursor.clone(),
                interval_ms,
            }),
        };

        match write_or_stop(&mut sink, &message, &mut stop).await {
            Write::Sent(Ok(())) => {
                if let Some(cursor) = message.cursor() {
                    last_cursor = Some(cursor.to_string());
                }
            }
            Write::Sent(Err(e)) => {
                tracing::warn!(
                    session_id = %session_id,
                    kind = %e.kind(),
                    error = %e,
                    "delivery failed; dropping session"
                );
                break;
            }
            Write::Stopped(stop) => {
                farewell(&mut sink, &session_id, stop).await;
                break;
            }
        }
    }

    registry.deregister_if_current(&session_id, generation);
    tracing::debug!(session_id = %session_id, "delivery task finished");
}

enum Write {
    Sent(Result<(), SinkError>),
    Stopped(Result<Termination, oneshot::error::RecvError>),
}

/// Writes `message`, abandoning the write if the session is stopped first.
async fn write_or_stop<S: SessionSink>(
    sink: &mut S,
    message: &ServerMessage,
    stop: &mut oneshot::Receiver<Termination>,
) -> Write {
    tokio::select! {
        biased;

        stop = stop => Write::Stopped(stop),
        sent = sink.send(message) => Write::Sent(sent),
    }
}

/// Tells an evicted client why and closes it, giving up after
/// [`EVICTION_NOTICE_TIMEOUT`]. Plain removal writes nothing.
async fn farewell<S: SessionSink>(
    sink: &mut S,
    session_id: &str,
    stop: Result<Termination, oneshot::error::RecvError>,
) {
    let Ok(Termination::SlowConsumer { limit }) = stop else {
        return;
    };
    let notice = async {
        if let Err(e) = sink.send(&slow_consumer_message(limit)).await {
            tracing::debug!(session_id, error = %e, "could not send slow consumer notice");
        }
        let code = CloseCode::SlowConsumer;
        if let Err(e) = sink.close(code, code.reason()).await {
            tracing::debug!(session_id, error = %e, "could not close slow consumer");
        }
    };
    if tokio::time::timeout(EVICTION_NOTICE_TIMEOUT, notice).await.is_err() {
        tracing::debug!(session_id, "slow consumer did not take its close in time");
    }
}

/// What a [`Mailbox`] yielded.
#[derive(Debug, Clone, PartialEq)]
pub enum MailboxItem {
    Message(Arc<ServerMessage>),
    /// Nothing arrived within the idle window.
    Idle,
    /// The registry ended the session.
    Terminated(Termination),
    /// The session was deregistered or replaced.
    Closed,
}

/// The receiving end of a poll session.
pub struct Mailbox {
    registry: ConnectionRegistry,
    session_id: String,
    generation: u64,
    rx: mpsc::Receiver<Arc<ServerMessage>>,
    stop: oneshot::Receiver<Termination>,
    finished: bool,
}

impl Mailbox {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Waits up to `idle` for the next queued message. After
    /// [`MailboxItem::Terminated`] or [`MailboxItem::Closed`] every later
    /// call returns [`MailboxItem::Closed`] immediately.
    pub async fn next(&mut self, idle: Duration) -> MailboxItem {
        if self.finished {
            return MailboxItem::Closed;
        }

        tokio::select! {
            biased;

            stop = &mut self.stop => {
                self.finished = true;
                match stop {
                    Ok(termination) => MailboxItem::Terminated(termination),
                    Err(_) => MailboxItem::Closed,
                }
            }

            next = self.rx.recv() => match next {
                Some(message) => MailboxItem::Message(message),
                None => {
                    self.finished = true;
                    MailboxItem::Closed
                }
            },

            () = tokio::time::sleep(idle) => MailboxItem::Idle,
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.registry
            .deregister_if_current(&self.session_id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Frame, RecordingSink, StuckSink};
    use talos_integrity::seal;
    use talos_types::EnvelopeFields;

    fn settings(capacity: usize) -> StreamSettings {
        StreamSettings {
            queue_capacity: capacity,
            ..StreamSettings::default()
        }
    }

    fn event(n: u32) -> ServerMessage {
        let id = format!("0190f5c2-7a10-7cc3-9a2b-{n:012}");
        let envelope = seal(EnvelopeFields::new("X"), &id, 1_767_225_600.0 + f64::from(n))
            .expect("seal");
        ServerMessage::Event {
            cursor: envelope.cursor.clone(),
            event: Arc::new(envelope),
            server_time: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn cursor_of(message: &ServerMessage) -> String {
        message.cursor().expect("event frame").to_string()
    }

    // ── poll sessions ────────────────────────────────────────────────

    #[tokio::test]
    async fn overflowing_a_poll_session_evicts_it_exactly_once() {
        let registry = ConnectionRegistry::new(&StreamSettings::default());
        let mut mailbox = registry.register_poll("p1", Filters::new());

        let mut outcomes = Vec::new();
        for n in 0..1_001 {
            outcomes.push(registry.enqueue("p1", event(n)));
        }

        assert_eq!(
            outcomes.iter().filter(|o| **o == EnqueueOutcome::Queued).count(),
            1_000
        );
        assert_eq!(outcomes[1_000], EnqueueOutcome::Evicted);
        assert!(!registry.contains("p1"));

        assert_eq!(
            registry.enqueue("p1", event(2_000)),
            EnqueueOutcome::UnknownSession
        );

        assert_eq!(
            mailbox.next(Duration::from_secs(1)).await,
            MailboxItem::Terminated(Termination::SlowConsumer { limit: 1_000 })
        );
        assert_eq!(mailbox.next(Duration::from_secs(1)).await, MailboxItem::Closed);
    }

    #[tokio::test]
    async fn mailbox_yields_in_order_then_idles() {
        let registry = ConnectionRegistry::new(&settings(8));
        let mut mailbox = registry.register_poll("p1", Filters::new());

        let a = event(1);
        let b = event(2);
        registry.enqueue("p1", a.clone());
        registry.enqueue("p1", b.clone());

        assert_eq!(
            mailbox.next(Duration::from_millis(50)).await,
            MailboxItem::Message(Arc::new(a))
        );
        assert_eq!(
            mailbox.next(Duration::from_millis(50)).await,
            MailboxItem::Message(Arc::new(b))
        );
        assert_eq!(
            mailbox.next(Duration::from_millis(50)).await,
            MailboxItem::Idle
        );
    }

    #[tokio::test]
    async fn dropping_a_mailbox_deregisters_it() {
        let registry = ConnectionRegistry::new(&settings(8));
        let mailbox = registry.register_poll("p1", Filters::new());
        assert_eq!(mailbox.session_id(), "p1");
        assert!(registry.contains("p1"));

        drop(mailbox);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn deregistered_mailbox_reports_closed() {
        let registry = ConnectionRegistry::new(&settings(8));
        let mut mailbox = registry.register_poll("p1", Filters::new());

        assert!(registry.deregister("p1"));
        assert!(!registry.deregister("p1"), "second removal is a no-op");
        assert_eq!(mailbox.next(Duration::from_secs(1)).await, MailboxItem::Closed);
    }

    // ── stream sessions ──────────────────────────────────────────────

    #[tokio::test]
    async fn stream_session_delivers_fifo_despite_slow_transport() {
        let registry = ConnectionRegistry::new(&settings(8));
        let sink = RecordingSink::slow(Duration::from_millis(20));
        let _session = registry.register("s1", sink.clone(), Filters::new());

        let a = event(1);
        let b = event(2);
        assert_eq!(registry.enqueue("s1", a.clone()), EnqueueOutcome::Queued);
        assert_eq!(registry.enqueue("s1", b.clone()), EnqueueOutcome::Queued);

        sink.wait_for(2).await;
        assert_eq!(sink.event_cursors(), vec![cursor_of(&a), cursor_of(&b)]);
    }

    #[tokio::test]
    async fn evicted_stream_session_is_told_and_closed() {
        let registry = ConnectionRegistry::new(&settings(2));
        let sink = RecordingSink::default();
        let task = registry.register("s1", sink.clone(), Filters::new()).task;

        // The delivery task has not run yet on this single-threaded runtime,
        // so the third message overflows.
        assert_eq!(registry.enqueue("s1", event(1)), EnqueueOutcome::Queued);
        assert_eq!(registry.enqueue("s1", event(2)), EnqueueOutcome::Queued);
        assert_eq!(registry.enqueue("s1", event(3)), EnqueueOutcome::Evicted);

        task.await.expect("delivery task");
        let frames = sink.frames();
        assert_eq!(
            frames,
            vec![
                Frame::Message(slow_consumer_message(2)),
                Frame::Close(CloseCode::SlowConsumer),
            ]
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_removes_the_session() {
        let registry = ConnectionRegistry::new(&settings(8));
        let task = registry.register("s1", RecordingSink::failing(), Filters::new()).task;

        registry.enqueue("s1", event(1));
        task.await.expect("delivery task");

        assert!(!registry.contains("s1"));
        assert_eq!(registry.enqueue("s1", event(2)), EnqueueOutcome::UnknownSession);
    }

    #[tokio::test]
    async fn deregister_stops_the_delivery_task() {
        let registry = ConnectionRegistry::new(&settings(8));
        let sink = RecordingSink::default();
        let task = registry.register("s1", sink.clone(), Filters::new()).task;

        assert!(registry.deregister("s1"));
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("task should end")
            .expect("delivery task");
        assert!(sink.frames().is_empty(), "no close frame on plain removal");
    }

    #[tokio::test]
    async fn replacing_a_session_leaves_the_new_one_registered() {
        let registry = ConnectionRegistry::new(&settings(8));
        let old_sink = RecordingSink::default();
        let old = registry.register("dup", old_sink.clone(), Filters::new());
        let new_sink = RecordingSink::default();
        let new = registry.register("dup", new_sink.clone(), Filters::new());
        assert_ne!(old.generation, new.generation);

        old.task.await.expect("old delivery task");
        assert!(registry.contains("dup"), "old task must not remove its replacement");
        assert!(
            !registry.deregister_if_current("dup", old.generation),
            "the old owner must not remove its replacement"
        );
        assert_eq!(registry.len(), 1);

        registry.enqueue("dup", event(1));
        new_sink.wait_for(1).await;
        assert!(old_sink.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_sessions_receive_heartbeats_with_last_cursor() {
        let registry = ConnectionRegistry::new(&StreamSettings {
            heartbeat_interval_ms: 1_000,
            ..StreamSettings::default()
        });
        let sink = RecordingSink::default();
        let _session = registry.register("s1", sink.clone(), Filters::new());

        let frames = sink.wait_for(1).await;
        assert_eq!(
            frames[0],
            Frame::Message(ServerMessage::Heartbeat {
                last_cursor: None,
                interval_ms: 1_000,
            })
        );

        let e = event(1);
        registry.enqueue("s1", e.clone());
        let frames = sink.wait_for(3).await;
        assert_eq!(frames[1], Frame::Message(e.clone()));
        assert_eq!(
            frames[2],
            Frame::Message(ServerMessage::Heartbeat {
                last_cursor: Some(cursor_of(&e)),
                interval_ms: 1_000,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_abandons_a_write_that_never_completes() {
        let registry = ConnectionRegistry::new(&settings(2));
        let sink = StuckSink::default();
        let session = registry.register("s1", sink.clone(), Filters::new());

        assert_eq!(registry.enqueue("s1", event(1)), EnqueueOutcome::Queued);
        sink.wait_until_blocked().await;

        assert_eq!(registry.enqueue("s1", event(2)), EnqueueOutcome::Queued);
        assert_eq!(registry.enqueue("s1", event(3)), EnqueueOutcome::Queued);
        assert_eq!(registry.enqueue("s1", event(4)), EnqueueOutcome::Evicted);
        assert!(!registry.contains("s1"));

        tokio::time::timeout(Duration::from_secs(10), session.task)
            .await
            .expect("delivery task should end despite the stuck transport")
            .expect("delivery task");
    }

    #[tokio::test(start_paused = true)]
    async fn deregister_abandons_a_write_that_never_completes() {
        let registry = ConnectionRegistry::new(&settings(8));
        let sink = StuckSink::default();
        let session = registry.register("s1", sink.clone(), Filters::new());

        registry.enqueue("s1", event(1));
        sink.wait_until_blocked().await;

        assert!(registry.deregister_if_current("s1", session.generation));
        tokio::time::timeout(Duration::from_secs(1), session.task)
            .await
            .expect("delivery task should end")
            .expect("delivery task");
    }

    // ── introspection ────────────────────────────────────────────────

    #[tokio::test]
    async fn introspection_reflects_live_sessions() {
        let registry = ConnectionRegistry::new(&settings(8));
        let _a = registry.register_poll("a", Filters::new());
        let _b = registry.register("b", RecordingSink::default(), Filters::new());

        let mut ids = registry.session_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot().len(), 2);
        assert_eq!(registry.capacity(), 8);
    }
}
