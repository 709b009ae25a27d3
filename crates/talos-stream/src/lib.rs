//! Live delivery of audit events to subscribed clients.
//!
//! - [`ReplayGuard`]: single-use nonces within a clock-skew window.
//! - [`HandshakeController`]: validates a connection's `init` frame.
//! - [`ConnectionRegistry`]: bounded per-session queues, delivery tasks,
//!   and slow-consumer eviction.
//! - [`Dispatcher`]: filters envelopes and queues them on matching
//!   sessions.
//!
//! Transports plug in through [`SessionSink`].

mod dispatch;
mod error;
mod handshake;
mod registry;
mod replay;
mod settings;
mod sink;

#[cfg(test)]
mod test_support;

pub use dispatch::{matches_filters, server_time, BroadcastReport, Dispatcher};
pub use error::{HandshakeError, HandshakeRejection, SinkError, StreamErrorKind};
pub use handshake::{
    has_read_capability, session_id_for, Accepted, HandshakeController, HandshakeState,
    CAPABILITY_MARKERS,
};
pub use registry::{
    slow_consumer_message, ConnectionRegistry, EnqueueOutcome, Mailbox, MailboxItem,
    StreamSession, Termination, TransportKind,
};
pub use replay::ReplayGuard;
pub use settings::StreamSettings;
pub use sink::SessionSink;
