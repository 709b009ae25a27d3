//! Publishing: durable append in the background, live fan-out inline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use talos_stream::{BroadcastReport, StreamErrorKind};
use talos_types::Envelope;
use tokio::task::JoinHandle;

use crate::AppState;

/// Counts of finished background appends.
#[derive(Debug, Default)]
pub struct ForwardStats {
    forwarded: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`ForwardStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwardCounts {
    pub forwarded: u64,
    pub forward_failures: u64,
}

impl ForwardStats {
    pub fn counts(&self) -> ForwardCounts {
        ForwardCounts {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            forward_failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn record_success(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// What [`publish`] did with an envelope.
pub struct Published {
    pub envelope: Arc<Envelope>,
    /// Live delivery counts, known as soon as `publish` returns.
    pub report: BroadcastReport,
    /// The background store append. Dropping it detaches the task.
    pub forward: JoinHandle<()>,
}

/// Hands `envelope` to the audit store on the blocking pool and broadcasts
/// it to live sessions without waiting for the store.
///
/// A failed append is counted and logged; it never reaches the caller.
pub fn publish(state: &AppState, envelope: Envelope) -> Published {
    let envelope = Arc::new(envelope);

    let store = state.store.clone();
    let stats = state.forward_stats.clone();
    let record = envelope.clone();
    let forward = tokio::spawn(async move {
        let event_id = record.event_id.clone();
        let result = tokio::task::spawn_blocking(move || store.append(&record)).await;

        match result {
            Ok(Ok(())) => {
                stats.record_success();
                tracing::debug!(event_id = %event_id, "event forwarded to audit store");
            }
            Ok(Err(e)) => {
                stats.record_failure();
                tracing::error!(
                    event_id = %event_id,
                    kind = %StreamErrorKind::DurableForwardFailure,
                    error = %e,
                    "audit store rejected event"
                );
            }
            Err(e) => {
                stats.record_failure();
                tracing::error!(
                    event_id = %event_id,
                    kind = %StreamErrorKind::DurableForwardFailure,
                    error = %e,
                    "audit store task failed"
                );
            }
        }
    });

    let report = state.dispatcher.broadcast(envelope.clone());
    tracing::info!(
        event_id = %envelope.event_id,
        event_type = %envelope.event_type,
        outcome = %envelope.outcome,
        matched = report.matched,
        delivered = report.delivered,
        "event published"
    );

    Published {
        envelope,
        report,
        forward,
    }
}
