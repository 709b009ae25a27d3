//! Fan-out of sealed envelopes to matching sessions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use talos_types::{Envelope, Filters, ServerMessage};

use crate::registry::{ConnectionRegistry, EnqueueOutcome};

/// Per-call delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Sessions whose filters accepted the envelope.
    pub matched: usize,
    /// Matched sessions the event was queued for.
    pub delivered: usize,
    /// Matched sessions evicted because their queue was full.
    pub evicted: usize,
}

/// Wraps envelopes as `event` frames and queues them on every session
/// whose filters match.
#[derive(Clone)]
pub struct Dispatcher {
    registry: ConnectionRegistry,
}

impl Dispatcher {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Queues `envelope` for each matching live session, at most once per
    /// session. Never waits on a consumer.
    pub fn broadcast(&self, envelope: Arc<Envelope>) -> BroadcastReport {
        let sessions = self.registry.snapshot();
        let mut report = BroadcastReport::default();
        if sessions.is_empty() {
            return report;
        }

        let fields = if sessions.iter().any(|(_, filters)| !filters.is_empty()) {
            envelope_fields(&envelope)
        } else {
            Map::new()
        };

        let message = Arc::new(ServerMessage::Event {
            cursor: envelope.cursor.clone(),
            event: envelope,
            server_time: server_time(Utc::now()),
        });

        for (session_id, filters) in &sessions {
            if !matches_filters(&fields, filters) {
                continue;
            }
            report.matched += 1;
            match self.registry.enqueue_shared(session_id, message.clone()) {
                EnqueueOutcome::Queued => report.delivered += 1,
                EnqueueOutcome::Evicted => report.evicted += 1,
                EnqueueOutcome::UnknownSession => {}
            }
        }

        tracing::debug!(
            sessions = sessions.len(),
            matched = report.matched,
            delivered = report.delivered,
            evicted = report.evicted,
            "broadcast complete"
        );
        report
    }
}

fn envelope_fields(envelope: &Envelope) -> Map<String, Value> {
    match serde_json::to_value(envelope) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => {
            tracing::warn!(event_id = %envelope.event_id, error = %e, "could not inspect envelope for filtering");
            Map::new()
        }
    }
}

/// True when every filter key that the envelope carries has the filter's
/// value. Keys the envelope lacks never exclude it.
pub fn matches_filters(fields: &Map<String, Value>, filters: &Filters) -> bool {
    filters
        .iter()
        .all(|(key, want)| fields.get(key).map_or(true, |have| have == want))
}

/// Server clock at second precision, e.g. `2026-01-01T12:00:00Z`.
pub fn server_time(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
