//! The audit store port and its query/result types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use talos_types::{Envelope, Outcome};

use crate::error::StoreError;

/// Page size used when a caller does not ask for one.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Metadata key holding the policy reason for a `DENY` outcome.
pub const DENIAL_REASON_KEY: &str = "denial_reason";

/// Seconds per bucket in [`AuditStats::request_volume_series`].
pub(crate) const BUCKET_SECS: i64 = 3_600;

/// Durable sink for sealed envelopes.
///
/// Implementations are synchronous; async callers run them on the blocking
/// pool.
pub trait AuditStore: Send + Sync {
    /// Persists `envelope`. Appending an `event_id` that is already stored
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend rejects the write.
    fn append(&self, envelope: &Envelope) -> Result<(), StoreError>;

    /// Returns up to `query.limit` events strictly older than
    /// `query.before`, in chronological order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidCursor`] for an undecodable cursor, or a
    /// backend error.
    fn list(&self, query: &ListQuery) -> Result<EventPage, StoreError>;

    /// Aggregates outcomes for events whose timestamp lies in `range`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend query fails.
    fn stats(&self, range: StatsRange) -> Result<AuditStats, StoreError>;
}

/// Equality filters for [`AuditStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
    pub outcome: Option<Outcome>,
}

impl ListFilter {
    pub(crate) fn matches(&self, envelope: &Envelope) -> bool {
        let eq = |want: &Option<String>, have: &Option<String>| {
            want.as_deref().map_or(true, |w| have.as_deref() == Some(w))
        };
        eq(&self.session_id, &envelope.session_id)
            && eq(&self.correlation_id, &envelope.correlation_id)
            && self.outcome.map_or(true, |o| o == envelope.outcome)
    }
}

/// A single page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    /// Cursor of the oldest event already seen; `None` starts at the newest.
    pub before: Option<String>,
    pub limit: usize,
    pub filter: ListFilter,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            before: None,
            limit: DEFAULT_LIST_LIMIT,
            filter: ListFilter::default(),
        }
    }
}

/// One page of events, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<Envelope>,
    /// Pass as `before` to fetch the preceding page. `None` once the page
    /// came back short, which means there is nothing older.
    pub next_cursor: Option<String>,
}

impl EventPage {
    /// Builds a page from rows fetched newest-first.
    pub(crate) fn from_newest_first(mut events: Vec<Envelope>, limit: usize) -> Self {
        let full = limit > 0 && events.len() == limit;
        events.reverse();
        let next_cursor = if full {
            events.first().map(|e| e.cursor.clone())
        } else {
            None
        };
        Self {
            events,
            next_cursor,
        }
    }
}

/// Inclusive time range in fractional Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsRange {
    pub start: f64,
    pub end: f64,
}

impl StatsRange {
    /// The `hours` ending at `now`.
    pub fn trailing_hours(now: f64, hours: u32) -> Self {
        Self {
            start: now - f64::from(hours) * BUCKET_SECS as f64,
            end: now,
        }
    }

    pub(crate) fn contains(&self, timestamp: f64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

/// Dashboard aggregates over a [`StatsRange`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditStats {
    /// Number of events in the range.
    pub requests: u64,
    /// Share of events with outcome `OK`; `1.0` when the range is empty.
    pub auth_success_rate: f64,
    /// `DENY` events grouped by `metadata.denial_reason`; events without a
    /// reason are not counted here.
    pub denial_reason_counts: BTreeMap<String, u64>,
    /// Hourly buckets, ascending by bucket start.
    pub request_volume_series: Vec<VolumeBucket>,
}

impl AuditStats {
    pub(crate) fn from_parts(
        requests: u64,
        ok: u64,
        denial_reason_counts: BTreeMap<String, u64>,
        request_volume_series: Vec<VolumeBucket>,
    ) -> Self {
        let auth_success_rate = if requests == 0 {
            1.0
        } else {
            ok as f64 / requests as f64
        };
        Self {
            requests,
            auth_success_rate,
            denial_reason_counts,
            request_volume_series,
        }
    }
}

/// Outcome counts for one hour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBucket {
    /// Bucket start, Unix seconds aligned to the hour.
    pub time: i64,
    pub ok: u64,
    pub deny: u64,
    pub error: u64,
}

/// Hour bucket containing `timestamp`.
pub(crate) fn bucket_start(timestamp: f64) -> i64 {
    (timestamp as i64).div_euclid(BUCKET_SECS) * BUCKET_SECS
}

/// The denial reason recorded on `envelope`, if it carries a string one.
pub(crate) fn denial_reason(envelope: &Envelope) -> Option<&str> {
    envelope
        .metadata
        .get(DENIAL_REASON_KEY)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}
