//! Process-local audit store.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use talos_integrity::decode_cursor;
use talos_types::{Envelope, Outcome};

use crate::error::StoreError;
use crate::port::{
    bucket_start, denial_reason, AuditStats, AuditStore, EventPage, ListQuery, StatsRange,
    VolumeBucket,
};

#[derive(Default)]
struct Inner {
    ids: HashSet<String>,
    events: Vec<Envelope>,
}

/// Keeps every appended envelope in memory. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryAuditStore {
    inner: RwLock<Inner>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct events held.
    pub fn len(&self) -> usize {
        self.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| {
            tracing::warn!("memory audit store lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| {
            tracing::warn!("memory audit store lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Orders by `(timestamp, event_id)`, the same key cursors encode.
fn position(a: (f64, &str), b: (f64, &str)) -> Ordering {
    a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1))
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let mut inner = self.write();
        if inner.ids.insert(envelope.event_id.clone()) {
            inner.events.push(envelope.clone());
        }
        Ok(())
    }

    fn list(&self, query: &ListQuery) -> Result<EventPage, StoreError> {
        let before = match &query.before {
            Some(cursor) => {
                let parts = decode_cursor(cursor)?;
                Some((parts.timestamp_secs()?, parts.event_id))
            }
            None => None,
        };

        let inner = self.read();
        let mut matching: Vec<&Envelope> = inner
            .events
            .iter()
            .filter(|e| query.filter.matches(e))
            .filter(|e| {
                before.as_ref().map_or(true, |(ts, id)| {
                    position((e.timestamp, e.event_id.as_str()), (*ts, id.as_str())) == Ordering::Less
                })
            })
            .collect();

        matching.sort_by(|a, b| {
            position((b.timestamp, b.event_id.as_str()), (a.timestamp, a.event_id.as_str()))
        });
        let newest: Vec<Envelope> = matching
            .into_iter()
            .take(query.limit)
            .cloned()
            .collect();

        Ok(EventPage::from_newest_first(newest, query.limit))
    }

    fn stats(&self, range: StatsRange) -> Result<AuditStats, StoreError> {
        let inner = self.read();
        let mut requests = 0u64;
        let mut ok = 0u64;
        let mut reasons: BTreeMap<String, u64> = BTreeMap::new();
        let mut buckets: BTreeMap<i64, VolumeBucket> = BTreeMap::new();

        for event in inner.events.iter().filter(|e| range.contains(e.timestamp)) {
            requests += 1;
            let time = bucket_start(event.timestamp);
            let bucket = buckets.entry(time).or_insert(VolumeBucket {
                time,
                ..VolumeBucket::default()
            });
            match event.outcome {
                Outcome::Ok => {
                    ok += 1;
                    bucket.ok += 1;
                }
                Outcome::Deny => {
                    bucket.deny += 1;
                    if let Some(reason) = denial_reason(event) {
                        *reasons.entry(reason.to_string()).or_default() += 1;
                    }
                }
                Outcome::Error => bucket.error += 1,
                Outcome::Pending => {}
            }
        }

        Ok(AuditStats::from_parts(
            requests,
            ok,
            reasons,
            buckets.into_values().collect(),
        ))
    }
}
