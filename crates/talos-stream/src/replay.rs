//! Single-use nonces with a bounded clock-skew window.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Why a nonce was refused. Only logged; callers see a plain `false`.
#[derive(Debug, Clone, PartialEq)]
enum Refusal {
    Replayed,
    BadTimestamp,
    Skewed { skew_ms: u64 },
}

/// Remembers consumed nonces and rejects replays or stale timestamps.
///
/// The set is reset wholesale once it grows past its ceiling, so a nonce
/// can be reused after enough other handshakes have happened. The ceiling
/// only bounds memory; the skew window is what limits replays in practice.
pub struct ReplayGuard {
    seen: Mutex<HashSet<String>>,
    max_skew: Duration,
    ceiling: usize,
}

impl ReplayGuard {
    pub fn new(max_skew: Duration, ceiling: usize) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            max_skew,
            ceiling,
        }
    }

    /// Checks `nonce` and `client_ts` against the current time and, if both
    /// pass, records the nonce.
    pub fn validate_and_consume(&self, nonce: &str, client_ts: &str) -> bool {
        self.validate_and_consume_at(nonce, client_ts, Utc::now())
    }

    /// [`validate_and_consume`](Self::validate_and_consume) with an explicit
    /// server clock.
    pub fn validate_and_consume_at(&self, nonce: &str, client_ts: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.lock();

        match self.check(&seen, nonce, client_ts, now) {
            Ok(()) => {}
            Err(refusal) => {
                match refusal {
                    Refusal::Replayed => tracing::warn!(nonce, "nonce replay detected"),
                    Refusal::BadTimestamp => {
                        tracing::warn!(client_ts, "invalid handshake timestamp")
                    }
                    Refusal::Skewed { skew_ms } => {
                        tracing::warn!(skew_ms, "handshake timestamp skew too large")
                    }
                }
                return false;
            }
        }

        seen.insert(nonce.to_string());
        if seen.len() > self.ceiling {
            tracing::info!(ceiling = self.ceiling, "nonce cache full, clearing");
            seen.clear();
        }
        true
    }

    /// Number of nonces currently remembered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(
        &self,
        seen: &HashSet<String>,
        nonce: &str,
        client_ts: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Refusal> {
        if seen.contains(nonce) {
            return Err(Refusal::Replayed);
        }

        let client = parse_client_ts(client_ts).ok_or(Refusal::BadTimestamp)?;
        let skew_ms = (now - client).num_milliseconds().unsigned_abs();
        if u128::from(skew_ms) > self.max_skew.as_millis() {
            return Err(Refusal::Skewed { skew_ms });
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("nonce cache lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// ISO 8601 with an offset (`Z` or `+hh:mm`), or without one, read as UTC.
fn parse_client_ts(ts: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
