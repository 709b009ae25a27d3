//! SQLite-backed audit store.

use std::collections::BTreeMap;

use rusqlite::{params, Row};
use talos_db::DbPool;
use talos_integrity::decode_cursor;
use talos_types::{Envelope, Outcome};

use crate::error::StoreError;
use crate::port::{
    denial_reason, AuditStats, AuditStore, EventPage, ListQuery, StatsRange, VolumeBucket,
    BUCKET_SECS,
};

const EVENT_COLUMNS: &str = "event_id, schema_version, timestamp, cursor, event_type, outcome,
    session_id, correlation_id, agent_id, peer_id, tool, method, resource,
    metadata_json, metrics_json, hashes_json, integrity_json, integrity_hash";

/// Audit store over the `events` table created by `talos-db` migrations.
#[derive(Clone)]
pub struct SqliteAuditStore {
    pool: DbPool,
}

impl SqliteAuditStore {
    /// Wraps a pool whose schema is already migrated.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Column values as stored, before JSON columns are decoded.
struct StoredRow {
    event_id: String,
    schema_version: String,
    timestamp: f64,
    cursor: String,
    event_type: String,
    outcome: String,
    session_id: Option<String>,
    correlation_id: Option<String>,
    agent_id: Option<String>,
    peer_id: Option<String>,
    tool: Option<String>,
    method: Option<String>,
    resource: Option<String>,
    metadata_json: String,
    metrics_json: String,
    hashes_json: String,
    integrity_json: String,
    integrity_hash: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            schema_version: row.get(1)?,
            timestamp: row.get(2)?,
            cursor: row.get(3)?,
            event_type: row.get(4)?,
            outcome: row.get(5)?,
            session_id: row.get(6)?,
            correlation_id: row.get(7)?,
            agent_id: row.get(8)?,
            peer_id: row.get(9)?,
            tool: row.get(10)?,
            method: row.get(11)?,
            resource: row.get(12)?,
            metadata_json: row.get(13)?,
            metrics_json: row.get(14)?,
            hashes_json: row.get(15)?,
            integrity_json: row.get(16)?,
            integrity_hash: row.get(17)?,
        })
    }

    fn into_envelope(self) -> Result<Envelope, StoreError> {
        let outcome: Outcome = self.outcome.parse().map_err(|e| StoreError::Corrupt {
            event_id: self.event_id.clone(),
            reason: format!("{e}"),
        })?;

        Ok(Envelope {
            outcome,
            metadata: serde_json::from_str(&self.metadata_json)?,
            metrics: serde_json::from_str(&self.metrics_json)?,
            hashes: serde_json::from_str(&self.hashes_json)?,
            integrity: serde_json::from_str(&self.integrity_json)?,
            event_id: self.event_id,
            schema_version: self.schema_version,
            timestamp: self.timestamp,
            cursor: self.cursor,
            event_type: self.event_type,
            session_id: self.session_id,
            correlation_id: self.correlation_id,
            agent_id: self.agent_id,
            peer_id: self.peer_id,
            tool: self.tool,
            method: self.method,
            resource: self.resource,
            integrity_hash: self.integrity_hash,
        })
    }
}

impl AuditStore for SqliteAuditStore {
    fn append(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let inserted = conn.execute(
            "INSERT INTO events (
                event_id, schema_version, timestamp, cursor, event_type, outcome,
                session_id, correlation_id, agent_id, peer_id, tool, method, resource,
                denial_reason, metadata_json, metrics_json, hashes_json, integrity_json,
                integrity_hash
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(event_id) DO NOTHING",
            params![
                envelope.event_id,
                envelope.schema_version,
                envelope.timestamp,
                envelope.cursor,
                envelope.event_type,
                envelope.outcome.as_str(),
                envelope.session_id,
                envelope.correlation_id,
                envelope.agent_id,
                envelope.peer_id,
                envelope.tool,
                envelope.method,
                envelope.resource,
                denial_reason(envelope),
                serde_json::to_string(&envelope.metadata)?,
                serde_json::to_string(&envelope.metrics)?,
                serde_json::to_string(&envelope.hashes)?,
                serde_json::to_string(&envelope.integrity)?,
                envelope.integrity_hash,
            ],
        )?;

        if inserted == 0 {
            tracing::debug!(event_id = %envelope.event_id, "event already stored");
        }
        Ok(())
    }

    fn list(&self, query: &ListQuery) -> Result<EventPage, StoreError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut idx = 1u32;

        if let Some(cursor) = &query.before {
            let parts = decode_cursor(cursor)?;
            let ts = parts.timestamp_secs()?;
            clauses.push(format!(
                "(timestamp < ?{idx} OR (timestamp = ?{idx} AND event_id < ?{}))",
                idx + 1
            ));
            param_values.push(Box::new(ts));
            param_values.push(Box::new(parts.event_id));
            idx += 2;
        }

        if let Some(session_id) = &query.filter.session_id {
            clauses.push(format!("session_id = ?{idx}"));
            param_values.push(Box::new(session_id.clone()));
            idx += 1;
        }

        if let Some(correlation_id) = &query.filter.correlation_id {
            clauses.push(format!("correlation_id = ?{idx}"));
            param_values.push(Box::new(correlation_id.clone()));
            idx += 1;
        }

        if let Some(outcome) = query.filter.outcome {
            clauses.push(format!("outcome = ?{idx}"));
            param_values.push(Box::new(outcome.as_str()));
            idx += 1;
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {EVENT_COLUMNS}
             FROM events
             {where_clause}
             ORDER BY timestamp DESC, event_id DESC
             LIMIT ?{idx}"
        );
        param_values.push(Box::new(i64::try_from(query.limit).unwrap_or(i64::MAX)));

        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| &**p).collect();

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_refs.as_slice(), StoredRow::from_row)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_envelope()?);
        }

        Ok(EventPage::from_newest_first(events, query.limit))
    }

    fn stats(&self, range: StatsRange) -> Result<AuditStats, StoreError> {
        let conn = self.pool.get()?;

        let (requests, ok): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN outcome = 'OK' THEN 1 ELSE 0 END), 0)
             FROM events WHERE timestamp BETWEEN ?1 AND ?2",
            params![range.start, range.end],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT denial_reason, COUNT(*) FROM events
             WHERE outcome = 'DENY' AND denial_reason IS NOT NULL
               AND timestamp BETWEEN ?1 AND ?2
             GROUP BY denial_reason",
        )?;
        let reasons = stmt.query_map(params![range.start, range.end], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut denial_reason_counts = BTreeMap::new();
        for row in reasons {
            let (reason, count) = row?;
            denial_reason_counts.insert(reason, count.unsigned_abs());
        }

        let mut stmt = conn.prepare(
            "SELECT (CAST(timestamp AS INTEGER) / ?3) * ?3 AS bucket,
                    SUM(CASE WHEN outcome = 'OK' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN outcome = 'DENY' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN outcome = 'ERROR' THEN 1 ELSE 0 END)
             FROM events
             WHERE timestamp BETWEEN ?1 AND ?2
             GROUP BY bucket
             ORDER BY bucket ASC",
        )?;
        let buckets = stmt.query_map(params![range.start, range.end, BUCKET_SECS], |row| {
            Ok(VolumeBucket {
                time: row.get(0)?,
                ok: row.get::<_, i64>(1)?.unsigned_abs(),
                deny: row.get::<_, i64>(2)?.unsigned_abs(),
                error: row.get::<_, i64>(3)?.unsigned_abs(),
            })
        })?;
        let mut series = Vec::new();
        for bucket in buckets {
            series.push(bucket?);
        }

        Ok(AuditStats::from_parts(
            requests.unsigned_abs(),
            ok.unsigned_abs(),
            denial_reason_counts,
            series,
        ))
    }
}
