//! Decision ingest: validation, normalization, and write-through to SQLite.
//!
//! Decisions are immutable once stored. Windowed reads used by the baseline
//! and the detector also live here since they are the only consumers of the
//! `decisions` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SentinelError};
use crate::storage::{from_millis, minutes_before, to_millis, Pool};

/// A raw decision record as submitted by a producing algorithm.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionInput {
    #[serde(default)]
    pub decision_id: Option<String>,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// RFC 3339 timestamp; ingest time is used when omitted.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub features: Option<serde_json::Value>,
}

/// One observed output of a monitored algorithm, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub algorithm: String,
    pub version: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub category: Option<String>,
    pub value: Option<f64>,
    pub zone: Option<String>,
    pub features: Option<serde_json::Value>,
}

fn trimmed(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl DecisionInput {
    /// Validate and normalize into a storable [`Decision`].
    pub fn normalize(self, now: DateTime<Utc>) -> Result<Decision> {
        let algorithm = trimmed(self.algorithm)
            .ok_or_else(|| SentinelError::Validation("missing algorithm".into()))?;

        let timestamp = match trimmed(self.timestamp) {
            None => now,
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| SentinelError::Validation(format!("bad timestamp '{raw}': {e}")))?,
        };

        let category = trimmed(self.category);
        let value = match self.value {
            Some(v) if !v.is_finite() => {
                return Err(SentinelError::Validation(format!("non-finite value {v}")));
            }
            other => other,
        };
        if category.is_none() && value.is_none() {
            return Err(SentinelError::Validation(
                "record needs a category or a numeric value".into(),
            ));
        }

        let features = match self.features {
            Some(serde_json::Value::Null) | None => None,
            Some(f @ serde_json::Value::Object(_)) => Some(f),
            Some(_) => {
                return Err(SentinelError::Validation(
                    "features must be a JSON object".into(),
                ));
            }
        };

        Ok(Decision {
            decision_id: trimmed(self.decision_id).unwrap_or_else(|| Uuid::new_v4().to_string()),
            algorithm,
            version: trimmed(self.version),
            timestamp,
            category,
            value,
            zone: trimmed(self.zone),
            features,
        })
    }
}

/// Per-item failure inside a bulk ingest.
#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    pub index: usize,
    pub decision_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReport {
    pub indexed: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
}

// ---------------------------------------------------------------------------
// DecisionStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DecisionStore {
    pool: Pool,
}

impl DecisionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Ingest a single record.
    pub fn ingest(&self, input: DecisionInput) -> Result<Decision> {
        let decision = input.normalize(Utc::now())?;
        let conn = self.pool.get()?;
        insert(&conn, &decision)?;
        debug!(algorithm = %decision.algorithm, decision_id = %decision.decision_id, "decision stored");
        Ok(decision)
    }

    /// Ingest many records in one transaction. Bad items are reported, not rolled back.
    pub fn ingest_bulk(&self, inputs: Vec<DecisionInput>) -> Result<BulkReport> {
        let now = Utc::now();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut report = BulkReport::default();

        for (index, input) in inputs.into_iter().enumerate() {
            let claimed_id = input.decision_id.clone();
            let outcome = input.normalize(now).and_then(|d| {
                insert(&tx, &d)?;
                Ok(d)
            });
            match outcome {
                Ok(_) => report.indexed += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(ItemError {
                        index,
                        decision_id: claimed_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tx.commit()?;
        if report.failed > 0 {
            warn!(indexed = report.indexed, failed = report.failed, "bulk ingest had rejected items");
        } else {
            info!(indexed = report.indexed, "bulk ingest complete");
        }
        Ok(report)
    }

    /// Decisions for `algorithm` with `from <= timestamp`, oldest first.
    pub fn window(&self, algorithm: &str, from: DateTime<Utc>) -> Result<Vec<Decision>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT decision_id, algorithm, version, ts_ms, category, value, zone, features_json
             FROM decisions
             WHERE algorithm = ?1 AND ts_ms >= ?2
             ORDER BY ts_ms ASC",
        )?;
        let rows = stmt.query_map(params![algorithm, to_millis(from)], decode_row)?;
        collect_lenient(rows)
    }

    /// Most recent decisions within `minutes`, newest first.
    pub fn stream(&self, algorithm: Option<&str>, minutes: i64, limit: usize) -> Result<Vec<Decision>> {
        let conn = self.pool.get()?;
        let from = to_millis(minutes_before(Utc::now(), minutes)?);
        let mut stmt = conn.prepare(
            "SELECT decision_id, algorithm, version, ts_ms, category, value, zone, features_json
             FROM decisions
             WHERE ts_ms >= ?1 AND (?2 IS NULL OR algorithm = ?2)
             ORDER BY ts_ms DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![from, algorithm, limit as i64], decode_row)?;
        collect_lenient(rows)
    }

    /// Algorithms that produced at least one decision since `from`.
    pub fn active_algorithms(&self, from: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT algorithm FROM decisions WHERE ts_ms >= ?1 ORDER BY algorithm",
        )?;
        let rows = stmt.query_map([to_millis(from)], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

fn insert(conn: &rusqlite::Connection, d: &Decision) -> Result<()> {
    let features = d.features.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO decisions
            (decision_id, algorithm, version, category, value, zone, features_json, ts_ms, ingested_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            d.decision_id,
            d.algorithm,
            d.version,
            d.category,
            d.value,
            d.zone,
            features,
            to_millis(d.timestamp),
            to_millis(Utc::now()),
        ],
    )
    .map_err(|e| match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::ConstraintViolation) => {
            SentinelError::Validation(format!("duplicate decision_id '{}'", d.decision_id))
        }
        _ => SentinelError::from(e),
    })?;
    Ok(())
}

fn decode_row(row: &Row<'_>) -> rusqlite::Result<Decision> {
    let features: Option<String> = row.get(7)?;
    Ok(Decision {
        decision_id: row.get(0)?,
        algorithm: row.get(1)?,
        version: row.get(2)?,
        timestamp: from_millis(row.get(3)?),
        category: row.get(4)?,
        value: row.get(5)?,
        zone: row.get(6)?,
        features: features.and_then(|f| serde_json::from_str(&f).ok()),
    })
}

/// Skip undecodable rows instead of failing the whole read.
fn collect_lenient(
    rows: impl Iterator<Item = rusqlite::Result<Decision>>,
) -> Result<Vec<Decision>> {
    let mut out = Vec::new();
    let mut skipped = 0usize;
    for r in rows {
        match r {
            Ok(d) => out.push(d),
            Err(rusqlite::Error::SqliteFailure(e, msg)) => {
                return Err(rusqlite::Error::SqliteFailure(e, msg).into());
            }
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(skipped, "skipped undecodable decision rows");
    }
    Ok(out)
}
