use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::detect::Severity;
use crate::diagnosis::{Diagnosis, FixAction, RootCause};
use crate::error::{Result, SentinelError};
use crate::storage::{from_millis, to_millis, Pool};

/// Incident lifecycle.
///
/// `detected -> investigating -> auto_fixing -> resolved`, with `escalated`
/// as the branch taken when confidence is too low or verification fails.
/// Any non-resolved state may be closed by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Detected,
    Investigating,
    AutoFixing,
    Resolved,
    Escalated,
}

impl IncidentStatus {
    pub const ALL: [IncidentStatus; 5] = [
        Self::Detected,
        Self::Investigating,
        Self::AutoFixing,
        Self::Resolved,
        Self::Escalated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Investigating => "investigating",
            Self::AutoFixing => "auto_fixing",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
        }
    }

    /// Counts against the one-active-incident-per-algorithm invariant.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Detected | Self::Investigating | Self::AutoFixing)
    }

    pub fn can_transition_to(self, to: Self) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, to),
            (Detected, Investigating)
                | (Investigating, AutoFixing)
                | (Investigating, Escalated)
                | (AutoFixing, Resolved)
                | (AutoFixing, Investigating)
                | (Detected | Investigating | Escalated, Resolved)
        )
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| SentinelError::Validation(format!("unknown incident status '{s}'")))
    }
}

/// Outcome of applying a fix, whether by policy or by an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub action: FixAction,
    pub confidence: f64,
    pub auto_executed: bool,
    pub applied_at: DateTime<Utc>,
    /// `None` until post-fix verification ran; always `None` for manual fixes.
    pub verified: Option<bool>,
    pub post_fix_divergence: Option<f64>,
    pub note: Option<String>,
}

/// A detected drift episode for one algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub algorithm: String,
    pub divergence: f64,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub affected_zones: Vec<String>,
    pub estimated_impact: f64,
    pub baseline_low_confidence: bool,
    pub root_cause: Option<RootCause>,
    pub diagnosis: Option<Diagnosis>,
    pub resolution: Option<Resolution>,
    pub agent_analysis: Option<String>,
    pub workflow_id: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// Still waiting for diagnosis: opened, possibly picked up, never diagnosed.
    ///
    /// Diagnosed `investigating` incidents are pending approval and excluded.
    pub fn needs_follow_up(&self) -> bool {
        matches!(self.status, IncidentStatus::Detected | IncidentStatus::Investigating)
            && self.diagnosis.is_none()
    }
}

/// Fields fixed at detection time.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub algorithm: String,
    pub divergence: f64,
    pub severity: Severity,
    pub affected_zones: Vec<String>,
    pub estimated_impact: f64,
    pub baseline_low_confidence: bool,
    pub detected_at: DateTime<Utc>,
}

impl NewIncident {
    /// Incident ids are derived from algorithm and detection epoch.
    pub fn incident_id(&self) -> String {
        format!("drift-{}-{}", self.algorithm, self.detected_at.timestamp_millis())
    }
}

#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub since: Option<DateTime<Utc>>,
    pub status: Option<IncidentStatus>,
    pub algorithm: Option<String>,
    pub limit: usize,
}

/// Best-effort page of incidents; undecodable rows are counted, not fatal.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentPage {
    pub incidents: Vec<Incident>,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IncidentMetrics {
    pub total_incidents: usize,
    pub auto_fixed: usize,
    /// Percentage of incidents resolved by a verified automatic fix.
    pub auto_fix_rate: f64,
    pub avg_divergence: f64,
    pub total_estimated_impact: f64,
    pub by_status: BTreeMap<String, usize>,
    pub by_algorithm: BTreeMap<String, usize>,
    pub skipped: usize,
}

// ---------------------------------------------------------------------------
// IncidentStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct IncidentStore {
    pool: Pool,
}

const COLUMNS: &str = "id, algorithm, divergence, severity, status, affected_zones_json,
    estimated_impact, baseline_low_confidence, diagnosis_json, resolution_json,
    agent_analysis, workflow_id, detected_at_ms, updated_at_ms, resolved_at_ms";

impl IncidentStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert a new `detected` incident unless one is already active.
    ///
    /// Atomic: the partial unique index on active incidents rejects a second
    /// insert even when two writers race past their own pre-checks.
    pub fn create(&self, new: NewIncident) -> Result<Incident> {
        let id = new.incident_id();
        let conn = self.pool.get()?;
        let now = to_millis(new.detected_at);
        let inserted = conn.execute(
            "INSERT INTO incidents
                (id, algorithm, divergence, severity, status, affected_zones_json,
                 estimated_impact, baseline_low_confidence, detected_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, 'detected', ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                new.algorithm,
                new.divergence,
                new.severity.as_str(),
                serde_json::to_string(&new.affected_zones)?,
                new.estimated_impact,
                new.baseline_low_confidence,
                now,
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(e) if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) => {
                if self.active_for(&new.algorithm)?.is_some() {
                    return Err(SentinelError::DuplicateIncident {
                        algorithm: new.algorithm,
                    });
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            incident_id = %id,
            algorithm = %new.algorithm,
            divergence = new.divergence,
            severity = %new.severity,
            "incident opened"
        );
        self.get(&id)
    }

    pub fn get(&self, id: &str) -> Result<Incident> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT {COLUMNS} FROM incidents WHERE id = ?1");
        conn.query_row(&sql, [id], decode_row)
            .optional()?
            .ok_or_else(|| SentinelError::not_found("incident", id))
    }

    /// The active incident for `algorithm`, if any.
    pub fn active_for(&self, algorithm: &str) -> Result<Option<Incident>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM incidents
             WHERE algorithm = ?1 AND status IN ('detected', 'investigating', 'auto_fixing')
             LIMIT 1"
        );
        Ok(conn.query_row(&sql, [algorithm], decode_row).optional()?)
    }

    pub fn list(&self, filter: &IncidentFilter) -> Result<IncidentPage> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM incidents
             WHERE detected_at_ms >= ?1
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR algorithm = ?3)
             ORDER BY detected_at_ms DESC
             LIMIT ?4"
        );
        let since = filter.since.map(to_millis).unwrap_or(i64::MIN);
        let limit = if filter.limit == 0 { 50 } else { filter.limit } as i64;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![since, filter.status.map(|s| s.as_str()), filter.algorithm, limit],
            decode_row,
        )?;

        let mut page = IncidentPage {
            incidents: Vec::new(),
            skipped: 0,
        };
        for r in rows {
            match r {
                Ok(i) => page.incidents.push(i),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable incident row");
                    page.skipped += 1;
                }
            }
        }
        Ok(page)
    }

    /// Move an incident to `to`, optionally recording a resolution.
    ///
    /// Compare-and-set on the current status: a concurrent writer that moved
    /// the incident first makes this call fail with `InvalidTransition`.
    pub fn transition(
        &self,
        id: &str,
        to: IncidentStatus,
        resolution: Option<&Resolution>,
    ) -> Result<Incident> {
        let current = self.get(id)?;
        if !current.status.can_transition_to(to) {
            return Err(SentinelError::InvalidTransition {
                incident_id: id.to_string(),
                from: current.status,
                to,
            });
        }

        let now = to_millis(Utc::now());
        let resolved_at = (to == IncidentStatus::Resolved).then_some(now);
        let resolution_json = resolution.map(serde_json::to_string).transpose()?;

        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE incidents
             SET status = ?1,
                 updated_at_ms = ?2,
                 resolved_at_ms = COALESCE(?3, resolved_at_ms),
                 resolution_json = COALESCE(?4, resolution_json)
             WHERE id = ?5 AND status = ?6",
            params![
                to.as_str(),
                now,
                resolved_at,
                resolution_json,
                id,
                current.status.as_str()
            ],
        )?;
        if changed == 0 {
            let latest = self.get(id)?;
            return Err(SentinelError::InvalidTransition {
                incident_id: id.to_string(),
                from: latest.status,
                to,
            });
        }

        info!(incident_id = %id, from = %current.status, to = %to, "incident transition");
        self.get(id)
    }

    pub fn record_diagnosis(&self, id: &str, diagnosis: &Diagnosis) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE incidents
             SET diagnosis_json = ?1, agent_analysis = COALESCE(?2, agent_analysis), updated_at_ms = ?3
             WHERE id = ?4",
            params![
                serde_json::to_string(diagnosis)?,
                diagnosis.agent_analysis,
                to_millis(Utc::now()),
                id
            ],
        )?;
        if changed == 0 {
            return Err(SentinelError::not_found("incident", id));
        }
        Ok(())
    }

    pub fn record_workflow(&self, id: &str, workflow_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE incidents SET workflow_id = ?1 WHERE id = ?2 AND workflow_id IS NULL",
            params![workflow_id, id],
        )?;
        Ok(())
    }

    /// Aggregate counts over incidents detected since `since`.
    pub fn metrics(&self, since: DateTime<Utc>) -> Result<IncidentMetrics> {
        let page = self.list(&IncidentFilter {
            since: Some(since),
            limit: i64::MAX as usize,
            ..Default::default()
        })?;

        let mut m = IncidentMetrics {
            skipped: page.skipped,
            ..Default::default()
        };
        let mut divergence_sum = 0.0;
        for inc in &page.incidents {
            m.total_incidents += 1;
            divergence_sum += inc.divergence;
            m.total_estimated_impact += inc.estimated_impact;
            *m.by_status.entry(inc.status.to_string()).or_default() += 1;
            *m.by_algorithm.entry(inc.algorithm.clone()).or_default() += 1;
            let auto_fixed = inc.status == IncidentStatus::Resolved
                && inc.resolution.as_ref().is_some_and(|r| r.auto_executed);
            if auto_fixed {
                m.auto_fixed += 1;
            }
        }
        if m.total_incidents > 0 {
            m.avg_divergence = divergence_sum / m.total_incidents as f64;
            m.auto_fix_rate = m.auto_fixed as f64 / m.total_incidents as f64 * 100.0;
        }
        Ok(m)
    }
}

fn decode_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    fn json_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    }

    let severity: String = row.get(3)?;
    let status: String = row.get(4)?;
    let zones: String = row.get(5)?;
    let diagnosis: Option<String> = row.get(8)?;
    let resolution: Option<String> = row.get(9)?;

    let diagnosis: Option<Diagnosis> = diagnosis
        .map(|d| serde_json::from_str(&d))
        .transpose()
        .map_err(|e| json_err(8, e))?;

    Ok(Incident {
        id: row.get(0)?,
        algorithm: row.get(1)?,
        divergence: row.get(2)?,
        severity: Severity::parse(&severity).ok_or_else(|| {
            json_err(3, SentinelError::Validation(format!("unknown severity '{severity}'")))
        })?,
        status: status.parse().map_err(|e| json_err(4, e))?,
        affected_zones: serde_json::from_str(&zones).map_err(|e| json_err(5, e))?,
        estimated_impact: row.get(6)?,
        baseline_low_confidence: row.get(7)?,
        root_cause: diagnosis.as_ref().map(|d| d.root_cause),
        diagnosis,
        resolution: resolution
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(|e| json_err(9, e))?,
        agent_analysis: row.get(10)?,
        workflow_id: row.get(11)?,
        detected_at: from_millis(row.get(12)?),
        updated_at: from_millis(row.get(13)?),
        resolved_at: row.get::<_, Option<i64>>(14)?.map(from_millis),
    })
}
