//! Append-only workflow audit log.

use std::collections::BTreeMap;

use rusqlite::{params, Row};
use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::storage::{from_millis, to_millis, Pool};
use crate::workflow::{Priority, WorkflowRecord, WorkflowStatus, WorkflowTrigger};

const COLUMNS: &str = "id, trigger_kind, entity_id, priority, actions_json, channels_json, \
                       status, ticket_key, created_at_ms, completed_at_ms";

#[derive(Debug, Clone, Default)]
pub struct WorkflowQuery {
    /// 0 means 100.
    pub limit: usize,
    pub status: Option<WorkflowStatus>,
    pub trigger: Option<WorkflowTrigger>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkflowStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    /// Percent of workflows that completed.
    pub success_rate: f64,
    pub chat_alerts_sent: u64,
    pub tickets_created: u64,
    pub by_trigger: BTreeMap<String, u64>,
}

#[derive(Clone)]
pub struct WorkflowStore {
    pool: Pool,
}

impl WorkflowStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn append(&self, record: &WorkflowRecord) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!("INSERT INTO workflows ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                record.id,
                record.trigger.as_str(),
                record.entity_id,
                record.priority.as_str(),
                serde_json::to_string(&record.actions)?,
                serde_json::to_string(&record.channels)?,
                record.status.as_str(),
                record.ticket_key,
                to_millis(record.created_at),
                to_millis(record.completed_at),
            ],
        )?;
        Ok(())
    }

    /// Newest first. Rows that no longer decode are skipped with a warning.
    pub fn history(&self, query: &WorkflowQuery) -> Result<Vec<WorkflowRecord>> {
        let conn = self.pool.get()?;
        let limit = if query.limit == 0 { 100 } else { query.limit } as i64;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM workflows
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR trigger_kind = ?2)
             ORDER BY created_at_ms DESC, rowid DESC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![
                query.status.map(WorkflowStatus::as_str),
                query.trigger.map(WorkflowTrigger::as_str),
                limit
            ],
            decode_row,
        )?;
        Ok(collect_lenient(rows))
    }

    /// Every workflow recorded against an incident, oldest first.
    pub fn for_entity(&self, entity_id: &str) -> Result<Vec<WorkflowRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM workflows WHERE entity_id = ?1 ORDER BY created_at_ms, rowid"
        ))?;
        let rows = stmt.query_map([entity_id], decode_row)?;
        Ok(collect_lenient(rows))
    }

    pub fn stats(&self) -> Result<WorkflowStats> {
        let records = self.history(&WorkflowQuery {
            limit: i64::MAX as usize,
            ..Default::default()
        })?;

        let mut stats = WorkflowStats::default();
        for r in &records {
            stats.total += 1;
            match r.status {
                WorkflowStatus::Completed => stats.completed += 1,
                WorkflowStatus::Failed => stats.failed += 1,
            }
            for action in &r.actions {
                match action.as_str() {
                    "slack_alert" => stats.chat_alerts_sent += 1,
                    "jira_ticket" => stats.tickets_created += 1,
                    _ => {}
                }
            }
            *stats.by_trigger.entry(r.trigger.to_string()).or_default() += 1;
        }
        if stats.total > 0 {
            stats.success_rate = stats.completed as f64 / stats.total as f64 * 100.0;
        }
        Ok(stats)
    }
}

fn collect_lenient(rows: impl Iterator<Item = rusqlite::Result<WorkflowRecord>>) -> Vec<WorkflowRecord> {
    rows.filter_map(|r| match r {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(error = %e, "skipping undecodable workflow row");
            None
        }
    })
    .collect()
}

fn decode_row(row: &Row<'_>) -> rusqlite::Result<WorkflowRecord> {
    fn bad(idx: usize, what: &str, value: String) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown {what} '{value}'").into(),
        )
    }
    fn json_err(idx: usize, e: serde_json::Error) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    }

    let trigger: String = row.get(1)?;
    let priority: String = row.get(3)?;
    let actions: String = row.get(4)?;
    let channels: String = row.get(5)?;
    let status: String = row.get(6)?;

    Ok(WorkflowRecord {
        id: row.get(0)?,
        trigger: WorkflowTrigger::parse(&trigger).ok_or_else(|| bad(1, "trigger", trigger.clone()))?,
        entity_id: row.get(2)?,
        priority: Priority::parse(&priority).ok_or_else(|| bad(3, "priority", priority.clone()))?,
        actions: serde_json::from_str(&actions).map_err(|e| json_err(4, e))?,
        channels: serde_json::from_str(&channels).map_err(|e| json_err(5, e))?,
        status: WorkflowStatus::parse(&status).ok_or_else(|| bad(6, "status", status.clone()))?,
        ticket_key: row.get(7)?,
        created_at: from_millis(row.get(8)?),
        completed_at: from_millis(row.get(9)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;
    use crate::workflow::ChannelOutcome;
    use chrono::{Duration, Utc};

    fn record(id: &str, trigger: WorkflowTrigger, status: WorkflowStatus, actions: &[&str]) -> WorkflowRecord {
        let now = Utc::now();
        WorkflowRecord {
            id: id.to_string(),
            trigger,
            entity_id: "drift-pricing-1".into(),
            priority: Priority::Normal,
            actions: actions.iter().map(|a| a.to_string()).collect(),
            channels: actions
                .iter()
                .map(|a| ChannelOutcome {
                    channel: a.to_string(),
                    ok: true,
                    detail: None,
                })
                .collect(),
            status,
            ticket_key: None,
            created_at: now,
            completed_at: now,
        }
    }

    #[test]
    fn test_history_newest_first_with_filters() {
        let (_dir, pool) = test_pool();
        let store = WorkflowStore::new(pool);

        let mut old = record("wf-drift-1", WorkflowTrigger::DriftIncident, WorkflowStatus::Completed, &["slack_alert"]);
        old.created_at = Utc::now() - Duration::minutes(5);
        store.append(&old).unwrap();
        store
            .append(&record("wf-escalation-2", WorkflowTrigger::Escalation, WorkflowStatus::Failed, &[]))
            .unwrap();

        let all = store.history(&WorkflowQuery::default()).unwrap();
        assert_eq!(
            all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["wf-escalation-2", "wf-drift-1"]
        );
        assert_eq!(all[1].actions, vec!["slack_alert".to_string()]);

        let failed = store
            .history(&WorkflowQuery {
                status: Some(WorkflowStatus::Failed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failed.len(), 1);

        let drift = store
            .history(&WorkflowQuery {
                trigger: Some(WorkflowTrigger::DriftIncident),
                limit: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(drift[0].id, "wf-drift-1");

        assert_eq!(store.for_entity("drift-pricing-1").unwrap().len(), 2);
        assert!(store.for_entity("drift-other-1").unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let (_dir, pool) = test_pool();
        let store = WorkflowStore::new(pool);
        let r = record("wf-manual-1", WorkflowTrigger::Manual, WorkflowStatus::Completed, &[]);
        store.append(&r).unwrap();
        assert!(store.append(&r).is_err());
    }

    #[test]
    fn test_stats() {
        let (_dir, pool) = test_pool();
        let store = WorkflowStore::new(pool);
        store
            .append(&record("a", WorkflowTrigger::DriftIncident, WorkflowStatus::Completed, &["slack_alert", "jira_ticket"]))
            .unwrap();
        store
            .append(&record("b", WorkflowTrigger::DriftIncident, WorkflowStatus::Completed, &["slack_alert"]))
            .unwrap();
        store
            .append(&record("c", WorkflowTrigger::Escalation, WorkflowStatus::Failed, &[]))
            .unwrap();
        store
            .append(&record("d", WorkflowTrigger::Manual, WorkflowStatus::Completed, &[]))
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 75.0).abs() < 1e-9);
        assert_eq!(stats.chat_alerts_sent, 2);
        assert_eq!(stats.tickets_created, 1);
        assert_eq!(stats.by_trigger["drift_incident"], 2);
    }

    #[test]
    fn test_corrupt_row_is_skipped() {
        let (_dir, pool) = test_pool();
        let store = WorkflowStore::new(pool.clone());
        store
            .append(&record("good", WorkflowTrigger::Manual, WorkflowStatus::Completed, &[]))
            .unwrap();
        pool.get()
            .unwrap()
            .execute(
                "INSERT INTO workflows (id, trigger_kind, entity_id, priority, actions_json,
                    channels_json, status, created_at_ms, completed_at_ms)
                 VALUES ('bad', 'cron', 'x', 'normal', '[]', '[]', 'completed', 0, 0)",
                [],
            )
            .unwrap();
        let history = store.history(&WorkflowQuery::default()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "good");
    }
}
