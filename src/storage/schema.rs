//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS decisions (
            id INTEGER PRIMARY KEY,
            decision_id TEXT NOT NULL UNIQUE,
            algorithm TEXT NOT NULL,
            version TEXT,
            category TEXT,
            value REAL,
            zone TEXT,
            features_json TEXT,
            ts_ms INTEGER NOT NULL,
            ingested_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_decisions_algo_ts ON decisions(algorithm, ts_ms);
        CREATE INDEX IF NOT EXISTS idx_decisions_ts ON decisions(ts_ms);

        CREATE TABLE IF NOT EXISTS baselines (
            algorithm TEXT PRIMARY KEY,
            distribution_json TEXT NOT NULL,
            bands_json TEXT,
            stats_json TEXT,
            sample_count INTEGER NOT NULL,
            low_confidence INTEGER NOT NULL DEFAULT 0,
            window_days INTEGER NOT NULL,
            computed_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            algorithm TEXT NOT NULL,
            divergence REAL NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL,
            affected_zones_json TEXT NOT NULL,
            estimated_impact REAL NOT NULL,
            baseline_low_confidence INTEGER NOT NULL DEFAULT 0,
            diagnosis_json TEXT,
            resolution_json TEXT,
            agent_analysis TEXT,
            workflow_id TEXT,
            detected_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            resolved_at_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_incidents_detected ON incidents(detected_at_ms);

        -- At most one active incident per algorithm, enforced by the store.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_one_active
            ON incidents(algorithm)
            WHERE status IN ('detected', 'investigating', 'auto_fixing');

        CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            trigger_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            priority TEXT NOT NULL,
            actions_json TEXT NOT NULL,
            channels_json TEXT NOT NULL,
            status TEXT NOT NULL,
            ticket_key TEXT,
            created_at_ms INTEGER NOT NULL,
            completed_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_workflows_created ON workflows(created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_workflows_entity ON workflows(entity_id);

        CREATE TABLE IF NOT EXISTS monitored_algorithms (
            name TEXT PRIMARY KEY,
            added_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Explicit removals; auto-discovery and config seeding skip these.
        CREATE TABLE IF NOT EXISTS excluded_algorithms (
            name TEXT PRIMARY KEY,
            removed_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    Ok(())
}
