//! Background scheduling: the monitored-algorithm registry, the periodic
//! drift scanner, and the cron-driven baseline refresh.

pub mod cron;
pub mod engine;

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{Duration, Utc};
use rusqlite::params;
use tracing::info;

use crate::error::{Result, SentinelError};
use crate::ingest::DecisionStore;
use crate::storage::Pool;

pub use self::engine::{
    refresh_baselines, run_baseline_refresh_loop, run_scan_loop, run_scan_once, ScanReport,
};

/// Process-wide set of monitored algorithms, persisted in SQLite.
///
/// Passed explicitly to the detector and scanner. Reads are served from
/// memory; every mutation writes through first. Explicit removals are
/// remembered so discovery and config seeding do not bring them back.
#[derive(Clone)]
pub struct MonitorRegistry {
    pool: Pool,
    names: Arc<RwLock<BTreeSet<String>>>,
    excluded: Arc<RwLock<BTreeSet<String>>>,
}

impl MonitorRegistry {
    /// Load the persisted set, adding `seed` (from configuration) to it.
    ///
    /// Seed names an operator removed earlier stay removed.
    pub fn load(pool: Pool, seed: &[String]) -> Result<Self> {
        let conn = pool.get()?;
        let excluded = select_names(&conn, "SELECT name FROM excluded_algorithms ORDER BY name")?;
        for name in seed.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
            if excluded.contains(name) {
                info!(algorithm = %name, "configured algorithm was removed by an operator, not monitoring");
                continue;
            }
            conn.execute(
                "INSERT OR IGNORE INTO monitored_algorithms (name) VALUES (?1)",
                [name],
            )?;
        }
        let names = select_names(&conn, "SELECT name FROM monitored_algorithms ORDER BY name")?;
        drop(conn);

        info!(count = names.len(), excluded = excluded.len(), "monitored algorithms loaded");
        Ok(Self {
            pool,
            names: Arc::new(RwLock::new(names)),
            excluded: Arc::new(RwLock::new(excluded)),
        })
    }

    pub fn contains(&self, algorithm: &str) -> bool {
        self.names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(algorithm)
    }

    /// Whether an operator explicitly removed the algorithm.
    pub fn is_excluded(&self, algorithm: &str) -> bool {
        self.excluded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(algorithm)
    }

    pub fn list(&self) -> Vec<String> {
        self.names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Returns `true` if the algorithm was not monitored before.
    ///
    /// An explicit add lifts an earlier removal.
    pub fn add(&self, algorithm: &str) -> Result<bool> {
        let name = algorithm.trim();
        if name.is_empty() {
            return Err(SentinelError::Validation("empty algorithm name".into()));
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM excluded_algorithms WHERE name = ?1", params![name])?;
        tx.execute(
            "INSERT OR IGNORE INTO monitored_algorithms (name) VALUES (?1)",
            params![name],
        )?;
        tx.commit()?;

        self.excluded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        let added = self
            .names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
        if added {
            info!(algorithm = %name, "algorithm added to monitoring");
        }
        Ok(added)
    }

    /// Stop monitoring and exclude the algorithm from discovery.
    ///
    /// In-flight scanner checks for it will not open incidents.
    pub fn remove(&self, algorithm: &str) -> Result<bool> {
        let name = algorithm.trim();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM monitored_algorithms WHERE name = ?1", params![name])?;
        tx.execute(
            "INSERT OR IGNORE INTO excluded_algorithms (name) VALUES (?1)",
            params![name],
        )?;
        tx.commit()?;

        self.excluded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
        let removed = self
            .names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed {
            info!(algorithm = %name, "algorithm removed from monitoring");
        }
        Ok(removed)
    }

    /// Add every algorithm that produced decisions in the last `window_minutes`,
    /// except those an operator removed.
    pub fn discover(&self, decisions: &DecisionStore, window_minutes: i64) -> Result<Vec<String>> {
        let window = Duration::try_minutes(window_minutes)
            .ok_or_else(|| SentinelError::Config(format!("discover window {window_minutes}m out of range")))?;
        let since = Utc::now()
            .checked_sub_signed(window)
            .ok_or_else(|| SentinelError::Config(format!("discover window {window_minutes}m out of range")))?;
        let active = decisions.active_algorithms(since)?;
        let mut added = Vec::new();
        for name in active {
            if self.contains(&name) || self.is_excluded(&name) {
                continue;
            }
            if self.add(&name)? {
                added.push(name);
            }
        }
        Ok(added)
    }
}

fn select_names(conn: &rusqlite::Connection, sql: &str) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare(sql)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<BTreeSet<_>>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::DecisionInput;
    use crate::storage::test_pool;

    #[test]
    fn test_registry_persists_across_loads() {
        let (_dir, pool) = test_pool();
        let registry = MonitorRegistry::load(pool.clone(), &["eta".to_string()]).unwrap();
        assert!(registry.contains("eta"));
        assert!(registry.add("surge").unwrap());
        assert!(!registry.add("surge").unwrap());

        let reloaded = MonitorRegistry::load(pool, &[]).unwrap();
        assert_eq!(reloaded.list(), vec!["eta".to_string(), "surge".to_string()]);
    }

    #[test]
    fn test_remove_and_empty_name() {
        let (_dir, pool) = test_pool();
        let registry = MonitorRegistry::load(pool, &["eta".to_string()]).unwrap();
        assert!(registry.remove("eta").unwrap());
        assert!(!registry.remove("eta").unwrap());
        assert!(!registry.contains("eta"));
        assert!(matches!(registry.add("  "), Err(SentinelError::Validation(_))));
    }

    #[test]
    fn test_discover_adds_recently_active_algorithms() {
        let (_dir, pool) = test_pool();
        let decisions = DecisionStore::new(pool.clone());
        for algorithm in ["eta", "surge"] {
            decisions
                .ingest(DecisionInput {
                    algorithm: Some(algorithm.into()),
                    category: Some("LOW".into()),
                    ..Default::default()
                })
                .unwrap();
        }

        let registry = MonitorRegistry::load(pool, &["eta".to_string()]).unwrap();
        let added = registry.discover(&decisions, 60).unwrap();
        assert_eq!(added, vec!["surge".to_string()]);
        assert!(registry.discover(&decisions, 60).unwrap().is_empty());
    }

    #[test]
    fn test_removed_algorithm_stays_removed() {
        let (_dir, pool) = test_pool();
        let decisions = DecisionStore::new(pool.clone());
        decisions
            .ingest(DecisionInput {
                algorithm: Some("surge".into()),
                category: Some("LOW".into()),
                ..Default::default()
            })
            .unwrap();

        let registry = MonitorRegistry::load(pool.clone(), &["surge".to_string()]).unwrap();
        assert!(registry.remove("surge").unwrap());
        assert!(registry.discover(&decisions, 60).unwrap().is_empty());
        assert!(!registry.contains("surge"));

        // Survives a restart, even when configuration still lists it.
        let reloaded = MonitorRegistry::load(pool.clone(), &["surge".to_string()]).unwrap();
        assert!(!reloaded.contains("surge"));
        assert!(reloaded.is_excluded("surge"));

        assert!(reloaded.add("surge").unwrap());
        assert!(!reloaded.is_excluded("surge"));
        let again = MonitorRegistry::load(pool, &[]).unwrap();
        assert!(again.contains("surge"));
    }
}
