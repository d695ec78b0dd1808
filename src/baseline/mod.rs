//! Per-algorithm reference distributions.
//!
//! A baseline is recomputed wholesale from a trailing historical window and
//! overwrites the previous row. Concurrent recomputes race benignly: the
//! computation is deterministic for a given window, so last writer wins.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BaselineConfig;
use crate::detect::distribution::{Bands, Distribution, NumericSummary};
use crate::error::Result;
use crate::ingest::{Decision, DecisionStore};
use crate::storage::{from_millis, to_millis, Pool};

/// Reference distribution for one algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub algorithm: String,
    pub distribution: Distribution,
    /// Present when the algorithm emits numeric values only; categories are bands.
    pub bands: Option<Bands>,
    pub stats: Option<NumericSummary>,
    pub sample_count: usize,
    /// Fewer than the configured minimum samples backed this baseline.
    pub low_confidence: bool,
    pub window_days: i64,
    pub computed_at: DateTime<Utc>,
}

impl Baseline {
    /// Build a baseline from the historical decisions of one algorithm.
    pub fn from_decisions(
        algorithm: &str,
        decisions: &[Decision],
        window_days: i64,
        min_samples: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let values: Vec<f64> = decisions.iter().filter_map(|d| d.value).collect();
        let stats = NumericSummary::from_values(&values);

        let has_categories = decisions.iter().any(|d| d.category.is_some());
        let bands = if has_categories {
            None
        } else {
            Bands::from_values(&values)
        };

        let mut baseline = Self {
            algorithm: algorithm.to_string(),
            distribution: Distribution::default(),
            bands,
            stats,
            sample_count: 0,
            low_confidence: true,
            window_days,
            computed_at: now,
        };

        let labels: Vec<String> = decisions.iter().filter_map(|d| baseline.label_for(d)).collect();
        baseline.sample_count = labels.len();
        baseline.low_confidence = labels.len() < min_samples;
        baseline.distribution = Distribution::from_labels(labels.iter().map(String::as_str));
        baseline
    }

    /// The category a decision falls into under this baseline's category space.
    pub fn label_for(&self, decision: &Decision) -> Option<String> {
        match &self.bands {
            Some(bands) => decision.value.map(|v| bands.label(v)),
            None => decision.category.clone(),
        }
    }

    /// Empirical distribution of `decisions` over this baseline's category space.
    pub fn distribution_of<'a>(&self, decisions: impl IntoIterator<Item = &'a Decision>) -> (Distribution, usize) {
        let labels: Vec<String> = decisions.into_iter().filter_map(|d| self.label_for(d)).collect();
        let n = labels.len();
        (Distribution::from_labels(labels.iter().map(String::as_str)), n)
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.computed_at
    }
}

// ---------------------------------------------------------------------------
// BaselineStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BaselineStore {
    pool: Pool,
    decisions: DecisionStore,
    config: BaselineConfig,
}

impl BaselineStore {
    pub fn new(pool: Pool, config: BaselineConfig) -> Self {
        let decisions = DecisionStore::new(pool.clone());
        Self { pool, decisions, config }
    }

    /// Stored baseline without recomputation.
    pub fn get(&self, algorithm: &str) -> Result<Option<Baseline>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT distribution_json, bands_json, stats_json, sample_count, low_confidence,
                        window_days, computed_at_ms
                 FROM baselines WHERE algorithm = ?1",
                [algorithm],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((dist, bands, stats, count, low, window_days, computed_at)) = row else {
            return Ok(None);
        };
        Ok(Some(Baseline {
            algorithm: algorithm.to_string(),
            distribution: serde_json::from_str(&dist)?,
            bands: bands.map(|b| serde_json::from_str(&b)).transpose()?,
            stats: stats.map(|s| serde_json::from_str(&s)).transpose()?,
            sample_count: count as usize,
            low_confidence: low,
            window_days,
            computed_at: from_millis(computed_at),
        }))
    }

    /// Cached baseline if fresh enough, otherwise a recomputed one.
    pub fn get_or_compute(&self, algorithm: &str) -> Result<Baseline> {
        let now = Utc::now();
        if let Some(existing) = self.get(algorithm)? {
            if existing.age(now) < Duration::hours(self.config.max_age_hours) {
                debug!(%algorithm, "baseline cache hit");
                return Ok(existing);
            }
            debug!(%algorithm, "baseline stale, recomputing");
        }
        self.recompute(algorithm)
    }

    /// Force recomputation from the trailing window, ignoring the cache.
    pub fn recompute(&self, algorithm: &str) -> Result<Baseline> {
        let now = Utc::now();
        let history = self
            .decisions
            .window(algorithm, now - Duration::days(self.config.window_days))?;
        let baseline = Baseline::from_decisions(
            algorithm,
            &history,
            self.config.window_days,
            self.config.min_samples,
            now,
        );

        if baseline.is_empty() {
            // Nothing to cache; the next check tries again.
            warn!(%algorithm, "no historical decisions, baseline left unset");
            return Ok(baseline);
        }
        if baseline.low_confidence {
            warn!(
                %algorithm,
                samples = baseline.sample_count,
                min_samples = self.config.min_samples,
                "low-sample baseline"
            );
        }

        self.put(&baseline)?;
        info!(
            %algorithm,
            samples = baseline.sample_count,
            categories = baseline.distribution.as_map().len(),
            "baseline updated"
        );
        Ok(baseline)
    }

    fn put(&self, b: &Baseline) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO baselines
                (algorithm, distribution_json, bands_json, stats_json, sample_count,
                 low_confidence, window_days, computed_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                b.algorithm,
                serde_json::to_string(&b.distribution)?,
                b.bands.as_ref().map(serde_json::to_string).transpose()?,
                b.stats.as_ref().map(serde_json::to_string).transpose()?,
                b.sample_count as i64,
                b.low_confidence,
                b.window_days,
                to_millis(b.computed_at),
            ],
        )?;
        Ok(())
    }
}
