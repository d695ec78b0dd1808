//! Root-cause attribution for drift incidents.
//!
//! The heuristic diagnosis is deterministic and local. An external agent can
//! refine it (see [`agent`]) but is never required.

pub mod agent;

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::baseline::Baseline;
use crate::config::{DetectionConfig, DiagnosisConfig, ScheduledJob};
use crate::detect::distribution::{kl_divergence, NumericSummary};
use crate::detect::{affected_zones, zone_divergences, ZoneDivergence};
use crate::error::SentinelError;
use crate::ingest::Decision;
use crate::scheduler::cron::firing_near;

pub use self::agent::{
    Diagnoser, DiagnosticAgent, HttpAgent, LoggingRemediator, RemediationRequest, Remediator,
};

/// Remediation actions. The set is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixAction {
    /// Revert the algorithm to its last known good version.
    Rollback,
    /// Serve a cached or fallback value for the drifting input.
    FeatureOverride,
    /// Exclude the affected zones from the algorithm.
    ZoneExclude,
    /// Stop the algorithm and serve its default.
    Pause,
}

impl FixAction {
    pub const ALL: [FixAction; 4] = [
        Self::Rollback,
        Self::FeatureOverride,
        Self::ZoneExclude,
        Self::Pause,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rollback => "rollback",
            Self::FeatureOverride => "feature_override",
            Self::ZoneExclude => "zone_exclude",
            Self::Pause => "pause",
        }
    }
}

impl std::fmt::Display for FixAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FixAction {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| {
                SentinelError::Validation(format!(
                    "unknown action '{s}', expected rollback|feature_override|zone_exclude|pause"
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    /// A strict subset of zones drifted.
    ZoneSpecific,
    /// All zones drifted abruptly.
    Global,
    /// All zones drifted, divergence ramped up over the lookback.
    Gradual,
    /// Onset lines up with a known batch job.
    ScheduledJob,
    /// An input feature moved far from its historical mean.
    FeatureShift,
    Unknown,
}

impl RootCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ZoneSpecific => "zone_specific",
            Self::Global => "global",
            Self::Gradual => "gradual",
            Self::ScheduledJob => "scheduled_job",
            Self::FeatureShift => "feature_shift",
            Self::Unknown => "unknown",
        }
    }

    /// Static root cause to action table.
    pub fn recommended_action(self) -> FixAction {
        match self {
            Self::ZoneSpecific => FixAction::ZoneExclude,
            Self::Global | Self::Gradual => FixAction::Rollback,
            Self::ScheduledJob | Self::FeatureShift => FixAction::FeatureOverride,
            Self::Unknown => FixAction::Pause,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        [
            Self::ZoneSpecific,
            Self::Global,
            Self::Gradual,
            Self::ScheduledJob,
            Self::FeatureShift,
            Self::Unknown,
        ]
        .into_iter()
        .find(|c| c.as_str() == normalized)
    }
}

impl std::fmt::Display for RootCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisSource {
    Heuristic,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureShift {
    pub feature: String,
    pub baseline_mean: f64,
    pub current_mean: f64,
    /// Shift of the current mean in baseline standard deviations.
    pub sigma: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub root_cause: RootCause,
    pub confidence: f64,
    pub recommended_action: FixAction,
    pub drift_start: Option<DateTime<Utc>>,
    pub affected_zones: Vec<String>,
    pub zone_divergences: Vec<ZoneDivergence>,
    pub scheduled_job: Option<String>,
    pub suspect_feature: Option<FeatureShift>,
    pub source: DiagnosisSource,
    pub agent_analysis: Option<String>,
    pub diagnosed_at: DateTime<Utc>,
}

/// Decisions and baseline the heuristics run over.
pub struct Evidence<'a> {
    pub baseline: &'a Baseline,
    /// Decisions over the diagnosis lookback, oldest first.
    pub lookback: &'a [Decision],
    /// Decisions in the detector's recent window.
    pub recent: &'a [Decision],
    /// Decisions from the baseline window preceding the recent window.
    pub history: &'a [Decision],
}

/// One lookback bucket that had enough samples to score.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub divergence: f64,
}

/// Score every lookback bucket against the baseline, oldest first.
pub fn bucket_divergences(
    evidence: &Evidence<'_>,
    config: &DiagnosisConfig,
    epsilon: f64,
    now: DateTime<Utc>,
) -> Vec<Bucket> {
    let width = Duration::minutes(config.bucket_minutes.max(1));
    let start = now - Duration::hours(config.lookback_hours);

    let mut grouped: BTreeMap<i64, Vec<&Decision>> = BTreeMap::new();
    for d in evidence.lookback.iter().filter(|d| d.timestamp >= start) {
        let idx = (d.timestamp - start).num_milliseconds() / width.num_milliseconds();
        grouped.entry(idx).or_default().push(d);
    }

    grouped
        .into_iter()
        .filter_map(|(idx, items)| {
            let (dist, n) = evidence.baseline.distribution_of(items);
            (n >= config.min_bucket_samples.max(1)).then(|| Bucket {
                start: start + width * idx as i32,
                divergence: kl_divergence(&dist, &evidence.baseline.distribution, epsilon),
            })
        })
        .collect()
}

/// Onset of the trailing run of drifting buckets.
///
/// Walks back from the newest bucket while buckets exceed `threshold`; the
/// oldest bucket of that run is where the current episode began.
pub fn drift_onset(buckets: &[Bucket], threshold: f64) -> Option<&[Bucket]> {
    let run = buckets
        .iter()
        .rev()
        .take_while(|b| b.divergence >= threshold)
        .count();
    (run > 0).then(|| &buckets[buckets.len() - run..])
}

/// Numeric input feature whose recent mean moved furthest from history.
pub fn feature_shift(history: &[Decision], recent: &[Decision], min_sigma: f64) -> Option<FeatureShift> {
    fn numeric_features(decisions: &[Decision]) -> BTreeMap<String, Vec<f64>> {
        let mut out: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for d in decisions {
            let Some(serde_json::Value::Object(map)) = &d.features else {
                continue;
            };
            for (k, v) in map {
                if let Some(x) = v.as_f64() {
                    out.entry(k.clone()).or_default().push(x);
                }
            }
        }
        out
    }

    let before = numeric_features(history);
    let after = numeric_features(recent);

    after
        .into_iter()
        .filter_map(|(feature, values)| {
            let base = NumericSummary::from_values(before.get(&feature)?)?;
            let cur = NumericSummary::from_values(&values)?;
            let sigma = base.z_score(cur.mean).abs();
            (sigma.is_finite() && sigma > min_sigma).then_some(FeatureShift {
                feature,
                baseline_mean: base.mean,
                current_mean: cur.mean,
                sigma,
            })
        })
        .max_by(|a, b| a.sigma.total_cmp(&b.sigma))
}

/// Deterministic diagnosis from temporal, geographic, and feature signals.
pub fn diagnose(
    evidence: &Evidence<'_>,
    config: &DiagnosisConfig,
    detection: &DetectionConfig,
    now: DateTime<Utc>,
) -> Diagnosis {
    let buckets = bucket_divergences(evidence, config, detection.epsilon, now);
    let run = drift_onset(&buckets, detection.kl_threshold);
    let drift_start = run.and_then(|r| r.first()).map(|b| b.start);
    let gradual = run.is_some_and(|r| {
        r.len() > 1 && r[0].divergence < 0.5 * r[r.len() - 1].divergence
    });

    let zones = zone_divergences(
        evidence.baseline,
        evidence.recent,
        detection.min_zone_samples,
        detection.epsilon,
    );
    let affected = affected_zones(&zones, detection.zone_threshold);
    let ambiguous = zones
        .iter()
        .filter(|z| z.divergence > 0.5 * detection.zone_threshold && z.divergence <= detection.zone_threshold)
        .count();
    let separation = if zones.is_empty() {
        1.0
    } else {
        (zones.len() - ambiguous) as f64 / zones.len() as f64
    };

    let tolerance = Duration::minutes(config.scheduled_job_tolerance_minutes);
    let job = drift_start.and_then(|start| matching_job(&config.scheduled_jobs, start, tolerance));
    let suspect = feature_shift(evidence.history, evidence.recent, config.feature_shift_sigma);

    let (root_cause, confidence) = if let Some((_, offset)) = &job {
        let miss = offset.num_seconds().abs() as f64 / tolerance.num_seconds().max(1) as f64;
        (RootCause::ScheduledJob, 0.9 - 0.2 * miss.min(1.0))
    } else if !affected.is_empty() && affected.len() < zones.len() {
        (RootCause::ZoneSpecific, 0.95 * separation)
    } else if let Some(shift) = &suspect {
        let excess = shift.sigma - config.feature_shift_sigma;
        (RootCause::FeatureShift, (0.6 + 0.05 * excess).min(0.9))
    } else if gradual {
        (RootCause::Gradual, 0.6)
    } else if drift_start.is_some() || !affected.is_empty() {
        (RootCause::Global, 0.7 * separation)
    } else {
        (RootCause::Unknown, 0.3)
    };

    Diagnosis {
        root_cause,
        confidence: confidence.clamp(0.0, 1.0),
        recommended_action: root_cause.recommended_action(),
        drift_start,
        affected_zones: affected,
        zone_divergences: zones,
        scheduled_job: job.map(|(name, _)| name),
        suspect_feature: suspect,
        source: DiagnosisSource::Heuristic,
        agent_analysis: None,
        diagnosed_at: now,
    }
}

/// First configured job that fired within `tolerance` of `start`.
fn matching_job(jobs: &[ScheduledJob], start: DateTime<Utc>, tolerance: Duration) -> Option<(String, Duration)> {
    jobs.iter().find_map(|job| {
        let fired = firing_near(&job.cron, start, tolerance)?;
        Some((job.name.clone(), fired - start))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decision(category: &str, zone: Option<&str>, ts: DateTime<Utc>) -> Decision {
        Decision {
            decision_id: uuid::Uuid::new_v4().to_string(),
            algorithm: "pricing".into(),
            version: None,
            timestamp: ts,
            category: Some(category.into()),
            value: None,
            zone: zone.map(str::to_string),
            features: None,
        }
    }

    fn batch(mix: &[(&str, usize)], zone: Option<&str>, ts: DateTime<Utc>) -> Vec<Decision> {
        mix.iter()
            .flat_map(|(c, n)| (0..*n).map(move |_| decision(c, zone, ts)))
            .collect()
    }

    fn baseline(now: DateTime<Utc>) -> Baseline {
        let history = batch(&[("low", 30), ("medium", 50), ("high", 20)], None, now - Duration::days(2));
        Baseline::from_decisions("pricing", &history, 7, 30, now)
    }

    #[test]
    fn test_action_table_is_static() {
        assert_eq!(RootCause::ZoneSpecific.recommended_action(), FixAction::ZoneExclude);
        assert_eq!(RootCause::Global.recommended_action(), FixAction::Rollback);
        assert_eq!(RootCause::Gradual.recommended_action(), FixAction::Rollback);
        assert_eq!(RootCause::ScheduledJob.recommended_action(), FixAction::FeatureOverride);
        assert_eq!(RootCause::FeatureShift.recommended_action(), FixAction::FeatureOverride);
        assert_eq!(RootCause::Unknown.recommended_action(), FixAction::Pause);
    }

    #[test]
    fn test_fix_action_parse() {
        assert_eq!("Zone_Exclude".parse::<FixAction>().unwrap(), FixAction::ZoneExclude);
        assert!(matches!("reboot".parse::<FixAction>(), Err(SentinelError::Validation(_))));
        assert_eq!(RootCause::parse("zone-specific"), Some(RootCause::ZoneSpecific));
    }

    #[test]
    fn test_onset_is_start_of_trailing_run() {
        let t0 = Utc::now();
        let b = |m: i64, d: f64| Bucket {
            start: t0 + Duration::minutes(m),
            divergence: d,
        };
        let buckets = vec![b(0, 0.9), b(5, 0.01), b(10, 0.5), b(15, 0.8)];
        let run = drift_onset(&buckets, 0.3).unwrap();
        assert_eq!(run.len(), 2);
        assert_eq!(run[0].start, t0 + Duration::minutes(10));
        assert!(drift_onset(&buckets[..2], 0.3).is_none());
    }

    #[test]
    fn test_zone_specific_drift() {
        let now = Utc::now();
        let base = baseline(now);
        let mut recent = batch(&[("high", 40)], Some("north"), now - Duration::minutes(10));
        recent.extend(batch(&[("low", 12), ("medium", 20), ("high", 8)], Some("south"), now - Duration::minutes(10)));
        recent.extend(batch(&[("low", 9), ("medium", 15), ("high", 6)], Some("east"), now - Duration::minutes(10)));

        let evidence = Evidence {
            baseline: &base,
            lookback: &recent,
            recent: &recent,
            history: &[],
        };
        let d = diagnose(&evidence, &DiagnosisConfig::default(), &DetectionConfig::default(), now);

        assert_eq!(d.root_cause, RootCause::ZoneSpecific);
        assert_eq!(d.recommended_action, FixAction::ZoneExclude);
        assert_eq!(d.affected_zones, vec!["north".to_string()]);
        assert!((d.confidence - 0.95).abs() < 1e-9);
        assert_eq!(d.source, DiagnosisSource::Heuristic);
    }

    #[test]
    fn test_global_drift_when_all_zones_shift() {
        let now = Utc::now();
        let base = baseline(now);
        let mut recent = batch(&[("high", 30)], Some("north"), now - Duration::minutes(10));
        recent.extend(batch(&[("high", 30)], Some("south"), now - Duration::minutes(10)));

        let evidence = Evidence {
            baseline: &base,
            lookback: &recent,
            recent: &recent,
            history: &[],
        };
        let d = diagnose(&evidence, &DiagnosisConfig::default(), &DetectionConfig::default(), now);
        assert_eq!(d.root_cause, RootCause::Global);
        assert!(d.drift_start.is_some());
        assert!((d.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_gradual_ramp_is_detected() {
        let now = Utc::now();
        let base = baseline(now);
        // Divergence grows bucket over bucket.
        let mut lookback = batch(&[("low", 15), ("medium", 25), ("high", 60)], None, now - Duration::minutes(40));
        lookback.extend(batch(&[("low", 5), ("medium", 10), ("high", 85)], None, now - Duration::minutes(20)));
        lookback.extend(batch(&[("high", 100)], None, now - Duration::minutes(2)));

        let evidence = Evidence {
            baseline: &base,
            lookback: &lookback,
            recent: &lookback,
            history: &[],
        };
        let d = diagnose(&evidence, &DiagnosisConfig::default(), &DetectionConfig::default(), now);
        assert_eq!(d.root_cause, RootCause::Gradual);
        assert_eq!(d.recommended_action, FixAction::Rollback);
    }

    #[test]
    fn test_scheduled_job_alignment() {
        let now = Utc::now();
        let base = baseline(now);
        let recent = batch(&[("high", 50)], None, now - Duration::minutes(1));
        let config = DiagnosisConfig {
            // Fires every minute, so it is always near the onset.
            scheduled_jobs: vec![ScheduledJob {
                name: "feature-refresh".into(),
                cron: "0 * * * * *".into(),
            }],
            ..Default::default()
        };

        let evidence = Evidence {
            baseline: &base,
            lookback: &recent,
            recent: &recent,
            history: &[],
        };
        let d = diagnose(&evidence, &config, &DetectionConfig::default(), now);
        assert_eq!(d.root_cause, RootCause::ScheduledJob);
        assert_eq!(d.scheduled_job.as_deref(), Some("feature-refresh"));
        assert!(d.confidence >= 0.7);
    }

    #[test]
    fn test_feature_shift_is_reported() {
        let now = Utc::now();
        let base = baseline(now);
        let with_feature = |ts: DateTime<Utc>, x: f64| Decision {
            features: Some(json!({ "demand_index": x, "label": "ignored" })),
            ..decision("high", None, ts)
        };
        let history: Vec<Decision> = (0..50)
            .map(|i| with_feature(now - Duration::days(1), 1.0 + f64::from(i % 5) * 0.1))
            .collect();
        let recent: Vec<Decision> = (0..30).map(|_| with_feature(now - Duration::minutes(3), 9.0)).collect();

        let shift = feature_shift(&history, &recent, 3.0).unwrap();
        assert_eq!(shift.feature, "demand_index");
        assert!(shift.sigma > 3.0);

        let evidence = Evidence {
            baseline: &base,
            lookback: &recent,
            recent: &recent,
            history: &history,
        };
        let d = diagnose(&evidence, &DiagnosisConfig::default(), &DetectionConfig::default(), now);
        assert_eq!(d.root_cause, RootCause::FeatureShift);
        assert_eq!(d.recommended_action, FixAction::FeatureOverride);
    }

    #[test]
    fn test_no_signal_is_unknown_with_low_confidence() {
        let now = Utc::now();
        let base = baseline(now);
        let evidence = Evidence {
            baseline: &base,
            lookback: &[],
            recent: &[],
            history: &[],
        };
        let d = diagnose(&evidence, &DiagnosisConfig::default(), &DetectionConfig::default(), now);
        assert_eq!(d.root_cause, RootCause::Unknown);
        assert_eq!(d.recommended_action, FixAction::Pause);
        assert!(d.confidence < 0.6);
    }
}
