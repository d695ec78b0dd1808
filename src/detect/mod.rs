//! Drift detection and incident records.

pub mod distribution;
pub mod engine;
pub mod incident;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::baseline::Baseline;
use crate::ingest::Decision;
use self::distribution::{kl_divergence, Distribution};
use self::incident::Incident;

/// Severity tiers for detected incidents, ordered by divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Tier for a divergence against `threshold`; `None` unless it exceeds it.
    ///
    /// (t, 2t) medium, [2t, 4t) high, >= 4t critical.
    pub fn classify(divergence: f64, threshold: f64) -> Option<Self> {
        if divergence <= threshold || divergence.is_nan() {
            None
        } else if divergence < 2.0 * threshold {
            Some(Self::Medium)
        } else if divergence < 4.0 * threshold {
            Some(Self::High)
        } else {
            Some(Self::Critical)
        }
    }

    /// One tier lower, used when the baseline itself is low-confidence.
    pub fn softened(self) -> Self {
        match self {
            Self::Critical => Self::High,
            Self::High | Self::Medium => Self::Medium,
        }
    }

    /// Multiplier applied to the per-algorithm impact figure.
    pub fn impact_weight(self) -> f64 {
        match self {
            Self::Medium => 1.0,
            Self::High => 2.0,
            Self::Critical => 4.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for a check. Scanner checks re-validate monitoring before writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOrigin {
    Scan,
    OnDemand,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// No historical decisions to compare against.
    NoBaseline,
    InsufficientSamples { have: usize, need: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// Divergence below threshold.
    Clean,
    IncidentCreated { incident_id: String },
    /// Above threshold, but an incident is already open for this algorithm.
    ActiveIncidentExists { incident_id: String },
    /// Above threshold, but the algorithm left the monitored set mid-check.
    Unmonitored,
    Skipped { reason: SkipReason },
}

/// Per-zone divergence of the current window against the global baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDivergence {
    pub zone: String,
    pub divergence: f64,
    pub samples: usize,
}

/// Result of a single drift check, returned whether or not an incident opened.
#[derive(Debug, Clone, Serialize)]
pub struct DriftCheckResult {
    pub algorithm: String,
    pub divergence: Option<f64>,
    pub threshold: f64,
    pub severity: Option<Severity>,
    pub current_samples: usize,
    pub baseline_samples: usize,
    pub baseline_low_confidence: bool,
    pub current_distribution: Distribution,
    pub baseline_distribution: Distribution,
    pub zones: Vec<ZoneDivergence>,
    pub outcome: CheckOutcome,
    pub incident: Option<Incident>,
    pub checked_at: DateTime<Utc>,
}

impl DriftCheckResult {
    pub fn incident_id(&self) -> Option<&str> {
        match &self.outcome {
            CheckOutcome::IncidentCreated { incident_id }
            | CheckOutcome::ActiveIncidentExists { incident_id } => Some(incident_id),
            _ => None,
        }
    }

    pub fn drift_detected(&self) -> bool {
        self.severity.is_some()
    }
}

/// Divergence of each zone with enough samples, highest first.
pub fn zone_divergences(
    baseline: &Baseline,
    decisions: &[Decision],
    min_samples: usize,
    epsilon: f64,
) -> Vec<ZoneDivergence> {
    let mut by_zone: BTreeMap<&str, Vec<&Decision>> = BTreeMap::new();
    for d in decisions {
        if let Some(zone) = d.zone.as_deref() {
            by_zone.entry(zone).or_default().push(d);
        }
    }

    let mut zones: Vec<ZoneDivergence> = by_zone
        .into_iter()
        .filter_map(|(zone, items)| {
            let (dist, n) = baseline.distribution_of(items);
            if n < min_samples.max(1) {
                return None;
            }
            Some(ZoneDivergence {
                zone: zone.to_string(),
                divergence: kl_divergence(&dist, &baseline.distribution, epsilon),
                samples: n,
            })
        })
        .collect();
    zones.sort_by(|a, b| b.divergence.total_cmp(&a.divergence));
    zones
}

/// Zones whose divergence exceeds `threshold`, sorted by name.
pub fn affected_zones(zones: &[ZoneDivergence], threshold: f64) -> Vec<String> {
    let mut out: Vec<String> = zones
        .iter()
        .filter(|z| z.divergence > threshold)
        .map(|z| z.zone.clone())
        .collect();
    out.sort();
    out
}

/// Current-window distribution of `decisions` against `baseline`.
pub fn current_distribution(baseline: &Baseline, decisions: &[Decision]) -> (Distribution, usize) {
    baseline.distribution_of(decisions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_tiers() {
        assert_eq!(Severity::classify(0.29, 0.3), None);
        assert_eq!(Severity::classify(0.3, 0.3), None);
        assert_eq!(Severity::classify(0.3001, 0.3), Some(Severity::Medium));
        assert_eq!(Severity::classify(f64::NAN, 0.3), None);
        assert_eq!(Severity::classify(0.59, 0.3), Some(Severity::Medium));
        assert_eq!(Severity::classify(0.6, 0.3), Some(Severity::High));
        assert_eq!(Severity::classify(1.19, 0.3), Some(Severity::High));
        assert_eq!(Severity::classify(1.2, 0.3), Some(Severity::Critical));
    }

    #[test]
    fn test_severity_is_monotonic_in_divergence() {
        let threshold = 0.3;
        let points: Vec<f64> = (0..400).map(|i| f64::from(i) * 0.005).collect();
        for pair in points.windows(2) {
            let (d1, d2) = (pair[0], pair[1]);
            assert!(
                Severity::classify(d1, threshold) <= Severity::classify(d2, threshold),
                "tier({d1}) > tier({d2})"
            );
        }
    }

    #[test]
    fn test_softened_never_drops_below_medium() {
        assert_eq!(Severity::Critical.softened(), Severity::High);
        assert_eq!(Severity::High.softened(), Severity::Medium);
        assert_eq!(Severity::Medium.softened(), Severity::Medium);
    }

    #[test]
    fn test_severity_parse_roundtrip() {
        for s in [Severity::Medium, Severity::High, Severity::Critical] {
            assert_eq!(Severity::parse(s.as_str()), Some(s));
        }
        assert_eq!(Severity::parse("info"), None);
    }
}
