//! Empirical distributions, KL divergence, and numeric summaries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Category label → probability. Ordered so serialized output is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Distribution(BTreeMap<String, f64>);

impl Distribution {
    /// Build from observed labels; empty input gives an empty distribution.
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for label in labels {
            *counts.entry(label.to_string()).or_default() += 1;
        }
        Self::from_counts(counts)
    }

    pub fn from_counts(counts: BTreeMap<String, u64>) -> Self {
        let total: u64 = counts.values().sum();
        if total == 0 {
            return Self::default();
        }
        Self(
            counts
                .into_iter()
                .map(|(k, c)| (k, c as f64 / total as f64))
                .collect(),
        )
    }

    /// Probabilities given directly. Caller guarantees they sum to 1.
    pub fn from_probabilities<K: Into<String>>(pairs: impl IntoIterator<Item = (K, f64)>) -> Self {
        Self(pairs.into_iter().map(|(k, p)| (k.into(), p)).collect())
    }

    pub fn get(&self, category: &str) -> f64 {
        self.0.get(category).copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.0
    }
}

/// KL(current || baseline) over the union of categories.
///
/// `epsilon` is added to every probability on both sides before the log, so a
/// category missing from either side contributes a finite term.
pub fn kl_divergence(current: &Distribution, baseline: &Distribution, epsilon: f64) -> f64 {
    let mut keys: Vec<&str> = current.categories().chain(baseline.categories()).collect();
    keys.sort_unstable();
    keys.dedup();

    let kl: f64 = keys
        .into_iter()
        .map(|k| {
            let p = current.get(k) + epsilon;
            let q = baseline.get(k) + epsilon;
            p * (p / q).ln()
        })
        .sum();

    // Both sides carry equal mass after smoothing, so negatives are rounding noise.
    kl.max(0.0)
}

// ---------------------------------------------------------------------------
// Numeric summaries
// ---------------------------------------------------------------------------

/// Summary statistics for numeric decision outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericSummary {
    pub count: u64,
    pub mean: f64,
    pub std: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl NumericSummary {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len() as u64;
        let mean = sorted.iter().sum::<f64>() / count as f64;
        // Sample variance
        let variance = if count > 1 {
            sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64
        } else {
            0.0
        };

        Some(Self {
            count,
            mean,
            std: variance.sqrt(),
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        })
    }

    /// How many standard deviations `value` sits from the mean.
    pub fn z_score(&self, value: f64) -> f64 {
        if self.std <= f64::EPSILON {
            if (value - self.mean).abs() > f64::EPSILON {
                return f64::INFINITY;
            }
            return 0.0;
        }
        (value - self.mean) / self.std
    }
}

/// Linear-interpolated percentile of an ascending slice.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (pct / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Quantile band edges used to categorize numeric-only outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bands {
    pub edges: Vec<f64>,
}

impl Bands {
    /// Edges at p25, p50, p75, p95 of the historical values.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let edges = [25.0, 50.0, 75.0, 95.0]
            .iter()
            .map(|p| percentile(&sorted, *p))
            .collect();
        Some(Self { edges })
    }

    /// Band label `q1`..`q{n+1}` for a value.
    pub fn label(&self, value: f64) -> String {
        let idx = self.edges.iter().take_while(|edge| value > **edge).count();
        format!("q{}", idx + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist(pairs: &[(&str, f64)]) -> Distribution {
        Distribution::from_probabilities(pairs.iter().map(|(k, p)| (*k, *p)))
    }

    #[test]
    fn test_identical_distributions_have_zero_divergence() {
        let p = dist(&[("low", 0.3), ("medium", 0.5), ("high", 0.2)]);
        let kl = kl_divergence(&p, &p.clone(), 1e-8);
        assert!(kl.abs() < 1e-12, "kl = {kl}");
    }

    #[test]
    fn test_divergence_is_non_negative() {
        let cases = [
            (dist(&[("a", 1.0)]), dist(&[("b", 1.0)])),
            (dist(&[("a", 0.5), ("b", 0.5)]), dist(&[("a", 0.9), ("b", 0.1)])),
            (dist(&[("a", 0.01), ("b", 0.99)]), dist(&[("a", 0.99), ("b", 0.01)])),
            (Distribution::default(), dist(&[("a", 1.0)])),
        ];
        for (p, q) in cases {
            assert!(kl_divergence(&p, &q, 1e-8) >= 0.0);
            assert!(kl_divergence(&q, &p, 1e-8) >= 0.0);
        }
    }

    #[test]
    fn test_shifted_distribution_matches_hand_computation() {
        let baseline = dist(&[("low", 0.3), ("medium", 0.5), ("high", 0.2)]);
        let current = dist(&[("low", 0.1), ("medium", 0.1), ("high", 0.8)]);
        let expected = 0.1 * (0.1f64 / 0.3).ln() + 0.1 * (0.1f64 / 0.5).ln() + 0.8 * 4f64.ln();
        let kl = kl_divergence(&current, &baseline, 1e-8);
        assert!((kl - expected).abs() < 1e-6);
        assert!(kl > 0.3);
    }

    #[test]
    fn test_unseen_category_stays_finite() {
        let baseline = dist(&[("low", 0.5), ("high", 0.5)]);
        let current = dist(&[("low", 0.5), ("extreme", 0.5)]);
        let kl = kl_divergence(&current, &baseline, 1e-8);
        assert!(kl.is_finite());
        assert!(kl > 1.0);
    }

    #[test]
    fn test_from_labels_sums_to_one() {
        let d = Distribution::from_labels(["a", "b", "b", "c"]);
        assert!((d.total() - 1.0).abs() < 1e-12);
        assert_eq!(d.get("b"), 0.5);
        assert_eq!(d.get("missing"), 0.0);
    }

    #[test]
    fn test_numeric_summary() {
        let s = NumericSummary::from_values(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(s.count, 5);
        assert_eq!(s.mean, 3.0);
        assert_eq!(s.p50, 3.0);
        // Sample std of 1..5 is sqrt(2.5)
        assert!((s.std - 2.5f64.sqrt()).abs() < 1e-12);
        assert!(s.z_score(10.0) > 4.0);
        assert!(NumericSummary::from_values(&[]).is_none());
    }

    #[test]
    fn test_bands_label_values() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let bands = Bands::from_values(&values).unwrap();
        assert_eq!(bands.label(1.0), "q1");
        assert_eq!(bands.label(60.0), "q3");
        assert_eq!(bands.label(1000.0), "q5");
    }
}
