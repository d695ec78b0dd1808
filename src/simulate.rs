//! Synthetic decision streams for demos and load checks.
//!
//! `history` spreads a stable category mix over the baseline window;
//! `drift` produces a recent burst skewed towards `HIGH` plus a category the
//! baseline has never seen.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;

use crate::ingest::DecisionInput;

pub const ZONES: [&str; 4] = ["north", "south", "east", "west"];

const STABLE: [(&str, u32); 3] = [("LOW", 30), ("MEDIUM", 50), ("HIGH", 20)];
const DRIFTED: [(&str, u32); 4] = [("HIGH", 70), ("LOW", 10), ("MEDIUM", 10), ("EXTREME", 10)];

/// `count` decisions with the stable mix, spread over the `days` before `now`.
///
/// The most recent hour is left empty so the history never overlaps a
/// detector's recent window.
pub fn history(algorithm: &str, count: usize, days: i64, now: DateTime<Utc>, rng: &mut impl Rng) -> Vec<DecisionInput> {
    let span_minutes = (days * 24 * 60).max(61);
    (0..count)
        .map(|i| {
            let age = Duration::minutes(rng.gen_range(60..span_minutes));
            decision(algorithm, &STABLE, format!("SIM-{i:06}"), now - age, false, rng)
        })
        .collect()
}

/// `count` drifted decisions within the last `minutes` before `now`.
///
/// With `zone` set, the burst is confined to that zone.
pub fn drift(
    algorithm: &str,
    count: usize,
    minutes: i64,
    zone: Option<&str>,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> Vec<DecisionInput> {
    (0..count)
        .map(|i| {
            let age = Duration::seconds(rng.gen_range(0..(minutes.max(1) * 60)));
            let mut d = decision(algorithm, &DRIFTED, format!("DRIFT-{i:06}"), now - age, true, rng);
            if let Some(zone) = zone {
                d.zone = Some(zone.to_string());
            }
            d
        })
        .collect()
}

fn decision(
    algorithm: &str,
    mix: &[(&str, u32)],
    id: String,
    ts: DateTime<Utc>,
    surge: bool,
    rng: &mut impl Rng,
) -> DecisionInput {
    let weights = WeightedIndex::new(mix.iter().map(|(_, w)| *w)).ok();
    let category = weights.map_or("MEDIUM", |w| mix[w.sample(rng)].0);
    let (demand, supply) = if surge {
        (rng.gen_range(80..=100), rng.gen_range(5..=15))
    } else {
        (rng.gen_range(10..=100), rng.gen_range(5..=80))
    };
    let value = match category {
        "HIGH" | "EXTREME" => rng.gen_range(2.0..2.5),
        "MEDIUM" => rng.gen_range(1.4..2.0),
        _ => rng.gen_range(1.0..1.4),
    };

    DecisionInput {
        decision_id: Some(format!("{id}-{}", ts.timestamp_millis())),
        algorithm: Some(algorithm.to_string()),
        version: Some("1.0".to_string()),
        timestamp: Some(ts.to_rfc3339()),
        category: Some(category.to_string()),
        value: Some(value),
        zone: ZONES.choose(rng).map(|z| z.to_string()),
        features: Some(json!({ "demand": demand, "supply": supply })),
    }
}
