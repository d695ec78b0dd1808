use std::time::Duration;

use chrono::Utc;
use cron::Schedule as CronSchedule;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::baseline::BaselineStore;
use crate::config::MonitorConfig;
use crate::detect::engine::DriftDetector;
use crate::detect::{CheckOrigin, CheckOutcome};
use crate::ingest::DecisionStore;
use crate::scheduler::cron::next_fire;
use crate::scheduler::MonitorRegistry;

/// Tally of one scan cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    pub checked: usize,
    pub incidents_created: Vec<String>,
    pub active_existing: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Check every monitored algorithm once, at most `max_parallel_checks` at a time.
///
/// A failing algorithm is logged and counted; the others still run.
pub async fn run_scan_once(
    detector: &DriftDetector,
    registry: &MonitorRegistry,
    decisions: &DecisionStore,
    monitor: &MonitorConfig,
) -> ScanReport {
    if monitor.auto_discover {
        let registry = registry.clone();
        let decisions = decisions.clone();
        let window = monitor.discover_window_minutes;
        match tokio::task::spawn_blocking(move || registry.discover(&decisions, window)).await {
            Ok(Ok(added)) if !added.is_empty() => info!(?added, "discovered new algorithms"),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "algorithm discovery failed, scanning known set"),
            Err(e) => warn!(error = %e, "algorithm discovery aborted, scanning known set"),
        }
    }

    let algorithms = registry.list();
    let parallel = detector.config().max_parallel_checks.max(1);
    let results: Vec<_> = stream::iter(algorithms)
        .map(|algorithm| async move {
            let result = detector.check_algorithm(&algorithm, CheckOrigin::Scan).await;
            (algorithm, result)
        })
        .buffer_unordered(parallel)
        .collect()
        .await;

    let mut report = ScanReport::default();
    for (algorithm, result) in results {
        report.checked += 1;
        match result {
            Ok(check) => match check.outcome {
                CheckOutcome::IncidentCreated { incident_id } => {
                    info!(
                        %algorithm,
                        %incident_id,
                        divergence = ?check.divergence,
                        severity = ?check.severity,
                        "drift incident opened"
                    );
                    report.incidents_created.push(incident_id);
                }
                CheckOutcome::ActiveIncidentExists { .. } => report.active_existing += 1,
                CheckOutcome::Skipped { .. } | CheckOutcome::Unmonitored => report.skipped += 1,
                CheckOutcome::Clean => {}
            },
            Err(e) if e.is_transient() => {
                warn!(%algorithm, error = %e, "check skipped, retrying next cycle");
                report.failed += 1;
            }
            Err(e) => {
                error!(%algorithm, error = %e, "drift check failed");
                report.failed += 1;
            }
        }
    }
    report
}

/// Periodic drift scanner. Returns when `cancel` fires; an in-flight cycle
/// finishes first.
pub async fn run_scan_loop(
    detector: DriftDetector,
    registry: MonitorRegistry,
    decisions: DecisionStore,
    monitor: MonitorConfig,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs(detector.config().check_interval_secs.max(1));
    info!(interval_secs = period.as_secs(), "drift scanner started");

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let report = run_scan_once(&detector, &registry, &decisions, &monitor).await;
        info!(
            checked = report.checked,
            created = report.incidents_created.len(),
            active = report.active_existing,
            skipped = report.skipped,
            failed = report.failed,
            "scan cycle complete"
        );
    }
    info!("drift scanner stopped");
}

/// Recompute the baseline of every monitored algorithm.
///
/// Returns `(refreshed, failed)`.
pub async fn refresh_baselines(baselines: &BaselineStore, registry: &MonitorRegistry) -> (usize, usize) {
    let mut refreshed = 0;
    let mut failed = 0;
    for algorithm in registry.list() {
        let store = baselines.clone();
        let name = algorithm.clone();
        match tokio::task::spawn_blocking(move || store.recompute(&name)).await {
            Ok(Ok(_)) => refreshed += 1,
            Ok(Err(e)) => {
                error!(%algorithm, error = %e, "baseline refresh failed");
                failed += 1;
            }
            Err(e) => {
                error!(%algorithm, error = %e, "baseline refresh aborted");
                failed += 1;
            }
        }
    }
    (refreshed, failed)
}

/// Recompute baselines whenever `schedule` fires.
pub async fn run_baseline_refresh_loop(
    baselines: BaselineStore,
    registry: MonitorRegistry,
    schedule: CronSchedule,
    cancel: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let Some(next) = next_fire(&schedule, now) else {
            warn!("baseline refresh schedule has no future firings");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!(next = %next, "next baseline refresh scheduled");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let (refreshed, failed) = refresh_baselines(&baselines, &registry).await;
        info!(refreshed, failed, "baseline refresh complete");
    }
    info!("baseline refresh stopped");
}
