use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::baseline::{Baseline, BaselineStore};
use crate::config::DetectionConfig;
use crate::detect::distribution::kl_divergence;
use crate::detect::incident::{Incident, IncidentStore, NewIncident};
use crate::detect::{
    affected_zones, current_distribution, zone_divergences, CheckOrigin, CheckOutcome,
    DriftCheckResult, Severity, SkipReason,
};
use crate::error::{Result, SentinelError};
use crate::ingest::{Decision, DecisionStore};
use crate::scheduler::MonitorRegistry;

/// One async mutex per key, created on first use.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(key.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

/// Divergence of decisions since a point in time, used for post-fix checks.
#[derive(Debug, Clone)]
pub struct WindowMeasurement {
    pub divergence: Option<f64>,
    pub samples: usize,
}

/// Compares each algorithm's recent decisions against its baseline and opens
/// incidents when the divergence crosses the configured threshold.
///
/// Scanner checks and on-demand checks share the same per-algorithm lock, so
/// check-then-create is serialized per algorithm inside this process. The
/// store's partial unique index covers writers outside it.
#[derive(Clone)]
pub struct DriftDetector {
    decisions: DecisionStore,
    baselines: BaselineStore,
    incidents: IncidentStore,
    registry: MonitorRegistry,
    config: DetectionConfig,
    locks: KeyedLocks,
    events: Option<mpsc::UnboundedSender<Incident>>,
}

impl DriftDetector {
    pub fn new(
        decisions: DecisionStore,
        baselines: BaselineStore,
        incidents: IncidentStore,
        registry: MonitorRegistry,
        config: DetectionConfig,
    ) -> Self {
        Self {
            decisions,
            baselines,
            incidents,
            registry,
            config,
            locks: KeyedLocks::default(),
            events: None,
        }
    }

    /// Publish every newly opened incident on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<Incident>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Run one drift check for `algorithm`.
    pub async fn check_algorithm(&self, algorithm: &str, origin: CheckOrigin) -> Result<DriftCheckResult> {
        let _guard = self.locks.lock(algorithm).await;

        let this = self.clone();
        let name = algorithm.to_string();
        let result = tokio::task::spawn_blocking(move || this.check_blocking(&name, origin, Utc::now()))
            .await??;

        if let Some(tx) = &self.events {
            let pending = match (&result.outcome, &result.incident) {
                (CheckOutcome::IncidentCreated { .. }, Some(incident)) => Some(incident.clone()),
                (CheckOutcome::ActiveIncidentExists { incident_id }, _) => self.stalled(incident_id).await,
                _ => None,
            };
            if let Some(incident) = pending {
                if tx.send(incident).is_err() {
                    debug!(%algorithm, "no follow-up consumer for incident");
                }
            }
        }
        Ok(result)
    }

    /// The active incident, if its follow-up never got as far as a diagnosis.
    async fn stalled(&self, incident_id: &str) -> Option<Incident> {
        let incidents = self.incidents.clone();
        let id = incident_id.to_string();
        match tokio::task::spawn_blocking(move || incidents.get(&id)).await {
            Ok(Ok(incident)) if incident.needs_follow_up() => {
                info!(incident_id = %incident.id, status = %incident.status, "re-queueing undiagnosed incident");
                Some(incident)
            }
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!(%incident_id, error = %e, "could not load active incident");
                None
            }
            Err(e) => {
                warn!(%incident_id, error = %e, "active incident lookup aborted");
                None
            }
        }
    }

    fn check_blocking(&self, algorithm: &str, origin: CheckOrigin, now: DateTime<Utc>) -> Result<DriftCheckResult> {
        let baseline = self.baselines.get_or_compute(algorithm)?;
        let recent = self
            .decisions
            .window(algorithm, now - Duration::minutes(self.config.recent_window_minutes))?;
        let (current, samples) = current_distribution(&baseline, &recent);

        let mut result = DriftCheckResult {
            algorithm: algorithm.to_string(),
            divergence: None,
            threshold: self.config.kl_threshold,
            severity: None,
            current_samples: samples,
            baseline_samples: baseline.sample_count,
            baseline_low_confidence: baseline.low_confidence,
            current_distribution: current,
            baseline_distribution: baseline.distribution.clone(),
            zones: Vec::new(),
            outcome: CheckOutcome::Clean,
            incident: None,
            checked_at: now,
        };

        if baseline.is_empty() {
            result.outcome = CheckOutcome::Skipped {
                reason: SkipReason::NoBaseline,
            };
            return Ok(result);
        }
        if samples < self.config.min_current_samples.max(1) {
            debug!(%algorithm, samples, "not enough recent decisions to check");
            result.outcome = CheckOutcome::Skipped {
                reason: SkipReason::InsufficientSamples {
                    have: samples,
                    need: self.config.min_current_samples.max(1),
                },
            };
            return Ok(result);
        }

        let divergence = kl_divergence(
            &result.current_distribution,
            &baseline.distribution,
            self.config.epsilon,
        );
        result.divergence = Some(divergence);
        result.zones = zone_divergences(
            &baseline,
            &recent,
            self.config.min_zone_samples,
            self.config.epsilon,
        );

        let Some(mut severity) = Severity::classify(divergence, self.config.kl_threshold) else {
            debug!(%algorithm, divergence, "no drift");
            return Ok(result);
        };
        if baseline.low_confidence {
            severity = severity.softened();
        }
        result.severity = Some(severity);

        result.outcome = self.open_incident(&baseline, &result, severity, origin, now)?;
        if let CheckOutcome::IncidentCreated { incident_id } = &result.outcome {
            result.incident = Some(self.incidents.get(incident_id)?);
        }
        Ok(result)
    }

    fn open_incident(
        &self,
        baseline: &Baseline,
        result: &DriftCheckResult,
        severity: Severity,
        origin: CheckOrigin,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome> {
        let algorithm = result.algorithm.as_str();
        if let Some(active) = self.incidents.active_for(algorithm)? {
            warn!(%algorithm, incident_id = %active.id, "drift persists, incident already active");
            return Ok(CheckOutcome::ActiveIncidentExists {
                incident_id: active.id,
            });
        }
        if origin == CheckOrigin::Scan && !self.registry.contains(algorithm) {
            info!(%algorithm, "algorithm no longer monitored, not opening incident");
            return Ok(CheckOutcome::Unmonitored);
        }

        let new = NewIncident {
            algorithm: algorithm.to_string(),
            divergence: result.divergence.unwrap_or_default(),
            severity,
            affected_zones: affected_zones(&result.zones, self.config.zone_threshold),
            estimated_impact: severity.impact_weight() * self.config.impact_multiplier(algorithm),
            baseline_low_confidence: baseline.low_confidence,
            detected_at: now,
        };
        match self.incidents.create(new) {
            Ok(incident) => Ok(CheckOutcome::IncidentCreated {
                incident_id: incident.id,
            }),
            Err(SentinelError::DuplicateIncident { .. }) => {
                let active = self
                    .incidents
                    .active_for(algorithm)?
                    .ok_or_else(|| SentinelError::not_found("active incident", algorithm))?;
                warn!(%algorithm, incident_id = %active.id, "lost incident race, keeping existing");
                Ok(CheckOutcome::ActiveIncidentExists {
                    incident_id: active.id,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Divergence of decisions with `timestamp >= from` against the current baseline.
    pub fn measure_since(&self, algorithm: &str, from: DateTime<Utc>) -> Result<WindowMeasurement> {
        let baseline = self.baselines.get_or_compute(algorithm)?;
        let decisions: Vec<Decision> = self.decisions.window(algorithm, from)?;
        let (current, samples) = current_distribution(&baseline, &decisions);
        let divergence = (!baseline.is_empty() && samples > 0)
            .then(|| kl_divergence(&current, &baseline.distribution, self.config.epsilon));
        Ok(WindowMeasurement { divergence, samples })
    }
}
