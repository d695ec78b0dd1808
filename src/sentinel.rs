//! Process-wide wiring: stores, detector, follow-up pipeline, and the
//! background tasks that drive them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::baseline::BaselineStore;
use crate::config::SentinelConfig;
use crate::detect::engine::DriftDetector;
use crate::detect::incident::{Incident, IncidentFilter, IncidentStatus, IncidentStore};
use crate::detect::Severity;
use crate::diagnosis::{Diagnoser, DiagnosticAgent, HttpAgent, LoggingRemediator, Remediator};
use crate::error::{Result, SentinelError};
use crate::ingest::DecisionStore;
use crate::resolution::{ResolutionOutcome, Resolver};
use crate::scheduler::{self, MonitorRegistry};
use crate::storage::{self, Pool};
use crate::workflow::{Dispatcher, NotificationPayload, Priority, WorkflowStore, WorkflowTrigger};

/// Everything the API, CLI, and background tasks share.
pub struct Sentinel {
    config: SentinelConfig,
    pool: Pool,
    decisions: DecisionStore,
    baselines: BaselineStore,
    incidents: IncidentStore,
    registry: MonitorRegistry,
    detector: DriftDetector,
    pipeline: Pipeline,
    refresh_schedule: ::cron::Schedule,
    events: Mutex<Option<mpsc::UnboundedReceiver<Incident>>>,
}

/// Diagnose-then-resolve follow-up for newly opened incidents.
#[derive(Clone)]
struct Pipeline {
    incidents: IncidentStore,
    diagnoser: Diagnoser,
    resolver: Resolver,
    dispatcher: Dispatcher,
    tracker: TaskTracker,
    cancel: CancellationToken,
    verification_grace: Duration,
    /// Incident ids with a follow-up task running.
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Sentinel {
    /// Open the configured database and wire every component.
    pub fn open(config: SentinelConfig) -> anyhow::Result<Self> {
        let pool = storage::open_pool(&config.storage.db_path)
            .with_context(|| format!("opening {}", config.storage.db_path.display()))?;
        Ok(Self::with_pool(config, pool)?)
    }

    pub fn with_pool(config: SentinelConfig, pool: Pool) -> Result<Self> {
        config.validate()?;
        let refresh_schedule = scheduler::cron::parse(&config.baseline.refresh_cron)?;

        let decisions = DecisionStore::new(pool.clone());
        let baselines = BaselineStore::new(pool.clone(), config.baseline.clone());
        let incidents = IncidentStore::new(pool.clone());
        let workflows = WorkflowStore::new(pool.clone());
        let registry = MonitorRegistry::load(pool.clone(), &config.monitor.algorithms)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let detector = DriftDetector::new(
            decisions.clone(),
            baselines.clone(),
            incidents.clone(),
            registry.clone(),
            config.detection.clone(),
        )
        .with_events(tx);

        let dispatcher = Dispatcher::from_config(workflows, &config.notify)?;
        let mut diagnoser = Diagnoser::new(
            decisions.clone(),
            baselines.clone(),
            config.diagnosis.clone(),
            config.detection.clone(),
            config.baseline.window_days,
        );
        let remediator: Arc<dyn Remediator> = match HttpAgent::from_config(&config.agent)? {
            Some(agent) => {
                let agent = Arc::new(agent);
                diagnoser = diagnoser.with_agent(agent.clone(), &config.agent);
                info!("diagnostic agent configured");
                agent
            }
            None => Arc::new(LoggingRemediator),
        };
        let resolver = Resolver::new(
            incidents.clone(),
            detector.clone(),
            dispatcher.clone(),
            remediator,
            config.policy.clone(),
        );

        let pipeline = Pipeline {
            incidents: incidents.clone(),
            diagnoser,
            resolver,
            dispatcher,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            verification_grace: Duration::from_secs(config.policy.verification_grace_secs),
            in_flight: Arc::default(),
        };

        Ok(Self {
            config,
            pool,
            decisions,
            baselines,
            incidents,
            registry,
            detector,
            pipeline,
            refresh_schedule,
            events: Mutex::new(Some(rx)),
        })
    }

    /// Replace the diagnostic agent.
    pub fn with_agent(mut self, agent: Arc<dyn DiagnosticAgent>) -> Self {
        self.pipeline.diagnoser = self.pipeline.diagnoser.clone().with_agent(agent, &self.config.agent);
        self
    }

    /// Replace the remediation executor.
    pub fn with_remediator(mut self, remediator: Arc<dyn Remediator>) -> Self {
        self.pipeline.resolver = Resolver::new(
            self.incidents.clone(),
            self.detector.clone(),
            self.pipeline.dispatcher.clone(),
            remediator,
            self.config.policy.clone(),
        );
        self
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn decisions(&self) -> &DecisionStore {
        &self.decisions
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn incidents(&self) -> &IncidentStore {
        &self.incidents
    }

    pub fn workflows(&self) -> &WorkflowStore {
        self.pipeline.dispatcher.store()
    }

    pub fn registry(&self) -> &MonitorRegistry {
        &self.registry
    }

    pub fn detector(&self) -> &DriftDetector {
        &self.detector
    }

    pub fn diagnoser(&self) -> &Diagnoser {
        &self.pipeline.diagnoser
    }

    pub fn resolver(&self) -> &Resolver {
        &self.pipeline.resolver
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.pipeline.dispatcher
    }

    /// Spawn the scanner, the baseline refresh, and the incident follow-up consumer.
    ///
    /// Incidents a previous run or another process left undiagnosed are
    /// re-queued for follow-up; those left in `auto_fixing` get their
    /// verification rescheduled.
    pub fn start(&self) -> Result<()> {
        let Some(mut events) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(SentinelError::Config("sentinel already started".into()));
        };

        let cancel = self.pipeline.cancel.clone();
        let tracker = &self.pipeline.tracker;

        tracker.spawn(scheduler::run_scan_loop(
            self.detector.clone(),
            self.registry.clone(),
            self.decisions.clone(),
            self.config.monitor.clone(),
            cancel.clone(),
        ));
        tracker.spawn(scheduler::run_baseline_refresh_loop(
            self.baselines.clone(),
            self.registry.clone(),
            self.refresh_schedule.clone(),
            cancel.clone(),
        ));

        let pipeline = self.pipeline.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = pipeline.cancel.cancelled() => break,
                    next = events.recv() => match next {
                        Some(incident) => pipeline.spawn_follow_up(incident),
                        None => break,
                    },
                }
            }
            info!("incident follow-up consumer stopped");
        });

        for status in [IncidentStatus::Detected, IncidentStatus::Investigating] {
            let page = self.incidents.list(&IncidentFilter {
                status: Some(status),
                limit: i64::MAX as usize,
                ..Default::default()
            })?;
            for incident in page.incidents.into_iter().filter(Incident::needs_follow_up) {
                info!(incident_id = %incident.id, %status, "resuming incident follow-up");
                self.pipeline.spawn_follow_up(incident);
            }
        }

        let pending = self.incidents.list(&IncidentFilter {
            status: Some(IncidentStatus::AutoFixing),
            limit: i64::MAX as usize,
            ..Default::default()
        })?;
        for incident in pending.incidents {
            info!(incident_id = %incident.id, "resuming pending fix verification");
            self.pipeline.schedule_verification(incident.id);
        }

        info!(
            monitored = self.registry.list().len(),
            interval_secs = self.config.detection.check_interval_secs,
            "sentinel started"
        );
        Ok(())
    }

    /// Stop background work and wait up to `wait` for in-flight tasks.
    pub async fn shutdown(&self, wait: Duration) {
        info!("sentinel shutting down");
        self.pipeline.cancel.cancel();
        self.pipeline.tracker.close();
        if tokio::time::timeout(wait, self.pipeline.tracker.wait()).await.is_err() {
            warn!(
                pending = self.pipeline.tracker.len(),
                "shutdown timed out with tasks still running"
            );
        }
    }

    /// Run the follow-up pipeline for one incident inline.
    pub async fn follow_up(&self, incident: Incident) -> Result<ResolutionOutcome> {
        self.pipeline.handle(incident).await
    }
}

impl Pipeline {
    /// Run the follow-up in the background, at most once at a time per incident.
    ///
    /// A failed follow-up leaves the incident undiagnosed, so the next scan
    /// that finds it active queues it again.
    fn spawn_follow_up(&self, incident: Incident) {
        let id = incident.id.clone();
        if !self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone())
        {
            debug!(incident_id = %id, "follow-up already running");
            return;
        }

        let this = self.clone();
        self.tracker.spawn(async move {
            match this.handle_if_pending(&id).await {
                Ok(Some(outcome)) => info!(incident_id = %id, ?outcome, "incident follow-up complete"),
                Ok(None) => debug!(incident_id = %id, "incident no longer needs follow-up"),
                Err(e) if e.is_transient() => {
                    warn!(incident_id = %id, error = %e, "incident follow-up failed, retrying next scan")
                }
                Err(e) => error!(incident_id = %id, error = %e, "incident follow-up failed"),
            }
            this.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        });
    }

    /// Re-read the incident and follow it up unless another run got there first.
    async fn handle_if_pending(&self, id: &str) -> Result<Option<ResolutionOutcome>> {
        let incidents = self.incidents.clone();
        let key = id.to_string();
        let current = tokio::task::spawn_blocking(move || incidents.get(&key)).await??;
        if !current.needs_follow_up() {
            return Ok(None);
        }
        self.handle(current).await.map(Some)
    }

    async fn handle(&self, incident: Incident) -> Result<ResolutionOutcome> {
        // A retried follow-up already announced the incident.
        let workflow_id = match &incident.workflow_id {
            Some(existing) => existing.clone(),
            None => {
                let priority = if incident.severity == Severity::Critical {
                    Priority::High
                } else {
                    Priority::Normal
                };
                self.dispatcher
                    .dispatch(NotificationPayload::for_incident(WorkflowTrigger::DriftIncident, priority, &incident))
                    .await?
                    .id
            }
        };

        let incidents = self.incidents.clone();
        let id = incident.id.clone();
        let incident = tokio::task::spawn_blocking(move || -> Result<Incident> {
            incidents.record_workflow(&id, &workflow_id)?;
            match incidents.get(&id)? {
                i if i.status == IncidentStatus::Detected => {
                    incidents.transition(&id, IncidentStatus::Investigating, None)
                }
                i => Ok(i),
            }
        })
        .await??;

        let diagnosis = self.diagnoser.diagnose(&incident).await?;
        info!(
            incident_id = %incident.id,
            root_cause = %diagnosis.root_cause,
            confidence = diagnosis.confidence,
            source = ?diagnosis.source,
            "incident diagnosed"
        );

        let incidents = self.incidents.clone();
        let id = incident.id.clone();
        let stored = diagnosis.clone();
        let incident = tokio::task::spawn_blocking(move || -> Result<Incident> {
            incidents.record_diagnosis(&id, &stored)?;
            incidents.get(&id)
        })
        .await??;

        let outcome = self.resolver.resolve(&incident, &diagnosis).await?;
        if matches!(outcome, ResolutionOutcome::AutoFixing { .. }) {
            self.schedule_verification(incident.id.clone());
        }
        Ok(outcome)
    }

    /// Verify an applied fix after the grace period, off the detection path.
    fn schedule_verification(&self, incident_id: String) {
        let resolver = self.resolver.clone();
        let cancel = self.cancel.clone();
        let grace = self.verification_grace;
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(%incident_id, "shutdown before fix verification, will resume on restart");
                }
                _ = tokio::time::sleep(grace) => match resolver.verify(&incident_id).await {
                    Ok(outcome) => info!(%incident_id, ?outcome, "fix verification complete"),
                    Err(e) => error!(%incident_id, error = %e, "fix verification failed to run"),
                },
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::CheckOrigin;
    use crate::ingest::DecisionInput;
    use crate::storage::test_pool;
    use chrono::{Duration as ChronoDuration, Utc};

    fn seed(sentinel: &Sentinel, mix: &[(&str, usize)], age: ChronoDuration) {
        let ts = (Utc::now() - age).to_rfc3339();
        let batch = mix
            .iter()
            .flat_map(|(c, n)| std::iter::repeat(*c).take(*n))
            .map(|c| DecisionInput {
                algorithm: Some("pricing".into()),
                category: Some(c.into()),
                timestamp: Some(ts.clone()),
                ..Default::default()
            })
            .collect();
        sentinel.decisions().ingest_bulk(batch).unwrap();
    }

    #[tokio::test]
    async fn test_follow_up_diagnoses_and_records_workflow() {
        let (_dir, pool) = test_pool();
        let mut config = SentinelConfig::default();
        config.monitor.algorithms = vec!["pricing".into()];
        let sentinel = Sentinel::with_pool(config, pool).unwrap();

        seed(&sentinel, &[("low", 30), ("medium", 50), ("high", 20)], ChronoDuration::days(2));
        sentinel.baselines().recompute("pricing").unwrap();
        seed(&sentinel, &[("high", 60)], ChronoDuration::minutes(3));

        let check = sentinel
            .detector()
            .check_algorithm("pricing", CheckOrigin::OnDemand)
            .await
            .unwrap();
        let incident = check.incident.unwrap();

        let outcome = sentinel.follow_up(incident.clone()).await.unwrap();
        let stored = sentinel.incidents().get(&incident.id).unwrap();
        assert!(stored.diagnosis.is_some());
        assert!(stored.workflow_id.as_deref().unwrap().starts_with("wf-drift-"));
        match outcome {
            ResolutionOutcome::AutoFixing { .. } => assert_eq!(stored.status, IncidentStatus::AutoFixing),
            ResolutionOutcome::Proposed { .. } => assert_eq!(stored.status, IncidentStatus::Investigating),
            ResolutionOutcome::Escalated { .. } => assert_eq!(stored.status, IncidentStatus::Escalated),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_follows_up_incidents_opened_elsewhere() {
        let (_dir, pool) = test_pool();
        let mut config = SentinelConfig::default();
        config.monitor.algorithms = vec!["pricing".into()];
        config.policy.verification_grace_secs = 3600;

        // An offline check opens the incident; nothing consumes its event.
        let offline = Sentinel::with_pool(config.clone(), pool.clone()).unwrap();
        seed(&offline, &[("low", 30), ("medium", 50), ("high", 20)], ChronoDuration::days(2));
        offline.baselines().recompute("pricing").unwrap();
        seed(&offline, &[("high", 60)], ChronoDuration::minutes(3));
        let opened = offline
            .detector()
            .check_algorithm("pricing", CheckOrigin::OnDemand)
            .await
            .unwrap()
            .incident
            .unwrap();

        let daemon = Sentinel::with_pool(config, pool).unwrap();
        daemon.start().unwrap();

        let mut stored = daemon.incidents().get(&opened.id).unwrap();
        for _ in 0..100 {
            if stored.diagnosis.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            stored = daemon.incidents().get(&opened.id).unwrap();
        }
        daemon.shutdown(Duration::from_secs(5)).await;

        assert!(stored.diagnosis.is_some(), "incident never diagnosed");
        assert_ne!(stored.status, IncidentStatus::Detected);
        // Scanner and startup both found it; it was announced once.
        let announced = daemon
            .workflows()
            .for_entity(&opened.id)
            .unwrap()
            .into_iter()
            .filter(|w| w.trigger == WorkflowTrigger::DriftIncident)
            .count();
        assert_eq!(announced, 1);
    }

    #[tokio::test]
    async fn test_failed_follow_up_is_retried_without_reannouncing() {
        let (_dir, pool) = test_pool();
        let mut config = SentinelConfig::default();
        config.monitor.algorithms = vec!["pricing".into()];
        let sentinel = Sentinel::with_pool(config, pool).unwrap();
        seed(&sentinel, &[("low", 30), ("medium", 50), ("high", 20)], ChronoDuration::days(2));
        sentinel.baselines().recompute("pricing").unwrap();
        seed(&sentinel, &[("high", 60)], ChronoDuration::minutes(3));
        let incident = sentinel
            .detector()
            .check_algorithm("pricing", CheckOrigin::OnDemand)
            .await
            .unwrap()
            .incident
            .unwrap();

        // A previous attempt announced it and moved it on, then died.
        sentinel.incidents().record_workflow(&incident.id, "wf-drift-0000abcd").unwrap();
        let stalled = sentinel
            .incidents()
            .transition(&incident.id, IncidentStatus::Investigating, None)
            .unwrap();
        assert!(stalled.needs_follow_up());

        sentinel.follow_up(stalled).await.unwrap();
        let stored = sentinel.incidents().get(&incident.id).unwrap();
        assert!(stored.diagnosis.is_some());
        assert_eq!(stored.workflow_id.as_deref(), Some("wf-drift-0000abcd"));
        let announced = sentinel
            .workflows()
            .for_entity(&incident.id)
            .unwrap()
            .into_iter()
            .filter(|w| w.trigger == WorkflowTrigger::DriftIncident)
            .count();
        assert_eq!(announced, 0);
    }

    struct BrokenRemediator;

    #[async_trait::async_trait]
    impl Remediator for BrokenRemediator {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn apply(&self, _request: &crate::diagnosis::RemediationRequest) -> Result<()> {
            Err(SentinelError::AgentUnavailable("executor offline".into()))
        }
    }

    #[tokio::test]
    async fn test_custom_remediator_failure_escalates() {
        use crate::diagnosis::{Diagnosis, DiagnosisSource, FixAction, RootCause};

        let (_dir, pool) = test_pool();
        let mut config = SentinelConfig::default();
        config.monitor.algorithms = vec!["pricing".into()];
        let sentinel = Sentinel::with_pool(config, pool)
            .unwrap()
            .with_remediator(Arc::new(BrokenRemediator));
        seed(&sentinel, &[("low", 30), ("medium", 50), ("high", 20)], ChronoDuration::days(2));
        sentinel.baselines().recompute("pricing").unwrap();
        seed(&sentinel, &[("high", 60)], ChronoDuration::minutes(3));
        let incident = sentinel
            .detector()
            .check_algorithm("pricing", CheckOrigin::OnDemand)
            .await
            .unwrap()
            .incident
            .unwrap();

        let diagnosis = Diagnosis {
            root_cause: RootCause::Global,
            confidence: 0.95,
            recommended_action: FixAction::Rollback,
            drift_start: None,
            affected_zones: vec![],
            zone_divergences: vec![],
            scheduled_job: None,
            suspect_feature: None,
            source: DiagnosisSource::Heuristic,
            agent_analysis: None,
            diagnosed_at: chrono::Utc::now(),
        };
        let outcome = sentinel.resolver().resolve(&incident, &diagnosis).await.unwrap();
        assert!(matches!(outcome, ResolutionOutcome::Escalated { .. }), "got {outcome:?}");
        assert_eq!(
            sentinel.incidents().get(&incident.id).unwrap().status,
            IncidentStatus::Escalated
        );
        assert!(sentinel
            .resolver()
            .resolve_manual(&incident.id, FixAction::Pause, 1.0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected_and_shutdown_completes() {
        let (_dir, pool) = test_pool();
        let sentinel = Sentinel::with_pool(SentinelConfig::default(), pool).unwrap();
        sentinel.start().unwrap();
        assert!(matches!(sentinel.start(), Err(SentinelError::Config(_))));
        sentinel.shutdown(Duration::from_secs(5)).await;
        assert!(sentinel.pipeline.tracker.is_empty());
    }

    #[test]
    fn test_invalid_refresh_cron_is_rejected() {
        let (_dir, pool) = test_pool();
        let mut config = SentinelConfig::default();
        config.baseline.refresh_cron = "daily".into();
        assert!(matches!(
            Sentinel::with_pool(config, pool),
            Err(SentinelError::Config(_))
        ));
    }
}
