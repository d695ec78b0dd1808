//! End-to-end scenarios over the library API: detection, the confidence
//! gate, verification, and bulk ingest, each against a scratch database.

use chrono::{Duration, Utc};

use driftsentinel::config::SentinelConfig;
use driftsentinel::detect::incident::IncidentStatus;
use driftsentinel::detect::{CheckOrigin, CheckOutcome, Severity};
use driftsentinel::diagnosis::{Diagnosis, DiagnosisSource, FixAction, RootCause};
use driftsentinel::ingest::DecisionInput;
use driftsentinel::resolution::ResolutionOutcome;
use driftsentinel::sentinel::Sentinel;
use driftsentinel::storage;
use driftsentinel::workflow::{Priority, WorkflowQuery, WorkflowTrigger};

struct Harness {
    _dir: tempfile::TempDir,
    sentinel: Sentinel,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = storage::open_pool(dir.path().join("sentinel.db")).unwrap();
    let mut config = SentinelConfig::default();
    config.monitor.algorithms = vec!["pricing".into()];
    config.policy.verification_grace_secs = 0;
    let sentinel = Sentinel::with_pool(config, pool).unwrap();
    Harness { _dir: dir, sentinel }
}

fn batch(mix: &[(&str, usize)], age: Duration) -> Vec<DecisionInput> {
    let ts = (Utc::now() - age).to_rfc3339();
    mix.iter()
        .flat_map(|(c, n)| std::iter::repeat(*c).take(*n))
        .map(|c| DecisionInput {
            algorithm: Some("pricing".into()),
            category: Some(c.into()),
            zone: Some("north".into()),
            timestamp: Some(ts.clone()),
            ..Default::default()
        })
        .collect()
}

const STABLE: [(&str, usize); 3] = [("low", 30), ("medium", 50), ("high", 20)];

fn with_baseline() -> Harness {
    let h = harness();
    h.sentinel
        .decisions()
        .ingest_bulk(batch(&STABLE, Duration::days(2)))
        .unwrap();
    h.sentinel.baselines().recompute("pricing").unwrap();
    h
}

fn diagnosis(confidence: f64) -> Diagnosis {
    Diagnosis {
        root_cause: RootCause::Global,
        confidence,
        recommended_action: FixAction::Rollback,
        drift_start: None,
        affected_zones: vec![],
        zone_divergences: vec![],
        scheduled_job: None,
        suspect_feature: None,
        source: DiagnosisSource::Heuristic,
        agent_analysis: None,
        diagnosed_at: Utc::now(),
    }
}

async fn drifted_incident(h: &Harness) -> driftsentinel::detect::incident::Incident {
    h.sentinel
        .decisions()
        .ingest_bulk(batch(&[("high", 50), ("low", 5), ("medium", 5)], Duration::minutes(5)))
        .unwrap();
    let check = h
        .sentinel
        .detector()
        .check_algorithm("pricing", CheckOrigin::Scan)
        .await
        .unwrap();
    check.incident.expect("drift should open an incident")
}

#[tokio::test]
async fn scenario_shifted_mix_opens_high_severity_incident() {
    let h = with_baseline();
    let incident = drifted_incident(&h).await;

    assert!(incident.severity >= Severity::High, "got {:?}", incident.severity);
    assert_eq!(incident.status, IncidentStatus::Detected);
    assert!(incident.divergence >= 0.6);
    assert!(incident.estimated_impact > 0.0);
    assert!(incident.id.starts_with("drift-pricing-"));
    assert_eq!(
        h.sentinel.incidents().active_for("pricing").unwrap().map(|i| i.id),
        Some(incident.id)
    );
}

#[tokio::test]
async fn scenario_identical_mix_opens_nothing() {
    let h = with_baseline();
    h.sentinel
        .decisions()
        .ingest_bulk(batch(&STABLE, Duration::minutes(5)))
        .unwrap();

    let check = h
        .sentinel
        .detector()
        .check_algorithm("pricing", CheckOrigin::Scan)
        .await
        .unwrap();

    assert_eq!(check.outcome, CheckOutcome::Clean);
    assert!(check.divergence.unwrap() < 1e-6);
    assert!(check.incident.is_none());
    assert!(h.sentinel.incidents().active_for("pricing").unwrap().is_none());
}

#[tokio::test]
async fn scenario_confident_fix_is_applied_and_verified() {
    let h = with_baseline();
    let incident = drifted_incident(&h).await;
    let resolver = h.sentinel.resolver();

    let outcome = resolver.resolve(&incident, &diagnosis(0.9)).await.unwrap();
    assert!(matches!(outcome, ResolutionOutcome::AutoFixing { .. }));
    assert_eq!(
        h.sentinel.incidents().get(&incident.id).unwrap().status,
        IncidentStatus::AutoFixing
    );

    // Post-fix traffic matches the baseline again.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    h.sentinel
        .decisions()
        .ingest_bulk(batch(&STABLE, Duration::zero()))
        .unwrap();

    let outcome = resolver.verify(&incident.id).await.unwrap();
    assert!(matches!(outcome, ResolutionOutcome::Resolved { .. }), "got {outcome:?}");

    let resolved = h.sentinel.incidents().get(&incident.id).unwrap();
    assert_eq!(resolved.status, IncidentStatus::Resolved);
    assert!(resolved.resolved_at.is_some());
    let resolution = resolved.resolution.unwrap();
    assert!(resolution.auto_executed);
    assert_eq!(resolution.verified, Some(true));
    assert_eq!(resolution.action, FixAction::Rollback);
}

#[tokio::test]
async fn scenario_middle_confidence_proposes_fix() {
    let h = with_baseline();
    let incident = drifted_incident(&h).await;

    let outcome = h.sentinel.resolver().resolve(&incident, &diagnosis(0.7)).await.unwrap();
    let ResolutionOutcome::Proposed { workflow_id } = outcome else {
        panic!("expected a proposal, got {outcome:?}");
    };

    let current = h.sentinel.incidents().get(&incident.id).unwrap();
    assert_eq!(current.status, IncidentStatus::Investigating);
    assert!(current.resolution.is_none());

    let proposals = h
        .sentinel
        .workflows()
        .history(&WorkflowQuery {
            trigger: Some(WorkflowTrigger::FixProposal),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].id, workflow_id);
    assert_eq!(proposals[0].entity_id, incident.id);
}

#[tokio::test]
async fn scenario_low_confidence_escalates() {
    let h = with_baseline();
    let incident = drifted_incident(&h).await;

    let outcome = h.sentinel.resolver().resolve(&incident, &diagnosis(0.4)).await.unwrap();
    assert!(matches!(outcome, ResolutionOutcome::Escalated { .. }));
    assert_eq!(
        h.sentinel.incidents().get(&incident.id).unwrap().status,
        IncidentStatus::Escalated
    );

    let escalations = h
        .sentinel
        .workflows()
        .history(&WorkflowQuery {
            trigger: Some(WorkflowTrigger::Escalation),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].priority, Priority::High);
}

#[tokio::test]
async fn scenario_bulk_ingest_only_recent_window_counts() {
    let h = with_baseline();

    let mut inputs = batch(&[("high", 100), ("low", 50)], Duration::hours(3));
    inputs.extend(batch(&[("low", 15), ("medium", 25), ("high", 10)], Duration::minutes(10)));
    assert_eq!(inputs.len(), 200);

    let report = h.sentinel.decisions().ingest_bulk(inputs).unwrap();
    assert_eq!(report.indexed, 200);
    assert_eq!(report.failed, 0);

    let check = h
        .sentinel
        .detector()
        .check_algorithm("pricing", CheckOrigin::OnDemand)
        .await
        .unwrap();
    assert_eq!(check.current_samples, 50);
    assert_eq!(check.outcome, CheckOutcome::Clean);
}
