//! Confidence-gated remediation.
//!
//! A diagnosis either gets its fix applied right away, is proposed to an
//! operator, or escalates the incident. Auto-applied fixes stay in
//! `auto_fixing` until [`Resolver::verify`] re-measures divergence on the
//! decisions made after the fix.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::PolicyConfig;
use crate::detect::engine::DriftDetector;
use crate::detect::incident::{Incident, IncidentStatus, IncidentStore, Resolution};
use crate::diagnosis::{Diagnosis, FixAction, RemediationRequest, Remediator};
use crate::error::{Result, SentinelError};
use crate::workflow::{Dispatcher, NotificationPayload, Priority, WorkflowTrigger};

/// Which branch of the policy a confidence value falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    AutoExecute,
    Propose,
    Escalate,
}

/// Pure policy decision. Non-finite confidence escalates.
pub fn gate(confidence: f64, policy: &PolicyConfig) -> Gate {
    if !confidence.is_finite() || confidence < policy.escalate_below_confidence {
        Gate::Escalate
    } else if confidence >= policy.auto_execute_confidence {
        Gate::AutoExecute
    } else {
        Gate::Propose
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// Fix applied; verification pending.
    AutoFixing { applied_at: DateTime<Utc> },
    /// Fix proposed for approval; incident stays `investigating`.
    Proposed { workflow_id: String },
    Escalated { workflow_id: String },
    Resolved { post_fix_divergence: Option<f64> },
    /// Post-fix divergence did not recover; incident escalated.
    VerificationFailed { reason: String, workflow_id: String },
}

#[derive(Clone)]
pub struct Resolver {
    incidents: IncidentStore,
    detector: DriftDetector,
    dispatcher: Dispatcher,
    remediator: Arc<dyn Remediator>,
    policy: PolicyConfig,
}

impl Resolver {
    pub fn new(
        incidents: IncidentStore,
        detector: DriftDetector,
        dispatcher: Dispatcher,
        remediator: Arc<dyn Remediator>,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            incidents,
            detector,
            dispatcher,
            remediator,
            policy,
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Act on a diagnosis according to its confidence.
    pub async fn resolve(&self, incident: &Incident, diagnosis: &Diagnosis) -> Result<ResolutionOutcome> {
        let incident = self.ensure_investigating(incident).await?;
        let branch = gate(diagnosis.confidence, &self.policy);
        info!(
            incident_id = %incident.id,
            algorithm = %incident.algorithm,
            confidence = diagnosis.confidence,
            action = %diagnosis.recommended_action,
            gate = ?branch,
            "resolution policy applied"
        );

        match branch {
            Gate::AutoExecute => self.auto_execute(incident, diagnosis).await,
            Gate::Propose => {
                let payload = NotificationPayload::for_incident(WorkflowTrigger::FixProposal, Priority::Normal, &incident)
                    .with_note(format!(
                        "Approve with POST /api/v1/incidents/{}/resolve {{\"action\": \"{}\", \"confidence\": {:.2}}}",
                        incident.id, diagnosis.recommended_action, diagnosis.confidence
                    ));
                let record = self.dispatcher.dispatch(payload).await?;
                Ok(ResolutionOutcome::Proposed { workflow_id: record.id })
            }
            Gate::Escalate => {
                let note = format!(
                    "Diagnosis confidence {:.2} is below {:.2}",
                    diagnosis.confidence, self.policy.escalate_below_confidence
                );
                self.escalate(&incident.id, note).await
            }
        }
    }

    async fn auto_execute(&self, incident: Incident, diagnosis: &Diagnosis) -> Result<ResolutionOutcome> {
        let request = RemediationRequest {
            incident_id: incident.id.clone(),
            algorithm: incident.algorithm.clone(),
            action: diagnosis.recommended_action,
            confidence: diagnosis.confidence,
            affected_zones: diagnosis.affected_zones.clone(),
        };
        if let Err(e) = self.remediator.apply(&request).await {
            warn!(
                incident_id = %incident.id,
                remediator = self.remediator.name(),
                error = %e,
                "remediation failed, escalating"
            );
            return self.escalate(&incident.id, format!("Automatic {} failed: {e}", request.action)).await;
        }

        let applied_at = Utc::now();
        let resolution = Resolution {
            action: diagnosis.recommended_action,
            confidence: diagnosis.confidence,
            auto_executed: true,
            applied_at,
            verified: None,
            post_fix_divergence: None,
            note: None,
        };
        self.transition(&incident.id, IncidentStatus::AutoFixing, Some(resolution))
            .await?;
        info!(
            incident_id = %incident.id,
            action = %diagnosis.recommended_action,
            remediator = self.remediator.name(),
            "fix applied automatically"
        );
        Ok(ResolutionOutcome::AutoFixing { applied_at })
    }

    /// Re-measure divergence on decisions made since the fix was applied.
    ///
    /// Too few post-fix decisions counts as a failure: the incident is never
    /// marked resolved without evidence.
    pub async fn verify(&self, incident_id: &str) -> Result<ResolutionOutcome> {
        let incident = self.get(incident_id).await?;
        let Some(mut resolution) = incident.resolution.clone() else {
            return Err(SentinelError::Validation(format!(
                "incident {incident_id} has no applied fix to verify"
            )));
        };
        if incident.status != IncidentStatus::AutoFixing {
            return Err(SentinelError::Validation(format!(
                "incident {incident_id} is {}, verification needs auto_fixing",
                incident.status
            )));
        }

        let detector = self.detector.clone();
        let algorithm = incident.algorithm.clone();
        let applied_at = resolution.applied_at;
        let measured =
            tokio::task::spawn_blocking(move || detector.measure_since(&algorithm, applied_at)).await??;

        let threshold = self.detector.config().kl_threshold;
        resolution.post_fix_divergence = measured.divergence;
        let failure = match measured.divergence {
            _ if measured.samples < self.policy.verification_min_samples => Some(format!(
                "only {} decisions since the fix, need {}",
                measured.samples, self.policy.verification_min_samples
            )),
            None => Some("no baseline to compare against".to_string()),
            Some(d) if d >= threshold => Some(format!("post-fix divergence {d:.4} still at or above {threshold}")),
            Some(_) => None,
        };

        match failure {
            None => {
                resolution.verified = Some(true);
                let resolved = self
                    .transition(incident_id, IncidentStatus::Resolved, Some(resolution))
                    .await?;
                info!(
                    incident_id,
                    algorithm = %resolved.algorithm,
                    divergence = ?measured.divergence,
                    "fix verified, incident resolved"
                );
                self.notify(WorkflowTrigger::IncidentResolved, Priority::Normal, &resolved, None)
                    .await;
                Ok(ResolutionOutcome::Resolved {
                    post_fix_divergence: measured.divergence,
                })
            }
            Some(reason) => {
                let err = SentinelError::VerificationFailed {
                    incident_id: incident_id.to_string(),
                    reason: reason.clone(),
                };
                warn!(error = %err, "reverting to investigation");
                resolution.verified = Some(false);
                resolution.note = Some(reason.clone());
                self.transition(incident_id, IncidentStatus::Investigating, Some(resolution))
                    .await?;
                match self.escalate(incident_id, format!("Verification failed: {reason}")).await? {
                    ResolutionOutcome::Escalated { workflow_id } => {
                        Ok(ResolutionOutcome::VerificationFailed { reason, workflow_id })
                    }
                    other => Ok(other),
                }
            }
        }
    }

    /// Operator-applied fix. Moves the incident straight to `resolved`.
    pub async fn resolve_manual(&self, incident_id: &str, action: FixAction, confidence: f64) -> Result<Incident> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(SentinelError::Validation(format!(
                "confidence must be within [0, 1], got {confidence}"
            )));
        }
        let incident = self.get(incident_id).await?;
        if !incident.status.can_transition_to(IncidentStatus::Resolved) {
            return Err(SentinelError::InvalidTransition {
                incident_id: incident_id.to_string(),
                from: incident.status,
                to: IncidentStatus::Resolved,
            });
        }

        self.remediator
            .apply(&RemediationRequest {
                incident_id: incident.id.clone(),
                algorithm: incident.algorithm.clone(),
                action,
                confidence,
                affected_zones: incident.affected_zones.clone(),
            })
            .await?;

        let resolution = Resolution {
            action,
            confidence,
            auto_executed: false,
            applied_at: Utc::now(),
            verified: None,
            post_fix_divergence: None,
            note: Some("manual resolution".to_string()),
        };
        let resolved = self
            .transition(incident_id, IncidentStatus::Resolved, Some(resolution))
            .await?;
        info!(incident_id, %action, confidence, "incident resolved manually");

        let note = format!("Operator applied {action} with confidence {confidence:.2}");
        self.notify(WorkflowTrigger::Manual, Priority::Normal, &resolved, Some(note))
            .await;
        Ok(resolved)
    }

    async fn ensure_investigating(&self, incident: &Incident) -> Result<Incident> {
        match incident.status {
            IncidentStatus::Investigating => Ok(incident.clone()),
            IncidentStatus::Detected => {
                self.transition(&incident.id, IncidentStatus::Investigating, None)
                    .await
            }
            other => Err(SentinelError::InvalidTransition {
                incident_id: incident.id.clone(),
                from: other,
                to: IncidentStatus::Investigating,
            }),
        }
    }

    async fn escalate(&self, incident_id: &str, note: String) -> Result<ResolutionOutcome> {
        let escalated = self
            .transition(incident_id, IncidentStatus::Escalated, None)
            .await?;
        warn!(incident_id, algorithm = %escalated.algorithm, %note, "incident escalated");
        let payload = NotificationPayload::for_incident(WorkflowTrigger::Escalation, Priority::High, &escalated)
            .with_note(note);
        let record = self.dispatcher.dispatch(payload).await?;
        Ok(ResolutionOutcome::Escalated { workflow_id: record.id })
    }

    /// Best-effort notification; the incident has already moved.
    async fn notify(&self, trigger: WorkflowTrigger, priority: Priority, incident: &Incident, note: Option<String>) {
        let mut payload = NotificationPayload::for_incident(trigger, priority, incident);
        payload.note = note;
        if let Err(e) = self.dispatcher.dispatch(payload).await {
            warn!(incident_id = %incident.id, %trigger, error = %e, "workflow dispatch failed");
        }
    }

    async fn get(&self, incident_id: &str) -> Result<Incident> {
        let incidents = self.incidents.clone();
        let id = incident_id.to_string();
        tokio::task::spawn_blocking(move || incidents.get(&id)).await?
    }

    async fn transition(
        &self,
        incident_id: &str,
        to: IncidentStatus,
        resolution: Option<Resolution>,
    ) -> Result<Incident> {
        let incidents = self.incidents.clone();
        let id = incident_id.to_string();
        tokio::task::spawn_blocking(move || incidents.transition(&id, to, resolution.as_ref())).await?
    }
}
