//! Notification and ticketing dispatch with an append-only audit trail.
//!
//! Every dispatch writes exactly one [`WorkflowRecord`], whatever happened on
//! the outbound channels. Channel failures are recorded per channel on that
//! record and never propagate to the incident pipeline.

pub mod jira;
pub mod slack;
pub mod store;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::NotifyConfig;
use crate::detect::incident::{Incident, IncidentStatus};
use crate::detect::Severity;
use crate::diagnosis::{FixAction, RootCause};
use crate::error::{Result, SentinelError};

pub use self::jira::JiraChannel;
pub use self::slack::SlackChannel;
pub use self::store::{WorkflowQuery, WorkflowStats, WorkflowStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowTrigger {
    DriftIncident,
    LowFindability,
    Manual,
    FixProposal,
    Escalation,
    IncidentResolved,
}

impl WorkflowTrigger {
    pub const ALL: [WorkflowTrigger; 6] = [
        Self::DriftIncident,
        Self::LowFindability,
        Self::Manual,
        Self::FixProposal,
        Self::Escalation,
        Self::IncidentResolved,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DriftIncident => "drift_incident",
            Self::LowFindability => "low_findability",
            Self::Manual => "manual",
            Self::FixProposal => "fix_proposal",
            Self::Escalation => "escalation",
            Self::IncidentResolved => "incident_resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for WorkflowTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    /// Every attempted channel failed.
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Result of one channel within a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub channel: String,
    pub ok: bool,
    /// Ticket key on success, failure reason otherwise.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub trigger: WorkflowTrigger,
    pub entity_id: String,
    pub priority: Priority,
    /// Actions that succeeded, e.g. `slack_alert`, `jira_ticket`.
    pub actions: Vec<String>,
    pub channels: Vec<ChannelOutcome>,
    pub status: WorkflowStatus,
    pub ticket_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn partial_failure(&self) -> bool {
        self.channels.iter().any(|c| !c.ok)
    }
}

/// What outbound channels are told about an incident.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub trigger: WorkflowTrigger,
    pub priority: Priority,
    pub incident_id: String,
    pub algorithm: String,
    pub divergence: f64,
    pub severity: Severity,
    pub affected_zones: Vec<String>,
    pub estimated_impact: f64,
    pub status: IncidentStatus,
    pub root_cause: Option<RootCause>,
    pub recommended_action: Option<FixAction>,
    pub confidence: Option<f64>,
    pub agent_analysis: Option<String>,
    pub note: Option<String>,
}

impl NotificationPayload {
    pub fn for_incident(trigger: WorkflowTrigger, priority: Priority, incident: &Incident) -> Self {
        let diagnosis = incident.diagnosis.as_ref();
        Self {
            trigger,
            priority,
            incident_id: incident.id.clone(),
            algorithm: incident.algorithm.clone(),
            divergence: incident.divergence,
            severity: incident.severity,
            affected_zones: incident.affected_zones.clone(),
            estimated_impact: incident.estimated_impact,
            status: incident.status,
            root_cause: incident.root_cause,
            recommended_action: diagnosis.map(|d| d.recommended_action),
            confidence: diagnosis.map(|d| d.confidence),
            agent_analysis: incident.agent_analysis.clone(),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn zones_label(&self) -> String {
        if self.affected_zones.is_empty() {
            "all zones".to_string()
        } else {
            self.affected_zones.join(", ")
        }
    }

    pub fn headline(&self) -> String {
        match self.trigger {
            WorkflowTrigger::DriftIncident => format!("Algorithm drift detected: {}", self.algorithm),
            WorkflowTrigger::FixProposal => format!("Fix proposal awaiting approval: {}", self.algorithm),
            WorkflowTrigger::Escalation => format!("Drift escalated for human review: {}", self.algorithm),
            WorkflowTrigger::IncidentResolved => format!("Drift resolved: {}", self.algorithm),
            WorkflowTrigger::Manual => format!("Manual action on {}", self.algorithm),
            WorkflowTrigger::LowFindability => format!("Low findability: {}", self.algorithm),
        }
    }
}

/// An outbound notification or ticketing target.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Action label recorded on the workflow when the send succeeds.
    fn action(&self) -> &'static str;

    fn accepts(&self, _trigger: WorkflowTrigger) -> bool {
        true
    }

    /// Deliver the payload. Returns a ticket key when one was created.
    async fn send(&self, payload: &NotificationPayload) -> Result<Option<String>>;
}

/// Fans a payload out to every configured channel and records the attempt.
#[derive(Clone)]
pub struct Dispatcher {
    store: WorkflowStore,
    channels: Vec<Arc<dyn Channel>>,
}

impl Dispatcher {
    pub fn new(store: WorkflowStore, channels: Vec<Arc<dyn Channel>>) -> Self {
        Self { store, channels }
    }

    /// Build channels from configuration. Unconfigured channels are left out.
    pub fn from_config(store: WorkflowStore, config: &NotifyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(15))
            .build()
            .map_err(|e| SentinelError::Config(format!("notification client: {e}")))?;

        let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
        if let Some(webhook) = &config.slack.webhook_url {
            channels.push(Arc::new(SlackChannel::new(client.clone(), webhook.clone())));
        }
        if let Some(jira) = JiraChannel::from_config(client, &config.jira) {
            channels.push(Arc::new(jira));
        }
        info!(
            channels = ?channels.iter().map(|c| c.name()).collect::<Vec<_>>(),
            "workflow dispatcher ready"
        );
        Ok(Self::new(store, channels))
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub async fn dispatch(&self, payload: NotificationPayload) -> Result<WorkflowRecord> {
        let created_at = Utc::now();
        let mut record = WorkflowRecord {
            id: workflow_id(payload.trigger),
            trigger: payload.trigger,
            entity_id: payload.incident_id.clone(),
            priority: payload.priority,
            actions: Vec::new(),
            channels: Vec::new(),
            status: WorkflowStatus::Completed,
            ticket_key: None,
            created_at,
            completed_at: created_at,
        };

        for channel in self.channels.iter().filter(|c| c.accepts(payload.trigger)) {
            match channel.send(&payload).await {
                Ok(ticket) => {
                    record.actions.push(channel.action().to_string());
                    if ticket.is_some() {
                        record.ticket_key.clone_from(&ticket);
                    }
                    record.channels.push(ChannelOutcome {
                        channel: channel.name().to_string(),
                        ok: true,
                        detail: ticket,
                    });
                }
                Err(e) => {
                    warn!(
                        workflow_id = %record.id,
                        channel = channel.name(),
                        error = %e,
                        "channel delivery failed"
                    );
                    record.channels.push(ChannelOutcome {
                        channel: channel.name().to_string(),
                        ok: false,
                        detail: Some(e.to_string()),
                    });
                }
            }
        }

        if !record.channels.is_empty() && record.actions.is_empty() {
            record.status = WorkflowStatus::Failed;
        }
        record.completed_at = Utc::now();

        let store = self.store.clone();
        let stored = record.clone();
        tokio::task::spawn_blocking(move || store.append(&stored)).await??;

        info!(
            workflow_id = %record.id,
            trigger = %record.trigger,
            entity_id = %record.entity_id,
            actions = ?record.actions,
            status = record.status.as_str(),
            "workflow recorded"
        );
        Ok(record)
    }
}

fn workflow_id(trigger: WorkflowTrigger) -> String {
    let short = match trigger {
        WorkflowTrigger::DriftIncident => "drift",
        WorkflowTrigger::LowFindability => "catalog",
        WorkflowTrigger::Manual => "manual",
        WorkflowTrigger::FixProposal => "proposal",
        WorkflowTrigger::Escalation => "escalation",
        WorkflowTrigger::IncidentResolved => "resolved",
    };
    let uuid = Uuid::new_v4().simple().to_string();
    format!("wf-{short}-{}", &uuid[..8])
}
