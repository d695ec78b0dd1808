//! External diagnostic/remediation agent boundary.
//!
//! The agent is an opaque collaborator reached over a message-passing
//! contract. It may be slow, down, or unsure; every call is bounded by a
//! timeout and the heuristic diagnosis stands whenever the agent does not
//! clearly improve on it.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::baseline::BaselineStore;
use crate::config::{AgentConfig, DetectionConfig, DiagnosisConfig};
use crate::detect::incident::{Incident, IncidentStatus};
use crate::detect::Severity;
use crate::diagnosis::{self, Diagnosis, DiagnosisSource, Evidence, FixAction, RootCause};
use crate::error::{Result, SentinelError};
use crate::ingest::DecisionStore;

const MAX_ANALYSIS_CHARS: usize = 2000;

/// Structured question sent to the diagnostic agent.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisRequest {
    pub incident_id: String,
    pub algorithm: String,
    pub divergence: f64,
    pub severity: Severity,
    pub affected_zones: Vec<String>,
    pub drift_start: Option<DateTime<Utc>>,
    pub heuristic_root_cause: RootCause,
    pub heuristic_confidence: f64,
}

/// What the agent answered. Free-form fields are optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentDiagnosis {
    pub root_cause: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub recommended_fix: Option<String>,
    #[serde(default)]
    pub root_cause_feature: Option<String>,
    /// Raw agent reply, kept for the incident record.
    #[serde(skip)]
    pub analysis: String,
}

#[async_trait]
pub trait DiagnosticAgent: Send + Sync {
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<AgentDiagnosis>;
}

/// A fix to apply to a drifting algorithm.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationRequest {
    pub incident_id: String,
    pub algorithm: String,
    pub action: FixAction,
    pub confidence: f64,
    pub affected_zones: Vec<String>,
}

/// Applies remediation actions.
#[async_trait]
pub trait Remediator: Send + Sync {
    fn name(&self) -> &'static str;
    async fn apply(&self, request: &RemediationRequest) -> Result<()>;
}

/// Records the action without side effects. Used when no executor is configured.
pub struct LoggingRemediator;

#[async_trait]
impl Remediator for LoggingRemediator {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn apply(&self, request: &RemediationRequest) -> Result<()> {
        info!(
            incident_id = %request.incident_id,
            algorithm = %request.algorithm,
            action = %request.action,
            confidence = request.confidence,
            "remediation recorded"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP agent (converse API)
// ---------------------------------------------------------------------------

/// Talks to an agent platform over its converse endpoint.
pub struct HttpAgent {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    diagnostician_id: String,
    resolver_id: String,
}

impl HttpAgent {
    /// `None` when no endpoint is configured.
    pub fn from_config(config: &AgentConfig) -> Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.as_deref() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SentinelError::Config(format!("agent client: {e}")))?;
        Ok(Some(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            diagnostician_id: config.diagnostician_id.clone(),
            resolver_id: config.resolver_id.clone(),
        }))
    }

    async fn converse(&self, agent_id: &str, message: String) -> Result<String> {
        let url = format!("{}/api/agent_builder/converse", self.endpoint);
        let mut req = self
            .client
            .post(&url)
            .header("kbn-xsrf", "true")
            .json(&json!({ "input": message, "agent_id": agent_id }));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("ApiKey {key}"));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SentinelError::AgentUnavailable(format!("{agent_id}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SentinelError::AgentUnavailable(format!("{agent_id}: HTTP {status}")));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| SentinelError::AgentUnavailable(format!("{agent_id}: bad body: {e}")))?;

        let text = body
            .pointer("/response/message")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());
        debug!(%agent_id, chars = text.len(), "agent replied");
        Ok(text)
    }
}

#[async_trait]
impl DiagnosticAgent for HttpAgent {
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<AgentDiagnosis> {
        let message = format!(
            "Diagnose drift for: {} in zones: {}. Context: {}",
            request.algorithm,
            if request.affected_zones.is_empty() {
                "all".to_string()
            } else {
                request.affected_zones.join(", ")
            },
            serde_json::to_string(request)?
        );
        let reply = self.converse(&self.diagnostician_id, message).await?;
        parse_agent_reply(&reply)
    }
}

#[async_trait]
impl Remediator for HttpAgent {
    fn name(&self) -> &'static str {
        "agent"
    }

    async fn apply(&self, request: &RemediationRequest) -> Result<()> {
        let message = format!(
            "Apply fix '{}' for incident {} on algorithm {} with confidence {:.2}",
            request.action, request.incident_id, request.algorithm, request.confidence
        );
        self.converse(&self.resolver_id, message).await?;
        Ok(())
    }
}

/// Extract the JSON object embedded in an agent's free-text reply.
pub fn parse_agent_reply(reply: &str) -> Result<AgentDiagnosis> {
    let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) else {
        return Err(SentinelError::AgentUnavailable("reply carries no JSON object".into()));
    };
    if end < start {
        return Err(SentinelError::AgentUnavailable("reply carries no JSON object".into()));
    }
    let mut parsed: AgentDiagnosis = serde_json::from_str(&reply[start..=end])
        .map_err(|e| SentinelError::AgentUnavailable(format!("unparseable reply: {e}")))?;
    parsed.analysis = reply.chars().take(MAX_ANALYSIS_CHARS).collect();
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// Diagnoser
// ---------------------------------------------------------------------------

/// Loads evidence, runs the heuristics, and consults the agent if one is set.
#[derive(Clone)]
pub struct Diagnoser {
    decisions: DecisionStore,
    baselines: BaselineStore,
    config: DiagnosisConfig,
    detection: DetectionConfig,
    baseline_window_days: i64,
    agent: Option<Arc<dyn DiagnosticAgent>>,
    agent_timeout: StdDuration,
    agent_min_confidence: f64,
}

impl Diagnoser {
    pub fn new(
        decisions: DecisionStore,
        baselines: BaselineStore,
        config: DiagnosisConfig,
        detection: DetectionConfig,
        baseline_window_days: i64,
    ) -> Self {
        Self {
            decisions,
            baselines,
            config,
            detection,
            baseline_window_days,
            agent: None,
            agent_timeout: StdDuration::from_secs(30),
            agent_min_confidence: 0.5,
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn DiagnosticAgent>, config: &AgentConfig) -> Self {
        self.agent = Some(agent);
        self.agent_timeout = StdDuration::from_secs(config.timeout_secs);
        self.agent_min_confidence = config.min_confidence;
        self
    }

    /// Diagnose an incident that is still `detected` or `investigating`.
    pub async fn diagnose(&self, incident: &Incident) -> Result<Diagnosis> {
        if !matches!(
            incident.status,
            IncidentStatus::Detected | IncidentStatus::Investigating
        ) {
            return Err(SentinelError::Validation(format!(
                "incident {} is {}, diagnosis needs detected or investigating",
                incident.id, incident.status
            )));
        }

        let this = self.clone();
        let algorithm = incident.algorithm.clone();
        let heuristic = tokio::task::spawn_blocking(move || this.heuristic(&algorithm, Utc::now())).await??;

        let Some(agent) = &self.agent else {
            return Ok(heuristic);
        };
        let request = DiagnosisRequest {
            incident_id: incident.id.clone(),
            algorithm: incident.algorithm.clone(),
            divergence: incident.divergence,
            severity: incident.severity,
            affected_zones: heuristic.affected_zones.clone(),
            drift_start: heuristic.drift_start,
            heuristic_root_cause: heuristic.root_cause,
            heuristic_confidence: heuristic.confidence,
        };

        match tokio::time::timeout(self.agent_timeout, agent.diagnose(&request)).await {
            Ok(Ok(reply)) => Ok(self.merge(heuristic, reply, &incident.id)),
            Ok(Err(e)) => {
                warn!(incident_id = %incident.id, error = %e, "agent diagnosis failed, using heuristics");
                Ok(heuristic)
            }
            Err(_) => {
                warn!(
                    incident_id = %incident.id,
                    timeout_secs = self.agent_timeout.as_secs_f64(),
                    "agent diagnosis timed out, using heuristics"
                );
                Ok(heuristic)
            }
        }
    }

    fn heuristic(&self, algorithm: &str, now: DateTime<Utc>) -> Result<Diagnosis> {
        let baseline = self.baselines.get_or_compute(algorithm)?;
        let all = self
            .decisions
            .window(algorithm, now - Duration::days(self.baseline_window_days))?;

        let recent_from = now - Duration::minutes(self.detection.recent_window_minutes);
        let lookback_from = now - Duration::hours(self.config.lookback_hours);
        let split_recent = all.partition_point(|d| d.timestamp < recent_from);
        let split_lookback = all.partition_point(|d| d.timestamp < lookback_from);

        let evidence = Evidence {
            baseline: &baseline,
            lookback: &all[split_lookback..],
            recent: &all[split_recent..],
            history: &all[..split_recent],
        };
        Ok(diagnosis::diagnose(&evidence, &self.config, &self.detection, now))
    }

    /// Adopt the agent's answer only if it is confident and beats the heuristics.
    fn merge(&self, mut heuristic: Diagnosis, reply: AgentDiagnosis, incident_id: &str) -> Diagnosis {
        heuristic.agent_analysis = Some(reply.analysis.clone());

        let Some(root_cause) = RootCause::parse(&reply.root_cause) else {
            debug!(%incident_id, label = %reply.root_cause, "agent root cause not recognised");
            return heuristic;
        };
        let confidence = reply.confidence.clamp(0.0, 1.0);
        if confidence < self.agent_min_confidence || confidence <= heuristic.confidence {
            debug!(%incident_id, agent = confidence, heuristic = heuristic.confidence, "keeping heuristic diagnosis");
            return heuristic;
        }

        info!(%incident_id, root_cause = %root_cause, confidence, "adopting agent diagnosis");
        heuristic.root_cause = root_cause;
        heuristic.confidence = confidence;
        heuristic.recommended_action = reply
            .recommended_fix
            .as_deref()
            .and_then(|f| f.parse().ok())
            .unwrap_or_else(|| root_cause.recommended_action());
        heuristic.source = DiagnosisSource::Agent;
        heuristic
    }
}
