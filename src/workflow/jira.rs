//! Ticket creation through the issue-tracker REST API.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::config::JiraConfig;
use crate::error::{Result, SentinelError};
use crate::workflow::{Channel, NotificationPayload, Priority, WorkflowTrigger};

pub struct JiraChannel {
    client: reqwest::Client,
    url: String,
    email: String,
    api_token: String,
    project_key: String,
}

impl JiraChannel {
    /// `None` unless url, email, and token are all set.
    pub fn from_config(client: reqwest::Client, config: &JiraConfig) -> Option<Self> {
        Some(Self {
            client,
            url: config.url.as_deref()?.trim_end_matches('/').to_string(),
            email: config.email.clone()?,
            api_token: config.api_token.clone()?,
            project_key: config.project_key.clone(),
        })
    }
}

/// Issue body in the tracker's document format.
pub fn render(payload: &NotificationPayload, project_key: &str) -> Value {
    let summary = match payload.trigger {
        WorkflowTrigger::FixProposal => format!(
            "[DRIFT][PROPOSAL] {}: apply {}?",
            payload.algorithm,
            payload.recommended_action.map_or("fix", |a| a.as_str())
        ),
        WorkflowTrigger::Escalation => format!(
            "[DRIFT][ESCALATED] {} algorithm, KL={:.4}",
            payload.algorithm, payload.divergence
        ),
        _ => format!(
            "[DRIFT] {} algorithm, KL={:.4} impact={:.0}",
            payload.algorithm, payload.divergence, payload.estimated_impact
        ),
    };

    let mut text = format!(
        "Algorithm drift detected on '{}'.\n\nKL Divergence: {:.4}\nSeverity: {}\nEstimated Impact: {:.0}/hr\n\
         Incident ID: {}\nAffected Zones: {}\n\nRoot Cause: {}\n",
        payload.algorithm,
        payload.divergence,
        payload.severity,
        payload.estimated_impact,
        payload.incident_id,
        payload.zones_label(),
        payload.root_cause.map_or("Under investigation", |r| r.as_str()),
    );
    if let (Some(action), Some(confidence)) = (payload.recommended_action, payload.confidence) {
        text.push_str(&format!("Recommended Fix: {action} (confidence {confidence:.2})\n"));
    }
    if let Some(note) = &payload.note {
        text.push_str(&format!("\n{note}\n"));
    }
    text.push_str(&format!(
        "\nAgent Analysis:\n{}",
        payload.agent_analysis.as_deref().unwrap_or("Pending...")
    ));

    let priority = match payload.priority {
        Priority::High => "Highest",
        Priority::Normal if payload.divergence > 0.6 => "High",
        Priority::Normal => "Medium",
    };

    json!({
        "fields": {
            "project": { "key": project_key },
            "summary": summary,
            "description": {
                "type": "doc",
                "version": 1,
                "content": [{
                    "type": "paragraph",
                    "content": [{ "type": "text", "text": text }]
                }]
            },
            "issuetype": { "name": if payload.trigger == WorkflowTrigger::FixProposal { "Task" } else { "Bug" } },
            "priority": { "name": priority },
            "labels": ["drift", "algorithm", payload.algorithm],
        }
    })
}

#[async_trait]
impl Channel for JiraChannel {
    fn name(&self) -> &'static str {
        "jira"
    }

    fn action(&self) -> &'static str {
        "jira_ticket"
    }

    /// Resolution notices go to chat only.
    fn accepts(&self, trigger: WorkflowTrigger) -> bool {
        trigger != WorkflowTrigger::IncidentResolved
    }

    async fn send(&self, payload: &NotificationPayload) -> Result<Option<String>> {
        let channel_err = |reason: String| SentinelError::ExternalChannel {
            channel: "jira".into(),
            reason,
        };

        let resp = self
            .client
            .post(format!("{}/rest/api/3/issue", self.url))
            .basic_auth(&self.email, Some(&self.api_token))
            .json(&render(payload, &self.project_key))
            .send()
            .await
            .map_err(|e| channel_err(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(channel_err(format!("HTTP {status}")));
        }

        let body: Value = resp.json().await.map_err(|e| channel_err(e.to_string()))?;
        let key = body.get("key").and_then(Value::as_str).map(str::to_string);
        if let Some(key) = &key {
            info!(ticket = %key, incident_id = %payload.incident_id, "ticket created");
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::incident::IncidentStatus;
    use crate::detect::Severity;
    use crate::diagnosis::FixAction;

    fn payload(trigger: WorkflowTrigger, priority: Priority) -> NotificationPayload {
        NotificationPayload {
            trigger,
            priority,
            incident_id: "drift-pricing-1".into(),
            algorithm: "pricing".into(),
            divergence: 0.45,
            severity: Severity::Medium,
            affected_zones: vec![],
            estimated_impact: 230_000.0,
            status: IncidentStatus::Investigating,
            root_cause: None,
            recommended_action: Some(FixAction::Rollback),
            confidence: Some(0.72),
            agent_analysis: None,
            note: Some("Approve via POST /api/v1/incidents/drift-pricing-1/resolve".into()),
        }
    }

    #[test]
    fn test_unconfigured_tracker_is_skipped() {
        let client = reqwest::Client::new();
        assert!(JiraChannel::from_config(client.clone(), &JiraConfig::default()).is_none());

        let config = JiraConfig {
            url: Some("https://tracker.example.com/".into()),
            email: Some("ops@example.com".into()),
            api_token: Some("token".into()),
            ..Default::default()
        };
        let channel = JiraChannel::from_config(client, &config).unwrap();
        assert_eq!(channel.url, "https://tracker.example.com");
        assert!(!channel.accepts(WorkflowTrigger::IncidentResolved));
        assert!(channel.accepts(WorkflowTrigger::Escalation));
    }

    #[test]
    fn test_proposal_ticket_fields() {
        let body = render(&payload(WorkflowTrigger::FixProposal, Priority::Normal), "CS");
        let fields = &body["fields"];
        assert_eq!(fields["project"]["key"], "CS");
        assert_eq!(fields["summary"], "[DRIFT][PROPOSAL] pricing: apply rollback?");
        assert_eq!(fields["issuetype"]["name"], "Task");
        assert_eq!(fields["priority"]["name"], "Medium");
        let text = fields["description"]["content"][0]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("Recommended Fix: rollback (confidence 0.72)"));
        assert!(text.contains("Affected Zones: all zones"));
    }

    #[test]
    fn test_escalation_ticket_is_highest_priority() {
        let body = render(&payload(WorkflowTrigger::Escalation, Priority::High), "CS");
        assert_eq!(body["fields"]["priority"]["name"], "Highest");
        assert_eq!(body["fields"]["issuetype"]["name"], "Bug");
    }
}
