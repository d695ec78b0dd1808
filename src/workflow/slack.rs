//! Chat alerts through an incoming-webhook URL.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Result, SentinelError};
use crate::workflow::{Channel, NotificationPayload, Priority, WorkflowTrigger};

pub struct SlackChannel {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackChannel {
    pub fn new(client: reqwest::Client, webhook_url: String) -> Self {
        Self { client, webhook_url }
    }
}

/// Attachment-style message body.
pub fn render(payload: &NotificationPayload) -> Value {
    let color = match (payload.trigger, payload.priority) {
        (WorkflowTrigger::IncidentResolved, _) => "#36a64f",
        (_, Priority::High) => "#FF0000",
        _ if payload.divergence > 0.6 => "#FF0000",
        _ => "#FF8C00",
    };

    let mut fields = vec![
        json!({ "title": "KL Divergence", "value": format!("{:.4}", payload.divergence), "short": true }),
        json!({ "title": "Severity", "value": payload.severity.as_str(), "short": true }),
        json!({ "title": "Estimated Impact", "value": format!("{:.0}/hr", payload.estimated_impact), "short": true }),
        json!({ "title": "Affected Zones", "value": payload.zones_label(), "short": true }),
        json!({ "title": "Status", "value": payload.status.as_str(), "short": true }),
        json!({ "title": "Incident ID", "value": payload.incident_id, "short": false }),
        json!({
            "title": "Root Cause",
            "value": payload.root_cause.map_or("Investigating...", |r| r.as_str()),
            "short": false
        }),
    ];
    if let (Some(action), Some(confidence)) = (payload.recommended_action, payload.confidence) {
        fields.push(json!({
            "title": "Recommended Fix",
            "value": format!("{action} ({:.0}% confidence)", confidence * 100.0),
            "short": false
        }));
    }
    if let Some(note) = &payload.note {
        fields.push(json!({ "title": "Note", "value": note, "short": false }));
    }

    json!({
        "attachments": [{
            "color": color,
            "title": payload.headline(),
            "fields": fields,
            "footer": "DriftSentinel",
            "ts": chrono::Utc::now().timestamp(),
        }]
    })
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn action(&self) -> &'static str {
        "slack_alert"
    }

    async fn send(&self, payload: &NotificationPayload) -> Result<Option<String>> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&render(payload))
            .send()
            .await
            .map_err(|e| SentinelError::ExternalChannel {
                channel: "slack".into(),
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(SentinelError::ExternalChannel {
                channel: "slack".into(),
                reason: format!("HTTP {}", resp.status()),
            });
        }
        Ok(None)
    }
}
