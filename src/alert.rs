use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::schema::NotificationRecord;

/// Outbound alerting collaborator.
///
/// Called fire-and-forget by the notification bus for alert-worthy
/// codes. Implementations must not retry; a lost alert is logged and
/// forgotten.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn notify(&self, record: &NotificationRecord) -> anyhow::Result<()>;
}

// ------------------------------------------------------------
// Chat webhook alerter
// ------------------------------------------------------------
//
// Posts `{ "text": ... }` to an incoming-webhook URL.
//
pub struct SlackAlerter {
    http: reqwest::Client,
    webhook: String,
}

impl SlackAlerter {
    pub fn new(webhook: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, webhook })
    }
}

pub fn format_alert(record: &NotificationRecord) -> String {
    let ts = chrono::DateTime::from_timestamp_millis(record.timestamp)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| record.timestamp.to_string());

    if record.payload.is_null() {
        format!("[{}] {} at {}", record.node_id, record.code, ts)
    } else {
        format!("[{}] {} at {}: {}", record.node_id, record.code, ts, record.payload)
    }
}

#[async_trait]
impl Alerter for SlackAlerter {
    async fn notify(&self, record: &NotificationRecord) -> anyhow::Result<()> {
        self.http
            .post(&self.webhook)
            .json(&json!({ "text": format_alert(record) }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Fallback used in demo mode or when no webhook is configured.
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn notify(&self, record: &NotificationRecord) -> anyhow::Result<()> {
        log::warn!("ALERT {}", format_alert(record));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn alert_text_includes_code_and_payload() {
        let rec = NotificationRecord {
            node_id: "L0".into(),
            timestamp: 0,
            code: "CONTRACT_ERROR".into(),
            payload: json!({ "message": "nonce too low" }),
        };
        let text = format_alert(&rec);
        assert!(text.starts_with("[L0] CONTRACT_ERROR at 1970-01-01T00:00:00"));
        assert!(text.contains("nonce too low"));

        let bare = NotificationRecord { payload: Value::Null, ..rec };
        assert!(!format_alert(&bare).contains(": "));
    }
}
