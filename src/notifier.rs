use crate::errors::{EngineError, EngineResult};
use crate::interfaces::{Alert, AlertLevel, Notifier};
use reqwest::Client;

/// POSTs each alert as JSON to a webhook (Slack/Discord-style `text` field
/// plus the structured alert).
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(4))
            .build()
            .unwrap_or_default();
        Self { client, url: url.to_string() }
    }
}

fn render(alert: &Alert) -> String {
    let tag = match alert.level {
        AlertLevel::Info => "INFO",
        AlertLevel::Warning => "WARN",
        AlertLevel::Critical => "CRITICAL",
    };
    format!("[{tag}] {}: {}", alert.title, alert.body)
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> EngineResult<()> {
        let payload = serde_json::json!({ "text": render(alert), "alert": alert });
        let resp = self.client.post(&self.url).json(&payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::BrokerApi { status: status.as_u16(), body });
        }
        Ok(())
    }
}

/// Alerts to the log only.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> EngineResult<()> {
        match alert.level {
            AlertLevel::Info => tracing::info!(title = %alert.title, "{}", alert.body),
            AlertLevel::Warning => tracing::warn!(title = %alert.title, "{}", alert.body),
            AlertLevel::Critical => tracing::error!(title = %alert.title, "{}", alert.body),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_tags_level() {
        let a = Alert::new(AlertLevel::Critical, "Runaway loss shutdown", "daily pnl -5.20%");
        assert_eq!(render(&a), "[CRITICAL] Runaway loss shutdown: daily pnl -5.20%");
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        assert!(LogNotifier.notify(&Alert::new(AlertLevel::Info, "t", "b")).await.is_ok());
    }
}
