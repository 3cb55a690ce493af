//! Notification dispatch: sends fired reminders somewhere.
//! Supports: generic HTTP webhook (the bot front-end relays to DM/channel)
//! and a log-only sink for headless runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use chime_core::config::DeliveryConfig;
use chime_core::traits::Deliverer;
use chime_core::{ChimeError, DeliveryError, DeliveryMode, Notification, Result};

/// POSTs each notification as JSON to a relay endpoint.
pub struct WebhookDeliverer {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl WebhookDeliverer {
    pub fn new(url: &str, headers: Vec<(String, String)>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChimeError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
            headers,
        })
    }
}

/// Statuses the relay uses to say "this destination can't take messages".
fn is_unreachable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE
    )
}

#[async_trait]
impl Deliverer for WebhookDeliverer {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(
        &self,
        destination: &str,
        mode: DeliveryMode,
        notification: &Notification,
    ) -> std::result::Result<(), DeliveryError> {
        let mut req = self.client.post(&self.url).json(&serde_json::json!({
            "destination": destination,
            "mode": mode,
            "task_id": notification.task_id,
            "owner": notification.owner,
            "title": notification.title,
            "body": notification.body,
            "fired_at": notification.fired_at.to_rfc3339(),
        }));
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DeliveryError::Other(format!("Webhook send failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!("✅ Webhook accepted reminder {} for {}", notification.task_id, destination);
            Ok(())
        } else if is_unreachable(status) {
            let body = resp.text().await.unwrap_or_default();
            Err(DeliveryError::Unreachable(format!("{destination}: {status} {body}")))
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(DeliveryError::Other(format!("Webhook error {status}: {body}")))
        }
    }
}

/// Writes notifications to the log. Never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDeliverer;

#[async_trait]
impl Deliverer for LogDeliverer {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(
        &self,
        destination: &str,
        mode: DeliveryMode,
        notification: &Notification,
    ) -> std::result::Result<(), DeliveryError> {
        tracing::info!(
            task_id = notification.task_id,
            destination,
            %mode,
            "📣 {}: {}",
            notification.title,
            notification.body
        );
        Ok(())
    }
}

/// Build the deliverer described by config: webhook if a URL is set, log otherwise.
pub fn deliverer_from_config(config: &DeliveryConfig) -> Result<Arc<dyn Deliverer>> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookDeliverer::new(
            url,
            config.headers.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => Ok(Arc::new(LogDeliverer)),
    }
}
