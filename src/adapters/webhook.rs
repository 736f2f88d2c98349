//! Chat webhook notifications
//!
//! Posts plain-text messages to an incoming-webhook URL (Slack/Feishu/Teams style).

use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{Result, TradeSyncError};

#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    webhook_url: String,
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    text: &'a str,
}

impl WebhookNotifier {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }

    /// Send a text message
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&WebhookMessage { text })
            .send()
            .await?;

        if resp.status().is_success() {
            debug!("Webhook notification sent");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            error!("Webhook notification failed: {} - {}", status, body);
            Err(TradeSyncError::Internal(format!(
                "webhook returned HTTP {}: {}",
                status, body
            )))
        }
    }
}
