//! Remediation trigger: asks the deployment pipeline to redeploy the producers

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{RemediationConfig, Secret};
use crate::error::{Result, TradeSyncError};

#[async_trait]
pub trait RemediationTrigger: Send + Sync {
    /// Fire once; failures are reported, never retried here
    async fn trigger(&self, reason: &str) -> Result<()>;
}

#[derive(Serialize)]
struct DispatchInputs<'a> {
    reason: &'a str,
}

#[derive(Serialize)]
struct DispatchRequest<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
    inputs: DispatchInputs<'a>,
}

/// CI/CD workflow dispatch over HTTP
pub struct DispatchTrigger {
    client: Client,
    url: String,
    token: Option<Secret>,
    git_ref: String,
}

impl DispatchTrigger {
    pub fn new(config: &RemediationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("tradesync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            token: config.token.clone(),
            git_ref: config.git_ref.clone(),
        })
    }
}

/// Dispatch endpoints cap free-text inputs; keep the reason readable
fn truncate_reason(reason: &str, max_chars: usize) -> String {
    if reason.chars().count() <= max_chars {
        return reason.to_string();
    }
    let mut cut: String = reason.chars().take(max_chars.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

#[async_trait]
impl RemediationTrigger for DispatchTrigger {
    async fn trigger(&self, reason: &str) -> Result<()> {
        let reason = truncate_reason(reason, 1000);
        let body = DispatchRequest {
            git_ref: &self.git_ref,
            inputs: DispatchInputs { reason: &reason },
        };

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }

        debug!(url = %self.url, git_ref = %self.git_ref, "Dispatching remediation");
        let resp = request
            .send()
            .await
            .map_err(|e| TradeSyncError::Remediation(format!("dispatch request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            info!(status = %status, "Remediation dispatched");
            Ok(())
        } else {
            let text = resp.text().await.unwrap_or_default();
            Err(TradeSyncError::Remediation(format!("HTTP {status}: {text}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_body_uses_ref_and_reason_input() {
        let body = DispatchRequest {
            git_ref: "main",
            inputs: DispatchInputs { reason: "sync_freshness: stale" },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value, serde_json::json!({"ref": "main", "inputs": {"reason": "sync_freshness: stale"}}));
    }

    #[test]
    fn long_reasons_are_truncated() {
        let reason = "x".repeat(1500);
        let cut = truncate_reason(&reason, 1000);
        assert_eq!(cut.chars().count(), 1000);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate_reason("short", 1000), "short");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_remediation_error() {
        let trigger = DispatchTrigger::new(&RemediationConfig {
            url: "http://127.0.0.1:1/dispatch".into(),
            token: Some(Secret::new("t")),
            git_ref: "main".into(),
            timeout_secs: 2,
        })
        .unwrap();
        let err = trigger.trigger("test").await.unwrap_err();
        assert!(matches!(err, TradeSyncError::Remediation(_)));
    }
}
