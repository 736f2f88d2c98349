//! Watchdog notifications
//!
//! `AlertManager` is the production `Notifier`: it always logs, and forwards to a
//! chat webhook when one is configured. Alerts sharing a level and title are
//! rate limited, so a pipeline that stays broken across cycles alerts once per
//! window even though each cycle's reason text differs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::adapters::WebhookNotifier;

/// Sink for remediation outcomes
#[async_trait]
pub trait Notifier: Send + Sync {
    /// `succeeded` reports whether the remediation trigger call itself went through
    async fn notify(&self, reason: &str, succeeded: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// A successful trigger is a warning; a failed one needs a human
    pub fn remediation(reason: &str, succeeded: bool) -> Self {
        let (level, title) = if succeeded {
            (AlertLevel::Warning, "Pipeline failing, remediation triggered")
        } else {
            (AlertLevel::Critical, "Pipeline failing, remediation NOT triggered")
        };
        Self {
            level,
            title: title.to_string(),
            message: reason.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn format_text(&self) -> String {
        format!(
            "[{}] {}\nTime: {}\n\n{}",
            self.level.as_str().to_uppercase(),
            self.title,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.message
        )
    }
}

#[derive(Debug)]
struct RateLimitState {
    last_sent: DateTime<Utc>,
    suppressed_count: u32,
}

pub struct AlertManager {
    rate_limit_secs: u64,
    webhook: Option<WebhookNotifier>,
    rate_limits: RwLock<HashMap<String, RateLimitState>>,
}

impl AlertManager {
    pub fn new(rate_limit_secs: u64) -> Self {
        Self {
            rate_limit_secs,
            webhook: None,
            rate_limits: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_webhook(mut self, webhook: WebhookNotifier) -> Self {
        self.webhook = Some(webhook);
        self
    }

    fn rate_limit_key(alert: &Alert) -> String {
        format!("{}:{}", alert.level, alert.title)
    }

    /// True when an alert with the same key went out within the rate-limit window
    async fn should_rate_limit(&self, alert: &Alert) -> bool {
        let key = Self::rate_limit_key(alert);
        let now = alert.timestamp;
        let window = self.rate_limit_secs;
        let mut limits = self.rate_limits.write().await;

        limits.retain(|k, state| {
            *k == key || (now.signed_duration_since(state.last_sent).num_seconds().max(0) as u64) < window
        });

        if let Some(state) = limits.get_mut(&key) {
            let elapsed = now.signed_duration_since(state.last_sent).num_seconds().max(0) as u64;
            if elapsed < window {
                state.suppressed_count += 1;
                debug!(
                    "Rate limiting alert '{}' ({} suppressed)",
                    alert.title, state.suppressed_count
                );
                return true;
            }
            state.last_sent = now;
            state.suppressed_count = 0;
        } else {
            limits.insert(
                key,
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
        }
        false
    }

    /// Suppressed alert counts per key, for keys with at least one suppression
    pub async fn suppressed_counts(&self) -> HashMap<String, u32> {
        let limits = self.rate_limits.read().await;
        limits
            .iter()
            .filter(|(_, state)| state.suppressed_count > 0)
            .map(|(key, state)| (key.clone(), state.suppressed_count))
            .collect()
    }

    /// Log the alert and forward it; returns whether it was forwarded
    pub async fn alert(&self, alert: Alert) -> bool {
        match alert.level {
            AlertLevel::Warning => warn!("{}: {}", alert.title, alert.message),
            AlertLevel::Critical => error!("CRITICAL {}: {}", alert.title, alert.message),
        }

        if self.should_rate_limit(&alert).await {
            return false;
        }

        let Some(webhook) = &self.webhook else {
            return false;
        };
        match webhook.send_message(&alert.format_text()).await {
            Ok(()) => {
                info!("Alert delivered to webhook");
                true
            }
            Err(e) => {
                error!("Failed to deliver alert: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl Notifier for AlertManager {
    async fn notify(&self, reason: &str, succeeded: bool) {
        self.alert(Alert::remediation(reason, succeeded)).await;
    }
}
