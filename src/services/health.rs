//! Status HTTP server for a running bridge
//!
//! Liveness probe for process supervision, a JSON status document and a
//! Prometheus text endpoint built from the bridge counters.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::domain::Platform;
use crate::error::{Result, TradeSyncError};
use crate::services::metrics::{BridgeMetrics, MetricsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub account_id: i64,
    pub platform: Platform,
    pub liveness_window_secs: u64,
    pub metrics: MetricsSnapshot,
}

/// Shared state for the status server
pub struct HealthState {
    pub account_id: i64,
    pub platform: Platform,
    pub liveness_window: Duration,
    pub metrics: Arc<BridgeMetrics>,
}

impl HealthState {
    pub fn new(account_id: i64, platform: Platform, liveness_window: Duration, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            account_id,
            platform,
            liveness_window,
            metrics,
        }
    }

    pub async fn get_health(&self) -> HealthResponse {
        let degraded = self.metrics.check_liveness(self.liveness_window).await;
        HealthResponse {
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            timestamp: Utc::now(),
            account_id: self.account_id,
            platform: self.platform,
            liveness_window_secs: self.liveness_window.as_secs(),
            metrics: self.metrics.snapshot().await,
        }
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    pub async fn run(&self) -> Result<()> {
        let app = router(Arc::clone(&self.state));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting status server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TradeSyncError::Internal(format!("Status server error: {}", e)))?;

        Ok(())
    }
}

/// Degraded still answers 200: the bridge keeps running and retrying
async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.get_health().await))
}

async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let m = &health.metrics;
    let up = match health.status {
        HealthStatus::Healthy => 1,
        HealthStatus::Degraded => 0,
    };
    let labels = format!(
        "account_id=\"{}\",platform=\"{}\"",
        health.account_id, health.platform
    );

    let mut body = String::new();
    let mut metric = |name: &str, kind: &str, help: &str, value: u64| {
        body.push_str(&format!(
            "# HELP tradesync_bridge_{name} {help}\n# TYPE tradesync_bridge_{name} {kind}\ntradesync_bridge_{name}{{{labels}}} {value}\n\n"
        ));
    };
    metric("up", "gauge", "Bridge status (1=healthy, 0=degraded)", up);
    metric("uptime_seconds", "counter", "Uptime in seconds", m.uptime_seconds);
    metric("messages_received_total", "counter", "Frames received from the terminal", m.messages_received);
    metric("snapshots_written_total", "counter", "Snapshots accepted by the store", m.snapshots_written);
    metric("stale_rejected_total", "counter", "Pushes older than the stored snapshot", m.stale_rejected);
    metric("validation_failures_total", "counter", "Malformed or incomplete payloads", m.validation_failures);
    metric("foreign_discarded_total", "counter", "Pushes for another account", m.foreign_discarded);
    metric("self_checks_total", "counter", "Account-info requests sent", m.self_checks_sent);
    metric("errors_total", "counter", "Store or link errors", m.errors);

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        body,
    )
}
