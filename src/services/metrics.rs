use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Ingest counters of one streaming bridge
pub struct BridgeMetrics {
    /// Frames received on any socket
    pub messages_received: AtomicU64,
    /// Snapshots accepted by the store
    pub snapshots_written: AtomicU64,
    /// Pushes rejected by the monotonic timestamp guard
    pub stale_rejected: AtomicU64,
    /// Malformed or incomplete payloads
    pub validation_failures: AtomicU64,
    /// Pushes for an account this bridge does not own
    pub foreign_discarded: AtomicU64,
    pub self_checks_sent: AtomicU64,
    /// Store or link errors
    pub errors: AtomicU64,
    degraded: AtomicBool,
    started_at: DateTime<Utc>,
    last_message_at: RwLock<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub snapshots_written: u64,
    pub stale_rejected: u64,
    pub validation_failures: u64,
    pub foreign_discarded: u64,
    pub self_checks_sent: u64,
    pub errors: u64,
    pub degraded: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            snapshots_written: AtomicU64::new(0),
            stale_rejected: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            foreign_discarded: AtomicU64::new(0),
            self_checks_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            started_at: Utc::now(),
            last_message_at: RwLock::new(None),
        }
    }

    /// Record any inbound frame; clears the degraded flag
    pub async fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        *self.last_message_at.write().await = Some(Utc::now());
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("Terminal traffic resumed, bridge no longer degraded");
        }
    }

    pub fn inc_written(&self) {
        self.snapshots_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale(&self) {
        self.stale_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_foreign(&self) {
        self.foreign_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_self_check(&self) {
        self.self_checks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub async fn last_message_at(&self) -> Option<DateTime<Utc>> {
        *self.last_message_at.read().await
    }

    /// Mark degraded when nothing arrived within `window` (counted from start
    /// when nothing ever arrived). Returns the current flag.
    pub async fn check_liveness(&self, window: Duration) -> bool {
        let reference = self.last_message_at().await.unwrap_or(self.started_at);
        let silent_for = (Utc::now() - reference).to_std().unwrap_or_default();
        if silent_for >= window {
            if !self.degraded.swap(true, Ordering::SeqCst) {
                warn!(
                    silent_secs = silent_for.as_secs(),
                    window_secs = window.as_secs(),
                    "No terminal traffic within liveness window, bridge degraded"
                );
            }
            true
        } else {
            self.is_degraded()
        }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            snapshots_written: self.snapshots_written.load(Ordering::Relaxed),
            stale_rejected: self.stale_rejected.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            foreign_discarded: self.foreign_discarded.load(Ordering::Relaxed),
            self_checks_sent: self.self_checks_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
            last_message_at: self.last_message_at().await,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// One-line summary for periodic logging
    pub async fn summary(&self) -> String {
        let s = self.snapshot().await;
        format!(
            "received={} written={} stale={} invalid={} foreign={} self_checks={} errors={}{}",
            s.messages_received,
            s.snapshots_written,
            s.stale_rejected,
            s.validation_failures,
            s.foreign_discarded,
            s.self_checks_sent,
            s.errors,
            if s.degraded { " DEGRADED" } else { "" }
        )
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn silence_marks_degraded_and_traffic_clears_it() {
        let metrics = BridgeMetrics::new();
        assert!(!metrics.check_liveness(Duration::from_secs(3600)).await);
        assert!(metrics.check_liveness(Duration::ZERO).await);
        assert!(metrics.is_degraded());

        metrics.record_message().await;
        assert!(!metrics.is_degraded());
        assert_eq!(metrics.snapshot().await.messages_received, 1);
    }

    #[tokio::test]
    async fn summary_flags_degraded_state() {
        let metrics = BridgeMetrics::new();
        metrics.inc_written();
        metrics.inc_foreign();
        metrics.check_liveness(Duration::ZERO).await;
        let line = metrics.summary().await;
        assert!(line.contains("written=1"));
        assert!(line.contains("foreign=1"));
        assert!(line.ends_with("DEGRADED"));
    }
}
