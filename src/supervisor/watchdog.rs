//! Pipeline watchdog
//!
//! Audits the snapshot store on a fixed period, turns the check outcomes into a
//! verdict and escalates `Failing` cycles to the remediation trigger and the
//! notifier. Constructed explicitly with its collaborators; nothing is global.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::alert_manager::Notifier;
use super::checks::run_checks;
use super::remediation::RemediationTrigger;
use crate::config::{PipelineExpectations, WatchdogConfig};
use crate::domain::{HealthCheckResult, Verdict};
use crate::error::TradeSyncError;
use crate::persistence::WatchdogStore;

/// What the escalation step did in one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RemediationStatus {
    NotNeeded,
    Triggered,
    Failed(String),
    NotConfigured,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub result: HealthCheckResult,
    pub remediation: RemediationStatus,
    /// Consecutive non-healthy cycles including this one
    pub consecutive_failures: u32,
}

pub struct PipelineWatchdog {
    store: Arc<dyn WatchdogStore>,
    trigger: Option<Arc<dyn RemediationTrigger>>,
    notifier: Arc<dyn Notifier>,
    expectations: PipelineExpectations,
    interval: Duration,
    cycle_deadline: Duration,
    retention: chrono::Duration,
    consecutive_failures: AtomicU32,
    /// Held for the duration of a cycle; a busy lock means skip
    cycle_lock: Mutex<()>,
}

impl PipelineWatchdog {
    pub fn new(
        config: &WatchdogConfig,
        store: Arc<dyn WatchdogStore>,
        trigger: Option<Arc<dyn RemediationTrigger>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            trigger,
            notifier,
            expectations: config.expectations.clone(),
            interval: config.interval(),
            cycle_deadline: config.cycle_deadline(),
            retention: chrono::Duration::hours(config.retention_hours as i64),
            consecutive_failures: AtomicU32::new(0),
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Run one cycle, or return `None` when the previous one is still running
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            warn!("Previous watchdog cycle still running, skipping this one");
            return None;
        };
        Some(self.execute_cycle().await)
    }

    async fn execute_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let deadline_secs = self.cycle_deadline.as_secs();

        let result = match timeout(
            self.cycle_deadline,
            run_checks(self.store.as_ref(), &self.expectations, Utc::now()),
        )
        .await
        {
            Ok(outcomes) => HealthCheckResult::from_outcomes(outcomes),
            Err(_) => {
                error!(deadline_secs, "Watchdog checks exceeded the cycle deadline");
                HealthCheckResult::timed_out(deadline_secs)
            }
        };

        let consecutive_failures = if result.overall_healthy {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            0
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
        };

        match result.verdict {
            Verdict::Healthy => info!("Pipeline healthy"),
            Verdict::Degraded => warn!(
                failing = ?result.failing_checks(),
                consecutive_failures,
                "Pipeline degraded: {}",
                result.summary()
            ),
            Verdict::Failing => error!(
                failing = ?result.failing_checks(),
                consecutive_failures,
                "Pipeline failing: {}",
                result.summary()
            ),
        }
        for violation in result.violations() {
            debug!("{}", violation);
        }

        let remediation = if result.verdict == Verdict::Failing {
            let remaining = self.cycle_deadline.saturating_sub(started.elapsed());
            self.escalate(&result, consecutive_failures, remaining).await
        } else {
            RemediationStatus::NotNeeded
        };

        self.record(&result).await;

        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Watchdog cycle finished");
        CycleReport {
            result,
            remediation,
            consecutive_failures,
        }
    }

    /// Call the trigger exactly once, then notify with its outcome
    async fn escalate(&self, result: &HealthCheckResult, consecutive_failures: u32, budget: Duration) -> RemediationStatus {
        let reason = format!(
            "{} (consecutive unhealthy cycles: {consecutive_failures})",
            result.summary()
        );

        let status = match &self.trigger {
            None => {
                warn!("No remediation trigger configured");
                RemediationStatus::NotConfigured
            }
            Some(trigger) => match timeout(budget, trigger.trigger(&reason)).await {
                Ok(Ok(())) => {
                    info!("Remediation triggered");
                    RemediationStatus::Triggered
                }
                Ok(Err(e)) => {
                    error!("Remediation trigger failed: {}", e);
                    RemediationStatus::Failed(e.to_string())
                }
                Err(_) => {
                    let e = TradeSyncError::Timeout(format!(
                        "remediation trigger did not answer within the {}s cycle deadline",
                        self.cycle_deadline.as_secs()
                    ));
                    error!("{}", e);
                    RemediationStatus::Failed(e.to_string())
                }
            },
        };

        self.notifier
            .notify(&reason, status == RemediationStatus::Triggered)
            .await;
        status
    }

    /// Persist the result and prune the trailing window; failures only log.
    ///
    /// Bounded by its own deadline so a hung store releases the cycle lock.
    async fn record(&self, result: &HealthCheckResult) {
        let write = async {
            if let Err(e) = self.store.record_health(result).await {
                warn!("Failed to record health result: {}", e);
            }
            match self.store.prune_health(Utc::now() - self.retention).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "Pruned old health results"),
                Err(e) => warn!("Failed to prune health results: {}", e),
            }
        };
        if timeout(self.cycle_deadline, write).await.is_err() {
            error!(
                deadline_secs = self.cycle_deadline.as_secs(),
                "Health history write exceeded the cycle deadline, result not recorded"
            );
        }
    }

    /// Run cycles every `interval` until `shutdown` flips to true.
    ///
    /// Each cycle runs on its own task so a slow one shows up as a skipped
    /// tick instead of a queued backlog.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                deadline_secs = self.cycle_deadline.as_secs(),
                "Pipeline watchdog started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_cycle: Option<JoinHandle<()>> = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let watchdog = Arc::clone(&self);
                        last_cycle = Some(tokio::spawn(async move {
                            watchdog.run_cycle().await;
                        }));
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            if let Some(cycle) = last_cycle {
                let _ = cycle.await;
            }
            info!("Pipeline watchdog stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use async_trait::async_trait;

    struct SilentNotifier;

    #[async_trait]
    impl Notifier for SilentNotifier {
        async fn notify(&self, _reason: &str, _succeeded: bool) {}
    }

    struct SlowTrigger;

    #[async_trait]
    impl RemediationTrigger for SlowTrigger {
        async fn trigger(&self, _reason: &str) -> crate::error::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn config(deadline_secs: u64) -> WatchdogConfig {
        WatchdogConfig {
            cycle_deadline_secs: deadline_secs,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn overlapping_cycle_is_skipped() {
        let watchdog = PipelineWatchdog::new(
            &config(5),
            Arc::new(MemoryStore::new()),
            None,
            Arc::new(SilentNotifier),
        );
        let _held = watchdog.cycle_lock.lock().await;
        assert!(watchdog.run_cycle().await.is_none());
    }

    #[tokio::test]
    async fn slow_trigger_cannot_stall_the_cycle() {
        let watchdog = PipelineWatchdog::new(
            &config(1),
            Arc::new(MemoryStore::new()),
            Some(Arc::new(SlowTrigger)),
            Arc::new(SilentNotifier),
        );
        let started = Instant::now();
        // Empty store: no synced records, so freshness fails and the cycle is Failing
        let report = watchdog.run_cycle().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.result.verdict, Verdict::Failing);
        assert!(matches!(report.remediation, RemediationStatus::Failed(ref m) if m.contains("deadline")));
    }

    #[tokio::test]
    async fn consecutive_failures_accumulate() {
        let watchdog = PipelineWatchdog::new(
            &config(5),
            Arc::new(MemoryStore::new()),
            None,
            Arc::new(SilentNotifier),
        );
        watchdog.run_cycle().await.unwrap();
        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(report.consecutive_failures, 2);
        assert_eq!(report.remediation, RemediationStatus::NotConfigured);
    }
}
