use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use tradesync::adapters::MemoryStore;
use tradesync::config::{PipelineExpectations, WatchdogConfig};
use tradesync::domain::{
    AccountInfo, AccountLinkage, AccountSnapshot, DealsSummary, HealthCheckResult, Platform,
    SnapshotKey, SyncSource, Verdict,
};
use tradesync::error::{Result, TradeSyncError};
use tradesync::persistence::{AccountCounts, HealthHistory, PipelineQueries, SnapshotStore};
use tradesync::supervisor::{
    AlertManager, Notifier, PipelineWatchdog, RemediationStatus, RemediationTrigger,
};

#[derive(Default)]
struct RecordingTrigger {
    reasons: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl RemediationTrigger for RecordingTrigger {
    async fn trigger(&self, reason: &str) -> Result<()> {
        self.reasons.lock().unwrap().push(reason.to_string());
        if self.fail {
            return Err(TradeSyncError::Remediation("dispatch returned 422".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, reason: &str, succeeded: bool) {
        self.sent.lock().unwrap().push((reason.to_string(), succeeded));
    }
}

fn expectations() -> PipelineExpectations {
    PipelineExpectations {
        expected_total_accounts: 2,
        expected_active_accounts: 2,
        expected_total_allocation: dec!(1500),
        min_deal_rows: 1000,
        ..Default::default()
    }
}

fn config() -> WatchdogConfig {
    WatchdogConfig {
        cycle_deadline_secs: 5,
        expectations: expectations(),
        ..Default::default()
    }
}

fn snapshot(account_id: i64) -> AccountSnapshot {
    let info = AccountInfo {
        login: account_id,
        server: "Broker-Live".into(),
        currency: "USD".into(),
        leverage: 100,
        balance: dec!(1000),
        equity: dec!(1000),
        margin_used: Decimal::ZERO,
        margin_free: dec!(1000),
        floating_profit: Decimal::ZERO,
    };
    AccountSnapshot::from_account_info(
        Platform::Mt5,
        SyncSource::SequentialCollector,
        &info,
        Vec::new(),
        DealsSummary::empty(30),
        Utc::now(),
    )
}

/// Two fresh, allocated, managed accounts and enough deal rows
async fn healthy_store(deal_rows: u64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (account_id, allocated, manager) in [(1, dec!(1000), "mgr-a"), (2, dec!(500), "mgr-b")] {
        store.upsert_snapshot(&snapshot(account_id)).await.unwrap();
        let key = SnapshotKey {
            account_id,
            platform: Platform::Mt5,
        };
        assert!(store.set_linkage(key, Some(manager), Some(allocated), true).await);
    }
    store.add_deal_rows(deal_rows).await;
    store
}

fn watchdog(
    store: Arc<MemoryStore>,
    trigger: Arc<RecordingTrigger>,
    notifier: Arc<RecordingNotifier>,
) -> PipelineWatchdog {
    let trigger: Arc<dyn RemediationTrigger> = trigger;
    PipelineWatchdog::new(&config(), store, Some(trigger), notifier)
}

#[tokio::test]
async fn healthy_pipeline_never_remediates() {
    let store = healthy_store(1000).await;
    let trigger = Arc::new(RecordingTrigger::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let watchdog = watchdog(store.clone(), trigger.clone(), notifier.clone());

    let report = watchdog.run_cycle().await.unwrap();

    assert_eq!(report.result.verdict, Verdict::Healthy, "{}", report.result.summary());
    assert!(report.result.overall_healthy);
    assert_eq!(report.result.components.len(), 5);
    assert_eq!(report.remediation, RemediationStatus::NotNeeded);
    assert!(trigger.reasons.lock().unwrap().is_empty());
    assert!(notifier.sent.lock().unwrap().is_empty());

    let history = store.health_results().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, report.result.id);
}

/// 500 rows against a floor of 1000 is a non-critical failure
#[tokio::test]
async fn low_deal_volume_degrades_without_remediation() {
    let store = healthy_store(500).await;
    let trigger = Arc::new(RecordingTrigger::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let watchdog = watchdog(store, trigger.clone(), notifier);

    let report = watchdog.run_cycle().await.unwrap();

    assert_eq!(report.result.verdict, Verdict::Degraded);
    assert!(!report.result.overall_healthy);
    let floor = &report.result.components["deal_volume_floor"];
    assert!(!floor.healthy);
    assert_eq!(floor.metrics["count"], 500);
    assert_eq!(floor.metrics["threshold"], 1000);
    assert_eq!(report.remediation, RemediationStatus::NotNeeded);
    assert!(trigger.reasons.lock().unwrap().is_empty());
    assert_eq!(report.consecutive_failures, 1);
}

#[tokio::test]
async fn failing_pipeline_remediates_exactly_once() {
    let store = healthy_store(1000).await;
    // An unallocated active account breaks allocation completeness
    let key = SnapshotKey {
        account_id: 2,
        platform: Platform::Mt5,
    };
    store.set_linkage(key, Some("mgr-b"), None, true).await;

    let trigger = Arc::new(RecordingTrigger::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let watchdog = watchdog(store, trigger.clone(), notifier.clone());

    let report = watchdog.run_cycle().await.unwrap();

    assert_eq!(report.result.verdict, Verdict::Failing);
    assert_eq!(report.remediation, RemediationStatus::Triggered);

    let reasons = trigger.reasons.lock().unwrap();
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].contains("allocation_completeness"), "{}", reasons[0]);

    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1);
}

#[tokio::test]
async fn trigger_error_is_reported_and_notified() {
    let store = Arc::new(MemoryStore::new());
    let trigger = Arc::new(RecordingTrigger {
        fail: true,
        ..Default::default()
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let watchdog = watchdog(store.clone(), trigger.clone(), notifier.clone());

    // Nothing synced at all: freshness fails
    let report = watchdog.run_cycle().await.unwrap();

    assert_eq!(report.result.verdict, Verdict::Failing);
    assert!(matches!(report.remediation, RemediationStatus::Failed(ref m) if m.contains("422")));
    let reasons = trigger.reasons.lock().unwrap().clone();
    assert_eq!(reasons.len(), 1);
    let sent = notifier.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![(reasons[0].clone(), false)]);
    assert_eq!(store.health_results().await.len(), 1);
}

#[tokio::test]
async fn recovery_resets_the_failure_streak() {
    let store = healthy_store(500).await;
    let trigger = Arc::new(RecordingTrigger::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let watchdog = watchdog(store.clone(), trigger, notifier);

    watchdog.run_cycle().await.unwrap();
    watchdog.run_cycle().await.unwrap();
    assert_eq!(watchdog.consecutive_failures(), 2);

    store.add_deal_rows(500).await;
    let report = watchdog.run_cycle().await.unwrap();
    assert!(report.result.overall_healthy);
    assert_eq!(watchdog.consecutive_failures(), 0);
    assert_eq!(store.health_results().await.len(), 3);
}

/// Wraps a memory store; reads can be slowed down and history writes can hang
struct SlowStore {
    inner: MemoryStore,
    read_delay: Duration,
    hang_history: bool,
    cycles_entered: AtomicUsize,
}

impl SlowStore {
    fn new(read_delay: Duration, hang_history: bool) -> Self {
        Self {
            inner: MemoryStore::new(),
            read_delay,
            hang_history,
            cycles_entered: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PipelineQueries for SlowStore {
    async fn account_counts(&self) -> Result<AccountCounts> {
        self.inner.account_counts().await
    }

    async fn active_accounts(&self) -> Result<Vec<AccountLinkage>> {
        // First query of every cycle
        self.cycles_entered.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.read_delay).await;
        self.inner.active_accounts().await
    }

    async fn latest_sync_by_source(&self) -> Result<Vec<(SyncSource, DateTime<Utc>)>> {
        self.inner.latest_sync_by_source().await
    }

    async fn deal_count(&self) -> Result<u64> {
        self.inner.deal_count().await
    }

    async fn deal_fields(&self) -> Result<Vec<String>> {
        self.inner.deal_fields().await
    }
}

#[async_trait]
impl HealthHistory for SlowStore {
    async fn record_health(&self, result: &HealthCheckResult) -> Result<()> {
        if self.hang_history {
            std::future::pending::<()>().await;
        }
        self.inner.record_health(result).await
    }

    async fn prune_health(&self, before: DateTime<Utc>) -> Result<u64> {
        self.inner.prune_health(before).await
    }
}

#[tokio::test]
async fn hung_history_write_releases_the_cycle() {
    let store = Arc::new(SlowStore::new(Duration::ZERO, true));
    let config = WatchdogConfig {
        cycle_deadline_secs: 1,
        ..config()
    };
    let watchdog = PipelineWatchdog::new(&config, store.clone(), None, Arc::new(RecordingNotifier::default()));

    let started = Instant::now();
    let first = watchdog.run_cycle().await;
    assert!(first.is_some());
    assert!(started.elapsed() < Duration::from_secs(4), "cycle took {:?}", started.elapsed());

    // The lock is free again, so the next cycle runs instead of being skipped
    assert!(watchdog.run_cycle().await.is_some());
    assert_eq!(store.cycles_entered.load(Ordering::SeqCst), 2);
}

/// Ticks at 0s, 1s and 2s; the first cycle is still running at 1s
#[tokio::test]
async fn scheduler_skips_ticks_while_a_cycle_runs() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(1500), false));
    let config = WatchdogConfig {
        interval_secs: 1,
        ..config()
    };
    let watchdog = Arc::new(PipelineWatchdog::new(
        &config,
        store.clone(),
        None,
        Arc::new(RecordingNotifier::default()),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = Arc::clone(&watchdog).start(shutdown_rx);
    tokio::time::sleep(Duration::from_millis(2600)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(store.cycles_entered.load(Ordering::SeqCst), 2);
    assert_eq!(store.inner.health_results().await.len(), 2);
    assert_eq!(watchdog.consecutive_failures(), 2);
}

/// The reason text changes every cycle; the alert still goes out once per window
#[tokio::test]
async fn persistent_failure_alerts_once_per_window() {
    let alerts = Arc::new(AlertManager::new(3600));
    let trigger: Arc<dyn RemediationTrigger> = Arc::new(RecordingTrigger::default());
    let watchdog = PipelineWatchdog::new(
        &config(),
        Arc::new(MemoryStore::new()),
        Some(trigger),
        alerts.clone(),
    );

    for _ in 0..3 {
        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(report.remediation, RemediationStatus::Triggered);
    }

    let suppressed = alerts.suppressed_counts().await;
    assert_eq!(suppressed.len(), 1);
    assert_eq!(suppressed.values().sum::<u32>(), 2);
}
