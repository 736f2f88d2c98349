//! Streaming ingest bridge
//!
//! One bridge owns one terminal link for one account. The receive loop is the
//! only code that touches the link; the periodic self-check runs as its own task
//! and hands commands to the loop over a channel.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::domain::{AccountSnapshot, DealsSummary, Platform, SyncSource, UpsertOutcome};
use crate::error::{Result, TradeSyncError};
use crate::persistence::SnapshotStore;
use crate::services::metrics::BridgeMetrics;
use crate::terminal::protocol::{account_payload, decode_account, parse_frame, payload_account_id, Inbound};
use crate::terminal::{InboundFrame, TerminalCommand, TerminalLink};

/// Reported equity may differ from balance + floating profit by rounding only
const EQUITY_DRIFT_TOLERANCE: Decimal = dec!(0.01);

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Written,
    /// Older than the stored snapshot
    Stale,
    /// Account push for another account
    Foreign { account_id: Option<i64> },
    Invalid(String),
    /// Status broadcast or reply without account data
    Informational,
    StoreError(String),
}

pub struct StreamingBridge<L: TerminalLink> {
    link: L,
    store: Arc<dyn SnapshotStore>,
    account_id: i64,
    platform: Platform,
    poll_timeout: Duration,
    liveness_window: Duration,
    self_check_interval: Duration,
    /// Upper bound of one snapshot write
    store_timeout: Duration,
    metrics: Arc<BridgeMetrics>,
}

impl<L: TerminalLink> StreamingBridge<L> {
    pub fn new(link: L, store: Arc<dyn SnapshotStore>, config: &BridgeConfig, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            link,
            store,
            account_id: config.account_id,
            platform: config.platform,
            poll_timeout: config.poll_timeout(),
            liveness_window: config.liveness_window(),
            self_check_interval: config.self_check_interval(),
            store_timeout: config.request_timeout(),
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Validate an account payload and upsert it under the monotonic guard
    pub async fn upsert_snapshot(&self, payload: &Value) -> Result<UpsertOutcome> {
        let push = decode_account(payload)?;

        let drift = push.info.equity_drift();
        if drift > EQUITY_DRIFT_TOLERANCE {
            warn!(
                account_id = push.info.login,
                reported = %push.info.equity,
                derived = %push.info.derived_equity(),
                "Reported equity drifts from balance + floating profit, storing derived value"
            );
        }

        let synced_at = push.timestamp.unwrap_or_else(Utc::now);
        let snapshot = AccountSnapshot::from_account_info(
            self.platform,
            SyncSource::StreamingBridge,
            &push.info,
            push.positions,
            push.deals.unwrap_or_else(|| DealsSummary::empty(0)),
            synced_at,
        );
        self.store.upsert_snapshot(&snapshot).await
    }

    /// Route one inbound frame. Never fails: every problem is logged and counted.
    pub async fn handle_frame(&self, frame: InboundFrame) -> IngestOutcome {
        self.metrics.record_message().await;

        let raw = match frame {
            InboundFrame::Data(raw) => raw,
            InboundFrame::Broadcast(raw) => {
                debug!(status = %raw, "Terminal broadcast");
                return IngestOutcome::Informational;
            }
        };

        let inbound = match parse_frame(&raw) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.metrics.inc_validation_failure();
                warn!("Discarding malformed frame: {}", e);
                return IngestOutcome::Invalid(e.to_string());
            }
        };

        let Some(payload) = account_payload(&inbound) else {
            if let Inbound::Reply(reply) = &inbound {
                if !reply.ok {
                    warn!(error = ?reply.error, "Terminal rejected a command");
                }
            }
            return IngestOutcome::Informational;
        };

        let pushed_for = payload_account_id(payload);
        if pushed_for != Some(self.account_id) {
            self.metrics.inc_foreign();
            warn!(
                expected = self.account_id,
                received = ?pushed_for,
                "Discarding push for unexpected account"
            );
            return IngestOutcome::Foreign {
                account_id: pushed_for,
            };
        }

        let upserted = tokio::time::timeout(self.store_timeout, self.upsert_snapshot(payload))
            .await
            .unwrap_or_else(|_| {
                Err(TradeSyncError::Timeout(format!(
                    "snapshot write exceeded {}ms",
                    self.store_timeout.as_millis()
                )))
            });
        match upserted {
            Ok(UpsertOutcome::Written) => {
                self.metrics.inc_written();
                debug!(account_id = self.account_id, "Snapshot written");
                IngestOutcome::Written
            }
            Ok(UpsertOutcome::Stale { stored }) => {
                self.metrics.inc_stale();
                debug!(account_id = self.account_id, %stored, "Out-of-order push ignored");
                IngestOutcome::Stale
            }
            Err(TradeSyncError::Validation(msg)) => {
                self.metrics.inc_validation_failure();
                warn!(account_id = self.account_id, "Rejected push: {}", msg);
                IngestOutcome::Invalid(msg)
            }
            Err(e) => {
                self.metrics.inc_error();
                error!(account_id = self.account_id, "Snapshot upsert failed: {}", e);
                IngestOutcome::StoreError(e.to_string())
            }
        }
    }

    async fn send(&mut self, command: TerminalCommand) {
        match self.link.send_command(&command).await {
            Ok(()) => {
                if matches!(command, TerminalCommand::GetAccountInfo) {
                    self.metrics.inc_self_check();
                }
            }
            Err(e) => {
                self.metrics.inc_error();
                warn!(command = ?command, "Failed to send command: {}", e);
            }
        }
    }

    /// Run until `shutdown` flips to true.
    ///
    /// Each receive waits at most `poll_timeout`; silence longer than the
    /// liveness window marks the bridge degraded but never stops it.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (commands_tx, mut commands) = mpsc::channel::<TerminalCommand>(8);
        let self_check = spawn_self_check(self.self_check_interval, commands_tx, shutdown.clone());

        info!(
            account_id = self.account_id,
            platform = %self.platform,
            "Streaming bridge started"
        );

        // Pull a first state right away instead of waiting for the first push
        self.send(TerminalCommand::GetAccountInfo).await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(command) = commands.recv() => {
                    self.send(command).await;
                }
                received = self.link.recv(self.poll_timeout) => {
                    match received {
                        Ok(Some(frame)) => {
                            self.handle_frame(frame).await;
                        }
                        Ok(None) => {
                            self.metrics.check_liveness(self.liveness_window).await;
                        }
                        Err(e) => {
                            self.metrics.inc_error();
                            error!("Terminal receive failed: {}", e);
                            self.metrics.check_liveness(self.liveness_window).await;
                            tokio::time::sleep(self.poll_timeout).await;
                        }
                    }
                }
            }
        }

        self_check.abort();
        info!("Streaming bridge stopped: {}", self.metrics.summary().await);
        Ok(())
    }
}

/// Periodically queue an account-info request to catch silent disconnects
fn spawn_self_check(
    interval: Duration,
    commands: mpsc::Sender<TerminalCommand>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately; the loop already sent one request
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Queueing self-check");
                    if commands.send(TerminalCommand::GetAccountInfo).await.is_err() {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::config::TerminalEndpoint;
    use crate::domain::SnapshotKey;
    use async_trait::async_trait;
    use serde_json::json;

    struct NullLink;

    #[async_trait]
    impl TerminalLink for NullLink {
        async fn send_command(&mut self, _command: &TerminalCommand) -> Result<()> {
            Ok(())
        }

        async fn recv(&mut self, timeout: Duration) -> Result<Option<InboundFrame>> {
            tokio::time::sleep(timeout).await;
            Ok(None)
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig {
            terminal: TerminalEndpoint::default(),
            account_id: 123,
            platform: Platform::Mt4,
            poll_timeout_ms: 10,
            liveness_window_secs: 900,
            self_check_interval_secs: 300,
            request_timeout_ms: 100,
            health_port: None,
        }
    }

    fn bridge(store: Arc<MemoryStore>) -> StreamingBridge<NullLink> {
        StreamingBridge::new(NullLink, store, &config(), Arc::new(BridgeMetrics::new()))
    }

    fn push(account_id: i64, timestamp: &str, balance: f64, profit: f64) -> InboundFrame {
        InboundFrame::Data(
            json!({
                "type": "account",
                "account_id": account_id,
                "server": "Broker-Live",
                "currency": "USD",
                "leverage": 100,
                "balance": balance,
                "equity": balance + profit,
                "margin": 0.0,
                "free_margin": balance + profit,
                "profit": profit,
                "timestamp": timestamp
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn drifting_equity_is_stored_derived() {
        let store = Arc::new(MemoryStore::new());
        let bridge = bridge(Arc::clone(&store));
        let frame = InboundFrame::Data(
            json!({
                "type": "account",
                "account_id": 123,
                "balance": 1000.0,
                "equity": 1500.0,
                "margin": 0.0,
                "free_margin": 1000.0,
                "profit": 25.5
            })
            .to_string(),
        );

        assert_eq!(bridge.handle_frame(frame).await, IngestOutcome::Written);
        let stored = store
            .get_snapshot(SnapshotKey { account_id: 123, platform: Platform::Mt4 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.equity, dec!(1025.5));
        assert_eq!(stored.source, SyncSource::StreamingBridge);
    }

    #[tokio::test]
    async fn out_of_order_push_is_counted_stale() {
        let store = Arc::new(MemoryStore::new());
        let bridge = bridge(Arc::clone(&store));

        let newer = push(123, "2024-05-01T10:05:00Z", 2000.0, 0.0);
        let older = push(123, "2024-05-01T10:00:00Z", 1000.0, 0.0);
        assert_eq!(bridge.handle_frame(newer).await, IngestOutcome::Written);
        assert_eq!(bridge.handle_frame(older).await, IngestOutcome::Stale);

        let stored = store
            .get_snapshot(SnapshotKey { account_id: 123, platform: Platform::Mt4 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.balance, dec!(2000));
        assert_eq!(bridge.metrics.snapshot().await.stale_rejected, 1);
    }

    #[tokio::test]
    async fn broadcasts_and_plain_replies_are_informational() {
        let bridge = bridge(Arc::new(MemoryStore::new()));
        let status = InboundFrame::Broadcast(r#"{"type":"status","state":"connected"}"#.into());
        assert_eq!(bridge.handle_frame(status).await, IngestOutcome::Informational);

        let reply = InboundFrame::Data(r#"{"type":"reply","ok":false,"error":"busy"}"#.into());
        assert_eq!(bridge.handle_frame(reply).await, IngestOutcome::Informational);
        assert_eq!(bridge.metrics.snapshot().await.messages_received, 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let bridge = bridge(Arc::new(MemoryStore::new()));
        let metrics = bridge.metrics();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(bridge.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(metrics.snapshot().await.self_checks_sent, 1);
    }
}
