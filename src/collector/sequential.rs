//! Sequential multi-account collector
//!
//! Time-shares one single-session terminal across an ordered account list:
//! initialize once, then login, pull and persist each account in turn.

use chrono::{Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{AccountCredentials, CollectorConfig};
use crate::domain::{
    return_pct, AccountOutcome, AccountResult, AccountSnapshot, CollectedAccount, DealsSummary,
    FailureStage, PortfolioReport, SyncSource, UpsertOutcome,
};
use crate::error::{Result, TradeSyncError};
use crate::persistence::SnapshotStore;
use crate::terminal::TerminalSession;

/// Bound a terminal or store call; expiry maps to `Timeout`
async fn bounded<T>(what: &str, limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TradeSyncError::Timeout(format!(
            "{what} exceeded {}s",
            limit.as_secs_f64()
        ))),
    }
}

type StageResult<T> = std::result::Result<T, (FailureStage, TradeSyncError)>;

fn at<T>(stage: FailureStage, result: Result<T>) -> StageResult<T> {
    result.map_err(|e| (stage, e))
}

pub struct SequentialCollector<T: TerminalSession> {
    terminal: T,
    store: Arc<dyn SnapshotStore>,
    min_login_interval: Duration,
    call_timeout: Duration,
    deal_window_days: u32,
    initialized: bool,
    /// Start of the most recent login call, across runs
    last_login_started: Option<Instant>,
}

impl<T: TerminalSession> SequentialCollector<T> {
    pub fn new(terminal: T, store: Arc<dyn SnapshotStore>, config: &CollectorConfig) -> Self {
        Self {
            terminal,
            store,
            min_login_interval: config.min_login_interval(),
            call_timeout: config.call_timeout(),
            deal_window_days: config.deal_window_days,
            initialized: false,
            last_login_started: None,
        }
    }

    pub fn terminal(&self) -> &T {
        &self.terminal
    }

    /// Collect every account in order. Always returns one result per input
    /// account; individual failures are recorded, never propagated.
    #[instrument(skip_all, fields(accounts = accounts.len(), platform = %self.terminal.platform()))]
    pub async fn collect_all(&mut self, accounts: &[AccountCredentials]) -> PortfolioReport {
        let platform = self.terminal.platform();

        if let Err(e) = self.ensure_initialized().await {
            error!("Terminal initialization failed: {}", e);
            let message = e.to_string();
            let results = accounts
                .iter()
                .map(|creds| failed(creds, FailureStage::Initialize, message.clone()))
                .collect();
            return PortfolioReport::from_results(platform, results);
        }

        let mut results = Vec::with_capacity(accounts.len());
        for (index, creds) in accounts.iter().enumerate() {
            let result = match self.collect_one(creds).await {
                Ok(collected) => {
                    info!(
                        login = creds.login,
                        position = index + 1,
                        equity = %collected.equity,
                        return_pct = %collected.return_pct,
                        "Account collected"
                    );
                    AccountResult {
                        login: creds.login,
                        server: creds.server.clone(),
                        fund_code: creds.fund_code.clone(),
                        allocated_amount: creds.allocated_amount,
                        outcome: AccountOutcome::Collected(collected),
                    }
                }
                Err((stage, e)) => {
                    warn!(login = creds.login, position = index + 1, stage = %stage, "Account failed: {}", e);
                    failed(creds, stage, e.to_string())
                }
            };
            results.push(result);
        }

        let report = PortfolioReport::from_results(platform, results);
        info!(
            collected = report.collected_count(),
            failed = report.failed_count(),
            total_equity = %report.total_equity,
            "Collection run finished"
        );
        report
    }

    async fn ensure_initialized(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let limit = self.call_timeout;
        bounded("initialize", limit, self.terminal.initialize()).await?;
        self.initialized = true;
        info!("Terminal initialized");
        Ok(())
    }

    /// Wait until `min_login_interval` has passed since the previous login started
    async fn pace_login(&mut self) {
        if let Some(previous) = self.last_login_started {
            let ready_at = previous + self.min_login_interval;
            if ready_at > Instant::now() {
                debug!("Waiting {:?} before next login", ready_at - Instant::now());
                sleep_until(ready_at).await;
            }
        }
        self.last_login_started = Some(Instant::now());
    }

    async fn ensure_logged_in(&mut self, creds: &AccountCredentials) -> Result<()> {
        let limit = self.call_timeout;
        match bounded("current login", limit, self.terminal.current_login()).await {
            Ok(Some(active)) if active == creds.login => {
                debug!(login = creds.login, "Already logged in, skipping login");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => debug!("Could not read active login, logging in anyway: {}", e),
        }

        self.pace_login().await;
        bounded(
            "login",
            limit,
            self.terminal.login(creds.login, &creds.secret, &creds.server),
        )
        .await
    }

    async fn collect_one(&mut self, creds: &AccountCredentials) -> StageResult<CollectedAccount> {
        let limit = self.call_timeout;
        let platform = self.terminal.platform();

        at(FailureStage::Login, self.ensure_logged_in(creds).await)?;

        let info = at(
            FailureStage::AccountInfo,
            bounded("account info", limit, self.terminal.account_info()).await,
        )?;
        if info.login != creds.login {
            return Err((
                FailureStage::AccountInfo,
                TradeSyncError::Validation(format!(
                    "terminal reports login {} while collecting {}",
                    info.login, creds.login
                )),
            ));
        }

        let positions = at(
            FailureStage::Positions,
            bounded("positions", limit, self.terminal.positions()).await,
        )?;

        let to = Utc::now();
        let from = to - ChronoDuration::days(i64::from(self.deal_window_days));
        let deals = at(
            FailureStage::DealHistory,
            bounded("deal history", limit, self.terminal.deal_history(from, to)).await,
        )?;

        let summary = DealsSummary::from_deals(&deals, self.deal_window_days);
        let open_positions = positions.len();
        let snapshot = AccountSnapshot::from_account_info(
            platform,
            SyncSource::SequentialCollector,
            &info,
            positions,
            summary.clone(),
            Utc::now(),
        )
        .with_allocation(&creds.fund_code, creds.allocated_amount);

        let outcome = at(
            FailureStage::Persist,
            bounded("snapshot upsert", limit, self.store.upsert_snapshot(&snapshot)).await,
        )?;
        if let UpsertOutcome::Stale { stored } = outcome {
            warn!(key = %snapshot.key(), %stored, "Stored snapshot is newer, keeping it");
        }
        at(
            FailureStage::Persist,
            bounded(
                "deal upsert",
                limit,
                self.store.upsert_deals(info.login, platform, &deals),
            )
            .await,
        )?;

        Ok(CollectedAccount {
            balance: snapshot.balance,
            equity: snapshot.equity,
            floating_profit: snapshot.floating_profit,
            margin_used: snapshot.margin_used,
            margin_free: snapshot.margin_free,
            return_pct: return_pct(snapshot.floating_profit, creds.allocated_amount),
            open_positions,
            deals: summary,
        })
    }
}

fn failed(creds: &AccountCredentials, stage: FailureStage, error: String) -> AccountResult {
    AccountResult {
        login: creds.login,
        server: creds.server.clone(),
        fund_code: creds.fund_code.clone(),
        allocated_amount: creds.allocated_amount,
        outcome: AccountOutcome::Failed { stage, error },
    }
}
