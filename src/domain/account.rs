use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Trading-terminal generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Mt4,
    Mt5,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Mt4 => "mt4",
            Platform::Mt5 => "mt5",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mt4" | "metatrader4" => Ok(Platform::Mt4),
            "mt5" | "metatrader5" => Ok(Platform::Mt5),
            other => Err(format!("invalid platform '{other}'; expected mt4|mt5")),
        }
    }
}

/// Which producer wrote a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncSource {
    StreamingBridge,
    SequentialCollector,
}

impl SyncSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncSource::StreamingBridge => "streaming-bridge",
            SyncSource::SequentialCollector => "sequential-collector",
        }
    }
}

impl std::fmt::Display for SyncSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncSource {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "streaming-bridge" => Ok(SyncSource::StreamingBridge),
            "sequential-collector" => Ok(SyncSource::SequentialCollector),
            other => Err(format!("invalid sync source '{other}'")),
        }
    }
}

/// Position or deal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "buy",
            Direction::Sell => "sell",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" | "0" => Ok(Direction::Buy),
            "sell" | "1" => Ok(Direction::Sell),
            other => Err(format!("invalid direction '{other}'")),
        }
    }
}

/// Open position as reported by the terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub current_price: Decimal,
    pub profit: Decimal,
}

/// Closed deal from the terminal history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub ticket: i64,
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub price: Decimal,
    pub profit: Decimal,
    #[serde(default)]
    pub commission: Decimal,
    #[serde(default)]
    pub swap: Decimal,
    pub closed_at: DateTime<Utc>,
}

impl Deal {
    /// Profit after commission and swap
    pub fn net_profit(&self) -> Decimal {
        self.profit + self.commission + self.swap
    }
}

/// Rolling deal-history aggregate stored with the snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealsSummary {
    pub count: u32,
    pub net_profit: Decimal,
    pub window_days: u32,
}

impl DealsSummary {
    pub fn empty(window_days: u32) -> Self {
        Self {
            count: 0,
            net_profit: Decimal::ZERO,
            window_days,
        }
    }

    pub fn from_deals(deals: &[Deal], window_days: u32) -> Self {
        Self {
            count: deals.len() as u32,
            net_profit: deals.iter().map(Deal::net_profit).sum(),
            window_days,
        }
    }
}

/// Decimal places kept for money figures; matches the NUMERIC(24, 8) columns
pub const MONEY_SCALE: u32 = 8;

/// Account-level figures reported by a terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub login: i64,
    pub server: String,
    pub currency: String,
    pub leverage: u32,
    pub balance: Decimal,
    /// Terminal-reported equity; the stored value is always derived
    pub equity: Decimal,
    pub margin_used: Decimal,
    pub margin_free: Decimal,
    pub floating_profit: Decimal,
}

impl AccountInfo {
    pub fn derived_equity(&self) -> Decimal {
        self.balance + self.floating_profit
    }

    /// Difference between reported and derived equity
    pub fn equity_drift(&self) -> Decimal {
        (self.equity - self.derived_equity()).abs()
    }
}

/// Store key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotKey {
    pub account_id: i64,
    pub platform: Platform,
}

impl std::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.platform, self.account_id)
    }
}

/// Canonical per-account state
///
/// Linkage fields (`fund_code`, `allocated_amount`, `manager_id`, `active`) are owned by
/// external workflows. `None` means "not reported by this producer": an upsert keeps
/// whatever the store already holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: i64,
    pub platform: Platform,
    pub server: String,
    pub currency: String,
    pub leverage: u32,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin_used: Decimal,
    pub margin_free: Decimal,
    pub floating_profit: Decimal,
    pub fund_code: Option<String>,
    pub allocated_amount: Option<Decimal>,
    pub manager_id: Option<String>,
    pub active: Option<bool>,
    pub open_positions: Vec<OpenPosition>,
    pub recent_deals_summary: DealsSummary,
    pub last_synced_at: DateTime<Utc>,
    pub source: SyncSource,
}

impl AccountSnapshot {
    /// Build a snapshot from terminal figures; equity is `balance + floating_profit`.
    ///
    /// Figures are rounded to `MONEY_SCALE` first so the stored equity still
    /// equals the stored sum after the database applies its column scale.
    pub fn from_account_info(
        platform: Platform,
        source: SyncSource,
        info: &AccountInfo,
        open_positions: Vec<OpenPosition>,
        recent_deals_summary: DealsSummary,
        last_synced_at: DateTime<Utc>,
    ) -> Self {
        let balance = info.balance.round_dp(MONEY_SCALE);
        let floating_profit = info.floating_profit.round_dp(MONEY_SCALE);
        Self {
            account_id: info.login,
            platform,
            server: info.server.clone(),
            currency: info.currency.clone(),
            leverage: info.leverage,
            balance,
            equity: balance + floating_profit,
            margin_used: info.margin_used.round_dp(MONEY_SCALE),
            margin_free: info.margin_free.round_dp(MONEY_SCALE),
            floating_profit,
            fund_code: None,
            allocated_amount: None,
            manager_id: None,
            active: None,
            open_positions,
            recent_deals_summary,
            last_synced_at,
            source,
        }
    }

    pub fn with_allocation(mut self, fund_code: &str, allocated_amount: Decimal) -> Self {
        self.fund_code = Some(fund_code.to_string());
        self.allocated_amount = Some(allocated_amount);
        self
    }

    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            account_id: self.account_id,
            platform: self.platform,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.equity == self.balance + self.floating_profit
    }
}

/// Result of a monotonic upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Written,
    /// Incoming `last_synced_at` was older than the stored one
    Stale { stored: DateTime<Utc> },
}

impl UpsertOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, UpsertOutcome::Written)
    }
}

/// Per-account projection read by the watchdog
#[derive(Debug, Clone, PartialEq)]
pub struct AccountLinkage {
    pub account_id: i64,
    pub platform: Platform,
    pub fund_code: Option<String>,
    pub allocated_amount: Option<Decimal>,
    pub manager_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn info() -> AccountInfo {
        AccountInfo {
            login: 123,
            server: "Broker-Live".into(),
            currency: "USD".into(),
            leverage: 100,
            balance: dec!(10000),
            equity: dec!(10150.5),
            margin_used: dec!(200),
            margin_free: dec!(9950.5),
            floating_profit: dec!(150.5),
        }
    }

    #[test]
    fn snapshot_equity_is_derived() {
        let mut reported = info();
        reported.equity = dec!(99999);
        let snap = AccountSnapshot::from_account_info(
            Platform::Mt5,
            SyncSource::SequentialCollector,
            &reported,
            vec![],
            DealsSummary::empty(30),
            Utc::now(),
        );
        assert_eq!(snap.equity, dec!(10150.5));
        assert!(snap.is_consistent());
        assert_eq!(reported.equity_drift(), dec!(89848.5));
    }

    #[test]
    fn sub_scale_figures_round_before_equity_is_derived() {
        let mut tiny = info();
        tiny.balance = dec!(0.000000015);
        tiny.floating_profit = dec!(0.000000025);
        tiny.margin_used = dec!(0.123456789);
        let snap = AccountSnapshot::from_account_info(
            Platform::Mt5,
            SyncSource::StreamingBridge,
            &tiny,
            vec![],
            DealsSummary::empty(0),
            Utc::now(),
        );
        // Banker's rounding: 1.5e-8 -> 2e-8, 2.5e-8 -> 2e-8
        assert_eq!(snap.balance, dec!(0.00000002));
        assert_eq!(snap.floating_profit, dec!(0.00000002));
        assert_eq!(snap.equity, dec!(0.00000004));
        assert_eq!(snap.margin_used, dec!(0.12345679));
        assert!(snap.is_consistent());
        for figure in [snap.balance, snap.equity, snap.margin_used, snap.floating_profit] {
            assert!(figure.scale() <= MONEY_SCALE);
        }
    }

    #[test]
    fn deals_summary_nets_commission_and_swap() {
        let deal = |ticket, profit, commission, swap| Deal {
            ticket,
            symbol: "EURUSD".into(),
            direction: Direction::Buy,
            volume: dec!(0.1),
            price: dec!(1.1),
            profit,
            commission,
            swap,
            closed_at: Utc::now(),
        };
        let summary = DealsSummary::from_deals(
            &[deal(1, dec!(10), dec!(-1), dec!(0)), deal(2, dec!(-4), dec!(-1), dec!(-0.5))],
            7,
        );
        assert_eq!(summary.count, 2);
        assert_eq!(summary.net_profit, dec!(3.5));
        assert_eq!(summary.window_days, 7);
    }

    #[test]
    fn platform_parses_aliases() {
        assert_eq!("MT4".parse::<Platform>().unwrap(), Platform::Mt4);
        assert_eq!("metatrader5".parse::<Platform>().unwrap(), Platform::Mt5);
        assert!("ctrader".parse::<Platform>().is_err());
    }

    #[test]
    fn sync_source_round_trips_through_str() {
        for source in [SyncSource::StreamingBridge, SyncSource::SequentialCollector] {
            assert_eq!(source.as_str().parse::<SyncSource>().unwrap(), source);
        }
    }
}
