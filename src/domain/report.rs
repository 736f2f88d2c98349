use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

use super::{DealsSummary, Platform};
use crate::error::TradeSyncError;

/// `profit / allocated * 100`, zero when nothing is allocated.
///
/// Saturates at the Decimal range when a tiny allocation would overflow.
pub fn return_pct(profit: Decimal, allocated: Decimal) -> Decimal {
    if allocated.is_zero() {
        return Decimal::ZERO;
    }
    profit
        .checked_div(allocated)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or_else(|| {
            if profit.is_sign_negative() != allocated.is_sign_negative() {
                Decimal::MIN
            } else {
                Decimal::MAX
            }
        })
}

/// Step of the per-account collection that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Initialize,
    Login,
    AccountInfo,
    Positions,
    DealHistory,
    Persist,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureStage::Initialize => "initialize",
            FailureStage::Login => "login",
            FailureStage::AccountInfo => "account_info",
            FailureStage::Positions => "positions",
            FailureStage::DealHistory => "deal_history",
            FailureStage::Persist => "persist",
        };
        write!(f, "{s}")
    }
}

/// Figures of a successfully collected account
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectedAccount {
    pub balance: Decimal,
    pub equity: Decimal,
    pub floating_profit: Decimal,
    pub margin_used: Decimal,
    pub margin_free: Decimal,
    pub return_pct: Decimal,
    pub open_positions: usize,
    pub deals: DealsSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AccountOutcome {
    Collected(CollectedAccount),
    Failed { stage: FailureStage, error: String },
}

/// One entry per input account, in input order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountResult {
    pub login: i64,
    pub server: String,
    pub fund_code: String,
    pub allocated_amount: Decimal,
    pub outcome: AccountOutcome,
}

impl AccountResult {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, AccountOutcome::Failed { .. })
    }

    pub fn collected(&self) -> Option<&CollectedAccount> {
        match &self.outcome {
            AccountOutcome::Collected(c) => Some(c),
            AccountOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FundRollup {
    pub accounts: usize,
    pub allocated: Decimal,
    pub equity: Decimal,
    pub profit: Decimal,
    pub return_pct: Decimal,
}

/// Consolidated multi-account report; totals cover collected accounts only
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioReport {
    pub generated_at: DateTime<Utc>,
    pub platform: Platform,
    pub total_allocated: Decimal,
    pub total_equity: Decimal,
    pub total_profit: Decimal,
    pub overall_return_pct: Decimal,
    pub funds: BTreeMap<String, FundRollup>,
    pub accounts: Vec<AccountResult>,
}

impl PortfolioReport {
    pub fn from_results(platform: Platform, accounts: Vec<AccountResult>) -> Self {
        let mut total_allocated = Decimal::ZERO;
        let mut total_equity = Decimal::ZERO;
        let mut total_profit = Decimal::ZERO;
        let mut funds: BTreeMap<String, FundRollup> = BTreeMap::new();

        for result in &accounts {
            let Some(collected) = result.collected() else {
                continue;
            };
            total_allocated += result.allocated_amount;
            total_equity += collected.equity;
            total_profit += collected.floating_profit;

            let fund = funds.entry(result.fund_code.clone()).or_default();
            fund.accounts += 1;
            fund.allocated += result.allocated_amount;
            fund.equity += collected.equity;
            fund.profit += collected.floating_profit;
        }

        for fund in funds.values_mut() {
            fund.return_pct = return_pct(fund.profit, fund.allocated);
        }

        Self {
            generated_at: Utc::now(),
            platform,
            total_allocated,
            total_equity,
            total_profit,
            overall_return_pct: return_pct(total_profit, total_allocated),
            funds,
            accounts,
        }
    }

    pub fn failed_count(&self) -> usize {
        self.accounts.iter().filter(|a| a.is_failed()).count()
    }

    pub fn collected_count(&self) -> usize {
        self.accounts.len() - self.failed_count()
    }

    /// `PartialBatchFailure` when any account failed
    pub fn partial_failure(&self) -> Option<TradeSyncError> {
        let failed = self.failed_count();
        (failed > 0).then(|| TradeSyncError::PartialBatchFailure {
            failed,
            total: self.accounts.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn return_pct_saturates_instead_of_overflowing() {
        assert_eq!(return_pct(dec!(30), dec!(1500)), dec!(2));
        assert_eq!(return_pct(dec!(5), Decimal::ZERO), Decimal::ZERO);
        let tiny = Decimal::new(1, 28);
        assert_eq!(return_pct(Decimal::MAX, tiny), Decimal::MAX);
        assert_eq!(return_pct(-Decimal::MAX, tiny), Decimal::MIN);
    }

    fn collected(login: i64, fund: &str, allocated: Decimal, equity: Decimal, profit: Decimal) -> AccountResult {
        AccountResult {
            login,
            server: "Srv".into(),
            fund_code: fund.into(),
            allocated_amount: allocated,
            outcome: AccountOutcome::Collected(CollectedAccount {
                balance: equity - profit,
                equity,
                floating_profit: profit,
                margin_used: Decimal::ZERO,
                margin_free: equity,
                return_pct: return_pct(profit, allocated),
                open_positions: 0,
                deals: DealsSummary::empty(30),
            }),
        }
    }

    #[test]
    fn return_pct_guards_zero_allocation() {
        assert_eq!(return_pct(dec!(50), dec!(0)), Decimal::ZERO);
        assert_eq!(return_pct(dec!(50), dec!(1000)), dec!(5));
        assert_eq!(return_pct(dec!(-25), dec!(500)), dec!(-5));
    }

    #[test]
    fn totals_skip_failed_accounts_and_roll_up_by_fund() {
        let failed = AccountResult {
            login: 2,
            server: "Srv".into(),
            fund_code: "A".into(),
            allocated_amount: dec!(5000),
            outcome: AccountOutcome::Failed {
                stage: FailureStage::Login,
                error: "invalid account".into(),
            },
        };
        let report = PortfolioReport::from_results(
            Platform::Mt5,
            vec![
                collected(1, "A", dec!(1000), dec!(1100), dec!(100)),
                failed,
                collected(3, "B", dec!(2000), dec!(1900), dec!(-100)),
                collected(4, "A", dec!(1000), dec!(1050), dec!(50)),
            ],
        );

        assert_eq!(report.accounts.len(), 4);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.total_allocated, dec!(4000));
        assert_eq!(report.total_equity, dec!(4050));
        assert_eq!(report.total_profit, dec!(50));
        assert_eq!(report.overall_return_pct, dec!(1.25));

        let fund_a = &report.funds["A"];
        assert_eq!(fund_a.accounts, 2);
        assert_eq!(fund_a.equity, dec!(2150));
        assert_eq!(fund_a.profit, dec!(150));
        assert_eq!(fund_a.return_pct, dec!(7.5));
        assert!(matches!(
            report.partial_failure(),
            Some(TradeSyncError::PartialBatchFailure { failed: 1, total: 4 })
        ));
    }
}
