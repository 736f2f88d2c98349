//! Output formatting for CLI commands.
//!
//! Supports two modes: human-readable tables (default) and JSON (--json).

use rust_decimal::Decimal;
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::domain::{AccountOutcome, PortfolioReport};
use crate::supervisor::{CycleReport, RemediationStatus};

/// Output mode for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Print a vec of Tabled + Serialize items in the chosen mode.
pub fn print_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Table => {
            if items.is_empty() {
                println!("(no results)");
            } else {
                println!("{}", Table::new(items));
            }
        }
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

fn money(value: Decimal) -> String {
    value.round_dp(2).to_string()
}

fn pct(value: Decimal) -> String {
    format!("{}%", value.round_dp(2))
}

#[derive(Tabled, Serialize)]
pub struct AccountRow {
    pub login: i64,
    pub server: String,
    pub fund: String,
    pub allocated: String,
    pub equity: String,
    pub profit: String,
    #[tabled(rename = "return")]
    pub return_pct: String,
    pub positions: String,
    pub deals: String,
    pub status: String,
}

#[derive(Tabled, Serialize)]
pub struct FundRow {
    pub fund: String,
    pub accounts: usize,
    pub allocated: String,
    pub equity: String,
    pub profit: String,
    #[tabled(rename = "return")]
    pub return_pct: String,
}

#[derive(Tabled, Serialize)]
pub struct CheckRow {
    pub check: String,
    pub healthy: bool,
    pub message: String,
}

pub fn account_rows(report: &PortfolioReport) -> Vec<AccountRow> {
    report
        .accounts
        .iter()
        .map(|account| {
            let (equity, profit, return_pct, positions, deals, status) = match &account.outcome {
                AccountOutcome::Collected(c) => (
                    money(c.equity),
                    money(c.floating_profit),
                    pct(c.return_pct),
                    c.open_positions.to_string(),
                    c.deals.count.to_string(),
                    "ok".to_string(),
                ),
                AccountOutcome::Failed { stage, error } => (
                    "-".into(),
                    "-".into(),
                    "-".into(),
                    "-".into(),
                    "-".into(),
                    format!("FAILED at {stage}: {error}"),
                ),
            };
            AccountRow {
                login: account.login,
                server: account.server.clone(),
                fund: account.fund_code.clone(),
                allocated: money(account.allocated_amount),
                equity,
                profit,
                return_pct,
                positions,
                deals,
                status,
            }
        })
        .collect()
}

pub fn fund_rows(report: &PortfolioReport) -> Vec<FundRow> {
    report
        .funds
        .iter()
        .map(|(code, fund)| FundRow {
            fund: code.clone(),
            accounts: fund.accounts,
            allocated: money(fund.allocated),
            equity: money(fund.equity),
            profit: money(fund.profit),
            return_pct: pct(fund.return_pct),
        })
        .collect()
}

pub fn print_report(report: &PortfolioReport, mode: OutputMode) -> anyhow::Result<()> {
    if mode == OutputMode::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "Portfolio report ({}, {})",
        report.platform,
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    print_items(&account_rows(report), mode)?;
    println!();
    print_items(&fund_rows(report), mode)?;
    println!();
    println!(
        "Total allocated: {} | equity: {} | profit: {} | return: {}",
        money(report.total_allocated),
        money(report.total_equity),
        money(report.total_profit),
        pct(report.overall_return_pct)
    );
    if report.failed_count() > 0 {
        print_warn(&format!(
            "{} of {} accounts failed",
            report.failed_count(),
            report.accounts.len()
        ));
    }
    Ok(())
}

pub fn print_cycle(report: &CycleReport, mode: OutputMode) -> anyhow::Result<()> {
    if mode == OutputMode::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let rows: Vec<CheckRow> = report
        .result
        .components
        .iter()
        .map(|(name, outcome)| CheckRow {
            check: name.clone(),
            healthy: outcome.healthy,
            message: outcome.message.clone(),
        })
        .collect();
    print_items(&rows, mode)?;

    let verdict = format!("Verdict: {}", report.result.verdict);
    if report.result.overall_healthy {
        print_success(&verdict);
    } else {
        print_warn(&format!(
            "{verdict} (consecutive unhealthy cycles: {})",
            report.consecutive_failures
        ));
    }
    match &report.remediation {
        RemediationStatus::NotNeeded => {}
        RemediationStatus::Triggered => println!("Remediation: triggered"),
        RemediationStatus::NotConfigured => println!("Remediation: not configured"),
        RemediationStatus::Failed(e) => print_error(&format!("Remediation failed: {e}")),
    }
    Ok(())
}

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("\x1b[32m{msg}\x1b[0m");
}

/// Print a warning message.
pub fn print_warn(msg: &str) {
    println!("\x1b[33m{msg}\x1b[0m");
}

/// Print an error message.
pub fn print_error(msg: &str) {
    eprintln!("\x1b[31m{msg}\x1b[0m");
}
