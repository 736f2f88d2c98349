//! The five pipeline checks
//!
//! Each check is a pure function of store query results and the configured
//! expectations, so it can be exercised without a database. `run_checks` wires
//! them to a `PipelineQueries` implementation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::warn;

use crate::config::PipelineExpectations;
use crate::domain::{AccountLinkage, CheckName, CheckOutcome, SyncSource};
use crate::persistence::{AccountCounts, PipelineQueries};

/// Row floor plus field-naming convention of the deal collection
pub fn deal_volume_floor(count: u64, fields: &[String], expectations: &PipelineExpectations) -> CheckOutcome {
    let threshold = expectations.min_deal_rows;
    let present: BTreeSet<&str> = fields.iter().map(String::as_str).collect();
    let missing: Vec<&str> = expectations
        .deal_fields
        .iter()
        .map(String::as_str)
        .filter(|f| !present.contains(f))
        .collect();
    let legacy: Vec<&str> = expectations
        .legacy_deal_fields
        .iter()
        .map(String::as_str)
        .filter(|f| present.contains(f))
        .collect();

    let metrics = json!({
        "count": count,
        "threshold": threshold,
        "missing_fields": missing,
        "legacy_fields": legacy,
    });

    let mut problems = Vec::new();
    if count < threshold {
        problems.push(format!("{count} deal rows below floor {threshold}"));
    }
    if !missing.is_empty() {
        problems.push(format!("missing fields: {}", missing.join(", ")));
    }
    if !legacy.is_empty() {
        problems.push(format!("legacy field names present: {}", legacy.join(", ")));
    }

    if problems.is_empty() {
        CheckOutcome::pass(format!("{count} deal rows (floor {threshold})"), metrics)
    } else {
        CheckOutcome::fail(problems.join("; "), metrics)
    }
}

fn delta(actual: u64, expected: u64) -> i64 {
    actual as i64 - expected as i64
}

/// Total and active counts against expectations, reported with deltas
pub fn expected_account_count(counts: AccountCounts, expectations: &PipelineExpectations) -> CheckOutcome {
    let total_delta = delta(counts.total, expectations.expected_total_accounts);
    let active_delta = delta(counts.active, expectations.expected_active_accounts);
    let metrics = json!({
        "total": counts.total,
        "expected_total": expectations.expected_total_accounts,
        "total_delta": total_delta,
        "active": counts.active,
        "expected_active": expectations.expected_active_accounts,
        "active_delta": active_delta,
    });

    if total_delta == 0 && active_delta == 0 {
        CheckOutcome::pass(
            format!("{} accounts, {} active", counts.total, counts.active),
            metrics,
        )
    } else {
        CheckOutcome::fail(
            format!(
                "account count off: total {} ({:+}), active {} ({:+})",
                counts.total, total_delta, counts.active, active_delta
            ),
            metrics,
        )
    }
}

/// Every active account allocated; sum within tolerance of the expected total
pub fn allocation_completeness(accounts: &[AccountLinkage], expectations: &PipelineExpectations) -> CheckOutcome {
    let unallocated: Vec<i64> = accounts
        .iter()
        .filter(|a| a.allocated_amount.map_or(true, |amt| amt.is_zero()))
        .map(|a| a.account_id)
        .collect();
    let total: Decimal = accounts.iter().filter_map(|a| a.allocated_amount).sum();
    let expected = expectations.expected_total_allocation;
    let delta = total - expected;
    let within = delta.abs() <= expectations.allocation_tolerance;

    let metrics = json!({
        "active_accounts": accounts.len(),
        "unallocated_accounts": unallocated,
        "total_allocation": total.to_string(),
        "expected_total": expected.to_string(),
        "delta": delta.to_string(),
        "tolerance": expectations.allocation_tolerance.to_string(),
    });

    let mut problems = Vec::new();
    if !unallocated.is_empty() {
        problems.push(format!("{} active accounts without allocation", unallocated.len()));
    }
    if !within {
        problems.push(format!("allocation total {total} differs from expected {expected} by {delta}"));
    }

    if problems.is_empty() {
        CheckOutcome::pass(format!("allocation total {total} matches expected {expected}"), metrics)
    } else {
        CheckOutcome::fail(problems.join("; "), metrics)
    }
}

fn max_age_secs(source: SyncSource, expectations: &PipelineExpectations) -> u64 {
    match source {
        SyncSource::StreamingBridge => expectations.streaming_max_age_secs,
        SyncSource::SequentialCollector => expectations.sequential_max_age_secs,
    }
}

/// Newest record of every source must be younger than that source's threshold
pub fn sync_freshness(
    latest: &[(SyncSource, DateTime<Utc>)],
    now: DateTime<Utc>,
    expectations: &PipelineExpectations,
) -> CheckOutcome {
    if latest.is_empty() {
        return CheckOutcome::fail("no synced records", json!({ "sources": {} }));
    }

    let mut sources = Map::new();
    let mut stale = Vec::new();
    for (source, synced_at) in latest {
        let age = (now - *synced_at).num_seconds().max(0) as u64;
        let threshold = max_age_secs(*source, expectations);
        let fresh = age < threshold;
        if !fresh {
            stale.push(format!("{source} last synced {age}s ago (max {threshold}s)"));
        }
        sources.insert(
            source.as_str().to_string(),
            json!({
                "latest": synced_at.to_rfc3339(),
                "age_secs": age,
                "threshold_secs": threshold,
                "fresh": fresh,
            }),
        );
    }

    let metrics = json!({ "sources": Value::Object(sources) });
    if stale.is_empty() {
        CheckOutcome::pass("all sources fresh", metrics)
    } else {
        CheckOutcome::fail(stale.join("; "), metrics)
    }
}

/// Every active account references a known manager; enough distinct managers
pub fn manager_metadata(accounts: &[AccountLinkage], expectations: &PipelineExpectations) -> CheckOutcome {
    let known: BTreeSet<&str> = expectations.known_managers.iter().map(String::as_str).collect();
    let is_known = |id: &str| {
        let id = id.trim();
        !id.is_empty() && (known.is_empty() || known.contains(id))
    };

    let unknown: Vec<i64> = accounts
        .iter()
        .filter(|a| !a.manager_id.as_deref().is_some_and(is_known))
        .map(|a| a.account_id)
        .collect();
    let distinct: BTreeSet<&str> = accounts
        .iter()
        .filter_map(|a| a.manager_id.as_deref())
        .filter(|id| is_known(id))
        .map(str::trim)
        .collect();
    let minimum = expectations.min_distinct_managers;

    let metrics = json!({
        "active_accounts": accounts.len(),
        "missing_or_unknown": unknown,
        "distinct_managers": distinct.len(),
        "min_distinct_managers": minimum,
    });

    let mut problems = Vec::new();
    if !unknown.is_empty() {
        problems.push(format!("{} active accounts without a known manager", unknown.len()));
    }
    if (distinct.len() as u64) < minimum {
        problems.push(format!("{} distinct managers, need {minimum}", distinct.len()));
    }

    if problems.is_empty() {
        CheckOutcome::pass(format!("{} distinct managers", distinct.len()), metrics)
    } else {
        CheckOutcome::fail(problems.join("; "), metrics)
    }
}

fn query_failed(name: CheckName, error: impl std::fmt::Display) -> CheckOutcome {
    warn!(check = %name, "Check query failed: {}", error);
    CheckOutcome::fail(
        format!("query failed: {error}"),
        json!({ "error": error.to_string() }),
    )
}

/// Run every check in `CheckName::ALL` order. Query errors fail only the check
/// that issued them.
pub async fn run_checks<S: PipelineQueries + ?Sized>(
    store: &S,
    expectations: &PipelineExpectations,
    now: DateTime<Utc>,
) -> Vec<(CheckName, CheckOutcome)> {
    let active = store.active_accounts().await;

    let mut outcomes = Vec::with_capacity(CheckName::ALL.len());
    for name in CheckName::ALL {
        let outcome = match name {
            CheckName::DealVolumeFloor => match (store.deal_count().await, store.deal_fields().await) {
                (Ok(count), Ok(fields)) => deal_volume_floor(count, &fields, expectations),
                (Err(e), _) | (_, Err(e)) => query_failed(name, e),
            },
            CheckName::ExpectedAccountCount => match store.account_counts().await {
                Ok(counts) => expected_account_count(counts, expectations),
                Err(e) => query_failed(name, e),
            },
            CheckName::AllocationCompleteness => match &active {
                Ok(accounts) => allocation_completeness(accounts, expectations),
                Err(e) => query_failed(name, e),
            },
            CheckName::SyncFreshness => match store.latest_sync_by_source().await {
                Ok(latest) => sync_freshness(&latest, now, expectations),
                Err(e) => query_failed(name, e),
            },
            CheckName::ManagerMetadata => match &active {
                Ok(accounts) => manager_metadata(accounts, expectations),
                Err(e) => query_failed(name, e),
            },
        };
        outcomes.push((name, outcome));
    }
    outcomes
}
