use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::TradeSyncError;

/// Watchdog checks, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    DealVolumeFloor,
    ExpectedAccountCount,
    AllocationCompleteness,
    SyncFreshness,
    ManagerMetadata,
}

impl CheckName {
    pub const ALL: [CheckName; 5] = [
        CheckName::DealVolumeFloor,
        CheckName::ExpectedAccountCount,
        CheckName::AllocationCompleteness,
        CheckName::SyncFreshness,
        CheckName::ManagerMetadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckName::DealVolumeFloor => "deal_volume_floor",
            CheckName::ExpectedAccountCount => "expected_account_count",
            CheckName::AllocationCompleteness => "allocation_completeness",
            CheckName::SyncFreshness => "sync_freshness",
            CheckName::ManagerMetadata => "manager_metadata",
        }
    }

    pub fn class(&self) -> CheckClass {
        CHECK_CLASSIFICATION
            .iter()
            .find(|(name, _)| name == self)
            .map(|(_, class)| *class)
            .unwrap_or(CheckClass::Critical)
    }
}

impl std::fmt::Display for CheckName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckClass {
    /// Failure makes the cycle `Failing` and triggers remediation
    Critical,
    /// Failure makes the cycle `Degraded`
    NonCritical,
}

/// Critical vs non-critical classification of every check.
///
/// Freshness and allocation totals are the checks a redeploy of the producers can fix;
/// the others indicate configuration or business-data drift and only notify.
pub const CHECK_CLASSIFICATION: [(CheckName, CheckClass); 5] = [
    (CheckName::SyncFreshness, CheckClass::Critical),
    (CheckName::AllocationCompleteness, CheckClass::Critical),
    (CheckName::ExpectedAccountCount, CheckClass::NonCritical),
    (CheckName::DealVolumeFloor, CheckClass::NonCritical),
    (CheckName::ManagerMetadata, CheckClass::NonCritical),
];

/// Outcome of a single check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub healthy: bool,
    pub message: String,
    pub metrics: serde_json::Value,
}

impl CheckOutcome {
    pub fn pass(message: impl Into<String>, metrics: serde_json::Value) -> Self {
        Self {
            healthy: true,
            message: message.into(),
            metrics,
        }
    }

    pub fn fail(message: impl Into<String>, metrics: serde_json::Value) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            metrics,
        }
    }
}

/// Cycle verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Healthy,
    Degraded,
    Failing,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Healthy => "healthy",
            Verdict::Degraded => "degraded",
            Verdict::Failing => "failing",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One watchdog run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub overall_healthy: bool,
    pub verdict: Verdict,
    pub components: BTreeMap<String, CheckOutcome>,
    #[serde(default)]
    pub timed_out: bool,
}

impl HealthCheckResult {
    pub fn from_outcomes(outcomes: Vec<(CheckName, CheckOutcome)>) -> Self {
        let verdict = verdict_for(&outcomes);
        let components = outcomes
            .into_iter()
            .map(|(name, outcome)| (name.as_str().to_string(), outcome))
            .collect();

        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            overall_healthy: verdict == Verdict::Healthy,
            verdict,
            components,
            timed_out: false,
        }
    }

    /// Result for a cycle that exceeded its soft deadline
    pub fn timed_out(deadline_secs: u64) -> Self {
        let mut components = BTreeMap::new();
        components.insert(
            "cycle_deadline".to_string(),
            CheckOutcome::fail(
                format!("watchdog cycle exceeded {deadline_secs}s deadline"),
                serde_json::json!({ "deadline_secs": deadline_secs }),
            ),
        );

        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            overall_healthy: false,
            verdict: Verdict::Degraded,
            components,
            timed_out: true,
        }
    }

    pub fn failing_checks(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, c)| !c.healthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// One `ConsistencyViolation` per failing check
    pub fn violations(&self) -> Vec<TradeSyncError> {
        self.components
            .iter()
            .filter(|(_, c)| !c.healthy)
            .map(|(name, c)| TradeSyncError::ConsistencyViolation {
                check: name.clone(),
                message: c.message.clone(),
            })
            .collect()
    }

    /// Human-readable reason used for remediation and notifications
    pub fn summary(&self) -> String {
        if self.overall_healthy {
            return "all pipeline checks passed".to_string();
        }
        let details: Vec<String> = self
            .components
            .iter()
            .filter(|(_, c)| !c.healthy)
            .map(|(name, c)| format!("{name}: {}", c.message))
            .collect();
        format!("pipeline {}: {}", self.verdict, details.join("; "))
    }
}

/// `Healthy` iff every check passes; `Failing` if a critical check fails
pub fn verdict_for(outcomes: &[(CheckName, CheckOutcome)]) -> Verdict {
    let mut verdict = Verdict::Healthy;
    for (name, outcome) in outcomes {
        if outcome.healthy {
            continue;
        }
        match name.class() {
            CheckClass::Critical => return Verdict::Failing,
            CheckClass::NonCritical => verdict = Verdict::Degraded,
        }
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_passing() -> Vec<(CheckName, CheckOutcome)> {
        CheckName::ALL
            .iter()
            .map(|n| (*n, CheckOutcome::pass("ok", serde_json::json!({}))))
            .collect()
    }

    #[test]
    fn every_check_is_classified() {
        for name in CheckName::ALL {
            assert!(CHECK_CLASSIFICATION.iter().any(|(n, _)| *n == name));
        }
    }

    #[test]
    fn healthy_iff_all_checks_pass() {
        assert_eq!(verdict_for(&all_passing()), Verdict::Healthy);

        for i in 0..CheckName::ALL.len() {
            let mut outcomes = all_passing();
            outcomes[i].1.healthy = false;
            let verdict = verdict_for(&outcomes);
            assert!(verdict >= Verdict::Degraded, "{} should flip verdict", outcomes[i].0);
            let expected = match outcomes[i].0.class() {
                CheckClass::Critical => Verdict::Failing,
                CheckClass::NonCritical => Verdict::Degraded,
            };
            assert_eq!(verdict, expected);
        }
    }

    #[test]
    fn summary_lists_failing_checks() {
        let mut outcomes = all_passing();
        outcomes[0].1 = CheckOutcome::fail("500 rows below floor 1000", serde_json::json!({}));
        let result = HealthCheckResult::from_outcomes(outcomes);
        assert!(!result.overall_healthy);
        assert_eq!(result.failing_checks(), vec!["deal_volume_floor"]);
        assert!(result.summary().contains("500 rows below floor 1000"));

        let violations = result.violations();
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            &violations[0],
            TradeSyncError::ConsistencyViolation { check, message }
                if check == "deal_volume_floor" && message == "500 rows below floor 1000"
        ));
    }

    #[test]
    fn timed_out_result_is_unhealthy_but_not_failing() {
        let result = HealthCheckResult::timed_out(120);
        assert!(result.timed_out);
        assert!(!result.overall_healthy);
        assert_eq!(result.verdict, Verdict::Degraded);
    }
}
