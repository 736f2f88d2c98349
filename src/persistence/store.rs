//! Storage seams shared by the producers and the watchdog
//!
//! Writers only ever upsert by `(account_id, platform)`; the monotonic
//! `last_synced_at` guard lives inside the upsert itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AccountLinkage, AccountSnapshot, Deal, HealthCheckResult, Platform, SnapshotKey, SyncSource,
    UpsertOutcome,
};
use crate::error::Result;

/// Columns of the deal collection under the current naming convention
pub const DEAL_COLUMNS: [&str; 11] = [
    "ticket",
    "account_id",
    "platform",
    "symbol",
    "direction",
    "volume",
    "price",
    "profit",
    "commission",
    "swap",
    "closed_at",
];

/// Write side used by the bridge and the collector
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert or update; rejects writes older than the stored `last_synced_at`
    async fn upsert_snapshot(&self, snapshot: &AccountSnapshot) -> Result<UpsertOutcome>;

    async fn get_snapshot(&self, key: SnapshotKey) -> Result<Option<AccountSnapshot>>;

    /// Upsert deals by ticket, returns rows written
    async fn upsert_deals(&self, account_id: i64, platform: Platform, deals: &[Deal]) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountCounts {
    pub total: u64,
    pub active: u64,
}

/// Read side used by the watchdog checks
#[async_trait]
pub trait PipelineQueries: Send + Sync {
    async fn account_counts(&self) -> Result<AccountCounts>;

    async fn active_accounts(&self) -> Result<Vec<AccountLinkage>>;

    /// Newest `last_synced_at` per source that has any records
    async fn latest_sync_by_source(&self) -> Result<Vec<(SyncSource, DateTime<Utc>)>>;

    async fn deal_count(&self) -> Result<u64>;

    /// Field names currently exposed by the deal collection
    async fn deal_fields(&self) -> Result<Vec<String>>;
}

/// Trailing window of watchdog results
#[async_trait]
pub trait HealthHistory: Send + Sync {
    async fn record_health(&self, result: &HealthCheckResult) -> Result<()>;

    /// Delete results older than `before`, returns rows removed
    async fn prune_health(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Everything the watchdog needs from the datastore
pub trait WatchdogStore: PipelineQueries + HealthHistory {}

impl<T: PipelineQueries + HealthHistory> WatchdogStore for T {}
