//! In-memory store with the same upsert semantics as PostgreSQL
//!
//! Used by `--dry-run` and by the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

use crate::domain::{
    AccountLinkage, AccountSnapshot, Deal, HealthCheckResult, Platform, SnapshotKey, SyncSource,
    UpsertOutcome,
};
use crate::error::Result;
use crate::persistence::{
    AccountCounts, HealthHistory, PipelineQueries, SnapshotStore, DEAL_COLUMNS,
};

#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<BTreeMap<SnapshotKey, AccountSnapshot>>,
    deals: RwLock<BTreeMap<(SnapshotKey, i64), Deal>>,
    /// Synthetic rows counted on top of stored deals
    extra_deal_rows: RwLock<u64>,
    deal_fields: RwLock<Vec<String>>,
    health: RwLock<Vec<HealthCheckResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            deal_fields: RwLock::new(DEAL_COLUMNS.iter().map(|c| c.to_string()).collect()),
            ..Default::default()
        }
    }

    /// Set externally owned linkage, as the allocation workflow would
    pub async fn set_linkage(
        &self,
        key: SnapshotKey,
        manager_id: Option<&str>,
        allocated_amount: Option<rust_decimal::Decimal>,
        active: bool,
    ) -> bool {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.get_mut(&key) {
            Some(snapshot) => {
                snapshot.manager_id = manager_id.map(str::to_string);
                snapshot.allocated_amount = allocated_amount;
                snapshot.active = Some(active);
                true
            }
            None => false,
        }
    }

    /// Pad the deal count without materializing rows
    pub async fn add_deal_rows(&self, rows: u64) {
        *self.extra_deal_rows.write().await += rows;
    }

    /// Replace the exposed deal field names
    pub async fn set_deal_fields(&self, fields: &[&str]) {
        *self.deal_fields.write().await = fields.iter().map(|f| f.to_string()).collect();
    }

    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn snapshots(&self) -> Vec<AccountSnapshot> {
        self.snapshots.read().await.values().cloned().collect()
    }

    pub async fn health_results(&self) -> Vec<HealthCheckResult> {
        self.health.read().await.clone()
    }
}

fn merge_linkage(incoming: &AccountSnapshot, stored: Option<&AccountSnapshot>) -> AccountSnapshot {
    let mut merged = incoming.clone();
    if let Some(stored) = stored {
        merged.fund_code = incoming.fund_code.clone().or_else(|| stored.fund_code.clone());
        merged.allocated_amount = incoming.allocated_amount.or(stored.allocated_amount);
        merged.manager_id = incoming.manager_id.clone().or_else(|| stored.manager_id.clone());
        merged.active = incoming.active.or(stored.active);
    }
    merged
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn upsert_snapshot(&self, snapshot: &AccountSnapshot) -> Result<UpsertOutcome> {
        let mut snapshots = self.snapshots.write().await;
        let key = snapshot.key();

        if let Some(stored) = snapshots.get(&key) {
            if snapshot.last_synced_at < stored.last_synced_at {
                return Ok(UpsertOutcome::Stale {
                    stored: stored.last_synced_at,
                });
            }
        }

        let merged = merge_linkage(snapshot, snapshots.get(&key));
        snapshots.insert(key, merged);
        Ok(UpsertOutcome::Written)
    }

    async fn get_snapshot(&self, key: SnapshotKey) -> Result<Option<AccountSnapshot>> {
        Ok(self.snapshots.read().await.get(&key).cloned())
    }

    async fn upsert_deals(&self, account_id: i64, platform: Platform, deals: &[Deal]) -> Result<u64> {
        let key = SnapshotKey {
            account_id,
            platform,
        };
        let mut stored = self.deals.write().await;
        for deal in deals {
            stored.insert((key, deal.ticket), deal.clone());
        }
        Ok(deals.len() as u64)
    }
}

#[async_trait]
impl PipelineQueries for MemoryStore {
    async fn account_counts(&self) -> Result<AccountCounts> {
        let snapshots = self.snapshots.read().await;
        Ok(AccountCounts {
            total: snapshots.len() as u64,
            active: snapshots.values().filter(|s| s.active.unwrap_or(true)).count() as u64,
        })
    }

    async fn active_accounts(&self) -> Result<Vec<AccountLinkage>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .values()
            .filter(|s| s.active.unwrap_or(true))
            .map(|s| AccountLinkage {
                account_id: s.account_id,
                platform: s.platform,
                fund_code: s.fund_code.clone(),
                allocated_amount: s.allocated_amount,
                manager_id: s.manager_id.clone(),
            })
            .collect())
    }

    async fn latest_sync_by_source(&self) -> Result<Vec<(SyncSource, DateTime<Utc>)>> {
        let snapshots = self.snapshots.read().await;
        let mut latest: BTreeMap<SyncSource, DateTime<Utc>> = BTreeMap::new();
        for snapshot in snapshots.values() {
            let entry = latest.entry(snapshot.source).or_insert(snapshot.last_synced_at);
            if snapshot.last_synced_at > *entry {
                *entry = snapshot.last_synced_at;
            }
        }
        Ok(latest.into_iter().collect())
    }

    async fn deal_count(&self) -> Result<u64> {
        Ok(self.deals.read().await.len() as u64 + *self.extra_deal_rows.read().await)
    }

    async fn deal_fields(&self) -> Result<Vec<String>> {
        Ok(self.deal_fields.read().await.clone())
    }
}

#[async_trait]
impl HealthHistory for MemoryStore {
    async fn record_health(&self, result: &HealthCheckResult) -> Result<()> {
        let mut health = self.health.write().await;
        let known: HashSet<_> = health.iter().map(|r| r.id).collect();
        if !known.contains(&result.id) {
            health.push(result.clone());
        }
        Ok(())
    }

    async fn prune_health(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut health = self.health.write().await;
        let len = health.len();
        health.retain(|r| r.timestamp >= before);
        Ok((len - health.len()) as u64)
    }
}
