use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::domain::{
    AccountLinkage, AccountSnapshot, Deal, DealsSummary, HealthCheckResult, OpenPosition,
    Platform, SnapshotKey, SyncSource, UpsertOutcome,
};
use crate::error::{Result, TradeSyncError};
use crate::persistence::{AccountCounts, HealthHistory, PipelineQueries, SnapshotStore};

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL; failure here is fatal for every command.
    ///
    /// Every session carries `statement_timeout`, so a stuck query errors out
    /// server-side instead of holding the caller forever.
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        connect_timeout: Duration,
        statement_timeout: Duration,
    ) -> Result<Self> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| TradeSyncError::Connection(format!("invalid database url: {e}")))?
            .options([("statement_timeout", statement_timeout.as_millis().to_string())]);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| TradeSyncError::Connection(format!("snapshot store unreachable: {e}")))?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn stored_synced_at(&self, key: SnapshotKey) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT last_synced_at FROM account_snapshots WHERE account_id = $1 AND platform = $2",
        )
        .bind(key.account_id)
        .bind(key.platform.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("last_synced_at")))
    }
}

fn parse_platform(raw: &str) -> Result<Platform> {
    raw.parse::<Platform>().map_err(TradeSyncError::Validation)
}

fn snapshot_from_row(row: &PgRow) -> Result<AccountSnapshot> {
    let platform: String = row.get("platform");
    let source: String = row.get("source");
    let leverage: i32 = row.get("leverage");
    let positions: Json<Vec<OpenPosition>> = row.get("open_positions");
    let summary: Json<DealsSummary> = row.get("recent_deals_summary");

    Ok(AccountSnapshot {
        account_id: row.get("account_id"),
        platform: parse_platform(&platform)?,
        server: row.get("server"),
        currency: row.get("currency"),
        leverage: leverage.max(0) as u32,
        balance: row.get("balance"),
        equity: row.get("equity"),
        margin_used: row.get("margin_used"),
        margin_free: row.get("margin_free"),
        floating_profit: row.get("floating_profit"),
        fund_code: row.get("fund_code"),
        allocated_amount: row.get("allocated_amount"),
        manager_id: row.get("manager_id"),
        active: row.get("active"),
        open_positions: positions.0,
        recent_deals_summary: summary.0,
        last_synced_at: row.get("last_synced_at"),
        source: source.parse::<SyncSource>().map_err(TradeSyncError::Validation)?,
    })
}

#[async_trait]
impl SnapshotStore for PostgresStore {
    #[instrument(skip(self, snapshot), fields(account_id = snapshot.account_id, platform = %snapshot.platform))]
    async fn upsert_snapshot(&self, snapshot: &AccountSnapshot) -> Result<UpsertOutcome> {
        // The WHERE clause turns an out-of-order write into a no-op
        let written = sqlx::query(
            r#"
            INSERT INTO account_snapshots (
                account_id, platform, server, currency, leverage,
                balance, equity, margin_used, margin_free, floating_profit,
                fund_code, allocated_amount, manager_id, active,
                open_positions, recent_deals_summary, last_synced_at, source
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (account_id, platform) DO UPDATE SET
                server = EXCLUDED.server,
                currency = EXCLUDED.currency,
                leverage = EXCLUDED.leverage,
                balance = EXCLUDED.balance,
                equity = EXCLUDED.equity,
                margin_used = EXCLUDED.margin_used,
                margin_free = EXCLUDED.margin_free,
                floating_profit = EXCLUDED.floating_profit,
                fund_code = COALESCE(EXCLUDED.fund_code, account_snapshots.fund_code),
                allocated_amount = COALESCE(EXCLUDED.allocated_amount, account_snapshots.allocated_amount),
                manager_id = COALESCE(EXCLUDED.manager_id, account_snapshots.manager_id),
                active = COALESCE(EXCLUDED.active, account_snapshots.active),
                open_positions = EXCLUDED.open_positions,
                recent_deals_summary = EXCLUDED.recent_deals_summary,
                last_synced_at = EXCLUDED.last_synced_at,
                source = EXCLUDED.source
            WHERE account_snapshots.last_synced_at <= EXCLUDED.last_synced_at
            RETURNING last_synced_at
            "#,
        )
        .bind(snapshot.account_id)
        .bind(snapshot.platform.as_str())
        .bind(&snapshot.server)
        .bind(&snapshot.currency)
        .bind(i32::try_from(snapshot.leverage).unwrap_or(i32::MAX))
        .bind(snapshot.balance)
        .bind(snapshot.equity)
        .bind(snapshot.margin_used)
        .bind(snapshot.margin_free)
        .bind(snapshot.floating_profit)
        .bind(&snapshot.fund_code)
        .bind(snapshot.allocated_amount)
        .bind(&snapshot.manager_id)
        .bind(snapshot.active)
        .bind(Json(&snapshot.open_positions))
        .bind(Json(&snapshot.recent_deals_summary))
        .bind(snapshot.last_synced_at)
        .bind(snapshot.source.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if written.is_some() {
            debug!("Snapshot upserted");
            return Ok(UpsertOutcome::Written);
        }

        let stored = self
            .stored_synced_at(snapshot.key())
            .await?
            .unwrap_or(snapshot.last_synced_at);
        Ok(UpsertOutcome::Stale { stored })
    }

    async fn get_snapshot(&self, key: SnapshotKey) -> Result<Option<AccountSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, platform, server, currency, leverage,
                   balance, equity, margin_used, margin_free, floating_profit,
                   fund_code, allocated_amount, manager_id, active,
                   open_positions, recent_deals_summary, last_synced_at, source
            FROM account_snapshots
            WHERE account_id = $1 AND platform = $2
            "#,
        )
        .bind(key.account_id)
        .bind(key.platform.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn upsert_deals(&self, account_id: i64, platform: Platform, deals: &[Deal]) -> Result<u64> {
        if deals.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for deal in deals {
            let result = sqlx::query(
                r#"
                INSERT INTO account_deals (
                    ticket, account_id, platform, symbol, direction,
                    volume, price, profit, commission, swap, closed_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (account_id, platform, ticket) DO UPDATE SET
                    profit = EXCLUDED.profit,
                    commission = EXCLUDED.commission,
                    swap = EXCLUDED.swap,
                    closed_at = EXCLUDED.closed_at
                "#,
            )
            .bind(deal.ticket)
            .bind(account_id)
            .bind(platform.as_str())
            .bind(&deal.symbol)
            .bind(deal.direction.as_str())
            .bind(deal.volume)
            .bind(deal.price)
            .bind(deal.profit)
            .bind(deal.commission)
            .bind(deal.swap)
            .bind(deal.closed_at)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        debug!("Upserted {} deals for {}/{}", written, platform, account_id);
        Ok(written)
    }
}

#[async_trait]
impl PipelineQueries for PostgresStore {
    async fn account_counts(&self) -> Result<AccountCounts> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE COALESCE(active, TRUE)) AS active
            FROM account_snapshots
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        let active: i64 = row.get("active");
        Ok(AccountCounts {
            total: total.max(0) as u64,
            active: active.max(0) as u64,
        })
    }

    async fn active_accounts(&self) -> Result<Vec<AccountLinkage>> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, platform, fund_code, allocated_amount, manager_id
            FROM account_snapshots
            WHERE COALESCE(active, TRUE)
            ORDER BY account_id, platform
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let platform: String = row.get("platform");
                Ok(AccountLinkage {
                    account_id: row.get("account_id"),
                    platform: parse_platform(&platform)?,
                    fund_code: row.get("fund_code"),
                    allocated_amount: row.get("allocated_amount"),
                    manager_id: row.get("manager_id"),
                })
            })
            .collect()
    }

    async fn latest_sync_by_source(&self) -> Result<Vec<(SyncSource, DateTime<Utc>)>> {
        let rows = sqlx::query(
            r#"
            SELECT source, MAX(last_synced_at) AS latest
            FROM account_snapshots
            GROUP BY source
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let source: String = row.get("source");
                let source = source.parse::<SyncSource>().map_err(TradeSyncError::Validation)?;
                Ok((source, row.get("latest")))
            })
            .collect()
    }

    async fn deal_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM account_deals")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn deal_fields(&self) -> Result<Vec<String>> {
        let fields: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::TEXT
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = 'account_deals'
            ORDER BY ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(fields)
    }
}

#[async_trait]
impl HealthHistory for PostgresStore {
    async fn record_health(&self, result: &HealthCheckResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_health_checks (id, checked_at, overall_healthy, verdict, timed_out, components)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(result.id)
        .bind(result.timestamp)
        .bind(result.overall_healthy)
        .bind(result.verdict.as_str())
        .bind(result.timed_out)
        .bind(Json(&result.components))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_health(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pipeline_health_checks WHERE checked_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
