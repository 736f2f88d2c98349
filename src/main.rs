use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use tradesync::adapters::{MemoryStore, PostgresStore, WebhookNotifier};
use tradesync::cli::output::{self, OutputMode};
use tradesync::cli::{Cli, Commands};
use tradesync::collector::SequentialCollector;
use tradesync::config::AppConfig;
use tradesync::error::{Result, TradeSyncError};
use tradesync::persistence::{SnapshotStore, WatchdogStore};
use tradesync::services::{BridgeMetrics, HealthServer, HealthState, StreamingBridge};
use tradesync::supervisor::{
    AlertManager, DispatchTrigger, Notifier, PipelineWatchdog, RemediationTrigger,
};
use tradesync::terminal::ZmqTerminal;

mod main_runtime;

use main_runtime::{init_logging, shutdown_channel};

/// Exit code of `collect` when some accounts failed
const EXIT_PARTIAL_FAILURE: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;
    init_logging(&config.logging);

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Invalid configuration: {}", e);
        }
        return Err(TradeSyncError::InvalidConfig(errors.join("; ")));
    }

    match &cli.command {
        Commands::Migrate => {
            let store = connect_postgres(&config).await?;
            store.migrate().await?;
        }
        Commands::Collect { json } => {
            let code = run_collect(&config, cli.dry_run, OutputMode::from_json_flag(*json)).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Bridge => run_bridge(&config, cli.dry_run).await?,
        Commands::Watchdog => {
            let watchdog = build_watchdog(&config, cli.dry_run).await?;
            let handle = watchdog.start(shutdown_channel());
            handle
                .await
                .map_err(|e| TradeSyncError::Internal(format!("watchdog task failed: {e}")))?;
        }
        Commands::Check { json } => {
            let watchdog = build_watchdog(&config, cli.dry_run).await?;
            let report = watchdog
                .run_cycle()
                .await
                .ok_or_else(|| TradeSyncError::Internal("cycle unexpectedly skipped".into()))?;
            output::print_cycle(&report, OutputMode::from_json_flag(*json))?;
            if !report.result.overall_healthy {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn connect_postgres(config: &AppConfig) -> Result<PostgresStore> {
    PostgresStore::new(
        &config.database.url,
        config.database.max_connections,
        Duration::from_secs(config.database.connect_timeout_secs),
        Duration::from_secs(config.database.statement_timeout_secs),
    )
    .await
}

/// Producers write to memory in dry-run mode
async fn snapshot_store(config: &AppConfig, dry_run: bool) -> Result<Arc<dyn SnapshotStore>> {
    if dry_run {
        warn!("Dry run: snapshots go to an in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(connect_postgres(config).await?))
}

async fn run_collect(config: &AppConfig, dry_run: bool, mode: OutputMode) -> Result<i32> {
    let collector_config = &config.collector;
    if collector_config.accounts.is_empty() {
        return Err(TradeSyncError::InvalidConfig(
            "collector.accounts is empty".to_string(),
        ));
    }

    let store = snapshot_store(config, dry_run).await?;
    let terminal = ZmqTerminal::connect(
        &collector_config.terminal,
        collector_config.platform,
        collector_config.call_timeout(),
        false,
    )
    .await?;

    let mut collector = SequentialCollector::new(terminal, store, collector_config);
    let report = collector.collect_all(&collector_config.accounts).await;
    output::print_report(&report, mode)?;

    match report.partial_failure() {
        Some(e) => {
            warn!("{}", e);
            Ok(EXIT_PARTIAL_FAILURE)
        }
        None => Ok(0),
    }
}

async fn run_bridge(config: &AppConfig, dry_run: bool) -> Result<()> {
    let bridge_config = config
        .bridge
        .as_ref()
        .ok_or_else(|| TradeSyncError::InvalidConfig("[bridge] section is required".to_string()))?;

    // Store first: failing to reach it is the one fatal startup error
    let store = snapshot_store(config, dry_run).await?;
    let link = ZmqTerminal::connect(
        &bridge_config.terminal,
        bridge_config.platform,
        bridge_config.request_timeout(),
        true,
    )
    .await?;

    let metrics = Arc::new(BridgeMetrics::new());
    if let Some(port) = bridge_config.health_port {
        let state = Arc::new(HealthState::new(
            bridge_config.account_id,
            bridge_config.platform,
            bridge_config.liveness_window(),
            Arc::clone(&metrics),
        ));
        tokio::spawn(async move {
            if let Err(e) = HealthServer::new(state, port).run().await {
                error!("Status server stopped: {}", e);
            }
        });
    }

    let bridge = StreamingBridge::new(link, store, bridge_config, metrics);
    bridge.run(shutdown_channel()).await
}

async fn build_watchdog(config: &AppConfig, dry_run: bool) -> Result<Arc<PipelineWatchdog>> {
    let watchdog_config = &config.watchdog;
    let store: Arc<dyn WatchdogStore> = Arc::new(connect_postgres(config).await?);

    let trigger: Option<Arc<dyn RemediationTrigger>> = match (&watchdog_config.remediation, dry_run) {
        (Some(_), true) => {
            warn!("Dry run: remediation trigger disabled");
            None
        }
        (Some(remediation), false) => Some(Arc::new(DispatchTrigger::new(remediation)?)),
        (None, _) => None,
    };

    let mut alerts = AlertManager::new(watchdog_config.notifier.rate_limit_secs);
    if let Some(url) = &watchdog_config.notifier.webhook_url {
        info!("Webhook notifications enabled");
        alerts = alerts.with_webhook(WebhookNotifier::new(url.clone(), Duration::from_secs(10))?);
    }
    let notifier: Arc<dyn Notifier> = Arc::new(alerts);

    Ok(Arc::new(PipelineWatchdog::new(
        watchdog_config,
        store,
        trigger,
        notifier,
    )))
}
