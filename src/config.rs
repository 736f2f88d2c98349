use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::domain::Platform;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Only required by the `bridge` command
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connect timeout at startup
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Server-side bound of any single statement
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_statement_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Addresses of the three terminal sockets
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalEndpoint {
    pub host: String,
    /// Terminal PULL socket; we PUSH commands here
    #[serde(default = "default_push_port")]
    pub push_port: u16,
    /// Terminal PUSH socket; we PULL replies and account pushes here
    #[serde(default = "default_pull_port")]
    pub pull_port: u16,
    /// Terminal PUB socket for status broadcasts
    #[serde(default = "default_sub_port")]
    pub sub_port: u16,
}

fn default_push_port() -> u16 {
    32768
}

fn default_pull_port() -> u16 {
    32769
}

fn default_sub_port() -> u16 {
    32770
}

impl Default for TerminalEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            push_port: default_push_port(),
            pull_port: default_pull_port(),
            sub_port: default_sub_port(),
        }
    }
}

impl TerminalEndpoint {
    pub fn push_addr(&self) -> String {
        format!("tcp://{}:{}", self.host, self.push_port)
    }

    pub fn pull_addr(&self) -> String {
        format!("tcp://{}:{}", self.host, self.pull_port)
    }

    pub fn sub_addr(&self) -> String {
        format!("tcp://{}:{}", self.host, self.sub_port)
    }
}

impl std::fmt::Display for TerminalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}",
            self.host, self.push_port, self.pull_port, self.sub_port
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub terminal: TerminalEndpoint,
    /// The only account this bridge accepts pushes for
    pub account_id: i64,
    pub platform: Platform,
    /// Upper bound of one receive wait
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// No message within this window marks the bridge degraded
    #[serde(default = "default_liveness_window_secs")]
    pub liveness_window_secs: u64,
    /// Interval of the proactive account-info request
    #[serde(default = "default_self_check_interval_secs")]
    pub self_check_interval_secs: u64,
    /// Timeout for connecting, sending commands and writing one snapshot
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Status server port (disabled when unset)
    #[serde(default)]
    pub health_port: Option<u16>,
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_liveness_window_secs() -> u64 {
    15 * 60
}

fn default_self_check_interval_secs() -> u64 {
    5 * 60
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl BridgeConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn self_check_interval(&self) -> Duration {
        Duration::from_secs(self.self_check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Credential (terminal password, dispatch token); zeroized on drop and never printed
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(***)")
    }
}

/// One entry of the collector's account list
#[derive(Debug, Clone, Deserialize)]
pub struct AccountCredentials {
    pub login: i64,
    pub secret: Secret,
    pub server: String,
    pub fund_code: String,
    #[serde(default)]
    pub allocated_amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_platform")]
    pub platform: Platform,
    #[serde(default)]
    pub terminal: TerminalEndpoint,
    /// Minimum spacing between login starts
    #[serde(default = "default_min_login_interval_ms")]
    pub min_login_interval_ms: u64,
    /// Timeout of each terminal call (init, login, data pulls)
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Deal-history lookback
    #[serde(default = "default_deal_window_days")]
    pub deal_window_days: u32,
    #[serde(default)]
    pub accounts: Vec<AccountCredentials>,
}

fn default_platform() -> Platform {
    Platform::Mt5
}

fn default_min_login_interval_ms() -> u64 {
    2000
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_deal_window_days() -> u32 {
    30
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            terminal: TerminalEndpoint::default(),
            min_login_interval_ms: default_min_login_interval_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            deal_window_days: default_deal_window_days(),
            accounts: Vec::new(),
        }
    }
}

impl CollectorConfig {
    pub fn min_login_interval(&self) -> Duration {
        Duration::from_millis(self.min_login_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Externally agreed expectations audited by the watchdog
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineExpectations {
    #[serde(default)]
    pub expected_total_accounts: u64,
    #[serde(default)]
    pub expected_active_accounts: u64,
    #[serde(default)]
    pub expected_total_allocation: Decimal,
    /// Absolute tolerance on the allocation sum
    #[serde(default = "default_allocation_tolerance")]
    pub allocation_tolerance: Decimal,
    #[serde(default = "default_min_deal_rows")]
    pub min_deal_rows: u64,
    /// Field names the deal collection must expose
    #[serde(default = "default_deal_fields")]
    pub deal_fields: Vec<String>,
    /// Field names of the superseded convention; their presence is drift
    #[serde(default = "default_legacy_deal_fields")]
    pub legacy_deal_fields: Vec<String>,
    #[serde(default = "default_streaming_max_age_secs")]
    pub streaming_max_age_secs: u64,
    #[serde(default = "default_sequential_max_age_secs")]
    pub sequential_max_age_secs: u64,
    /// Known manager identities; empty accepts any non-empty id
    #[serde(default)]
    pub known_managers: Vec<String>,
    #[serde(default = "default_min_distinct_managers")]
    pub min_distinct_managers: u64,
}

fn default_allocation_tolerance() -> Decimal {
    dec!(1)
}

fn default_min_deal_rows() -> u64 {
    1000
}

fn default_deal_fields() -> Vec<String> {
    ["ticket", "account_id", "platform", "symbol", "profit", "closed_at"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_legacy_deal_fields() -> Vec<String> {
    ["login", "close_time"].iter().map(|s| s.to_string()).collect()
}

fn default_streaming_max_age_secs() -> u64 {
    15 * 60
}

fn default_sequential_max_age_secs() -> u64 {
    6 * 60 * 60
}

fn default_min_distinct_managers() -> u64 {
    1
}

impl Default for PipelineExpectations {
    fn default() -> Self {
        Self {
            expected_total_accounts: 0,
            expected_active_accounts: 0,
            expected_total_allocation: Decimal::ZERO,
            allocation_tolerance: default_allocation_tolerance(),
            min_deal_rows: default_min_deal_rows(),
            deal_fields: default_deal_fields(),
            legacy_deal_fields: default_legacy_deal_fields(),
            streaming_max_age_secs: default_streaming_max_age_secs(),
            sequential_max_age_secs: default_sequential_max_age_secs(),
            known_managers: Vec::new(),
            min_distinct_managers: default_min_distinct_managers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemediationConfig {
    /// CI/CD dispatch URL
    pub url: String,
    /// Bearer token (usually from TRADESYNC_WATCHDOG__REMEDIATION__TOKEN)
    #[serde(default)]
    pub token: Option<Secret>,
    #[serde(default = "default_git_ref")]
    pub git_ref: String,
    #[serde(default = "default_remediation_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_git_ref() -> String {
    "main".to_string()
}

fn default_remediation_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Minimum interval between identical notifications
    #[serde(default = "default_rate_limit_secs")]
    pub rate_limit_secs: u64,
}

fn default_rate_limit_secs() -> u64 {
    60
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            rate_limit_secs: default_rate_limit_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    /// Interval between full audits
    #[serde(default = "default_watchdog_interval_secs")]
    pub interval_secs: u64,
    /// Soft deadline of one cycle (checks + remediation)
    #[serde(default = "default_cycle_deadline_secs")]
    pub cycle_deadline_secs: u64,
    /// Health history retention
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default)]
    pub expectations: PipelineExpectations,
    #[serde(default)]
    pub remediation: Option<RemediationConfig>,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

fn default_watchdog_interval_secs() -> u64 {
    15 * 60
}

fn default_cycle_deadline_secs() -> u64 {
    120
}

fn default_retention_hours() -> u64 {
    24
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval_secs(),
            cycle_deadline_secs: default_cycle_deadline_secs(),
            retention_hours: default_retention_hours(),
            expectations: PipelineExpectations::default(),
            remediation: None,
            notifier: NotifierConfig::default(),
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TRADESYNC_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TRADESYNC_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("TRADESYNC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.url.trim().is_empty() {
            errors.push("database.url must be set".to_string());
        }
        if self.database.statement_timeout_secs == 0 {
            errors.push("database.statement_timeout_secs must be positive".to_string());
        }

        if let Some(bridge) = &self.bridge {
            validate_endpoint("bridge.terminal", &bridge.terminal, &mut errors);
            if bridge.account_id <= 0 {
                errors.push("bridge.account_id must be positive".to_string());
            }
            if bridge.poll_timeout_ms == 0 {
                errors.push("bridge.poll_timeout_ms must be positive".to_string());
            }
            if bridge.self_check_interval_secs == 0 {
                errors.push("bridge.self_check_interval_secs must be positive".to_string());
            }
            if bridge.liveness_window_secs == 0 {
                errors.push("bridge.liveness_window_secs must be positive".to_string());
            }
        }

        validate_endpoint("collector.terminal", &self.collector.terminal, &mut errors);
        if self.collector.call_timeout_secs == 0 {
            errors.push("collector.call_timeout_secs must be positive".to_string());
        }
        let mut seen = HashSet::new();
        for account in &self.collector.accounts {
            if !seen.insert(account.login) {
                errors.push(format!("collector.accounts: duplicate login {}", account.login));
            }
            if account.allocated_amount < Decimal::ZERO {
                errors.push(format!(
                    "collector.accounts: login {} has negative allocated_amount",
                    account.login
                ));
            }
        }

        let watchdog = &self.watchdog;
        if watchdog.interval_secs == 0 {
            errors.push("watchdog.interval_secs must be positive".to_string());
        }
        if watchdog.cycle_deadline_secs == 0 {
            errors.push("watchdog.cycle_deadline_secs must be positive".to_string());
        }
        let expectations = &watchdog.expectations;
        if expectations.expected_total_allocation < Decimal::ZERO {
            errors.push("watchdog.expectations.expected_total_allocation must not be negative".to_string());
        }
        if expectations.allocation_tolerance < Decimal::ZERO {
            errors.push("watchdog.expectations.allocation_tolerance must not be negative".to_string());
        }
        if expectations.expected_active_accounts > expectations.expected_total_accounts {
            errors.push(
                "watchdog.expectations.expected_active_accounts exceeds expected_total_accounts"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn validate_endpoint(section: &str, endpoint: &TerminalEndpoint, errors: &mut Vec<String>) {
    if endpoint.host.trim().is_empty() {
        errors.push(format!("{section}.host must be set"));
    }
    for (name, port) in [
        ("push_port", endpoint.push_port),
        ("pull_port", endpoint.pull_port),
        ("sub_port", endpoint.sub_port),
    ] {
        if port == 0 {
            errors.push(format!("{section}.{name} must be non-zero"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            database: DatabaseConfig {
                url: "postgres://localhost/tradesync".into(),
                max_connections: 5,
                connect_timeout_secs: 10,
                statement_timeout_secs: 30,
            },
            logging: LoggingConfig::default(),
            bridge: None,
            collector: CollectorConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }

    fn credentials(login: i64) -> AccountCredentials {
        AccountCredentials {
            login,
            secret: Secret::new("hunter2"),
            server: "Broker-Live".into(),
            fund_code: "F1".into(),
            allocated_amount: dec!(1000),
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = base_config();
        assert_eq!(config.collector.min_login_interval(), Duration::from_secs(2));
        assert_eq!(config.watchdog.interval(), Duration::from_secs(900));
        assert_eq!(config.watchdog.retention_hours, 24);
        assert_eq!(config.watchdog.expectations.min_deal_rows, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_logins_are_rejected() {
        let mut config = base_config();
        config.collector.accounts = vec![credentials(1), credentials(1)];
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("duplicate login 1")));
    }

    #[test]
    fn secret_is_redacted_in_debug_output() {
        let rendered = format!("{:?}", credentials(7));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("Secret(***)"));
    }

    #[test]
    fn environment_overrides_use_single_underscore_prefix() {
        std::env::set_var("TRADESYNC_DATABASE__URL", "postgres://env/override");
        std::env::set_var("TRADESYNC_WATCHDOG__INTERVAL_SECS", "60");
        let loaded = AppConfig::load_from("does-not-exist");
        std::env::remove_var("TRADESYNC_DATABASE__URL");
        std::env::remove_var("TRADESYNC_WATCHDOG__INTERVAL_SECS");

        let config = loaded.unwrap();
        assert_eq!(config.database.url, "postgres://env/override");
        assert_eq!(config.watchdog.interval_secs, 60);
    }

    #[test]
    fn remediation_token_is_redacted_in_debug_output() {
        let remediation = RemediationConfig {
            url: "https://ci.example/dispatch".into(),
            token: Some(Secret::new("ghp_live_token")),
            git_ref: default_git_ref(),
            timeout_secs: default_remediation_timeout_secs(),
        };
        let rendered = format!("{remediation:?}");
        assert!(!rendered.contains("ghp_live_token"));
        assert!(rendered.contains("Secret(***)"));
    }

    #[test]
    fn endpoint_addresses() {
        let endpoint = TerminalEndpoint {
            host: "10.0.0.5".into(),
            ..Default::default()
        };
        assert_eq!(endpoint.push_addr(), "tcp://10.0.0.5:32768");
        assert_eq!(endpoint.pull_addr(), "tcp://10.0.0.5:32769");
        assert_eq!(endpoint.sub_addr(), "tcp://10.0.0.5:32770");
    }

    #[test]
    fn bridge_requires_positive_account() {
        let mut config = base_config();
        config.bridge = Some(BridgeConfig {
            terminal: TerminalEndpoint::default(),
            account_id: 0,
            platform: Platform::Mt4,
            poll_timeout_ms: 1000,
            liveness_window_secs: 900,
            self_check_interval_secs: 300,
            request_timeout_ms: 5000,
            health_port: None,
        });
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("bridge.account_id")));
    }
}
