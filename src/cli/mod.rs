//! tradesync CLI
//!
//! Commands:
//! - `tradesync bridge` - stream one terminal account into the store
//! - `tradesync collect` - one sequential collection run over the configured accounts
//! - `tradesync watchdog` - periodic pipeline audit with remediation
//! - `tradesync check` - a single audit cycle
//! - `tradesync migrate` - apply database migrations

pub mod output;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tradesync")]
#[command(author, version, about = "Trading-account synchronization and pipeline-health watchdog")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration directory (default.toml, <TRADESYNC_ENV>.toml)
    #[arg(short, long, global = true, default_value = "config", env = "TRADESYNC_CONFIG_DIR")]
    pub config: String,

    /// Producers write to an in-memory store; the watchdog never calls remediation
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the streaming bridge for the configured terminal account
    Bridge,

    /// Collect every configured account once and print the portfolio report
    Collect {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the pipeline watchdog until shutdown
    Watchdog,

    /// Run one watchdog cycle; exits 1 when the pipeline is not healthy
    Check {
        /// Print the cycle result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply database migrations
    Migrate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["tradesync", "collect", "--json", "--dry-run", "--config", "/etc/tradesync"]).unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.config, "/etc/tradesync");
        assert!(matches!(cli.command, Commands::Collect { json: true }));
    }

    #[test]
    fn command_is_required() {
        assert!(Cli::try_parse_from(["tradesync"]).is_err());
    }
}
