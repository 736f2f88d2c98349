pub mod adapters;
pub mod cli;
pub mod collector;
pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod services;
pub mod supervisor;
pub mod terminal;

pub use collector::SequentialCollector;
pub use config::AppConfig;
pub use error::{Result, TradeSyncError};
pub use services::{BridgeMetrics, StreamingBridge};
pub use supervisor::{Notifier, PipelineWatchdog, RemediationTrigger};
