use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::protocol::TerminalCommand;
use crate::config::Secret;
use crate::domain::{AccountInfo, Deal, OpenPosition, Platform};
use crate::error::Result;

/// Request/reply capabilities of a broker terminal.
///
/// Every method takes `&mut self`: a terminal holds one authenticated session, so a
/// handle can only be driven by one caller at a time.
#[async_trait]
pub trait TerminalSession: Send {
    fn platform(&self) -> Platform;

    /// Start the terminal process / attach to it. Expensive; once per run.
    async fn initialize(&mut self) -> Result<()>;

    /// Login the terminal currently has active, if any
    async fn current_login(&mut self) -> Result<Option<i64>>;

    async fn login(&mut self, login: i64, secret: &Secret, server: &str) -> Result<()>;

    async fn account_info(&mut self) -> Result<AccountInfo>;

    async fn positions(&mut self) -> Result<Vec<OpenPosition>>;

    async fn deal_history(&mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Deal>>;
}

/// Raw inbound frame from one of the terminal sockets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// PULL socket: replies and account pushes
    Data(String),
    /// SUB socket: status broadcasts
    Broadcast(String),
}

/// Asynchronous channel to a streaming terminal
#[async_trait]
pub trait TerminalLink: Send {
    async fn send_command(&mut self, command: &TerminalCommand) -> Result<()>;

    /// Wait at most `timeout` for the next frame; `None` on timeout
    async fn recv(&mut self, timeout: Duration) -> Result<Option<InboundFrame>>;
}
