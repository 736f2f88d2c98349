//! ZeroMQ terminal adapter
//!
//! The terminal-side expert advisor binds three sockets: a PULL socket for our
//! commands, a PUSH socket for replies and account pushes, and a PUB socket for
//! status broadcasts. One `ZmqTerminal` owns one connection to each.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeromq::{PullSocket, PushSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use super::protocol::{decode_account, encode_command, parse_frame, Inbound, TerminalCommand};
use super::traits::{InboundFrame, TerminalLink, TerminalSession};
use crate::config::{Secret, TerminalEndpoint};
use crate::domain::{AccountInfo, Deal, OpenPosition, Platform};
use crate::error::{Result, TradeSyncError};

pub struct ZmqTerminal {
    platform: Platform,
    endpoint: String,
    push: PushSocket,
    pull: PullSocket,
    sub: Option<SubSocket>,
    /// Frames that arrived while waiting for a correlated reply
    backlog: VecDeque<InboundFrame>,
    request_timeout: Duration,
}

async fn bounded<T>(
    what: &str,
    limit: Duration,
    fut: impl std::future::Future<Output = std::result::Result<T, zeromq::ZmqError>>,
) -> Result<T> {
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TradeSyncError::Connection(format!("{what}: {e}"))),
        Err(_) => Err(TradeSyncError::Connection(format!(
            "{what}: no response within {}ms",
            limit.as_millis()
        ))),
    }
}

fn frame_text(message: ZmqMessage) -> Result<String> {
    String::try_from(message)
        .map_err(|e| TradeSyncError::Validation(format!("non-UTF-8 frame: {e}")))
}

impl ZmqTerminal {
    /// Connect the command, data and (optionally) broadcast sockets.
    ///
    /// Fails fast with `Connection` when any socket cannot be established within
    /// `request_timeout`; restart policy belongs to the process supervisor.
    pub async fn connect(
        endpoint: &TerminalEndpoint,
        platform: Platform,
        request_timeout: Duration,
        with_broadcasts: bool,
    ) -> Result<Self> {
        let mut push = PushSocket::new();
        bounded("connect command socket", request_timeout, push.connect(&endpoint.push_addr())).await?;

        let mut pull = PullSocket::new();
        bounded("connect data socket", request_timeout, pull.connect(&endpoint.pull_addr())).await?;

        let sub = if with_broadcasts {
            let mut sub = SubSocket::new();
            bounded("connect broadcast socket", request_timeout, sub.connect(&endpoint.sub_addr())).await?;
            bounded("subscribe", request_timeout, sub.subscribe("")).await?;
            Some(sub)
        } else {
            None
        };

        info!(endpoint = %endpoint, platform = %platform, "Connected to terminal");

        Ok(Self {
            platform,
            endpoint: endpoint.to_string(),
            push,
            pull,
            sub,
            backlog: VecDeque::new(),
            request_timeout,
        })
    }

    async fn send_raw(&mut self, payload: String) -> Result<()> {
        let limit = self.request_timeout;
        bounded("send command", limit, self.push.send(ZmqMessage::from(payload))).await
    }

    async fn next_frame(&mut self) -> Result<InboundFrame> {
        match self.sub.as_mut() {
            Some(sub) => tokio::select! {
                msg = self.pull.recv() => Ok(InboundFrame::Data(frame_text(msg?)?)),
                msg = sub.recv() => Ok(InboundFrame::Broadcast(frame_text(msg?)?)),
            },
            None => Ok(InboundFrame::Data(frame_text(self.pull.recv().await?)?)),
        }
    }

    /// Send a command and wait for its correlated reply payload
    async fn request(&mut self, command: TerminalCommand) -> Result<Value> {
        let id = Uuid::new_v4();
        self.send_raw(encode_command(&command, Some(id))?).await?;

        let deadline = Instant::now() + self.request_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match timeout(remaining, self.next_frame()).await {
                Ok(frame) => frame?,
                Err(_) => {
                    return Err(TradeSyncError::Timeout(format!(
                        "{} on {} after {}ms",
                        command.name(),
                        self.endpoint,
                        self.request_timeout.as_millis()
                    )))
                }
            };

            if let InboundFrame::Data(raw) = &frame {
                if let Ok(Inbound::Reply(reply)) = parse_frame(raw) {
                    if reply.id == Some(id) {
                        debug!(command = ?command, ok = reply.ok, "Terminal replied");
                        return reply.into_data(command.name());
                    }
                }
            }
            self.backlog.push_back(frame);
        }
    }
}

/// Decode a list reply: either a bare array or `{"<key>": [...]}`
fn decode_list<T: DeserializeOwned>(data: Value, key: &str) -> Result<Vec<T>> {
    let list = match data {
        Value::Array(_) => data,
        Value::Object(mut obj) => obj.remove(key).unwrap_or(Value::Array(Vec::new())),
        Value::Null => Value::Array(Vec::new()),
        other => {
            return Err(TradeSyncError::Validation(format!(
                "expected {key} list, got {other}"
            )))
        }
    };
    serde_json::from_value(list).map_err(|e| TradeSyncError::Validation(format!("bad {key}: {e}")))
}

#[async_trait]
impl TerminalLink for ZmqTerminal {
    async fn send_command(&mut self, command: &TerminalCommand) -> Result<()> {
        debug!(command = ?command, "Sending terminal command");
        self.send_raw(encode_command(command, None)?).await
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<InboundFrame>> {
        if let Some(frame) = self.backlog.pop_front() {
            return Ok(Some(frame));
        }
        match timeout(wait, self.next_frame()).await {
            Ok(frame) => frame.map(Some),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl TerminalSession for ZmqTerminal {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn initialize(&mut self) -> Result<()> {
        self.request(TerminalCommand::Initialize).await?;
        Ok(())
    }

    async fn current_login(&mut self) -> Result<Option<i64>> {
        let data = self.request(TerminalCommand::CurrentLogin).await?;
        let login = match &data {
            Value::Number(n) => n.as_i64(),
            Value::Object(obj) => obj.get("login").and_then(Value::as_i64),
            _ => None,
        };
        Ok(login.filter(|l| *l > 0))
    }

    async fn login(&mut self, login: i64, secret: &Secret, server: &str) -> Result<()> {
        self.request(TerminalCommand::Login {
            login,
            password: secret.clone(),
            server: server.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn account_info(&mut self) -> Result<AccountInfo> {
        let data = self.request(TerminalCommand::GetAccountInfo).await?;
        let push = decode_account(&data)?;
        if push.info.equity_drift() > rust_decimal::Decimal::ZERO {
            warn!(
                login = push.info.login,
                reported = %push.info.equity,
                derived = %push.info.derived_equity(),
                "Terminal equity differs from balance + floating profit"
            );
        }
        Ok(push.info)
    }

    async fn positions(&mut self) -> Result<Vec<OpenPosition>> {
        let data = self.request(TerminalCommand::GetPositions).await?;
        decode_list(data, "positions")
    }

    async fn deal_history(&mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Deal>> {
        let data = self.request(TerminalCommand::GetDeals { from, to }).await?;
        decode_list(data, "deals")
    }
}
