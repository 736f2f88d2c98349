//! JSON contract spoken with the terminal-side expert advisor
//!
//! Outbound commands are objects tagged by `action`, optionally carrying an `id`
//! that the terminal echoes in its reply:
//!
//! ```text
//! {"id":"…","action":"LOGIN","login":123,"password":"…","server":"Broker-Live"}
//! ```
//!
//! Inbound frames carry a `type`:
//! - `account`: unsolicited account state push
//! - `reply`: `{"type":"reply","id":"…","ok":true,"data":…}` or `ok:false` with `error`
//! - anything else (status, heartbeat) is informational

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};
use std::str::FromStr;
use uuid::Uuid;

use crate::config::Secret;
use crate::domain::{AccountInfo, DealsSummary, OpenPosition, MONEY_SCALE};
use crate::error::{Result, TradeSyncError};

/// Commands understood by the terminal
#[derive(Clone, Serialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalCommand {
    Initialize,
    CurrentLogin,
    Login {
        login: i64,
        password: Secret,
        server: String,
    },
    GetAccountInfo,
    GetPositions,
    GetDeals {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

impl TerminalCommand {
    pub fn name(&self) -> &'static str {
        match self {
            TerminalCommand::Initialize => "INITIALIZE",
            TerminalCommand::CurrentLogin => "CURRENT_LOGIN",
            TerminalCommand::Login { .. } => "LOGIN",
            TerminalCommand::GetAccountInfo => "GET_ACCOUNT_INFO",
            TerminalCommand::GetPositions => "GET_POSITIONS",
            TerminalCommand::GetDeals { .. } => "GET_DEALS",
        }
    }
}

impl std::fmt::Debug for TerminalCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalCommand::Login { login, server, .. } => {
                write!(f, "LOGIN({login}@{server})")
            }
            other => write!(f, "{}", other.name()),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Uuid>,
    #[serde(flatten)]
    command: &'a TerminalCommand,
}

/// Serialize a command, with a correlation id when a reply is awaited
pub fn encode_command(command: &TerminalCommand, id: Option<Uuid>) -> Result<String> {
    Ok(serde_json::to_string(&Envelope { id, command })?)
}

/// Reply to a correlated request
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: Option<Uuid>,
    pub ok: bool,
    pub error: Option<String>,
    pub data: Value,
}

impl Reply {
    /// Payload of a successful reply, `TerminalRejected` otherwise
    pub fn into_data(self, action: &str) -> Result<Value> {
        if self.ok {
            Ok(self.data)
        } else {
            Err(TradeSyncError::TerminalRejected(format!(
                "{action}: {}",
                self.error.unwrap_or_else(|| "no reason given".to_string())
            )))
        }
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Account(Value),
    Reply(Reply),
    Status(Value),
}

pub fn parse_frame(raw: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| TradeSyncError::Validation(format!("malformed frame: {e}")))?;
    let Value::Object(obj) = value else {
        return Err(TradeSyncError::Validation("frame is not a JSON object".into()));
    };

    match obj.get("type").and_then(Value::as_str) {
        Some("account") => Ok(Inbound::Account(Value::Object(obj))),
        Some("reply") => {
            let id = obj
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok());
            let ok = obj.get("ok").and_then(Value::as_bool).unwrap_or(false);
            let error = obj.get("error").and_then(Value::as_str).map(str::to_string);
            let data = obj.get("data").cloned().unwrap_or(Value::Null);
            Ok(Inbound::Reply(Reply { id, ok, error, data }))
        }
        _ => Ok(Inbound::Status(Value::Object(obj))),
    }
}

/// Account payload carried by a frame: a push, or a successful reply holding one
pub fn account_payload(inbound: &Inbound) -> Option<&Value> {
    match inbound {
        Inbound::Account(payload) => Some(payload),
        Inbound::Reply(reply) if reply.ok && reply.data.get("account_id").is_some() => {
            Some(&reply.data)
        }
        _ => None,
    }
}

/// `account_id` of a payload, without validating the rest
pub fn payload_account_id(payload: &Value) -> Option<i64> {
    payload.get("account_id").and_then(Value::as_i64)
}

/// Validated account state decoded from the wire
#[derive(Debug, Clone, PartialEq)]
pub struct AccountPush {
    pub info: AccountInfo,
    pub positions: Vec<OpenPosition>,
    pub deals: Option<DealsSummary>,
    /// Terminal-side time of the state; `None` when not reported
    pub timestamp: Option<DateTime<Utc>>,
}

/// Required numeric fields of an account payload
pub const REQUIRED_NUMERIC_FIELDS: [&str; 5] = ["balance", "equity", "margin", "free_margin", "profit"];

fn object(payload: &Value) -> Result<&Map<String, Value>> {
    payload
        .as_object()
        .ok_or_else(|| TradeSyncError::Validation("account payload is not an object".into()))
}

fn number_to_decimal(field: &str, value: &Value) -> Result<Decimal> {
    let Value::Number(n) = value else {
        return Err(TradeSyncError::Validation(format!(
            "field '{field}' must be numeric, got {value}"
        )));
    };
    let raw = n.to_string();
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|e| TradeSyncError::Validation(format!("field '{field}' out of range: {e}")))
}

fn required_decimal(obj: &Map<String, Value>, field: &str) -> Result<Decimal> {
    let value = obj
        .get(field)
        .ok_or_else(|| TradeSyncError::Validation(format!("missing required field '{field}'")))?;
    number_to_decimal(field, value)
}

fn optional_str(obj: &Map<String, Value>, field: &str) -> String {
    obj.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| TradeSyncError::Validation(format!("bad timestamp '{s}': {e}"))),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| TradeSyncError::Validation(format!("bad timestamp {n}"))),
        other => Err(TradeSyncError::Validation(format!("bad timestamp {other}"))),
    }
}

/// Validate and decode an account payload
pub fn decode_account(payload: &Value) -> Result<AccountPush> {
    let obj = object(payload)?;

    let account_id = obj
        .get("account_id")
        .ok_or_else(|| TradeSyncError::Validation("missing required field 'account_id'".into()))?
        .as_i64()
        .ok_or_else(|| TradeSyncError::Validation("field 'account_id' must be an integer".into()))?;

    let mut figures = [Decimal::ZERO; 5];
    for (slot, field) in figures.iter_mut().zip(REQUIRED_NUMERIC_FIELDS) {
        *slot = required_decimal(obj, field)?.round_dp(MONEY_SCALE);
    }
    let [balance, equity, margin_used, margin_free, floating_profit] = figures;

    let leverage = match obj.get("leverage") {
        None | Some(Value::Null) => 0,
        Some(v) => v
            .as_u64()
            .and_then(|l| u32::try_from(l).ok())
            .ok_or_else(|| TradeSyncError::Validation("field 'leverage' must be a positive integer".into()))?,
    };

    let positions = match obj.get("positions") {
        None | Some(Value::Null) => Vec::new(),
        Some(v) => serde_json::from_value::<Vec<OpenPosition>>(v.clone())
            .map_err(|e| TradeSyncError::Validation(format!("bad positions: {e}")))?,
    };

    let deals = match obj.get("deals") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            serde_json::from_value::<DealsSummary>(v.clone())
                .map_err(|e| TradeSyncError::Validation(format!("bad deals summary: {e}")))?,
        ),
    };

    let timestamp = match obj.get("timestamp") {
        None | Some(Value::Null) => None,
        Some(v) => Some(parse_timestamp(v)?),
    };

    Ok(AccountPush {
        info: AccountInfo {
            login: account_id,
            server: optional_str(obj, "server"),
            currency: optional_str(obj, "currency"),
            leverage,
            balance,
            equity,
            margin_used,
            margin_free,
            floating_profit,
        },
        positions,
        deals,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn account_json() -> Value {
        json!({
            "type": "account",
            "account_id": 123,
            "server": "Broker-Live",
            "currency": "USD",
            "leverage": 200,
            "balance": 10000.0,
            "equity": 10125.25,
            "margin": 300.5,
            "free_margin": 9824.75,
            "profit": 125.25,
            "positions": [{
                "symbol": "XAUUSD",
                "direction": "buy",
                "volume": 0.5,
                "open_price": 2300.1,
                "current_price": 2302.6,
                "profit": 125.25
            }],
            "timestamp": "2024-05-01T10:00:00Z"
        })
    }

    #[test]
    fn figures_are_rounded_to_money_scale() {
        let mut payload = account_json();
        payload["balance"] = json!(0.000000005);
        payload["profit"] = json!(0.000000005);
        payload["equity"] = json!(0.00000001);
        let push = decode_account(&payload).unwrap();
        // Midpoints round to even
        assert_eq!(push.info.balance, Decimal::ZERO);
        assert_eq!(push.info.floating_profit, Decimal::ZERO);
        assert_eq!(push.info.equity, dec!(0.00000001));
        assert!(push.info.balance.scale() <= MONEY_SCALE);
    }

    #[test]
    fn login_command_never_prints_password() {
        let cmd = TerminalCommand::Login {
            login: 7,
            password: Secret::new("s3cret"),
            server: "Srv".into(),
        };
        assert_eq!(format!("{cmd:?}"), "LOGIN(7@Srv)");

        let wire = encode_command(&cmd, None).unwrap();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["action"], "LOGIN");
        assert_eq!(value["password"], "s3cret");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn correlated_command_carries_id() {
        let id = Uuid::new_v4();
        let wire = encode_command(&TerminalCommand::GetAccountInfo, Some(id)).unwrap();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["action"], "GET_ACCOUNT_INFO");
        assert_eq!(value["id"], id.to_string());
    }

    #[test]
    fn decodes_valid_account_push() {
        let push = decode_account(&account_json()).unwrap();
        assert_eq!(push.info.login, 123);
        assert_eq!(push.info.leverage, 200);
        assert_eq!(push.info.balance, dec!(10000));
        assert_eq!(push.info.floating_profit, dec!(125.25));
        assert_eq!(push.info.margin_used, dec!(300.5));
        assert_eq!(push.positions.len(), 1);
        assert_eq!(push.positions[0].symbol, "XAUUSD");
        assert!(push.timestamp.is_some());
    }

    #[test]
    fn missing_required_field_is_validation_error() {
        let mut payload = account_json();
        payload.as_object_mut().unwrap().remove("balance");
        let err = decode_account(&payload).unwrap_err();
        assert!(matches!(err, TradeSyncError::Validation(ref m) if m.contains("balance")));
    }

    #[test]
    fn string_typed_figure_is_rejected() {
        let mut payload = account_json();
        payload["equity"] = json!("10125.25");
        assert!(matches!(
            decode_account(&payload),
            Err(TradeSyncError::Validation(_))
        ));
    }

    #[test]
    fn unix_timestamp_is_accepted() {
        let mut payload = account_json();
        payload["timestamp"] = json!(1_714_557_600);
        let push = decode_account(&payload).unwrap();
        assert_eq!(push.timestamp.unwrap().timestamp(), 1_714_557_600);
    }

    #[test]
    fn reply_with_account_data_is_an_account_payload() {
        let raw = json!({
            "type": "reply",
            "id": Uuid::new_v4().to_string(),
            "ok": true,
            "data": account_json()
        })
        .to_string();
        let inbound = parse_frame(&raw).unwrap();
        let payload = account_payload(&inbound).unwrap();
        assert_eq!(payload_account_id(payload), Some(123));
    }

    #[test]
    fn failed_reply_becomes_terminal_rejected() {
        let raw = r#"{"type":"reply","ok":false,"error":"invalid account"}"#;
        let Inbound::Reply(reply) = parse_frame(raw).unwrap() else {
            panic!("expected reply");
        };
        let err = reply.into_data("LOGIN").unwrap_err();
        assert!(matches!(err, TradeSyncError::TerminalRejected(ref m) if m.contains("invalid account")));
    }

    #[test]
    fn garbage_is_validation_error() {
        assert!(matches!(parse_frame("not json"), Err(TradeSyncError::Validation(_))));
        assert!(matches!(parse_frame("[1,2]"), Err(TradeSyncError::Validation(_))));
    }
}
