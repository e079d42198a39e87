//! Wire frames exchanged with a host agent
//!
//! Every frame is a JSON text message with a `type` discriminator:
//!
//! ```text
//! out  {"type":"auth","data":{"password":"…"}}
//! in   {"type":"auth","status":"success"} | {"type":"auth","error":"…"}
//! in   {"type":"metrics","data":{…}}
//! out  {"type":"history","range":"1h"}
//! in   {"type":"history","range":"1h","points":[{"timestamp":…,"cpu":…,"memory":…,"disk":…}]}
//! ```

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SystemMetrics;
use crate::history::{HistoryPoint, HistoryRange};

/// Frames sent to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Auth { data: AuthPayload },
    History { range: HistoryRange },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub password: String,
}

impl Outbound {
    pub fn auth(secret: impl Into<String>) -> Self {
        Outbound::Auth {
            data: AuthPayload {
                password: secret.into(),
            },
        }
    }

    pub fn history(range: HistoryRange) -> Self {
        Outbound::History { range }
    }
}

/// Frames received from an agent, after the first dispatch step
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Handshake answer; `error` is set when the secret was rejected
    Auth { error: Option<String> },

    Metrics(Box<SystemMetrics>),

    /// Anything else, left uninterpreted for listeners
    Other { kind: String, message: Value },
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self> {
        let message: Value = serde_json::from_str(text).context("frame is not valid JSON")?;

        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("frame has no type field"))?
            .to_string();

        match kind.as_str() {
            "metrics" => {
                let data = message
                    .get("data")
                    .cloned()
                    .ok_or_else(|| anyhow!("metrics frame has no data field"))?;
                let metrics: SystemMetrics =
                    serde_json::from_value(data).context("failed to parse metrics payload")?;
                Ok(Inbound::Metrics(Box::new(metrics)))
            }
            "auth" => {
                let error = message
                    .get("error")
                    .and_then(Value::as_str)
                    .filter(|error| !error.is_empty())
                    .map(String::from);
                Ok(Inbound::Auth { error })
            }
            _ => Ok(Inbound::Other { kind, message }),
        }
    }
}

/// Message forwarded by a connection to its listeners
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedMessage {
    pub kind: String,
    pub message: Value,
}

/// Answer to an [`Outbound::History`] request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub range: HistoryRange,
    #[serde(default)]
    pub points: Vec<HistoryPoint>,
}
