//! Engine.IO v4 / Socket.IO v4 text packet codec.
//!
//! Two layers are stacked on every frame:
//!
//! ```text
//! 4 2 12 ["clientMessage", {...}]
//! │ │ │  └─ JSON payload
//! │ │ └──── ack id (optional)
//! │ └────── Socket.IO packet type (2 = EVENT)
//! └──────── Engine.IO packet type (4 = MESSAGE)
//! ```
//!
//! Over long-polling several Engine.IO packets share one HTTP body, separated
//! by the ASCII record separator (`0x1e`). Binary packets are not supported.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ChatError;

/// Separator between Engine.IO packets in a polling payload.
pub const RECORD_SEPARATOR: char = '\x1e';

/// Parameters the server sends in the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

/// Transport-level packet.
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> Result<Self, ChatError> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ChatError::Protocol("empty engine packet".into()))?;
        let rest = chars.as_str();
        match kind {
            '0' => serde_json::from_str(rest)
                .map(Self::Open)
                .map_err(|e| ChatError::Protocol(format!("bad handshake: {e}"))),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(rest.to_string())),
            '3' => Ok(Self::Pong(rest.to_string())),
            '4' => Ok(Self::Message(rest.to_string())),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(ChatError::Protocol(format!(
                "unknown engine packet type '{other}'"
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            // Servers send `open`; clients never do. Encoded for completeness in tests.
            Self::Open(h) => format!(
                "0{}",
                json!({
                    "sid": h.sid,
                    "upgrades": h.upgrades,
                    "pingInterval": h.ping_interval,
                    "pingTimeout": h.ping_timeout,
                })
            ),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(data) => format!("4{data}"),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

/// Split a polling response body into packets.
pub fn decode_payload(body: &str) -> Result<Vec<EnginePacket>, ChatError> {
    body.split(RECORD_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(EnginePacket::decode)
        .collect()
}

/// Join packets into a single polling request body.
pub fn encode_payload(packets: &[EnginePacket]) -> String {
    let parts: Vec<String> = packets.iter().map(EnginePacket::encode).collect();
    parts.join(&RECORD_SEPARATOR.to_string())
}

/// Application-level (Socket.IO) packet on the default namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Option<Value>),
    Disconnect,
    /// A named event. `data` is the first argument (`Null` when absent).
    Event {
        name: String,
        data: Value,
        ack: Option<u64>,
    },
    Ack {
        id: u64,
        data: Value,
    },
    ConnectError(Value),
}

impl Packet {
    pub fn event(name: &str, data: Value) -> Self {
        Self::Event {
            name: name.to_string(),
            data,
            ack: None,
        }
    }

    pub fn event_with_ack(name: &str, data: Value, ack: u64) -> Self {
        Self::Event {
            name: name.to_string(),
            data,
            ack: Some(ack),
        }
    }

    /// Name of the event, if this is an event packet.
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Self::Event { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn decode(payload: &str) -> Result<Self, ChatError> {
        let mut chars = payload.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ChatError::Protocol("empty socket packet".into()))?;
        let mut rest = chars.as_str();

        // Skip an explicit namespace ("/chat,"); everything runs on "/".
        if rest.starts_with('/') {
            rest = rest.split_once(',').map_or("", |(_, tail)| tail);
        }

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack = if digits > 0 {
            Some(
                rest[..digits]
                    .parse::<u64>()
                    .map_err(|e| ChatError::Protocol(format!("bad ack id: {e}")))?,
            )
        } else {
            None
        };
        let body = &rest[digits..];

        match kind {
            '0' => Ok(Self::Connect(parse_optional(body)?)),
            '1' => Ok(Self::Disconnect),
            '2' => {
                let mut args = parse_array(body)?;
                if args.is_empty() {
                    return Err(ChatError::Protocol("event without a name".into()));
                }
                let name = match args.remove(0) {
                    Value::String(s) => s,
                    other => {
                        return Err(ChatError::Protocol(format!(
                            "event name is not a string: {other}"
                        )))
                    }
                };
                Ok(Self::Event {
                    name,
                    data: first_arg(args),
                    ack,
                })
            }
            '3' => {
                let id = ack.ok_or_else(|| ChatError::Protocol("ack without id".into()))?;
                Ok(Self::Ack {
                    id,
                    data: first_arg(parse_array(body)?),
                })
            }
            '4' => Ok(Self::ConnectError(
                parse_optional(body)?.unwrap_or(Value::Null),
            )),
            '5' | '6' => Err(ChatError::Protocol("binary packets are not supported".into())),
            other => Err(ChatError::Protocol(format!(
                "unknown socket packet type '{other}'"
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Connect(None) => "0".to_string(),
            Self::Connect(Some(auth)) => format!("0{auth}"),
            Self::Disconnect => "1".to_string(),
            Self::Event { name, data, ack } => {
                let args = if data.is_null() {
                    json!([name])
                } else {
                    json!([name, data])
                };
                match ack {
                    Some(id) => format!("2{id}{args}"),
                    None => format!("2{args}"),
                }
            }
            Self::Ack { id, data } => format!("3{id}{}", json!([data])),
            Self::ConnectError(data) => format!("4{data}"),
        }
    }

    /// Wrap in an Engine.IO message frame, ready for the wire.
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

fn parse_optional(body: &str) -> Result<Option<Value>, ChatError> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(body)
        .map(Some)
        .map_err(|e| ChatError::Protocol(format!("bad packet payload: {e}")))
}

fn parse_array(body: &str) -> Result<Vec<Value>, ChatError> {
    match parse_optional(body)? {
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(ChatError::Protocol(format!(
            "expected argument array, got {other}"
        ))),
        None => Ok(Vec::new()),
    }
}

fn first_arg(args: Vec<Value>) -> Value {
    args.into_iter().next().unwrap_or(Value::Null)
}
