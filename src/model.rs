//! Chat data model: messages and conversations.
//!
//! The wire format uses camelCase keys and carries the text in a `message`
//! field; [`Message::body`] is that field. Server identifiers arrive either as
//! strings or numbers and are normalised to strings so comparisons are exact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Client,
    Agent,
    System,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

/// A single chat message.
///
/// Always carries `id` (server-accepted), `local_id` (optimistic or synthetic),
/// or briefly both while being reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(
        default,
        deserialize_with = "optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    /// Client-side identifier. Never sent to or received from the server.
    #[serde(skip)]
    pub local_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_id: Option<String>,
    pub sender: Sender,
    #[serde(rename = "message")]
    pub body: String,
    /// Missing, null or unparseable timestamps fall back to arrival time.
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// A message typed by the local user, not yet accepted by the server.
    pub fn optimistic(body: &str, conversation_id: Option<String>) -> Self {
        Self {
            id: None,
            local_id: Some(new_local_id("local")),
            conversation_id,
            sender: Sender::Client,
            body: body.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// A session-only notice (agent joined, chat archived).
    pub fn system(body: &str, conversation_id: Option<String>) -> Self {
        Self {
            id: None,
            local_id: Some(new_local_id("system")),
            conversation_id,
            sender: Sender::System,
            body: body.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Stable key for presentation: server id when known, else the local id.
    pub fn key(&self) -> &str {
        self.id
            .as_deref()
            .or(self.local_id.as_deref())
            .unwrap_or_default()
    }

    /// Two messages are the same if they share a server id, or if the same
    /// sender produced the same text within `window` of each other.
    pub fn is_duplicate_of(&self, other: &Message, window: Duration) -> bool {
        if let (Some(a), Some(b)) = (self.id.as_deref(), other.id.as_deref()) {
            if !a.is_empty() && a == b {
                return true;
            }
        }
        if self.sender != other.sender || self.body != other.body {
            return false;
        }
        let delta = (self.timestamp - other.timestamp).num_milliseconds().unsigned_abs();
        u128::from(delta) < window.as_millis()
    }

    /// Fill in a local id for a message the server sent without one.
    pub(crate) fn ensure_key(&mut self, prefix: &str) {
        if self.id.as_deref().map_or(true, str::is_empty) && self.local_id.is_none() {
            self.id = None;
            self.local_id = Some(new_local_id(prefix));
        }
    }
}

/// Server-side conversation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Pending,
    Active,
    Archived,
    /// Any status this client does not know about; never treated as active.
    #[serde(other)]
    Unknown,
}

/// A support conversation as listed by `userConversations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(deserialize_with = "required_id")]
    pub id: String,
    #[serde(default, deserialize_with = "optional_id")]
    pub user_id: Option<String>,
    pub status: ConversationStatus,
}

fn new_local_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

/// Accepts `"abc"`, `123` or `null`.
pub(crate) fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// RFC 3339 text or epoch milliseconds.
pub(crate) fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(parse_timestamp(&value).unwrap_or_else(Utc::now))
}

pub(crate) fn required_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    optional_id(deserializer)?.ok_or_else(|| serde::de::Error::custom("missing id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent(body: &str, at: &str) -> Message {
        serde_json::from_value(json!({
            "message": body,
            "sender": "agent",
            "timestamp": at,
            "conversationId": 7,
        }))
        .unwrap()
    }

    #[test]
    fn parses_wire_message() {
        let msg: Message = serde_json::from_value(json!({
            "id": 42,
            "message": "Hola",
            "sender": "agent",
            "timestamp": "2025-03-01T10:00:00Z",
            "conversationId": "c-1",
            "agentId": "a-9",
        }))
        .unwrap();
        assert_eq!(msg.id.as_deref(), Some("42"));
        assert_eq!(msg.conversation_id.as_deref(), Some("c-1"));
        assert_eq!(msg.body, "Hola");
        assert_eq!(msg.sender, Sender::Agent);
        assert!(msg.local_id.is_none());
    }

    #[test]
    fn numeric_conversation_id_compares_as_string() {
        let msg = agent("hi", "2025-03-01T10:00:00Z");
        assert_eq!(msg.conversation_id.as_deref(), Some("7"));
    }

    #[test]
    fn duplicate_within_window() {
        let a = agent("Hi", "2025-03-01T10:00:00.000Z");
        let b = agent("Hi", "2025-03-01T10:00:01.200Z");
        assert!(b.is_duplicate_of(&a, Duration::from_secs(3)));
    }

    #[test]
    fn not_duplicate_outside_window() {
        let a = agent("Hi", "2025-03-01T10:00:00.000Z");
        let b = agent("Hi", "2025-03-01T10:00:03.000Z");
        assert!(!b.is_duplicate_of(&a, Duration::from_secs(3)));
    }

    #[test]
    fn different_sender_is_not_duplicate() {
        let a = agent("Hi", "2025-03-01T10:00:00Z");
        let mut b = a.clone();
        b.sender = Sender::Client;
        assert!(!b.is_duplicate_of(&a, Duration::from_secs(3)));
    }

    #[test]
    fn same_id_is_duplicate_regardless_of_content() {
        let mut a = agent("one", "2025-03-01T10:00:00Z");
        let mut b = agent("two", "2025-03-01T11:00:00Z");
        a.id = Some("m1".into());
        b.id = Some("m1".into());
        assert!(b.is_duplicate_of(&a, Duration::from_secs(3)));
    }

    #[test]
    fn optimistic_has_local_id_only() {
        let msg = Message::optimistic("hello", None);
        assert!(msg.id.is_none());
        assert!(msg.local_id.as_deref().unwrap().starts_with("local-"));
        assert_eq!(msg.key(), msg.local_id.as_deref().unwrap());
    }

    #[test]
    fn null_or_epoch_timestamp_still_decodes() {
        let null: Message = serde_json::from_value(json!({
            "message": "hi",
            "sender": "agent",
            "timestamp": null,
        }))
        .unwrap();
        assert!((Utc::now() - null.timestamp).num_seconds() < 5);

        let epoch: Message = serde_json::from_value(json!({
            "message": "hi",
            "sender": "agent",
            "timestamp": 1_740_823_200_000_i64,
        }))
        .unwrap();
        assert_eq!(epoch.timestamp.to_rfc3339(), "2025-03-01T10:00:00+00:00");
    }

    #[test]
    fn unknown_conversation_status_is_not_active() {
        let conv: Conversation =
            serde_json::from_value(json!({"id": "c1", "userId": "u", "status": "closed"}))
                .unwrap();
        assert_eq!(conv.status, ConversationStatus::Unknown);
    }
}
