//! Chat backend event catalogue and payload helpers.
//!
//! ## Events (client → server)
//!
//! | Event                  | Payload                              | Ack                                  |
//! |------------------------|--------------------------------------|--------------------------------------|
//! | `joinChat`             | `userId`, `officeId?`                | `{success}`                          |
//! | `getUserConversations` | `userId`, `officeId?`                | none (answered by `userConversations`)|
//! | `createConversation`   | `userId`, `officeId?`                | `{success, data:{conversationId}}`   |
//! | `getMessages`          | `conversationId`                     | none (answered by `messageHistory`)   |
//! | `clientMessage`        | `userId`, `message`, `conversationId`| `{success, data:{messageId, timestamp?}}` |
//! | `checkConnection`      | -                                    | connection status echo               |
//! | `pong`                 | -                                    | -                                    |
//!
//! ## Events (server → client)
//!
//! | Event                  | Payload                              |
//! |------------------------|--------------------------------------|
//! | `connect`              | `sid`                                |
//! | `connect_error`        | `message`                            |
//! | `disconnect`           | `reason`                             |
//! | `message` / `newMessage` | message                            |
//! | `messageHistory`       | message array                        |
//! | `messageConfirmation`  | send result                          |
//! | `userConversations`    | conversation array                   |
//! | `agentAssigned`        | `conversationId`, `agentId`          |
//! | `chatArchived`         | `conversationId`                     |
//! | `ping`                 | none (answered with `pong`)           |
//! | `error` / `messageError` | `message`                          |

pub mod packet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ChatError;

pub const JOIN_CHAT: &str = "joinChat";
pub const GET_USER_CONVERSATIONS: &str = "getUserConversations";
pub const CREATE_CONVERSATION: &str = "createConversation";
pub const GET_MESSAGES: &str = "getMessages";
pub const CLIENT_MESSAGE: &str = "clientMessage";
pub const CHECK_CONNECTION: &str = "checkConnection";
pub const PONG: &str = "pong";

pub const MESSAGE: &str = "message";
pub const NEW_MESSAGE: &str = "newMessage";
pub const MESSAGE_HISTORY: &str = "messageHistory";
pub const MESSAGE_CONFIRMATION: &str = "messageConfirmation";
pub const USER_CONVERSATIONS: &str = "userConversations";
pub const AGENT_ASSIGNED: &str = "agentAssigned";
pub const CHAT_ARCHIVED: &str = "chatArchived";
pub const PING: &str = "ping";
pub const ERROR: &str = "error";
pub const MESSAGE_ERROR: &str = "messageError";

/// Payload shared by `joinChat`, `getUserConversations` and `createConversation`.
pub fn user_payload(user_id: &str, office_id: Option<&str>) -> Value {
    let mut payload = json!({ "userId": user_id });
    if let Some(office) = office_id {
        payload["officeId"] = json!(office);
    }
    payload
}

pub fn get_messages_payload(conversation_id: &str) -> Value {
    json!({ "conversationId": conversation_id })
}

pub fn client_message_payload(user_id: &str, body: &str, conversation_id: &str) -> Value {
    json!({
        "userId": user_id,
        "message": body,
        "conversationId": conversation_id,
    })
}

/// Decode an event payload, tagging failures with the event name.
pub fn decode<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, ChatError> {
    serde_json::from_value(data)
        .map_err(|e| ChatError::Protocol(format!("malformed '{event}' payload: {e}")))
}

/// The `{success, message?, data?}` envelope used by acks and confirmations.
#[derive(Debug, Clone, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Reply {
    pub fn parse(event: &str, data: Value) -> Result<Self, ChatError> {
        if !data.is_object() {
            return Err(ChatError::Protocol(format!(
                "'{event}' reply is not an object: {data}"
            )));
        }
        decode(event, data)
    }

    /// `Ok(data)` on success, [`ChatError::Application`] when the server said no.
    pub fn into_data(self) -> Result<Value, ChatError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(ChatError::Application(
                self.message
                    .unwrap_or_else(|| "request rejected by server".to_string()),
            ))
        }
    }
}

/// Extract `conversationId` from a create reply's `data`.
pub fn conversation_id(data: &Value) -> Result<String, ChatError> {
    id_field(data, "conversationId")
        .ok_or_else(|| ChatError::Protocol("reply carries no conversationId".into()))
}

/// Server receipt for an accepted `clientMessage`.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub message_id: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl SendReceipt {
    pub fn from_data(data: &Value) -> Result<Self, ChatError> {
        let message_id = id_field(data, "messageId")
            .ok_or_else(|| ChatError::Protocol("reply carries no messageId".into()))?;
        let timestamp = crate::model::parse_timestamp(&data["timestamp"]);
        Ok(Self {
            message_id,
            timestamp,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAssigned {
    #[serde(deserialize_with = "crate::model::required_id")]
    pub conversation_id: String,
    #[serde(default, deserialize_with = "crate::model::optional_id")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatArchived {
    #[serde(deserialize_with = "crate::model::required_id")]
    pub conversation_id: String,
}

/// Human-readable text from an `error`-style payload (`"text"` or `{message}`).
pub fn notice_text(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Object(_) => data["message"]
            .as_str()
            .or_else(|| data["reason"].as_str())
            .unwrap_or("unknown")
            .to_string(),
        Value::Null => "unknown".to_string(),
        other => other.to_string(),
    }
}

fn id_field(data: &Value, key: &str) -> Option<String> {
    match &data[key] {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
