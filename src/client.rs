//! HTTP client for the chat backend's REST endpoints.
//!
//! Only one endpoint is used: `POST /chat/start-chat`, an alternate way to
//! create a conversation. It yields the same result as the
//! `createConversation` socket event and feeds the same session transition.
//!
//! Non-2xx responses are parsed for a `message` (or `error`) field in the
//! JSON body; if that fails the raw body is used as the error text.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::ChatError;
use crate::protocol;

/// HTTP client for one chat backend.
#[derive(Clone)]
pub struct ChatApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ChatApiClient {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /chat/start-chat`: create (or reopen) the user's conversation.
    /// Returns the conversation id.
    pub async fn start_chat(&self, user_id: &str) -> Result<String, ChatError> {
        let resp = self
            .http
            .post(format!("{}/chat/start-chat", self.base_url))
            .json(&json!({ "userId": user_id }))
            .send()
            .await?;
        let body = Self::handle_response(resp).await?;
        parse_start_chat(&body)
    }

    /// JSON body on success, [`ChatError::Application`] with the server's
    /// message otherwise.
    async fn handle_response(resp: reqwest::Response) -> Result<Value, ChatError> {
        let status = resp.status();
        let body = resp.text().await?;
        decode_body(status, body)
    }
}

fn decode_body(status: reqwest::StatusCode, body: String) -> Result<Value, ChatError> {
    if status.is_success() {
        return Ok(serde_json::from_str(&body)?);
    }
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v["message"]
                .as_str()
                .or_else(|| v["error"].as_str())
                .map(String::from)
        })
        .unwrap_or(body);
    Err(ChatError::Application(format!(
        "HTTP {}: {message}",
        status.as_u16()
    )))
}

/// `{success?, message?, data: {conversationId}}` → conversation id.
fn parse_start_chat(body: &Value) -> Result<String, ChatError> {
    if body["success"] == Value::Bool(false) {
        return Err(ChatError::Application(
            body["message"]
                .as_str()
                .unwrap_or("conversation creation rejected")
                .to_string(),
        ));
    }
    protocol::conversation_id(&body["data"])
}
