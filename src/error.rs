//! Error taxonomy for the chat session.
//!
//! Every failure the session can observe is a [`ChatError`]. Each variant maps
//! onto one of four recovery classes (see [`ErrorClass`]):
//!
//! - **Transport**: connect failure or unexpected disconnect. Drives the
//!   reconnect state machine; only fatal once the attempt budget is spent.
//! - **Protocol**: malformed or incomplete payload. The pending action is
//!   aborted and any optimistic effect rolled back.
//! - **Application**: the server answered but reported failure.
//! - **Timeout**: an acknowledgement did not arrive in time.
//!
//! Errors are handled where they occur and surfaced as status text; none of
//! them propagate out of an event handler.

use std::time::Duration;

/// Recovery class of a [`ChatError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transport,
    Protocol,
    Application,
    Timeout,
}

/// Errors produced by the session core and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Transport error: {0}")]
    Transport(String),

    /// A send was attempted while the connection was not in the `connected` phase.
    #[error("Not connected")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server processed the request and reported failure.
    #[error("{0}")]
    Application(String),

    #[error("No acknowledgement for '{event}' after {}s", after.as_secs())]
    Timeout { event: String, after: Duration },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// Recovery class used by handlers to decide how to roll back.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(_) | Self::NotConnected | Self::Http(_) => ErrorClass::Transport,
            Self::Protocol(_) | Self::Json(_) | Self::Config(_) => ErrorClass::Protocol,
            Self::Application(_) => ErrorClass::Application,
            Self::Timeout { .. } => ErrorClass::Timeout,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.class() == ErrorClass::Timeout
    }
}
