#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::needless_pass_by_value)]

//! support-session library: the session core of a real-time support chat
//! client.
//!
//! - `connection`: transport lifecycle, reconnect state machine, heartbeat
//! - `dispatcher`: named-event routing and ack correlation with timeouts
//! - `ledger`: ordered, deduplicated message sequence with reconciliation
//! - `session`: single-active-conversation controller and presentation events
//! - `transport`: Socket.IO over WebSocket with long-polling fallback
//! - `protocol`: event catalogue and Engine.IO/Socket.IO packet codec
//! - `client`: REST conversation creation
//! - `driver`: the task that runs a session
//! - `config`: configuration loading

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod model;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::ChatError;
pub use session::{Input, Intent, SessionController, SessionEvent};
