//! Transport seam between the session core and the network.
//!
//! [`Connector::open`] starts one physical connection and returns a
//! [`Transport`] handle for outbound packets. Everything the connection
//! observes (handshake done, packets, failures) is posted back through an
//! [`EventSink`] as [`Input::Transport`], tagged with the generation the
//! connection was opened under. The session drops inputs from any generation
//! other than the current one, so a torn-down connection can never act on
//! session state.
//!
//! [`SocketIoConnector`] is the production connector: it negotiates a
//! WebSocket first and falls back to HTTP long-polling when the WebSocket
//! attempt fails at the network level.

pub mod polling;
pub mod websocket;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ChatError, ErrorClass};
use crate::protocol::packet::Packet;
use crate::session::Input;

/// Which physical transport carried a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Polling,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Polling => "polling",
        }
    }
}

/// What a connection reports back to the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Socket.IO handshake completed; `sid` is the server-assigned connection id.
    Connected { sid: String, kind: TransportKind },
    Packet(Packet),
    /// The connection could not be established.
    ConnectError(String),
    /// An established connection dropped.
    Disconnected(String),
}

/// Generation-tagged route from an I/O task into the session loop.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<Input>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Post an event. Returns `false` once the session loop has gone away.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Input::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Outbound half of an open connection.
pub trait Transport: Send {
    fn send(&mut self, packet: Packet) -> Result<(), ChatError>;
    /// Tear the connection down. No further events are emitted for it.
    fn close(&mut self);
}

/// Opens connections.
pub trait Connector: Send {
    fn open(&mut self, sink: EventSink) -> Box<dyn Transport>;
}

/// Connection parameters shared by both physical transports.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Backend origin, `http://` or `https://`.
    pub origin: String,
    pub connect_timeout: Duration,
    /// Try a WebSocket before falling back to polling.
    pub prefer_websocket: bool,
}

/// Production connector speaking Socket.IO v4.
pub struct SocketIoConnector {
    options: TransportOptions,
}

impl SocketIoConnector {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

impl Connector for SocketIoConnector {
    fn open(&mut self, sink: EventSink) -> Box<dyn Transport> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        debug!(generation = sink.generation(), "opening transport");
        tokio::spawn(negotiate(self.options.clone(), sink, rx, cancel.clone()));
        Box::new(ChannelTransport {
            outbound: tx,
            cancel,
        })
    }
}

/// Handle to a spawned I/O task.
struct ChannelTransport {
    outbound: mpsc::UnboundedSender<Packet>,
    cancel: CancellationToken,
}

impl Transport for ChannelTransport {
    fn send(&mut self, packet: Packet) -> Result<(), ChatError> {
        self.outbound
            .send(packet)
            .map_err(|_| ChatError::Transport("transport task has stopped".into()))
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Pick a physical transport and run it until it drops or is cancelled.
///
/// Both attempts share one connect timeout; the polling fallback only gets
/// what the WebSocket attempt left over.
async fn negotiate(
    options: TransportOptions,
    sink: EventSink,
    outbound: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
) {
    let started = std::time::Instant::now();
    let mut websocket_failure = None;

    if options.prefer_websocket {
        let attempt = tokio::select! {
            () = cancel.cancelled() => return,
            result = websocket::connect(&options) => result,
        };
        match attempt {
            Ok(established) => {
                websocket::run(established, sink, outbound, cancel).await;
                return;
            }
            Err(e) if e.class() == ErrorClass::Transport => {
                warn!("WebSocket transport unavailable ({e}), falling back to polling");
                websocket_failure = Some(e);
            }
            Err(e) => {
                sink.emit(TransportEvent::ConnectError(e.to_string()));
                return;
            }
        }
    }

    let Some(remaining) = remaining_budget(options.connect_timeout, started.elapsed()) else {
        let reason = websocket_failure.map_or_else(String::new, |ws| format!("{ws}; "));
        sink.emit(TransportEvent::ConnectError(format!(
            "{reason}connect timed out after {}s",
            options.connect_timeout.as_secs()
        )));
        return;
    };
    let polling_options = TransportOptions {
        connect_timeout: remaining,
        ..options
    };
    let attempt = tokio::select! {
        () = cancel.cancelled() => return,
        result = polling::connect(&polling_options) => result,
    };
    match attempt {
        Ok(established) => polling::run(established, sink, outbound, cancel).await,
        Err(e) => {
            let message = match websocket_failure {
                Some(ws) => format!("{ws}; polling: {e}"),
                None => e.to_string(),
            };
            sink.emit(TransportEvent::ConnectError(message));
        }
    }
}

/// Time left of the connect timeout after `spent`, `None` once exhausted.
fn remaining_budget(total: Duration, spent: Duration) -> Option<Duration> {
    total.checked_sub(spent).filter(|left| !left.is_zero())
}

/// `https://host/` → `https://host` with a validated scheme.
pub(crate) fn normalize_origin(origin: &str) -> Result<&str, ChatError> {
    let base = origin.trim_end_matches('/');
    if base.starts_with("https://") || base.starts_with("http://") {
        Ok(base)
    } else {
        Err(ChatError::Config(format!("Invalid URL scheme: {base}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_tags_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(4, tx);
        assert!(sink.emit(TransportEvent::Disconnected("bye".into())));
        match rx.try_recv().unwrap() {
            Input::Transport { generation, event } => {
                assert_eq!(generation, 4);
                assert_eq!(event, TransportEvent::Disconnected("bye".into()));
            }
            _ => panic!("expected transport input"),
        }
    }

    #[test]
    fn sink_reports_closed_loop() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(1, tx);
        assert!(!sink.emit(TransportEvent::ConnectError("x".into())));
    }

    #[test]
    fn fallback_gets_only_the_leftover_connect_budget() {
        let total = Duration::from_secs(10);
        assert_eq!(remaining_budget(total, Duration::ZERO), Some(total));
        assert_eq!(
            remaining_budget(total, Duration::from_millis(9_400)),
            Some(Duration::from_millis(600))
        );
        assert_eq!(remaining_budget(total, total), None);
        assert_eq!(remaining_budget(total, Duration::from_secs(12)), None);
    }

    #[test]
    fn origin_requires_http_scheme() {
        assert_eq!(
            normalize_origin("https://chat.example.com/").unwrap(),
            "https://chat.example.com"
        );
        assert!(normalize_origin("ftp://chat.example.com").is_err());
    }
}
