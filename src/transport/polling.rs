//! HTTP long-polling transport.
//!
//! Used when the WebSocket attempt fails. A GET to
//! `<origin>/socket.io/?EIO=4&transport=polling` opens the Engine.IO session;
//! afterwards one GET is always outstanding to receive, and outbound packets
//! are batched into POST bodies separated by `0x1e`.

use std::time::Duration;

use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{normalize_origin, EventSink, TransportEvent, TransportKind, TransportOptions};
use crate::error::ChatError;
use crate::protocol::notice_text;
use crate::protocol::packet::{decode_payload, encode_payload, EnginePacket, Handshake, Packet};

/// Extra time a long-poll GET may take beyond the server's ping window.
const POLL_SLACK: Duration = Duration::from_secs(5);

/// A polling session that has completed the Socket.IO handshake.
pub(super) struct Established {
    http: Client,
    session_url: String,
    handshake: Handshake,
    sid: String,
    /// Packets that arrived in the same poll as the connect ack.
    backlog: Vec<Packet>,
}

/// Build the Socket.IO polling URL from the HTTP origin.
pub fn build_url(origin: &str) -> Result<String, ChatError> {
    let base = normalize_origin(origin)?;
    Ok(format!("{base}/socket.io/?EIO=4&transport=polling"))
}

pub(super) async fn connect(options: &TransportOptions) -> Result<Established, ChatError> {
    tokio::time::timeout(options.connect_timeout, handshake(options))
        .await
        .map_err(|_| {
            ChatError::Transport(format!(
                "polling connect timed out after {}s",
                options.connect_timeout.as_secs()
            ))
        })?
}

async fn handshake(options: &TransportOptions) -> Result<Established, ChatError> {
    let http = Client::builder()
        .connect_timeout(options.connect_timeout)
        .build()
        .map_err(|e| ChatError::Transport(format!("Failed to build HTTP client: {e}")))?;
    let base = build_url(&options.origin)?;

    let body = get_text(&http, &base, options.connect_timeout).await?;
    let handshake = decode_payload(&body)?
        .into_iter()
        .find_map(|p| match p {
            EnginePacket::Open(h) => Some(h),
            _ => None,
        })
        .ok_or_else(|| ChatError::Protocol("polling handshake carried no open packet".into()))?;

    let session_url = format!("{base}&sid={}", handshake.sid);
    post_text(&http, &session_url, Packet::Connect(None).to_frame()).await?;

    let window = poll_window(&handshake);
    let mut backlog = Vec::new();
    loop {
        let body = get_text(&http, &session_url, window).await?;
        let mut sid = None;
        for packet in decode_payload(&body)? {
            match packet {
                EnginePacket::Message(payload) => match Packet::decode(&payload)? {
                    Packet::Connect(data) => {
                        sid = Some(
                            data.as_ref()
                                .and_then(|d| d["sid"].as_str())
                                .map_or_else(|| handshake.sid.clone(), ToString::to_string),
                        );
                    }
                    Packet::ConnectError(data) => {
                        return Err(ChatError::Application(notice_text(&data)));
                    }
                    other if sid.is_some() => backlog.push(other),
                    _ => {}
                },
                EnginePacket::Ping(data) => {
                    post_text(&http, &session_url, EnginePacket::Pong(data).encode()).await?;
                }
                EnginePacket::Close => {
                    return Err(ChatError::Transport("closed during handshake".into()));
                }
                _ => {}
            }
        }
        if let Some(sid) = sid {
            return Ok(Established {
                http,
                session_url,
                handshake,
                sid,
                backlog,
            });
        }
    }
}

fn poll_window(handshake: &Handshake) -> Duration {
    Duration::from_millis(handshake.ping_interval + handshake.ping_timeout) + POLL_SLACK
}

async fn get_text(http: &Client, url: &str, timeout: Duration) -> Result<String, ChatError> {
    let resp = http
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ChatError::Transport(format!("poll failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(ChatError::Transport(format!("poll returned HTTP {}", resp.status())));
    }
    resp.text()
        .await
        .map_err(|e| ChatError::Transport(format!("poll body: {e}")))
}

async fn post_text(http: &Client, url: &str, body: String) -> Result<(), ChatError> {
    let resp = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
        .body(body)
        .send()
        .await
        .map_err(|e| ChatError::Transport(format!("post failed: {e}")))?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(ChatError::Transport(format!("post returned HTTP {}", resp.status())))
    }
}

/// Main I/O loop. Emits `Disconnected` unless cancelled.
pub(super) async fn run(
    established: Established,
    sink: EventSink,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
) {
    let Established {
        http,
        session_url,
        handshake,
        sid,
        backlog,
    } = established;

    debug!(sid = %sid, "polling transport connected");
    if !sink.emit(TransportEvent::Connected {
        sid,
        kind: TransportKind::Polling,
    }) {
        return;
    }
    for packet in backlog {
        sink.emit(TransportEvent::Packet(packet));
    }

    let window = poll_window(&handshake);
    let mut poll = Box::pin(get_text(&http, &session_url, window));

    let reason = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let goodbye = encode_payload(&[
                    EnginePacket::Message(Packet::Disconnect.encode()),
                    EnginePacket::Close,
                ]);
                let _ = post_text(&http, &session_url, goodbye).await;
                return;
            }
            body = &mut poll => {
                let body = match body {
                    Ok(body) => body,
                    Err(e) => break format!("transport error: {e}"),
                };
                match deliver(&body, &http, &session_url, &sink).await {
                    Ok(None) => {}
                    Ok(Some(reason)) => break reason,
                    Err(e) => break format!("transport error: {e}"),
                }
                poll = Box::pin(get_text(&http, &session_url, window));
            }
            packet = outbound.recv() => {
                let Some(first) = packet else { return };
                let mut batch = vec![EnginePacket::Message(first.encode())];
                while let Ok(more) = outbound.try_recv() {
                    batch.push(EnginePacket::Message(more.encode()));
                }
                if let Err(e) = post_text(&http, &session_url, encode_payload(&batch)).await {
                    break format!("transport error: {e}");
                }
            }
        }
    };

    sink.emit(TransportEvent::Disconnected(reason));
}

/// Forward one poll body. `Ok(Some(reason))` means the server closed the session.
async fn deliver(
    body: &str,
    http: &Client,
    url: &str,
    sink: &EventSink,
) -> Result<Option<String>, ChatError> {
    let packets = match decode_payload(body) {
        Ok(packets) => packets,
        Err(e) => {
            warn!("Dropping undecodable poll body: {e}");
            return Ok(None);
        }
    };
    for packet in packets {
        match packet {
            EnginePacket::Ping(data) => {
                post_text(http, url, EnginePacket::Pong(data).encode()).await?;
            }
            EnginePacket::Message(payload) => match Packet::decode(&payload) {
                Ok(Packet::Disconnect) => return Ok(Some("io server disconnect".into())),
                Ok(packet) => {
                    sink.emit(TransportEvent::Packet(packet));
                }
                Err(e) => warn!("Dropping undecodable packet: {e}"),
            },
            EnginePacket::Close => return Ok(Some("transport close".into())),
            _ => {}
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_polling_url() {
        assert_eq!(
            build_url("https://chat.example.com/").unwrap(),
            "https://chat.example.com/socket.io/?EIO=4&transport=polling"
        );
    }

    #[test]
    fn poll_window_covers_ping_cycle() {
        let handshake = Handshake {
            sid: "s".into(),
            upgrades: vec![],
            ping_interval: 25_000,
            ping_timeout: 20_000,
            max_payload: None,
        };
        assert_eq!(poll_window(&handshake), Duration::from_secs(50));
    }
}
