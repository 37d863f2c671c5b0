//! WebSocket transport.
//!
//! Connects to `<origin>/socket.io/?EIO=4&transport=websocket`, completes the
//! Engine.IO open + Socket.IO connect handshake within the connect timeout,
//! then pumps frames until the socket drops or the handle is closed. Engine.IO
//! pings are answered here and never reach the session; if the server stops
//! pinging for longer than `pingInterval + pingTimeout` the connection is
//! treated as dead.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{normalize_origin, EventSink, TransportEvent, TransportKind, TransportOptions};
use crate::error::ChatError;
use crate::protocol::notice_text;
use crate::protocol::packet::{EnginePacket, Handshake, Packet};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A socket that has completed the Socket.IO handshake.
pub(super) struct Established {
    stream: WsStream,
    handshake: Handshake,
    sid: String,
}

/// Build the Socket.IO WebSocket URL from the HTTP origin.
pub fn build_url(origin: &str) -> Result<String, ChatError> {
    let base = normalize_origin(origin)?;
    let ws_base = if base.starts_with("https://") {
        base.replacen("https://", "wss://", 1)
    } else {
        base.replacen("http://", "ws://", 1)
    };
    Ok(format!("{ws_base}/socket.io/?EIO=4&transport=websocket"))
}

pub(super) async fn connect(options: &TransportOptions) -> Result<Established, ChatError> {
    let url = build_url(&options.origin)?;
    tokio::time::timeout(options.connect_timeout, handshake(&url))
        .await
        .map_err(|_| {
            ChatError::Transport(format!(
                "WebSocket connect timed out after {}s",
                options.connect_timeout.as_secs()
            ))
        })?
}

async fn handshake(url: &str) -> Result<Established, ChatError> {
    let (mut stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ChatError::Transport(format!("WebSocket connect failed: {e}")))?;

    let handshake = loop {
        if let EnginePacket::Open(h) = EnginePacket::decode(&next_text(&mut stream).await?)? {
            break h;
        }
    };

    send_text(&mut stream, Packet::Connect(None).to_frame()).await?;

    let sid = loop {
        match EnginePacket::decode(&next_text(&mut stream).await?)? {
            EnginePacket::Message(payload) => match Packet::decode(&payload)? {
                Packet::Connect(data) => {
                    break data
                        .as_ref()
                        .and_then(|d| d["sid"].as_str())
                        .map_or_else(|| handshake.sid.clone(), ToString::to_string);
                }
                Packet::ConnectError(data) => {
                    return Err(ChatError::Application(notice_text(&data)));
                }
                _ => {}
            },
            EnginePacket::Ping(data) => {
                send_text(&mut stream, EnginePacket::Pong(data).encode()).await?;
            }
            EnginePacket::Close => {
                return Err(ChatError::Transport("closed during handshake".into()));
            }
            _ => {}
        }
    };

    Ok(Established {
        stream,
        handshake,
        sid,
    })
}

async fn next_text(stream: &mut WsStream) -> Result<String, ChatError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_string()),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ChatError::Transport("closed during handshake".into()))
            }
            Some(Err(e)) => return Err(ChatError::Transport(e.to_string())),
            Some(Ok(_)) => {}
        }
    }
}

async fn send_text(stream: &mut WsStream, frame: String) -> Result<(), ChatError> {
    stream
        .send(Message::Text(frame.into()))
        .await
        .map_err(|e| ChatError::Transport(format!("WebSocket send failed: {e}")))
}

/// Main I/O loop: forwards inbound packets to the session, writes outbound
/// packets, answers Engine.IO pings. Emits `Disconnected` unless cancelled.
pub(super) async fn run(
    established: Established,
    sink: EventSink,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
) {
    let Established {
        stream,
        handshake,
        sid,
    } = established;
    let (mut ws_sink, mut ws_reader) = stream.split();

    debug!(sid = %sid, "WebSocket transport connected");
    if !sink.emit(TransportEvent::Connected {
        sid,
        kind: TransportKind::WebSocket,
    }) {
        return;
    }

    let liveness = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
    let deadline = tokio::time::sleep(liveness);
    tokio::pin!(deadline);

    let reason = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = ws_sink.send(Message::Text(Packet::Disconnect.to_frame().into())).await;
                let _ = ws_sink.close().await;
                return;
            }
            () = &mut deadline, if !liveness.is_zero() => {
                break "ping timeout".to_string();
            }
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match EnginePacket::decode(text.as_str()) {
                        Ok(EnginePacket::Ping(data)) => {
                            deadline.as_mut().reset(Instant::now() + liveness);
                            let pong = EnginePacket::Pong(data).encode();
                            if let Err(e) = ws_sink.send(Message::Text(pong.into())).await {
                                break format!("transport error: {e}");
                            }
                        }
                        Ok(EnginePacket::Message(payload)) => match Packet::decode(&payload) {
                            Ok(Packet::Disconnect) => break "io server disconnect".to_string(),
                            Ok(packet) => {
                                if !sink.emit(TransportEvent::Packet(packet)) {
                                    return;
                                }
                            }
                            Err(e) => warn!("Dropping undecodable packet: {e}"),
                        },
                        Ok(EnginePacket::Close) => break "transport close".to_string(),
                        Ok(_) => {}
                        Err(e) => warn!("Dropping undecodable frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break "transport close".to_string(),
                    Some(Err(e)) => break format!("transport error: {e}"),
                    Some(Ok(_)) => {} // Binary/Ping/Pong frames
                }
            }
            packet = outbound.recv() => {
                match packet {
                    Some(packet) => {
                        let frame = packet.to_frame();
                        if let Err(e) = ws_sink.send(Message::Text(frame.into())).await {
                            break format!("transport error: {e}");
                        }
                    }
                    // Handle dropped without close(): nothing left to serve.
                    None => return,
                }
            }
        }
    };

    sink.emit(TransportEvent::Disconnected(reason));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_secure_url() {
        assert_eq!(
            build_url("https://chat.example.com/").unwrap(),
            "wss://chat.example.com/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn builds_plain_url() {
        assert_eq!(
            build_url("http://localhost:3000").unwrap(),
            "ws://localhost:3000/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn rejects_ws_scheme_origin() {
        assert!(build_url("wss://chat.example.com").is_err());
    }
}
