//! Socket.IO push channel over a raw WebSocket
//!
//! Speaks just enough of Engine.IO v4 / Socket.IO v5 to receive ad
//! commands:
//!
//! | Engine.IO | meaning            | Socket.IO (inside `4`) | meaning        |
//! |-----------|--------------------|------------------------|----------------|
//! | `0`       | open               | `0`                    | connect        |
//! | `1`       | close              | `1`                    | disconnect     |
//! | `2` / `3` | ping / pong        | `2`                    | event `[name, ...args]` |
//! | `4`       | message            | `4`                    | connect error  |
//!
//! Handshake: open → client `40` → server event `identify` → client emits
//! `identification` with the token → server event `join`. After that, each
//! `playAudio` event becomes an [`AdEvent`].

use crate::engine::collaborators::{PushChannel, PushConnector};
use crate::error::{Error, Result};
use crate::events::AdEvent;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Wait for the reader task to finish after a close request
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Engine.IO packet
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open,
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Unknown(String),
}

/// Socket.IO packet carried in an Engine.IO message
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect,
    Disconnect,
    Event { name: String, args: Vec<Value> },
    ConnectError(String),
    Unknown(String),
}

/// Parse one text frame.
pub fn parse_packet(text: &str) -> EnginePacket {
    let mut chars = text.chars();
    match chars.next() {
        Some('0') => EnginePacket::Open,
        Some('1') => EnginePacket::Close,
        Some('2') => EnginePacket::Ping,
        Some('3') => EnginePacket::Pong,
        Some('4') => EnginePacket::Message(parse_socket_packet(chars.as_str())),
        _ => EnginePacket::Unknown(text.to_string()),
    }
}

fn parse_socket_packet(text: &str) -> SocketPacket {
    let mut chars = text.chars();
    let kind = chars.next();

    // Optional "/namespace," prefix, then optional ack id digits
    let mut rest = chars.as_str();
    if rest.starts_with('/') {
        rest = rest.find(',').map_or("", |i| &rest[i + 1..]);
    }
    let payload = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    match kind {
        Some('0') => SocketPacket::Connect,
        Some('1') => SocketPacket::Disconnect,
        Some('2') => match serde_json::from_str::<Vec<Value>>(payload) {
            Ok(mut items) if !items.is_empty() => match items.remove(0) {
                Value::String(name) => SocketPacket::Event { name, args: items },
                _ => SocketPacket::Unknown(text.to_string()),
            },
            _ => SocketPacket::Unknown(text.to_string()),
        },
        Some('4') => SocketPacket::ConnectError(payload.to_string()),
        _ => SocketPacket::Unknown(text.to_string()),
    }
}

/// Ad URL carried by a `playAudio` argument.
///
/// A string argument is used from its first `http`; an object argument uses
/// its `url` field, else its first string value starting with `http`.
pub fn extract_ad_url(arg: &Value) -> Option<String> {
    match arg {
        Value::String(s) => s.find("http").map(|i| s[i..].trim().to_string()),
        Value::Object(map) => map
            .get("url")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| {
                map.values()
                    .filter_map(Value::as_str)
                    .find(|s| s.starts_with("http"))
                    .map(str::to_string)
            }),
        _ => None,
    }
}

/// WebSocket URL for the Socket.IO endpoint of `base_url`.
pub fn socket_url(base_url: &str, socket_path: &str) -> Result<String> {
    let base = base_url.trim_end_matches('/');
    let host = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(Error::Config(format!("Unsupported backend URL '{}'", base_url)));
    };

    let path = format!("/{}", socket_path.trim_matches('/'));
    Ok(format!("{}{}/?EIO=4&transport=websocket", host, path))
}

/// Opens Socket.IO push channels on the backend.
#[derive(Debug, Clone)]
pub struct SocketIoConnector {
    base_url: String,
    socket_path: String,
    open_timeout: Duration,
}

impl SocketIoConnector {
    pub fn new(base_url: &str, socket_path: &str, open_timeout: Duration) -> Self {
        Self {
            base_url: base_url.to_string(),
            socket_path: socket_path.to_string(),
            open_timeout,
        }
    }

    async fn connect(
        &self,
        token: &str,
        events: &mpsc::Sender<AdEvent>,
    ) -> Result<(WsSink, WsSource)> {
        let url = socket_url(&self.base_url, &self.socket_path)?;
        debug!(url = %url, "Opening push channel");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Config(format!("Invalid push channel URL {}: {}", url, e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::Request(format!("Access token is not a valid header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Connectivity(format!("WebSocket connect to {} failed: {}", url, e)))?;

        let (mut sink, mut source) = ws_stream.split();
        handshake(&mut sink, &mut source, token, events).await?;
        Ok((sink, source))
    }
}

#[async_trait]
impl PushConnector for SocketIoConnector {
    async fn open(&self, token: &str, events: mpsc::Sender<AdEvent>) -> Result<Box<dyn PushChannel>> {
        let (sink, source) = tokio::time::timeout(self.open_timeout, self.connect(token, &events))
            .await
            .map_err(|_| {
                Error::Connectivity(format!(
                    "Push channel did not join within {:?}",
                    self.open_timeout
                ))
            })??;

        info!("Push channel joined");

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(read_loop(sink, source, events, shutdown.clone()));

        Ok(Box::new(SocketIoChannel {
            shutdown,
            task: Some(task),
        }))
    }
}

async fn send_text(sink: &mut WsSink, text: impl Into<String>) -> Result<()> {
    let text = text.into();
    trace!(packet = %text, "Sending");
    sink.send(Message::Text(text))
        .await
        .map_err(|e| Error::Connectivity(format!("WebSocket send failed: {}", e)))
}

/// Run the Socket.IO handshake until the server joins us to our room.
async fn handshake(
    sink: &mut WsSink,
    source: &mut WsSource,
    token: &str,
    events: &mpsc::Sender<AdEvent>,
) -> Result<()> {
    while let Some(message) = source.next().await {
        let message =
            message.map_err(|e| Error::Connectivity(format!("WebSocket receive failed: {}", e)))?;

        let text = match message {
            Message::Text(text) => text,
            Message::Close(frame) => {
                return Err(Error::Connectivity(format!(
                    "Push channel closed during handshake: {:?}",
                    frame
                )));
            }
            _ => continue,
        };

        match parse_packet(&text) {
            EnginePacket::Open => send_text(sink, "40").await?,
            EnginePacket::Ping => send_text(sink, "3").await?,
            EnginePacket::Close => {
                return Err(Error::Connectivity("Server closed the session".to_string()));
            }
            EnginePacket::Message(SocketPacket::Connect) => debug!("Socket.IO connected"),
            EnginePacket::Message(SocketPacket::ConnectError(reason)) => {
                return Err(Error::Connectivity(format!("Socket.IO connect error: {}", reason)));
            }
            EnginePacket::Message(SocketPacket::Event { name, args }) => match name.as_str() {
                "identify" => {
                    let payload = serde_json::json!(["identification", token]);
                    send_text(sink, format!("42{}", payload)).await?;
                    debug!("Sent identification");
                }
                "join" => {
                    debug!(room = ?args.first(), "Joined");
                    return Ok(());
                }
                _ => {
                    if !handle_event(&name, &args, events) {
                        return Err(Error::Connectivity(
                            "Ad event receiver dropped during handshake".to_string(),
                        ));
                    }
                }
            },
            other => trace!(?other, "Ignoring packet during handshake"),
        }
    }

    Err(Error::Connectivity("Push channel ended during handshake".to_string()))
}

/// Forward a `playAudio` event. Returns false once the receiver is gone.
fn handle_event(name: &str, args: &[Value], events: &mpsc::Sender<AdEvent>) -> bool {
    if name != "playAudio" {
        trace!(event = name, "Ignoring event");
        return true;
    }

    let Some(url) = args.first().and_then(extract_ad_url) else {
        warn!(?args, "playAudio event without a URL");
        return true;
    };

    info!(url = %url, "Ad requested");
    match events.try_send(AdEvent::new(url)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(url = %event.url, "Ad event queue full, dropping event");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

async fn read_loop(
    mut sink: WsSink,
    mut source: WsSource,
    events: mpsc::Sender<AdEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Err(e) = send_text(&mut sink, "41").await {
                    debug!("Disconnect not delivered: {}", e);
                }
                let _ = sink.close().await;
                break;
            }
            message = source.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "Push channel closed by server");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Push channel receive failed: {}", e);
                        break;
                    }
                    None => {
                        info!("Push channel ended");
                        break;
                    }
                };

                match parse_packet(&text) {
                    EnginePacket::Ping => {
                        if let Err(e) = send_text(&mut sink, "3").await {
                            warn!("Failed to answer ping: {}", e);
                            break;
                        }
                    }
                    EnginePacket::Close | EnginePacket::Message(SocketPacket::Disconnect) => {
                        info!("Server disconnected the push channel");
                        break;
                    }
                    EnginePacket::Message(SocketPacket::Event { name, args }) => {
                        if !handle_event(&name, &args, &events) {
                            debug!("Event receiver dropped, stopping reader");
                            break;
                        }
                    }
                    other => trace!(?other, "Ignoring packet"),
                }
            }
        }
    }
    // Dropping `events` here tells the engine the channel is gone
}

/// An open Socket.IO connection
struct SocketIoChannel {
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl PushChannel for SocketIoChannel {
    async fn close(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        info!("Closing push channel");
        self.shutdown.cancel();
        if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
            warn!("Push channel reader did not stop in time");
        }
        Ok(())
    }
}

impl Drop for SocketIoChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_engine_packets() {
        assert_eq!(parse_packet(r#"0{"sid":"abc"}"#), EnginePacket::Open);
        assert_eq!(parse_packet("2"), EnginePacket::Ping);
        assert_eq!(parse_packet("3"), EnginePacket::Pong);
        assert_eq!(parse_packet("40"), EnginePacket::Message(SocketPacket::Connect));
        assert_eq!(parse_packet("41"), EnginePacket::Message(SocketPacket::Disconnect));
        assert!(matches!(parse_packet("x"), EnginePacket::Unknown(_)));
    }

    #[test]
    fn test_parse_event_with_namespace_and_ack() {
        let packet = parse_packet(r#"42/shops,17["playAudio","http://ads/a.mp3"]"#);
        assert_eq!(
            packet,
            EnginePacket::Message(SocketPacket::Event {
                name: "playAudio".to_string(),
                args: vec![json!("http://ads/a.mp3")],
            })
        );
    }

    #[test]
    fn test_parse_connect_error() {
        let packet = parse_packet(r#"44{"message":"unauthorized"}"#);
        assert_eq!(
            packet,
            EnginePacket::Message(SocketPacket::ConnectError(
                r#"{"message":"unauthorized"}"#.to_string()
            ))
        );
    }

    #[test]
    fn test_extract_ad_url_variants() {
        assert_eq!(
            extract_ad_url(&json!("http://ads/a.mp3")).as_deref(),
            Some("http://ads/a.mp3")
        );
        assert_eq!(
            extract_ad_url(&json!({"url": "https://ads/b.mp3", "title": "x"})).as_deref(),
            Some("https://ads/b.mp3")
        );
        assert_eq!(
            extract_ad_url(&json!({"title": "promo", "file": "https://ads/c.mp3"})).as_deref(),
            Some("https://ads/c.mp3")
        );
        assert_eq!(extract_ad_url(&json!({"title": "promo"})), None);
        assert_eq!(extract_ad_url(&json!(42)), None);
    }

    #[test]
    fn test_socket_url() {
        assert_eq!(
            socket_url("https://backend.example/", "/socket.io").unwrap(),
            "wss://backend.example/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            socket_url("http://127.0.0.1:3000", "socket.io/").unwrap(),
            "ws://127.0.0.1:3000/socket.io/?EIO=4&transport=websocket"
        );
        assert!(matches!(socket_url("ftp://x", "/socket.io"), Err(Error::Config(_))));
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("unexpected websocket item: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_and_play_audio() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            ws.send(Message::Text(r#"0{"sid":"s1","pingInterval":25000}"#.into()))
                .await
                .unwrap();
            assert_eq!(next_text(&mut ws).await, "40");

            ws.send(Message::Text(r#"40{"sid":"x"}"#.into())).await.unwrap();
            ws.send(Message::Text(r#"42["identify"]"#.into())).await.unwrap();
            assert_eq!(next_text(&mut ws).await, r#"42["identification","tok"]"#);

            ws.send(Message::Text(r#"42["join","company-1"]"#.into())).await.unwrap();
            ws.send(Message::Text("2".into())).await.unwrap();
            assert_eq!(next_text(&mut ws).await, "3");

            ws.send(Message::Text(r#"42["playAudio",{"url":"http://ads/a.mp3"}]"#.into()))
                .await
                .unwrap();

            // Client disconnect on close
            assert_eq!(next_text(&mut ws).await, "41");
        });

        let connector = SocketIoConnector::new(&format!("http://{}", addr), "/socket.io", Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(4);
        let mut channel = connector.open("tok", tx).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.url, "http://ads/a.mp3");

        channel.close().await.unwrap();
        channel.close().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_error_fails_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"0{"sid":"s1"}"#.into())).await.unwrap();
            let _ = next_text(&mut ws).await;
            ws.send(Message::Text(r#"44{"message":"invalid token"}"#.into()))
                .await
                .unwrap();
            // Keep the socket open until the client gives up
            let _ = ws.next().await;
        });

        let connector = SocketIoConnector::new(&format!("http://{}", addr), "/socket.io", Duration::from_secs(5));
        let (tx, _rx) = mpsc::channel(4);
        let result = connector.open("bad", tx).await;
        assert!(matches!(result, Err(Error::Connectivity(_))));
    }

    #[tokio::test]
    async fn test_dropped_receiver_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"0{"sid":"s1"}"#.into())).await.unwrap();
            let _ = next_text(&mut ws).await;
            ws.send(Message::Text(r#"42["playAudio","http://ads/early.mp3"]"#.into()))
                .await
                .unwrap();
            let _ = ws.next().await;
        });

        let connector = SocketIoConnector::new(&format!("http://{}", addr), "/socket.io", Duration::from_secs(5));
        let (tx, rx) = mpsc::channel(4);
        drop(rx);

        match connector.open("tok", tx).await {
            Err(Error::Connectivity(msg)) => assert!(msg.contains("receiver dropped"), "{}", msg),
            Err(other) => panic!("expected Connectivity error, got {:?}", other),
            Ok(_) => panic!("handshake should fail once the receiver is gone"),
        }
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await;
        });

        let connector =
            SocketIoConnector::new(&format!("http://{}", addr), "/socket.io", Duration::from_millis(200));
        let (tx, _rx) = mpsc::channel(4);
        let result = connector.open("tok", tx).await;
        assert!(matches!(result, Err(Error::Connectivity(_))));
    }
}
