//! Duplex byte connections underneath the session transport.
//!
//! The transport only needs "send one binary message" and "receive the next binary message";
//! `WireSink` / `WireSource` capture exactly that so the websocket can be swapped for an
//! in-memory pair in tests.

use crate::codec;
use crate::error::{WireError, WireResult};
use crate::protocol::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Outbound half of a connection. Owned by exactly one writer task.
#[async_trait]
pub trait WireSink: Send {
    async fn send_binary(&mut self, data: Vec<u8>) -> WireResult<()>;
    async fn close(&mut self) -> WireResult<()>;
}

/// Inbound half of a connection. `None` means the peer went away.
#[async_trait]
pub trait WireSource: Send {
    async fn next_binary(&mut self) -> Option<WireResult<Bytes>>;
}

/// Endpoint and credentials for the cloud dialogue service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub url: String,
    pub app_id: String,
    pub access_key: String,
    pub resource_id: String,
    pub app_key: String,
    /// Sent as `X-Api-Connect-Id`; a fresh UUID is used when absent.
    pub connect_id: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            url: "wss://openspeech.bytedance.com/api/v3/realtime/dialogue".to_string(),
            app_id: String::new(),
            access_key: String::new(),
            resource_id: "volc.speech.dialog".to_string(),
            app_key: String::new(),
            connect_id: None,
            connect_timeout_ms: 10_000,
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

pub struct WsSource {
    inner: SplitStream<WsStream>,
}

/// Open the websocket with the auth headers the service expects.
pub async fn connect_ws(config: &ConnectConfig) -> WireResult<(WsSink, WsSource)> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| WireError::Handshake(format!("invalid url {}: {}", config.url, e)))?;

    let connect_id = config
        .connect_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let headers = [
        ("X-Api-App-ID", config.app_id.as_str()),
        ("X-Api-Access-Key", config.access_key.as_str()),
        ("X-Api-Resource-Id", config.resource_id.as_str()),
        ("X-Api-App-Key", config.app_key.as_str()),
        ("X-Api-Connect-Id", connect_id.as_str()),
    ];
    for (name, value) in headers {
        if value.is_empty() {
            continue;
        }
        let value = HeaderValue::from_str(value)
            .map_err(|e| WireError::Handshake(format!("bad header value for {}: {}", name, e)))?;
        let header = name
            .parse::<HeaderName>()
            .map_err(|e| WireError::Handshake(format!("bad header name {}: {}", name, e)))?;
        request.headers_mut().insert(header, value);
    }

    info!(url = %config.url, connect_id = %connect_id, "Connecting to dialogue service");

    let timeout = Duration::from_millis(config.connect_timeout_ms);
    let (stream, response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| WireError::Handshake(format!("connect timed out after {:?}", timeout)))?
        .map_err(|e| WireError::Handshake(e.to_string()))?;

    if let Some(logid) = response.headers().get("X-Tt-Logid") {
        debug!(logid = ?logid, "Dialogue service log id");
    }

    let (sink, source) = stream.split();
    Ok((WsSink { inner: sink }, WsSource { inner: source }))
}

#[async_trait]
impl WireSink for WsSink {
    async fn send_binary(&mut self, data: Vec<u8>) -> WireResult<()> {
        self.inner.send(Message::Binary(Bytes::from(data))).await?;
        Ok(())
    }

    async fn close(&mut self) -> WireResult<()> {
        self.inner.send(Message::Close(None)).await?;
        self.inner.close().await?;
        Ok(())
    }
}

#[async_trait]
impl WireSource for WsSource {
    async fn next_binary(&mut self) -> Option<WireResult<Bytes>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Text(text)) => {
                    warn!(len = text.len(), "Ignoring unexpected text message");
                }
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| format!("{} {}", f.code, f.reason))
                        .unwrap_or_else(|| "peer closed".to_string());
                    return Some(Err(WireError::ConnectionClosed(reason)));
                }
                // Pings are answered by tungstenite on the next read/write.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Client half of an in-memory connection.
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Server half of an in-memory connection, driven by tests and local tooling.
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    to_client: Option<mpsc::UnboundedSender<Bytes>>,
}

/// Build a connected (sink, source, peer) triple with no network underneath.
pub fn memory_pair() -> (MemorySink, MemorySource, MemoryPeer) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    (
        MemorySink { tx: Some(client_tx) },
        MemorySource { rx: server_rx },
        MemoryPeer {
            from_client: client_rx,
            to_client: Some(server_tx),
        },
    )
}

#[async_trait]
impl WireSink for MemorySink {
    async fn send_binary(&mut self, data: Vec<u8>) -> WireResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| WireError::ConnectionClosed("sink closed".to_string()))?;
        tx.send(data)
            .map_err(|_| WireError::ConnectionClosed("peer dropped".to_string()))
    }

    async fn close(&mut self) -> WireResult<()> {
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl WireSource for MemorySource {
    async fn next_binary(&mut self) -> Option<WireResult<Bytes>> {
        self.rx.recv().await.map(Ok)
    }
}

impl MemoryPeer {
    /// Next frame written by the client, or `None` once the client sink is closed.
    pub async fn recv_frame(&mut self) -> Option<WireResult<Frame>> {
        let bytes = self.from_client.recv().await?;
        Some(codec::parse(&bytes))
    }

    /// Non-blocking variant of [`recv_frame`](Self::recv_frame).
    pub fn try_recv_frame(&mut self) -> Option<WireResult<Frame>> {
        let bytes = self.from_client.try_recv().ok()?;
        Some(codec::parse(&bytes))
    }

    pub fn send_frame(&self, frame: &Frame) -> WireResult<()> {
        let bytes = codec::marshal(frame)?;
        self.send_raw(Bytes::from(bytes))
    }

    pub fn send_raw(&self, bytes: Bytes) -> WireResult<()> {
        self.to_client
            .as_ref()
            .ok_or_else(|| WireError::ConnectionClosed("peer disconnected".to_string()))?
            .send(bytes)
            .map_err(|_| WireError::ConnectionClosed("client dropped".to_string()))
    }

    /// Drop the server side; the client source yields `None` afterwards.
    pub fn disconnect(&mut self) {
        self.to_client = None;
    }
}
