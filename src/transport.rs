//! Transport seam: the streaming-connection contract and its WebSocket
//! implementation.
//!
//! The session core only sees the [`Transport`] trait and the
//! [`TransportEvent`] stream; framing, the HTTP upgrade, and TLS live inside
//! `tokio-tungstenite`. Events are delivered over one `mpsc` channel
//! registered at construction — there is no dynamic re-registration.

use crate::config::ConnectionConfig;
use crate::error::{DeviceError, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Payload framing for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// UTF-8 control message.
    Text,
    /// Encoded audio frame.
    Binary,
}

/// Coarse connection-handle state, used by the reconnect policy to decide
/// whether a lingering handle needs cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No handle, or handle fully torn down (terminal).
    Closed,
    /// Connect in flight.
    Connecting,
    /// Established.
    Open,
}

/// Asynchronous events from the transport, one producer per connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// Transport-level connect finished with the given HTTP status code
    /// (101 for a successful WebSocket upgrade).
    Connected {
        /// Upgrade response status.
        status: u16,
    },
    /// The connection dropped (remote close, reset, or read error).
    Disconnected,
    /// One inbound text message.
    Text(String),
    /// One inbound binary message.
    Binary(Vec<u8>),
}

/// Streaming-connection contract consumed by the connection manager.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a fresh connection and start delivering events.
    ///
    /// # Errors
    ///
    /// Returns an error when the connect attempt fails outright. Handshake
    /// completion is reported separately via [`TransportEvent::Connected`].
    async fn connect(&self, config: &ConnectionConfig, headers: &[(String, String)])
        -> Result<()>;

    /// Write one frame.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::TransportClosed`] when the peer closed or
    /// reset the connection; other failures map to
    /// [`DeviceError::Transport`].
    async fn write(&self, payload: &[u8], kind: FrameKind) -> Result<()>;

    /// Close the connection gracefully. Local closes do not emit
    /// [`TransportEvent::Disconnected`].
    ///
    /// # Errors
    ///
    /// Returns an error when the close frame cannot be sent.
    async fn close(&self, reason: &str) -> Result<()>;

    /// Force-clear the handle state without a close frame.
    async fn reset(&self);

    /// Current handle state.
    fn link_state(&self) -> LinkState;
}

// ---------------------------------------------------------------------------
// WebSocket implementation
// ---------------------------------------------------------------------------

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// [`Transport`] backed by `tokio-tungstenite`.
pub struct WsTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    state: Arc<Mutex<LinkState>>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsTransport {
    /// Create a transport delivering events on `events`. Registered once;
    /// every connection reuses the same channel.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            sink: tokio::sync::Mutex::new(None),
            state: Arc::new(Mutex::new(LinkState::Closed)),
            reader: Mutex::new(None),
        }
    }

    fn set_state(&self, state: LinkState) {
        match self.state.lock() {
            Ok(mut s) => *s = state,
            Err(p) => *p.into_inner() = state,
        }
    }

    fn abort_reader(&self) {
        let handle = match self.reader.lock() {
            Ok(mut r) => r.take(),
            Err(p) => p.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Build the endpoint URL from the connection config.
fn endpoint_url(config: &ConnectionConfig) -> Result<url::Url> {
    let scheme = if config.tls { "wss" } else { "ws" };
    let text = format!(
        "{scheme}://{}:{}{}",
        config.host, config.port, config.path
    );
    url::Url::parse(&text).map_err(|e| DeviceError::Config(format!("bad endpoint {text}: {e}")))
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        headers: &[(String, String)],
    ) -> Result<()> {
        let url = endpoint_url(config)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| DeviceError::Transport(format!("request build: {e}")))?;

        let header_map = request.headers_mut();
        let auth = format!("Bearer {}", config.access_token);
        header_map.insert(
            "Authorization",
            HeaderValue::from_str(&auth)
                .map_err(|e| DeviceError::Config(format!("bad access token: {e}")))?,
        );
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DeviceError::Config(format!("bad header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| DeviceError::Config(format!("bad header value: {e}")))?;
            header_map.insert(name, value);
        }

        self.set_state(LinkState::Connecting);
        let (stream, response) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(e) => {
                self.set_state(LinkState::Closed);
                return Err(DeviceError::Transport(format!("connect: {e}")));
            }
        };
        let status = response.status().as_u16();
        debug!("websocket upgrade status {status}");

        let (sink, mut read) = stream.split();
        *self.sink.lock().await = Some(sink);
        self.set_state(LinkState::Open);

        // Read loop: forwards inbound frames and reports the disconnect.
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let reader = tokio::spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(TransportEvent::Text(text));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = events.send(TransportEvent::Binary(data));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("websocket read error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {} // Ping/Pong handled by tungstenite.
                }
            }
            match state.lock() {
                Ok(mut s) => *s = LinkState::Closed,
                Err(p) => *p.into_inner() = LinkState::Closed,
            }
            let _ = events.send(TransportEvent::Disconnected);
        });
        match self.reader.lock() {
            Ok(mut slot) => *slot = Some(reader),
            Err(p) => *p.into_inner() = Some(reader),
        }

        let _ = self.events.send(TransportEvent::Connected { status });
        Ok(())
    }

    async fn write(&self, payload: &[u8], kind: FrameKind) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(DeviceError::TransportClosed);
        };
        let message = match kind {
            FrameKind::Text => Message::Text(
                String::from_utf8(payload.to_vec())
                    .map_err(|e| DeviceError::Transport(format!("non-UTF-8 text frame: {e}")))?,
            ),
            FrameKind::Binary => Message::Binary(payload.to_vec()),
        };
        match sink.send(message).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                self.set_state(LinkState::Closed);
                Err(DeviceError::TransportClosed)
            }
            Err(e) => {
                self.set_state(LinkState::Closed);
                Err(DeviceError::Transport(format!("write: {e}")))
            }
        }
    }

    async fn close(&self, reason: &str) -> Result<()> {
        debug!("closing websocket: {reason}");
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            // Best effort; the peer may already be gone.
            let _ = sink.send(Message::Close(None)).await;
        }
        drop(guard);
        self.abort_reader();
        self.set_state(LinkState::Closed);
        Ok(())
    }

    async fn reset(&self) {
        self.sink.lock().await.take();
        self.abort_reader();
        self.set_state(LinkState::Closed);
    }

    fn link_state(&self) -> LinkState {
        match self.state.lock() {
            Ok(s) => *s,
            Err(p) => *p.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn config(tls: bool) -> ConnectionConfig {
        ConnectionConfig {
            host: "assistant.example.org".to_owned(),
            path: "/v1/".to_owned(),
            port: 443,
            tls,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn endpoint_url_tls() {
        let url = endpoint_url(&config(true)).unwrap();
        assert_eq!(url.as_str(), "wss://assistant.example.org:443/v1/");
    }

    #[test]
    fn endpoint_url_plain() {
        let url = endpoint_url(&config(false)).unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn fresh_transport_is_closed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = WsTransport::new(tx);
        assert_eq!(transport.link_state(), LinkState::Closed);
    }
}
