//! Socket abstraction for the status channel.
//!
//! The connection manager only sees text frames, errors and closes. The
//! production transport is a WebSocket; tests plug in scripted sockets.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

/// Path of the status broadcast channel on the pipeline server
pub const STATUS_CHANNEL_PATH: &str = "/ws/status";

/// Errors raised while establishing the status channel
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Invalid server URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported URL scheme '{0}' (expected http, https, ws or wss)")]
    UnsupportedScheme(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("{0}")]
    Connect(String),

    #[error("No async runtime available to drive the status channel")]
    NoRuntime,
}

/// One observation from a live socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text payload, passed on unparsed
    Text(String),
    /// Transport error. A `Closed` always follows.
    Error(String),
    /// Socket is gone, with the peer's close reason when it sent one
    Closed(Option<String>),
}

/// The closing side of a socket, usable from outside the task reading it.
pub trait SocketCloser: Send {
    /// Start the close handshake without waiting for it. Consumes the closer,
    /// so a socket is closed at most once.
    fn close(self: Box<Self>);
}

#[async_trait]
pub trait StatusSocket: Send {
    /// Wait for the next event. Returns `Closed` forever once closed.
    async fn next_event(&mut self) -> SocketEvent;

    /// Detach the closing side. Called once, right after connecting.
    fn take_closer(&mut self) -> Box<dyn SocketCloser>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn StatusSocket>, ConnectionError>;
}

/// Derive the status channel URL from the configured server base URL.
///
/// `http` becomes `ws` and `https` becomes `wss`; the status path is appended
/// to whatever path the base URL already carries.
pub fn status_channel_url(base: &str) -> Result<Url, ConnectionError> {
    let trimmed = base.trim();
    let mut url = Url::parse(trimmed).map_err(|e| ConnectionError::InvalidUrl {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConnectionError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::UnsupportedScheme(url.scheme().to_string()))?;

    let path = format!("{}{}", url.path().trim_end_matches('/'), STATUS_CHANNEL_PATH);
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);

    Ok(url)
}

/// WebSocket transport backed by tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn StatusSocket>, ConnectionError> {
        let runtime = Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;
        let (stream, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        log::debug!(
            "Status channel handshake with {} returned {}",
            url,
            response.status()
        );
        let (writer, reader) = stream.split();
        Ok(Box::new(WebSocketStatusSocket {
            reader,
            writer: Some(writer),
            runtime,
            finished: false,
        }))
    }
}

struct WebSocketStatusSocket {
    reader: SplitStream<WsStream>,
    writer: Option<SplitSink<WsStream, Message>>,
    runtime: Handle,
    finished: bool,
}

#[async_trait]
impl StatusSocket for WebSocketStatusSocket {
    async fn next_event(&mut self) -> SocketEvent {
        if self.finished {
            return SocketEvent::Closed(None);
        }

        loop {
            match self.reader.next().await {
                Some(Ok(Message::Text(text))) => return SocketEvent::Text(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return SocketEvent::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
                Some(Ok(Message::Close(frame))) => {
                    self.finished = true;
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty());
                    return SocketEvent::Closed(reason);
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.finished = true;
                    return SocketEvent::Error(e.to_string());
                }
                None => {
                    self.finished = true;
                    return SocketEvent::Closed(None);
                }
            }
        }
    }

    fn take_closer(&mut self) -> Box<dyn SocketCloser> {
        Box::new(WebSocketCloser {
            writer: self.writer.take(),
            runtime: self.runtime.clone(),
        })
    }
}

struct WebSocketCloser {
    writer: Option<SplitSink<WsStream, Message>>,
    runtime: Handle,
}

impl SocketCloser for WebSocketCloser {
    fn close(self: Box<Self>) {
        let Some(mut writer) = self.writer else {
            return;
        };
        // Sends the close frame; the reader then sees the peer's reply.
        self.runtime.spawn(async move {
            if let Err(e) = writer.close().await {
                log::debug!("Status channel close: {}", e);
            }
        });
    }
}
