//! Transport abstraction for the duplex connection
//!
//! The connection manager only sees a [`Link`]: a sink and a stream of
//! [`Frame`]s produced by a [`Connector`]. Production code uses
//! [`WebSocketConnector`]; tests plug in an in-memory server.

use std::pin::Pin;

use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Error type for transport operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed unexpectedly
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The connection target is not a usable URL
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Close handshake details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// A unit exchanged with the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A JSON envelope
    Text(String),
    /// Close handshake (inbound: the server closed; outbound: we close)
    Close(Option<CloseInfo>),
}

/// Outbound half of a link
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Inbound half of a link
pub type FrameStream = Pin<Box<dyn Stream<Item = TransportResult<Frame>> + Send>>;

/// One open physical connection
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens links to a server
pub trait Connector: Send + Sync + 'static {
    /// Open a new link to `url`
    fn connect(&self, url: &Url) -> BoxFuture<'static, TransportResult<Link>>;
}

/// WebSocket connector using tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, TransportResult<Link>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

            let (write, read) = ws_stream.split();

            let sink = write
                .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
                .with(|frame: Frame| future::ready(Ok::<_, TransportError>(into_message(frame))));

            let stream = read.filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                    Ok(Message::Close(frame)) => Some(Ok(Frame::Close(frame.map(|f| CloseInfo {
                        code: u16::from(f.code),
                        reason: f.reason.into_owned(),
                    })))),
                    // Protocol-level ping/pong is answered by tungstenite itself
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::ReceiveFailed(e.to_string()))),
                })
            });

            Ok(Link {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Close(info) => Message::Close(info.map(|info| WsCloseFrame {
            code: CloseCode::from(info.code),
            reason: info.reason.into(),
        })),
    }
}

/// Build the connect URL, appending the bearer token as a `token` query parameter
pub fn connection_url(base: &str, token: Option<&str>) -> TransportResult<Url> {
    let mut url = Url::parse(base).map_err(|_| TransportError::InvalidUrl(base.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(TransportError::InvalidUrl(base.to_string()));
    }
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_url_without_token() {
        let url = connection_url("ws://localhost:8080/ws", None).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/ws");
    }

    #[test]
    fn test_connection_url_appends_token() {
        let url = connection_url("wss://sync.example.com/ws?v=2", Some("abc def")).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("v".to_string(), "2".to_string()),
                ("token".to_string(), "abc def".to_string()),
            ]
        );
    }

    #[test]
    fn test_connection_url_ignores_empty_token() {
        let url = connection_url("ws://localhost/ws", Some("")).unwrap();
        assert!(url.query().is_none());
    }

    #[test]
    fn test_connection_url_rejects_bad_targets() {
        assert!(matches!(
            connection_url("not a url", None),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            connection_url("http://localhost/ws", None),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_close_frame_conversion() {
        let msg = into_message(Frame::Close(Some(CloseInfo {
            code: 1000,
            reason: "bye".to_string(),
        })));
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1000);
                assert_eq!(frame.reason, "bye");
            }
            other => panic!("Expected close frame, got {:?}", other),
        }
    }
}
