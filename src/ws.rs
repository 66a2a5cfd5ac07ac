#![expect(
    clippy::module_name_repetitions,
    reason = "WebSocket types include the module name to indicate their scope"
)]

//! WebSocket transport backed by `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::Result;
use crate::config::BinaryType;
use crate::transport::{CloseFrame, Connector, Payload, Transport, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Connector`] over `tokio_tungstenite::connect_async`, used by
/// [`Connection::new`](crate::Connection::new).
///
/// Offers the configured sub-protocols via `Sec-WebSocket-Protocol` and
/// records whichever the server selected.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Create the default WebSocket connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(
        &self,
        url: &Url,
        protocols: &[String],
        _binary_type: BinaryType,
    ) -> Result<WsTransport> {
        // Native frames are always raw bytes; the binary-type hint only
        // matters for browser-style transports.
        let mut request = url.as_str().into_client_request()?;
        if !protocols.is_empty() {
            let offer = HeaderValue::from_str(&protocols.join(", "))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offer);
        }

        let (stream, response) = connect_async(request).await?;
        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        Ok(WsTransport {
            stream,
            protocol,
            failed: false,
        })
    }
}

/// One live WebSocket epoch.
pub struct WsTransport {
    stream: WsStream,
    protocol: Option<String>,
    /// A fatal read error was already surfaced; the next poll reports closed
    failed: bool,
}

#[async_trait]
impl Transport for WsTransport {
    fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    async fn send(&mut self, payload: Payload) -> Result<()> {
        let message = match payload {
            Payload::Text(text) => Message::Text(text.into()),
            Payload::Binary(bytes) => Message::Binary(bytes),
        };
        self.stream.send(message).await?;
        Ok(())
    }

    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<()> {
        match self.stream.close(frame.map(Into::into)).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn next_event(&mut self) -> TransportEvent {
        if self.failed {
            return TransportEvent::Closed(None);
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Message(Payload::Text(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return TransportEvent::Message(Payload::Binary(bytes));
                }
                Some(Ok(Message::Close(frame))) => {
                    return TransportEvent::Closed(frame.map(Into::into));
                }
                // Ping/pong bookkeeping is tungstenite's job
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    self.failed = true;
                    return TransportEvent::Error(error.into());
                }
                None => return TransportEvent::Closed(None),
            }
        }
    }
}

impl From<CloseFrame> for WsCloseFrame {
    fn from(frame: CloseFrame) -> Self {
        Self {
            code: CloseCode::from(frame.code),
            reason: frame.reason.into(),
        }
    }
}

impl From<WsCloseFrame> for CloseFrame {
    fn from(frame: WsCloseFrame) -> Self {
        Self {
            code: frame.code.into(),
            reason: frame.reason.as_str().to_owned(),
        }
    }
}
