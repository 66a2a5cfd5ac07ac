#![expect(
    clippy::module_name_repetitions,
    reason = "Transport types expose their domain in the name for clarity"
)]

//! The transport seam consumed by the connection driver.
//!
//! A [`Connector`] plays the factory half of the collaborator (construct a
//! connection bound to a URL and protocol offers), a [`Transport`] the
//! instance half (send, close, and a stream of inbound [`TransportEvent`]s).
//! The built-in WebSocket implementation lives in [`crate::ws`]; tests plug
//! in scripted implementations.

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::Result;
use crate::config::BinaryType;
use crate::error::Error;

/// A payload forwarded verbatim in either direction.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Bytes),
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

/// Status code and reason attached to a close.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close status code
    pub code: u16,
    /// Human-readable reason
    pub reason: String,
}

impl CloseFrame {
    /// Create a close frame with an explicit code and reason.
    #[must_use]
    pub fn new<R: Into<String>>(code: u16, reason: R) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl Default for CloseFrame {
    /// Normal closure (1000) with an empty reason.
    fn default() -> Self {
        Self::new(1000, String::new())
    }
}

/// Inbound happenings on a live transport.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportEvent {
    /// A payload from the remote peer
    Message(Payload),
    /// A transport-level error; the epoch may report `Closed` next
    Error(Error),
    /// The connection is gone, with the close frame if the peer sent one
    Closed(Option<CloseFrame>),
}

/// One live connection epoch.
///
/// A value of this type exists exactly as long as the underlying connection
/// does; the driver drops it once [`next_event`](Transport::next_event)
/// yields [`TransportEvent::Closed`].
#[async_trait]
pub trait Transport: Send + 'static {
    /// Sub-protocol selected by the remote during the handshake.
    fn protocol(&self) -> Option<&str>;

    /// Forward a payload to the remote peer.
    async fn send(&mut self, payload: Payload) -> Result<()>;

    /// Request a close handshake. Must tolerate an already-closed
    /// connection; `next_event` must eventually yield
    /// [`TransportEvent::Closed`] afterwards.
    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<()>;

    /// Next inbound event.
    ///
    /// Must be cancel-safe: the driver races this against its command
    /// channel and drops the future whenever a command wins.
    async fn next_event(&mut self) -> TransportEvent;
}

/// Factory producing one [`Transport`] per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Transport produced by a successful handshake
    type Transport: Transport;

    /// Establish one connection epoch.
    async fn connect(
        &self,
        url: &Url,
        protocols: &[String],
        binary_type: BinaryType,
    ) -> Result<Self::Transport>;
}
