use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use crate::connection::ConnectionState;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// An operation was attempted while the connection cannot support it
    InvalidState,
    /// Error surfaced by the underlying transport
    Transport,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    #[must_use]
    pub fn invalid_state(state: ConnectionState) -> Self {
        InvalidState { state }.into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Error raised by [`send`](crate::Connection::send) when no transport is
/// attached, e.g. mid-backoff between reconnect attempts or after a close.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct InvalidState {
    /// Connection state at the time of the call
    pub state: ConnectionState,
}

impl fmt::Display for InvalidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot send: no transport attached (connection is {:?})",
            self.state
        )
    }
}

impl StdError for InvalidState {}

impl From<InvalidState> for Error {
    fn from(err: InvalidState) -> Self {
        Error::with_source(Kind::InvalidState, err)
    }
}

/// An [`events`](crate::Connection::events) subscriber fell behind the
/// broadcast buffer and missed messages.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Lagged {
    /// Number of events that were missed
    pub count: u64,
}

impl fmt::Display for Lagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event subscriber lagged, missed {} events", self.count)
    }
}

impl StdError for Lagged {}

impl From<Lagged> for Error {
    fn from(err: Lagged) -> Self {
        Error::with_source(Kind::Internal, err)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::Transport, e)
    }
}

impl From<tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue> for Error {
    fn from(e: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}
