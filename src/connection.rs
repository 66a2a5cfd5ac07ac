#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

//! Connection lifecycle state machine.
//!
//! [`Connection`] is a cloneable handle to a background driver task that
//! owns at most one live [`Transport`](crate::transport::Transport) at a
//! time and replaces it wholesale after every loss, on a capped
//! exponential-backoff schedule. The handle's event surface is stable
//! across reconnect cycles: subscribers see `Connecting`/`Open`/`Message`/
//! `Error`/`Close` regardless of how many times the underlying transport
//! was rebuilt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::try_stream;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::sleep;
use url::Url;

use crate::Result;
use crate::config::Config;
use crate::error::{Error, Lagged};
use crate::transport::{CloseFrame, Connector, Payload, Transport as _, TransportEvent};
use crate::ws::WsConnector;

/// Broadcast channel capacity for emitted events.
const EVENT_CAPACITY: usize = 1024;

/// Connection state tracking.
///
/// Mirrors the underlying transport's lifecycle but persists across
/// reconnect cycles: the state stays [`Connecting`](Self::Connecting)
/// through the whole retry loop instead of surfacing a close per attempt.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A handshake is in flight, or the driver is waiting out the backoff
    /// gap between attempts
    Connecting,
    /// Successfully connected
    Open {
        /// When the connection was established
        since: Instant,
    },
    /// A caller-initiated close is in flight
    Closing,
    /// Terminal; only ever reached through [`Connection::close`]
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently open.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Check if the connection reached its terminal state.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Point-in-time snapshot of a connection, published through a watch
/// channel.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Status {
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Sub-protocol negotiated with the remote; `None` unless open
    pub protocol: Option<Arc<str>>,
    /// Reconnection attempts since the last successful (or fresh) open
    pub reconnect_attempts: u32,
}

/// Events emitted by a [`Connection`], delivered to every subscriber in
/// emission order.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection attempt is starting, or the retry loop re-entered after
    /// a loss
    Connecting,
    /// The transport reached open
    Open {
        /// Whether this open recovered from a connectivity loss
        is_reconnect: bool,
        /// Sub-protocol selected by the remote, if any
        protocol: Option<Arc<str>>,
    },
    /// Payload from the remote peer, forwarded verbatim
    Message(Payload),
    /// Transport-level error, forwarded verbatim and never interpreted
    Error(Arc<Error>),
    /// The connection was lost (exactly once per genuine loss) or was
    /// terminally closed
    Close(Option<CloseFrame>),
    /// The retry budget ran out; emitted only when
    /// [`ReconnectConfig::notify_exhausted`](crate::ReconnectConfig::notify_exhausted)
    /// is set
    Exhausted {
        /// Reconnection attempts made before giving up
        attempts: u32,
    },
}

enum Command {
    Open,
    Send(Payload),
    Close(CloseFrame),
    Refresh,
}

/// Resilient handle to one logical endpoint.
///
/// Cloning is cheap; every clone addresses the same driver task. Dropping
/// the last clone shuts the driver down.
///
/// # Example
///
/// ```no_run
/// use futures::StreamExt as _;
/// use reconnecting_socket::{Config, Connection, Event};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let connection = Connection::new("wss://example.com/feed", Config::default())?;
/// let mut events = std::pin::pin!(connection.events());
///
/// while let Some(event) = events.next().await {
///     match event? {
///         Event::Open { is_reconnect, .. } if is_reconnect => {
///             // Re-establish server-side session state here.
///         }
///         Event::Message(payload) => {
///             let _ = payload;
///         }
///         _ => {}
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Connection {
    url: Arc<Url>,
    protocols: Arc<[String]>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<Event>,
    status: watch::Receiver<Status>,
}

impl Connection {
    /// Connect to `url` over the built-in WebSocket transport.
    ///
    /// # Errors
    ///
    /// Fails when `url` does not parse.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime: the lifecycle driver is
    /// spawned onto the current one.
    pub fn new(url: &str, config: Config) -> Result<Self> {
        Self::with_connector(url, config, WsConnector::new())
    }

    /// Connect through a custom [`Connector`].
    ///
    /// # Errors
    ///
    /// Fails when `url` does not parse.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime: the lifecycle driver is
    /// spawned onto the current one.
    pub fn with_connector<C: Connector>(url: &str, config: Config, connector: C) -> Result<Self> {
        let url = Arc::new(Url::parse(url)?);
        let protocols: Arc<[String]> = config.protocols.clone().into();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(Status {
            state: ConnectionState::Connecting,
            protocol: None,
            reconnect_attempts: 0,
        });

        let debug = config.debug;
        let driver = Driver {
            connector,
            url: Arc::clone(&url),
            protocols: Arc::clone(&protocols),
            config,
            commands: commands_rx,
            outbox: Outbox {
                events: events_tx.clone(),
                status: status_tx,
                debug,
            },
            reconnect_attempts: 0,
        };
        tokio::spawn(driver.run());

        Ok(Self {
            url,
            protocols,
            commands: commands_tx,
            events: events_tx,
            status: status_rx,
        })
    }

    /// Target address this connection keeps re-establishing.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sub-protocols offered during each handshake.
    #[must_use]
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Snapshot of state, negotiated protocol, and retry counter.
    #[must_use]
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Sub-protocol selected by the remote; `None` unless open.
    #[must_use]
    pub fn negotiated_protocol(&self) -> Option<Arc<str>> {
        self.status.borrow().protocol.clone()
    }

    /// Reconnection attempts since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.status.borrow().reconnect_attempts
    }

    /// Subscribe to status changes.
    ///
    /// Useful for detecting recovery and re-establishing server-side state
    /// without consuming the event stream.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Subscribe to events.
    ///
    /// Each call returns a new independent receiver; subscribers do not
    /// block each other. Events emitted before subscribing are not
    /// replayed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Stream of events.
    ///
    /// A subscriber that falls behind the event buffer yields one
    /// [`Lagged`] error for the missed span and then continues with live
    /// events.
    pub fn events(&self) -> impl Stream<Item = Result<Event>> + Send + use<> {
        let mut rx = self.events.subscribe();
        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(count)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(count, "event subscriber lagged");
                        Err(Lagged { count })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Begin connecting when `automatic_open` is off, or start a fresh
    /// session after the retry budget was exhausted. No-op otherwise.
    pub fn open(&self) {
        _ = self.commands.send(Command::Open);
    }

    /// Forward a payload to the remote peer.
    ///
    /// # Errors
    ///
    /// Fails with [`Kind::InvalidState`](crate::error::Kind::InvalidState)
    /// when no transport is attached (while connecting, during the backoff
    /// gap, or after a close); nothing is queued in that case.
    pub fn send(&self, payload: Payload) -> Result<()> {
        let state = self.state();
        if !state.is_open() {
            return Err(Error::invalid_state(state));
        }
        self.commands
            .send(Command::Send(payload))
            .map_err(|_e| Error::invalid_state(ConnectionState::Closed))
    }

    /// Forward a text payload to the remote peer.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn send_text<T: Into<String>>(&self, text: T) -> Result<()> {
        self.send(Payload::Text(text.into()))
    }

    /// Forward a binary payload to the remote peer.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn send_binary<B: Into<Bytes>>(&self, bytes: B) -> Result<()> {
        self.send(Payload::Binary(bytes.into()))
    }

    /// Close for good with the default frame (1000, empty reason).
    ///
    /// Terminal: suppresses every pending and future reconnect attempt. A
    /// closed connection is not reusable; construct a new one instead.
    pub fn close(&self) {
        self.close_with(CloseFrame::default());
    }

    /// Close for good with an explicit code and reason.
    pub fn close_with(&self, frame: CloseFrame) {
        _ = self.commands.send(Command::Close(frame));
    }

    /// Tear down and re-establish a connection the caller suspects is
    /// silently dead.
    ///
    /// Runs the normal unforced-close path: one `Close` event, then the
    /// backoff schedule from the start. No-op unless currently open.
    pub fn refresh(&self) {
        _ = self.commands.send(Command::Refresh);
    }
}

struct Outbox {
    events: broadcast::Sender<Event>,
    status: watch::Sender<Status>,
    debug: bool,
}

impl Outbox {
    fn emit(&self, event: Event) {
        #[cfg(feature = "tracing")]
        if self.debug {
            tracing::debug!(?event, "emitting event");
        }
        #[cfg(not(feature = "tracing"))]
        let _ = self.debug;
        _ = self.events.send(event);
    }

    fn transition(&self, state: ConnectionState) {
        self.status.send_modify(|status| {
            status.state = state;
            if !state.is_open() {
                // The negotiated protocol never outlives its epoch
                status.protocol = None;
            }
        });
    }

    fn opened(&self, protocol: Option<Arc<str>>, since: Instant) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Open { since };
            status.protocol = protocol;
            status.reconnect_attempts = 0;
        });
    }

    fn set_attempts(&self, attempts: u32) {
        self.status
            .send_modify(|status| status.reconnect_attempts = attempts);
    }
}

/// How one connection epoch (or attempt) ended.
enum EpochEnd {
    /// Unforced loss; retry per the backoff policy
    Lost {
        frame: Option<CloseFrame>,
        /// The epoch reached open before it ended
        opened: bool,
        /// The stall timer cut the attempt short
        timed_out: bool,
    },
    /// A caller close drove this epoch down; terminal
    Forced { frame: Option<CloseFrame> },
    /// Every handle is gone
    Abandoned,
}

enum SessionEnd {
    /// The retry budget was exceeded
    Exhausted,
    /// Closed for good or abandoned
    Terminal,
}

struct Driver<C: Connector> {
    connector: C,
    url: Arc<Url>,
    protocols: Arc<[String]>,
    config: Config,
    commands: mpsc::UnboundedReceiver<Command>,
    outbox: Outbox,
    reconnect_attempts: u32,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        if !self.config.automatic_open && !self.wait_for_open().await {
            return;
        }
        loop {
            // Fresh session: announce it and start counting from zero.
            self.reconnect_attempts = 0;
            self.outbox.set_attempts(0);
            self.outbox.emit(Event::Connecting);

            match self.run_session().await {
                SessionEnd::Terminal => return,
                SessionEnd::Exhausted => {
                    let attempts = self.reconnect_attempts.saturating_sub(1);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempts, "retry budget exhausted, giving up");
                    if self.config.reconnect.notify_exhausted {
                        self.outbox.emit(Event::Exhausted { attempts });
                    }
                    if !self.wait_for_open().await {
                        return;
                    }
                }
            }
        }
    }

    /// Attempt/epoch/backoff loop. Returns once the retry budget is
    /// exhausted or the connection is done for good.
    async fn run_session(&mut self) -> SessionEnd {
        let mut backoff: ExponentialBackoff = self.config.reconnect.clone().into();
        let mut is_reconnect = false;
        loop {
            match self.run_epoch(is_reconnect).await {
                EpochEnd::Forced { frame } => {
                    self.finish(frame);
                    return SessionEnd::Terminal;
                }
                EpochEnd::Abandoned => return SessionEnd::Terminal,
                EpochEnd::Lost {
                    frame,
                    opened,
                    timed_out,
                } => {
                    if opened {
                        // The delay curve restarts after an epoch that
                        // reached open
                        backoff.reset();
                    }
                    self.outbox.transition(ConnectionState::Connecting);
                    self.outbox.emit(Event::Connecting);
                    // Exactly one close per genuine loss: retry failures
                    // and stall-timeout teardowns stay silent.
                    if opened || (!is_reconnect && !timed_out) {
                        self.outbox.emit(Event::Close(frame));
                    }
                }
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.reconnect.max_backoff);
            if !self.wait_out_gap(delay).await {
                return SessionEnd::Terminal;
            }

            self.reconnect_attempts += 1;
            self.outbox.set_attempts(self.reconnect_attempts);
            if let Some(max) = self.config.reconnect.max_attempts
                && self.reconnect_attempts > max
            {
                return SessionEnd::Exhausted;
            }
            is_reconnect = true;
        }
    }

    /// One connection attempt and, if it opens, the epoch that follows.
    async fn run_epoch(&mut self, is_reconnect: bool) -> EpochEnd {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            url = %self.url,
            is_reconnect,
            attempt = self.reconnect_attempts,
            "connecting"
        );

        let mut transport = match self.establish().await {
            Ok(transport) => transport,
            Err(end) => return end,
        };

        let protocol: Option<Arc<str>> = transport.protocol().map(Arc::from);
        self.reconnect_attempts = 0;
        self.outbox.opened(protocol.clone(), Instant::now());
        self.outbox.emit(Event::Open {
            is_reconnect,
            protocol,
        });

        let mut forced = false;
        loop {
            tokio::select! {
                event = transport.next_event() => match event {
                    TransportEvent::Message(payload) => {
                        self.outbox.emit(Event::Message(payload));
                    }
                    TransportEvent::Error(error) => {
                        self.outbox.emit(Event::Error(Arc::new(error)));
                    }
                    TransportEvent::Closed(frame) => {
                        return if forced {
                            EpochEnd::Forced { frame }
                        } else {
                            EpochEnd::Lost { frame, opened: true, timed_out: false }
                        };
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(payload)) => {
                        if let Err(error) = transport.send(payload).await {
                            self.outbox.emit(Event::Error(Arc::new(error)));
                        }
                    }
                    Some(Command::Close(frame)) => {
                        forced = true;
                        self.outbox.transition(ConnectionState::Closing);
                        if let Err(error) = transport.close(Some(frame)).await {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(%error, "close request failed");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &error;
                        }
                    }
                    Some(Command::Refresh) => {
                        // Deliberate kick into the unforced-close path
                        if let Err(error) = transport.close(None).await {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(%error, "refresh close failed");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &error;
                        }
                    }
                    Some(Command::Open) => {}
                    None => {
                        _ = transport.close(None).await;
                        return EpochEnd::Abandoned;
                    }
                },
            }
        }
    }

    /// Drive one handshake, bounded by the stall timer.
    async fn establish(&mut self) -> std::result::Result<C::Transport, EpochEnd> {
        let stall = sleep(self.config.connect_timeout);
        tokio::pin!(stall);
        let connect = self
            .connector
            .connect(&self.url, &self.protocols, self.config.binary_type);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(transport) => return Ok(transport),
                    Err(error) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(%error, "unable to connect");
                        self.outbox.emit(Event::Error(Arc::new(error)));
                        return Err(EpochEnd::Lost {
                            frame: None,
                            opened: false,
                            timed_out: false,
                        });
                    }
                },
                () = &mut stall => {
                    // Dropping the in-flight handshake tears the half-open
                    // transport down.
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        timeout = ?self.config.connect_timeout,
                        "connection attempt stalled"
                    );
                    return Err(EpochEnd::Lost {
                        frame: None,
                        opened: false,
                        timed_out: true,
                    });
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Close(frame)) => {
                        return Err(EpochEnd::Forced { frame: Some(frame) });
                    }
                    Some(Command::Send(_)) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("dropping send: no transport attached");
                    }
                    Some(Command::Open | Command::Refresh) => {}
                    None => return Err(EpochEnd::Abandoned),
                },
            }
        }
    }

    /// Sleep out the backoff gap while staying responsive to commands, so
    /// a forced close cancels the pending retry instead of racing it.
    async fn wait_out_gap(&mut self, delay: Duration) -> bool {
        let gap = sleep(delay);
        tokio::pin!(gap);
        loop {
            tokio::select! {
                () = &mut gap => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Close(frame)) => {
                        self.finish(Some(frame));
                        return false;
                    }
                    Some(Command::Send(_)) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("dropping send: no transport attached");
                    }
                    Some(Command::Open | Command::Refresh) => {}
                    None => return false,
                },
            }
        }
    }

    /// Park until a caller asks to (re)open. Returns `false` when the
    /// connection is done for good.
    async fn wait_for_open(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                Some(Command::Open) => return true,
                Some(Command::Close(frame)) => {
                    self.finish(Some(frame));
                    return false;
                }
                Some(Command::Send(_)) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("dropping send: no transport attached");
                }
                Some(Command::Refresh) => {}
                None => return false,
            }
        }
    }

    /// Terminal transition: `Closed` state and the final close event.
    fn finish(&self, frame: Option<CloseFrame>) {
        self.outbox.transition(ConnectionState::Closed);
        self.outbox.emit(Event::Close(frame));
    }
}
