#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

//! End-to-end tests of the built-in WebSocket transport against a loopback
//! server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use reconnecting_socket::{Config, Connection, Event, Payload};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

fn init_logging() {
    _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Mock WebSocket server.
struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast messages to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Receives text frames sent by clients
    received_rx: mpsc::UnboundedReceiver<String>,
    /// Tells every live connection task to drop its socket abruptly
    kick_tx: broadcast::Sender<()>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port. Echoes any offered
    /// sub-protocol back during the handshake.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (received_tx, received_rx) = mpsc::unbounded_channel::<String>();
        let (kick_tx, _) = broadcast::channel::<()>(8);

        let broadcast_tx = message_tx.clone();
        let kicker = kick_tx.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let callback = |request: &Request, mut response: Response| {
                    if let Some(offer) = request.headers().get("Sec-WebSocket-Protocol") {
                        response
                            .headers_mut()
                            .insert("Sec-WebSocket-Protocol", offer.clone());
                    }
                    Ok::<Response, ErrorResponse>(response)
                };
                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let received = received_tx.clone();
                let mut outgoing = broadcast_tx.subscribe();
                let mut kick = kicker.subscribe();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            message = read.next() => match message {
                                Some(Ok(Message::Text(text))) => {
                                    drop(received.send(text.as_str().to_owned()));
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                            message = outgoing.recv() => match message {
                                Ok(text) => {
                                    if write.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            },
                            _ = kick.recv() => break,
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            received_rx,
            kick_tx,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/stream", self.addr)
    }

    /// Send a text frame to all connected clients.
    fn send(&self, message: &str) {
        drop(self.message_tx.send(message.to_owned()));
    }

    /// Drop every live connection without a close handshake.
    fn drop_clients(&self) {
        drop(self.kick_tx.send(()));
    }

    /// Receive the next text frame a client sent.
    async fn recv(&mut self) -> Option<String> {
        timeout(Duration::from_secs(5), self.received_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

fn quick_config() -> Config {
    let mut config = Config::default();
    config.reconnect.initial_backoff = Duration::from_millis(50);
    config
}

async fn next_event(rx: &mut broadcast::Receiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn wait_for_open(rx: &mut broadcast::Receiver<Event>) -> (bool, Option<Arc<str>>) {
    loop {
        if let Event::Open {
            is_reconnect,
            protocol,
        } = next_event(rx).await
        {
            return (is_reconnect, protocol);
        }
    }
}

async fn wait_for_text(rx: &mut broadcast::Receiver<Event>) -> String {
    loop {
        if let Event::Message(Payload::Text(text)) = next_event(rx).await {
            return text;
        }
    }
}

#[tokio::test]
async fn round_trip() -> anyhow::Result<()> {
    init_logging();
    let mut server = MockWsServer::start().await;
    let connection = Connection::new(&server.url(), quick_config())?;
    let mut events = connection.subscribe();

    let (is_reconnect, _) = wait_for_open(&mut events).await;
    assert!(!is_reconnect, "first open should be fresh");

    server.send("hello");
    assert_eq!(wait_for_text(&mut events).await, "hello", "inbound frame altered");

    connection.send_text("world")?;
    assert_eq!(
        server.recv().await.as_deref(),
        Some("world"),
        "outbound frame altered"
    );

    connection.close();
    let mut status = connection.status_receiver();
    timeout(
        Duration::from_secs(5),
        status.wait_for(|status| status.state.is_closed()),
    )
    .await
    .expect("timed out waiting for the terminal state")
    .expect("status channel closed");

    Ok(())
}

#[tokio::test]
async fn reconnects_after_server_drop() -> anyhow::Result<()> {
    init_logging();
    let mut server = MockWsServer::start().await;
    let connection = Connection::new(&server.url(), quick_config())?;
    let mut events = connection.subscribe();

    let (is_reconnect, _) = wait_for_open(&mut events).await;
    assert!(!is_reconnect, "first open should be fresh");

    server.drop_clients();

    let (is_reconnect, _) = wait_for_open(&mut events).await;
    assert!(is_reconnect, "recovery open should be flagged");
    assert_eq!(
        connection.reconnect_attempts(),
        0,
        "counter should reset after recovery"
    );

    // The replacement connection is fully functional
    connection.send_text("still here")?;
    assert_eq!(
        server.recv().await.as_deref(),
        Some("still here"),
        "outbound frame lost after recovery"
    );

    connection.close();

    Ok(())
}

#[tokio::test]
async fn negotiates_subprotocol() -> anyhow::Result<()> {
    init_logging();
    let server = MockWsServer::start().await;
    let mut config = quick_config();
    config.protocols = vec!["chat".to_owned()];
    let connection = Connection::new(&server.url(), config)?;
    let mut events = connection.subscribe();

    let (_, protocol) = wait_for_open(&mut events).await;
    assert_eq!(protocol.as_deref(), Some("chat"), "wrong negotiated protocol");
    assert_eq!(
        connection.negotiated_protocol().as_deref(),
        Some("chat"),
        "negotiated protocol should be readable while open"
    );
    assert_eq!(connection.protocols().len(), 1, "offer altered");
    assert_eq!(connection.protocols()[0], "chat", "offer altered");

    connection.close();

    Ok(())
}
