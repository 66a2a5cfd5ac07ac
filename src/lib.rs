#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod config;
pub mod connection;
pub mod error;
pub mod transport;
pub mod ws;

pub use config::{BinaryType, Config, ReconnectConfig};
pub use connection::{Connection, ConnectionState, Event, Status};
pub use error::Error;
pub use transport::{CloseFrame, Connector, Payload, Transport, TransportEvent};
pub use ws::WsConnector;

pub type Result<T> = std::result::Result<T, Error>;
