//! The duplex connection collaborator.
//!
//! Courier is transport-agnostic: the host application supplies anything
//! that can open, send opaque text messages, and report inbound traffic.
//! The connection never interprets messages.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection not open")]
    NotOpen,

    #[error("connection closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

/// Inbound traffic and lifecycle notifications from a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A serialized message arrived.
    Message(String),
    /// A transport-level error occurred; the connection may still be usable.
    Error(String),
    /// The peer or transport closed the connection.
    Closed,
}

/// An abstracted duplex message channel.
///
/// `take_events` yields the single event stream for the connection,
/// replacing the callback registration of a push-style API: there is
/// exactly one consumer, and taking it twice returns `None`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens the connection and leaves it open.
    async fn open(&self) -> Result<(), ConnectionError>;

    /// Sends a serialized message. Must return an error on failure,
    /// never panic.
    async fn send_message(&self, msg: String) -> Result<(), ConnectionError>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), ConnectionError>;

    /// Takes the inbound event stream. `None` once taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;
}
