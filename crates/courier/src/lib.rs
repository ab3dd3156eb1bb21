//! Reliable, session-oriented command/acknowledgement exchange over an
//! arbitrary duplex message connection.
//!
//! The transport only has to move opaque text messages both ways; this
//! crate layers on top of it bounded retransmission with cancellation,
//! transaction correlation, server-allocated sender sessions with
//! inactivity eviction, and acknowledged intermediate progress statuses.
//!
//! A [`Server`] registers handlers and owns one side of the connection;
//! a [`Client`] opens sessions with [`Client::create_sender`] and issues
//! commands through the resulting [`Sender`].

pub mod client;
pub mod error;
pub mod inactivity;
pub(crate) mod retry;
pub mod server;
pub mod testing;
pub mod txn;

pub use client::{Client, ClientConfig, Sender};
pub use error::CommandError;
pub use retry::RetryHandle;
pub use server::{HandlerFn, HandlerOutcome, IntermediateSender, Server, ServerConfig};

pub use courier_protocol as protocol;
