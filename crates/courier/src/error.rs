use courier_protocol::{ConnectionError, NackReason};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    /// The peer refused the command or status outright.
    #[error("NACK received")]
    Nack {
        command: String,
        reason: Option<NackReason>,
    },

    /// Retry budget exhausted without an ACK or status.
    #[error("Failed to secure response in time for {command}")]
    AckTimeout { command: String },

    #[error("Sender already had closed call. Cannot send again")]
    SenderClosed,

    #[error("Sender did not make a call within {inactivity_ms}ms. Cannot send again")]
    SenderInactive { inactivity_ms: u64 },

    /// A `senderCreate` exchange completed with a fail status.
    #[error("Failed to create Sender: [{kind}] {message}")]
    SenderCreateFailed { kind: String, message: String },

    /// The id generator could not produce a fresh id within the
    /// collision bound. Fatal: the generator is not providing enough
    /// entropy.
    #[error("id generator is not providing enough entropy, could not create unique id")]
    IdExhausted,

    /// The client or server was closed while the call was outstanding.
    #[error("closed while awaiting response for {command}")]
    Closed { command: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<serde_json::Error> for CommandError {
    fn from(err: serde_json::Error) -> Self {
        CommandError::Protocol(format!("failed to encode message: {err}"))
    }
}
