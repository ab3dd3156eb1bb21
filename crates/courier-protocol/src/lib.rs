pub mod connection;
pub mod idgen;

use serde::{Deserialize, Serialize};

pub use connection::{Connection, ConnectionError, ConnectionEvent};
pub use idgen::{IdGenerator, int_generator};

/// Unique identifier for a sender session, allocated by the server.
pub type SessionId = String;

/// Correlation id attached to one command/status exchange.
pub type TxnId = String;

/// Command name reserved for opening a session. The only command sent
/// without a `for` field.
pub const SENDER_CREATE: &str = "senderCreate";

/// Command name reserved for closing a session. Handled by a built-in
/// server handler.
pub const SENDER_CLOSE: &str = "senderClose";

/// `ack` field value used when acknowledging a status message rather
/// than a command.
pub const ACK_STATUS: &str = "status";

/// Advertised completion estimate on the `senderCreate` ACK, in ms.
pub const SENDER_CREATE_ACK_TIMEOUT_MS: u64 = 3000;

/// Any protocol message on the wire. Variants are distinguished by their
/// required fields (`command`, `ack`, `nack`, `result`), so the JSON
/// carries no extra envelope.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum Message {
    Command(CommandMessage),
    Ack(AckMessage),
    Nack(NackMessage),
    Status(StatusMessage),
}

impl Message {
    pub fn txn(&self) -> &str {
        match self {
            Message::Command(m) => &m.txn,
            Message::Ack(m) => &m.txn,
            Message::Nack(m) => &m.txn,
            Message::Status(m) => m.txn(),
        }
    }

    /// Whether this message is addressed to the handling (server) side.
    ///
    /// Commands always are; ACK/NACKs are only when they acknowledge a
    /// status. Lets one physical connection carry both directions.
    pub fn is_for_server(&self) -> bool {
        match self {
            Message::Command(_) => true,
            Message::Ack(m) => m.ack == ACK_STATUS,
            Message::Nack(m) => m.nack == ACK_STATUS,
            Message::Status(_) => false,
        }
    }

    /// Whether this message is addressed to the issuing (client) side.
    pub fn is_for_client(&self) -> bool {
        match self {
            Message::Command(_) => false,
            Message::Ack(m) => m.ack != ACK_STATUS,
            Message::Nack(m) => m.nack != ACK_STATUS,
            Message::Status(_) => true,
        }
    }
}

/// A named command issued against a session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommandMessage {
    /// Omitted only for `senderCreate`, which has no session yet.
    #[serde(rename = "for", default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<SessionId>,
    pub txn: TxnId,
    pub command: String,
    pub data: serde_json::Value,
}

/// Positive receipt acknowledgement for a command or status.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AckMessage {
    /// The command name being acknowledged, or `"status"`.
    pub ack: String,
    #[serde(rename = "for", default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<SessionId>,
    pub txn: TxnId,
    #[serde(
        rename = "interModifier",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub inter_modifier: Option<String>,
    /// Estimated handler completion time in ms, echoed from the
    /// handler's configured `max_timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Negative receipt acknowledgement carrying a machine-readable reason.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NackMessage {
    pub nack: String,
    #[serde(rename = "for", default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<SessionId>,
    pub txn: TxnId,
    #[serde(
        rename = "interModifier",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub inter_modifier: Option<String>,
    pub reason: NackReason,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NackReason {
    NoSender,
    NoCommand,
    BadMessage,
}

/// Business-level result for a command: terminal success/fail, or a
/// deduplicated intermediate progress update.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum StatusMessage {
    Success {
        #[serde(rename = "for")]
        sender_id: SessionId,
        txn: TxnId,
        data: serde_json::Value,
    },
    Fail {
        #[serde(rename = "for")]
        sender_id: SessionId,
        txn: TxnId,
        error: ErrorDetail,
    },
    Intermediate {
        #[serde(rename = "for")]
        sender_id: SessionId,
        txn: TxnId,
        #[serde(rename = "interModifier")]
        inter_modifier: String,
        data: serde_json::Value,
    },
}

impl StatusMessage {
    pub fn sender_id(&self) -> &str {
        match self {
            StatusMessage::Success { sender_id, .. }
            | StatusMessage::Fail { sender_id, .. }
            | StatusMessage::Intermediate { sender_id, .. } => sender_id,
        }
    }

    pub fn txn(&self) -> &str {
        match self {
            StatusMessage::Success { txn, .. }
            | StatusMessage::Fail { txn, .. }
            | StatusMessage::Intermediate { txn, .. } => txn,
        }
    }

    pub fn inter_modifier(&self) -> Option<&str> {
        match self {
            StatusMessage::Intermediate { inter_modifier, .. } => Some(inter_modifier),
            _ => None,
        }
    }

    /// Success and fail statuses close out a transaction; intermediates
    /// leave it open.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusMessage::Intermediate { .. })
    }
}

/// Typed `{type, message}` pair carried in a fail status.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self {
            kind: "unexpected".to_string(),
            message: message.into(),
        }
    }
}
