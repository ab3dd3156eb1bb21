//! The issuing side of the conversation.
//!
//! [`Client`] owns one half of a connection and multiplexes any number of
//! concurrent command exchanges over it. [`Sender`] wraps a single
//! server-allocated session and is the normal way to issue commands.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use courier_protocol::{
    ACK_STATUS, AckMessage, CommandMessage, Connection, ConnectionEvent, IdGenerator, Message,
    SENDER_CLOSE, SENDER_CREATE, SessionId, StatusMessage,
};

use crate::error::CommandError;
use crate::retry::MsgSender;
use crate::txn::{SenderTxnEvent, SenderTxnManager};

pub struct ClientConfig {
    /// Interval between retransmissions while no ACK has arrived.
    pub ack_retry_delay: Duration,
    /// Retransmissions after the initial send; total attempts is this
    /// plus one.
    pub max_ack_retries: u32,
    /// Transaction id source; defaults to the wrapping integer
    /// generator.
    pub id_generator: Option<IdGenerator>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_retry_delay: Duration::from_secs(1),
            max_ack_retries: 4,
            id_generator: None,
        }
    }
}

struct ClientInner {
    base: MsgSender,
    txns: Mutex<SenderTxnManager>,
    opened: AtomicBool,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(connection: Arc<dyn Connection>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                base: MsgSender::new(connection, config.ack_retry_delay, config.max_ack_retries),
                txns: Mutex::new(SenderTxnManager::new(config.id_generator)),
                opened: AtomicBool::new(false),
            }),
        }
    }

    /// Opens the connection and starts routing inbound replies.
    /// Idempotent: repeated calls after the first are no-ops.
    pub async fn open(&self) -> Result<(), CommandError> {
        if self.inner.opened.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.base.connection().open().await?;
        let events = self
            .inner
            .base
            .connection()
            .take_events()
            .ok_or_else(|| CommandError::Protocol("connection event stream already taken".into()))?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(route_inbound(inner, events));
        Ok(())
    }

    /// Drains outstanding retry schedules and closes the connection.
    /// Pending calls resolve with timeout or closed errors.
    pub async fn close(&self) -> Result<(), CommandError> {
        self.inner.base.close(true).await?;
        self.inner.txns.lock().await.clear();
        Ok(())
    }

    /// Opens a session: sends `senderCreate` with the given auth payload
    /// and wraps the allocated session id in a [`Sender`].
    pub async fn create_sender(&self, auth_payload: Value) -> Result<Sender, CommandError> {
        let status = self
            .send_inner(SENDER_CREATE, auth_payload, None, None)
            .await?;
        match status {
            StatusMessage::Fail { error, .. } => Err(CommandError::SenderCreateFailed {
                kind: error.kind,
                message: error.message,
            }),
            StatusMessage::Success {
                sender_id, data, ..
            } => {
                let inactivity_ms = data
                    .get("inactivity")
                    .and_then(Value::as_u64)
                    .unwrap_or_default();
                let auth_verify = data.get("auth").cloned();
                Ok(Sender::new(
                    self.clone(),
                    sender_id,
                    inactivity_ms,
                    auth_verify,
                ))
            }
            StatusMessage::Intermediate { .. } => Err(CommandError::Protocol(
                "intermediate status returned for senderCreate".into(),
            )),
        }
    }

    /// Issues a command against an existing session and waits for its
    /// terminal status. Most callers go through [`Sender::command`].
    pub async fn send_command(
        &self,
        command: &str,
        payload: Value,
        sender_id: &str,
    ) -> Result<StatusMessage, CommandError> {
        self.send_inner(command, payload, Some(sender_id), None)
            .await
    }

    /// Like [`send_command`](Client::send_command) but surfaces each
    /// intermediate status through `on_intermediate` before the terminal
    /// status resolves the call. The full status is passed so callers
    /// can correlate updates by modifier.
    pub async fn send_command_with_updates(
        &self,
        command: &str,
        payload: Value,
        sender_id: &str,
        mut on_intermediate: impl FnMut(StatusMessage) + Send,
    ) -> Result<StatusMessage, CommandError> {
        self.send_inner(command, payload, Some(sender_id), Some(&mut on_intermediate))
            .await
    }

    async fn send_inner(
        &self,
        command: &str,
        payload: Value,
        sender_id: Option<&str>,
        mut on_intermediate: Option<&mut (dyn FnMut(StatusMessage) + Send)>,
    ) -> Result<StatusMessage, CommandError> {
        let (listener, mut events) = mpsc::unbounded_channel();
        let txn = self.inner.txns.lock().await.create(listener)?;

        let envelope = CommandMessage {
            sender_id: sender_id.map(str::to_string),
            txn: txn.clone(),
            command: command.to_string(),
            data: payload,
        };
        let encoded = serde_json::to_string(&Message::Command(envelope))?;

        let inner = Arc::clone(&self.inner);
        let timed_out_txn = txn.clone();
        let sent = self
            .inner
            .base
            .send_with_retry(
                encoded,
                Box::pin(async move {
                    inner.txns.lock().await.timeout(&timed_out_txn);
                }),
            )
            .await;
        let retry = match sent {
            Ok(handle) => handle,
            Err(err) => {
                self.inner.txns.lock().await.remove(&txn);
                return Err(err.into());
            }
        };

        loop {
            match events.recv().await {
                Some(SenderTxnEvent::Ack) => retry.stop_retry(),
                Some(SenderTxnEvent::Nack(reason)) => {
                    retry.stop_retry();
                    return Err(CommandError::Nack {
                        command: command.to_string(),
                        reason,
                    });
                }
                Some(SenderTxnEvent::Status(status)) => {
                    self.ack_status(&txn, &status).await;
                    if status.is_terminal() {
                        retry.stop_retry();
                        return Ok(status);
                    }
                    if let Some(callback) = on_intermediate.as_deref_mut() {
                        callback(status);
                    }
                }
                Some(SenderTxnEvent::TimedOut) => {
                    return Err(CommandError::AckTimeout {
                        command: command.to_string(),
                    });
                }
                None => {
                    return Err(CommandError::Closed {
                        command: command.to_string(),
                    });
                }
            }
        }
    }

    /// Statuses are retried by the server until acknowledged, so every
    /// delivered one is ACK'd immediately, intermediates by modifier.
    async fn ack_status(&self, txn: &str, status: &StatusMessage) {
        let ack = AckMessage {
            ack: ACK_STATUS.to_string(),
            sender_id: Some(status.sender_id().to_string()),
            txn: txn.to_string(),
            inter_modifier: status.inter_modifier().map(str::to_string),
            timeout: None,
        };
        let encoded = match serde_json::to_string(&Message::Ack(ack)) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(error = %err, "failed to encode status ACK");
                return;
            }
        };
        if let Err(err) = self.inner.base.send_no_retry(encoded).await {
            debug!(error = %err, txn, "failed to send status ACK");
        }
    }
}

async fn route_inbound(
    inner: Arc<ClientInner>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Message(text) => {
                let message: Message = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(error = %err, "discarding unparseable message");
                        continue;
                    }
                };
                if !message.is_for_client() {
                    continue;
                }
                match message {
                    Message::Ack(ack) => inner.txns.lock().await.ack(&ack.txn),
                    Message::Nack(nack) => {
                        inner.txns.lock().await.nack(&nack.txn, Some(nack.reason));
                    }
                    Message::Status(status) => {
                        let txn = status.txn().to_string();
                        inner.txns.lock().await.status(&txn, status);
                    }
                    Message::Command(_) => {}
                }
            }
            ConnectionEvent::Error(err) => {
                warn!(error = %err, "connection reported an error");
            }
            ConnectionEvent::Closed => {
                debug!("connection closed, shutting down client routing");
                if let Err(err) = inner.base.close(false).await {
                    warn!(error = %err, "error while winding down after close");
                }
                inner.txns.lock().await.clear();
                return;
            }
        }
    }
}

/// One managed session on a client connection. Guarantees commands are
/// associated with the session the server allocated for it.
pub struct Sender {
    client: Client,
    id: SessionId,
    inactivity_ms: u64,
    auth_verify: Option<Value>,
    closed: AtomicBool,
    /// Local optimistic deadline mirroring the server's inactivity
    /// window; re-armed at call time, before the server has ACK'd.
    deadline: Mutex<Option<Instant>>,
}

impl Sender {
    fn new(client: Client, id: SessionId, inactivity_ms: u64, auth_verify: Option<Value>) -> Self {
        let deadline = if inactivity_ms > 0 {
            Some(Instant::now() + Duration::from_millis(inactivity_ms))
        } else {
            None
        };
        Self {
            client,
            id,
            inactivity_ms,
            auth_verify,
            closed: AtomicBool::new(false),
            deadline: Mutex::new(deadline),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The server-reported inactivity window in ms, 0 when disabled.
    pub fn inactivity_ms(&self) -> u64 {
        self.inactivity_ms
    }

    /// Any verification payload the server echoed on session creation.
    pub fn auth_verify(&self) -> Option<&Value> {
        self.auth_verify.as_ref()
    }

    pub async fn command(
        &self,
        command: &str,
        payload: Value,
    ) -> Result<StatusMessage, CommandError> {
        self.ensure_sendable().await?;
        self.client.send_command(command, payload, &self.id).await
    }

    pub async fn command_with_updates(
        &self,
        command: &str,
        payload: Value,
        on_intermediate: impl FnMut(StatusMessage) + Send,
    ) -> Result<StatusMessage, CommandError> {
        self.ensure_sendable().await?;
        self.client
            .send_command_with_updates(command, payload, &self.id, on_intermediate)
            .await
    }

    /// Closes the session: sends `senderClose` (carrying the auth
    /// verification payload when one was issued) and marks this sender
    /// unusable, whatever the outcome.
    pub async fn close(&self) -> Result<StatusMessage, CommandError> {
        self.closed.store(true, Ordering::SeqCst);
        let payload = match &self.auth_verify {
            Some(auth) => json!({ "auth": auth }),
            None => json!({}),
        };
        self.client
            .send_command(SENDER_CLOSE, payload, &self.id)
            .await
    }

    async fn ensure_sendable(&self) -> Result<(), CommandError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommandError::SenderClosed);
        }
        let mut deadline = self.deadline.lock().await;
        if let Some(at) = *deadline {
            if Instant::now() >= at {
                return Err(CommandError::SenderInactive {
                    inactivity_ms: self.inactivity_ms,
                });
            }
            *deadline = Some(Instant::now() + Duration::from_millis(self.inactivity_ms));
        }
        Ok(())
    }
}
