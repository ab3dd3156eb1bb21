//! The handling side of the conversation.
//!
//! [`Server`] owns one half of a connection, allocates sender sessions,
//! dispatches commands to registered handlers, and drives the reliable
//! status exchange back to the issuing side.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

use courier_protocol::{
    AckMessage, CommandMessage, Connection, ConnectionEvent, ErrorDetail, IdGenerator, Message,
    NackMessage, NackReason, SENDER_CLOSE, SENDER_CREATE, SENDER_CREATE_ACK_TIMEOUT_MS, SessionId,
    StatusMessage, TxnId, int_generator,
};

use crate::error::CommandError;
use crate::inactivity::InactivityMonitor;
use crate::retry::MsgSender;
use crate::txn::{ReceiverTxnEvent, ReceiverTxnManager};

const MAX_ID_COLLISIONS: u32 = 100;

/// What a command handler resolved to; mapped onto the success or fail
/// status sent back to the issuing side.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Success(Value),
    Fail(ErrorDetail),
}

/// Emits intermediate statuses for the command currently being handled.
///
/// Each send allocates the next integer modifier for the command's
/// `{for, txn}` pair and resolves once the peer acknowledges (true),
/// refuses (false), or the retry budget runs out (false). Sending after
/// the owning command completed returns false.
#[derive(Clone)]
pub struct IntermediateSender {
    inner: Arc<ServerInner>,
    sender_id: SessionId,
    txn: TxnId,
}

impl IntermediateSender {
    pub async fn send(&self, payload: Value) -> bool {
        let key = intermediate_key(&self.sender_id, &self.txn);
        let (listener, mut events) = mpsc::unbounded_channel();
        let modifier = {
            let mut state = self.inner.state.lock().await;
            let Some(entry) = state.intermediate.get_mut(&key) else {
                debug!(txn = %self.txn, "intermediate status on completed command");
                return false;
            };
            entry.next_modifier += 1;
            let modifier = entry.next_modifier.to_string();
            entry.txns.start(&modifier, listener);
            modifier
        };

        let status = StatusMessage::Intermediate {
            sender_id: self.sender_id.clone(),
            txn: self.txn.clone(),
            inter_modifier: modifier.clone(),
            data: payload,
        };
        let encoded = match serde_json::to_string(&Message::Status(status)) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(error = %err, "failed to encode intermediate status");
                return false;
            }
        };

        let timeout_inner = Arc::clone(&self.inner);
        let timeout_key = key.clone();
        let timeout_modifier = modifier.clone();
        let sent = self
            .inner
            .base
            .send_with_retry(
                encoded,
                Box::pin(async move {
                    let mut state = timeout_inner.state.lock().await;
                    if let Some(entry) = state.intermediate.get_mut(&timeout_key) {
                        entry.txns.timeout(&timeout_modifier);
                    }
                }),
            )
            .await;
        let retry = match sent {
            Ok(handle) => handle,
            Err(err) => {
                debug!(error = %err, "failed to send intermediate status");
                let mut state = self.inner.state.lock().await;
                if let Some(entry) = state.intermediate.get_mut(&key) {
                    entry.txns.remove(&modifier);
                }
                return false;
            }
        };

        match events.recv().await {
            Some(ReceiverTxnEvent::Ack) => {
                retry.stop_retry();
                true
            }
            Some(ReceiverTxnEvent::Nack) => {
                retry.stop_retry();
                false
            }
            Some(ReceiverTxnEvent::TimedOut) => {
                debug!(txn = %self.txn, "no acknowledgement for intermediate status");
                false
            }
            None => false,
        }
    }
}

/// Boxed command handler invoked with the command message and an
/// intermediate-status sender for its transaction.
pub type HandlerFn =
    Arc<dyn Fn(CommandMessage, IntermediateSender) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;

struct HandlerConfig {
    handler: HandlerFn,
    /// Advertised on the command ACK as the expected completion time.
    max_timeout: Option<u64>,
}

#[derive(Default)]
struct IntermediateState {
    txns: ReceiverTxnManager,
    next_modifier: u64,
}

struct ServerState {
    active: HashMap<SessionId, ReceiverTxnManager>,
    closing: HashMap<SessionId, ReceiverTxnManager>,
    /// Sub-transactions for in-flight intermediate statuses, keyed
    /// `"{for}-{txn}"`.
    intermediate: HashMap<String, IntermediateState>,
    handlers: HashMap<String, HandlerConfig>,
    session_ids: IdGenerator,
}

struct ServerInner {
    base: MsgSender,
    state: Mutex<ServerState>,
    monitor: InactivityMonitor,
    max_sender_inactivity_ms: u64,
    opened: AtomicBool,
}

pub struct ServerConfig {
    pub ack_retry_delay: Duration,
    pub max_ack_retries: u32,
    /// How long a sender may go without issuing a command before its
    /// session is evicted.
    pub max_sender_inactivity: Duration,
    /// Session id source; defaults to the wrapping integer generator.
    pub id_generator: Option<IdGenerator>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ack_retry_delay: Duration::from_secs(1),
            max_ack_retries: 4,
            max_sender_inactivity: Duration::from_secs(60),
            id_generator: None,
        }
    }
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(connection: Arc<dyn Connection>, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                base: MsgSender::new(connection, config.ack_retry_delay, config.max_ack_retries),
                state: Mutex::new(ServerState {
                    active: HashMap::new(),
                    closing: HashMap::new(),
                    intermediate: HashMap::new(),
                    handlers: HashMap::new(),
                    session_ids: config.id_generator.unwrap_or_else(int_generator),
                }),
                monitor: InactivityMonitor::new(config.max_sender_inactivity),
                max_sender_inactivity_ms: config.max_sender_inactivity.as_millis() as u64,
                opened: AtomicBool::new(false),
            }),
        }
    }

    /// Opens the connection and starts dispatching inbound traffic.
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

    /// Evicts every remaining session (their inactivity handlers fire
    /// immediately), drains outstanding retries, and closes the
    /// connection.
    pub async fn close(&self) -> Result<(), CommandError> {
        self.inner.monitor.close().await;
        self.inner.base.close(true).await?;
        Ok(())
    }

    /// Registers the handler invoked for `command`. The reserved
    /// `senderCreate`/`senderClose` names are built in and cannot be
    /// overridden; attempts are logged and ignored.
    pub async fn register_handler<F, Fut>(
        &self,
        command: impl Into<String>,
        max_timeout: Option<u64>,
        handler: F,
    ) where
        F: Fn(CommandMessage, IntermediateSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        let command = command.into();
        if command == SENDER_CREATE || command == SENDER_CLOSE {
            warn!(command, "reserved command name, handler not registered");
            return;
        }
        let handler: HandlerFn = Arc::new(move |msg, inter| {
            Box::pin(handler(msg, inter)) as BoxFuture<'static, HandlerOutcome>
        });
        self.inner.state.lock().await.handlers.insert(
            command,
            HandlerConfig {
                handler,
                max_timeout,
            },
        );
    }

    pub async fn remove_handler(&self, command: &str) -> bool {
        self.inner.state.lock().await.handlers.remove(command).is_some()
    }

    /// Count of active (not closing) sessions.
    pub async fn number_of_senders(&self) -> usize {
        self.inner.state.lock().await.active.len()
    }
}

fn intermediate_key(sender_id: &str, txn: &str) -> String {
    format!("{sender_id}-{txn}")
}

async fn route_inbound(
    inner: Arc<ServerInner>,
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
                if !message.is_for_server() {
                    continue;
                }
                match message {
                    Message::Command(cmd) => dispatch_command(&inner, cmd).await,
                    Message::Ack(ack) => {
                        resolve_acknowledgement(&inner, ack.sender_id.as_deref(), &ack.txn, ack.inter_modifier.as_deref(), true).await;
                    }
                    Message::Nack(nack) => {
                        resolve_acknowledgement(&inner, nack.sender_id.as_deref(), &nack.txn, nack.inter_modifier.as_deref(), false).await;
                    }
                    Message::Status(_) => {}
                }
            }
            ConnectionEvent::Error(err) => {
                warn!(error = %err, "connection reported an error");
            }
            ConnectionEvent::Closed => {
                debug!("connection closed, shutting down server routing");
                if let Err(err) = inner.base.close(false).await {
                    warn!(error = %err, "error while winding down after close");
                }
                return;
            }
        }
    }
}

/// Routes an inbound ACK/NACK for a status the server sent. A modifier
/// addresses the sub-transaction of an intermediate status; otherwise
/// the session's transaction is resolved directly. ACKs for unknown
/// sessions have no meaning and are dropped.
async fn resolve_acknowledgement(
    inner: &Arc<ServerInner>,
    sender_id: Option<&str>,
    txn: &str,
    inter_modifier: Option<&str>,
    positive: bool,
) {
    let Some(sender_id) = sender_id else {
        debug!(txn, "acknowledgement without a sender id");
        return;
    };
    let mut state = inner.state.lock().await;
    if let Some(modifier) = inter_modifier {
        let key = intermediate_key(sender_id, txn);
        if let Some(entry) = state.intermediate.get_mut(&key) {
            if positive {
                entry.txns.ack(modifier);
            } else {
                entry.txns.nack(modifier);
            }
        }
        return;
    }
    if let Some(manager) = state.active.get_mut(sender_id) {
        if positive {
            manager.ack(txn);
        } else {
            manager.nack(txn);
        }
    } else if let Some(manager) = state.closing.get_mut(sender_id) {
        if positive {
            manager.ack(txn);
        } else {
            manager.nack(txn);
        }
    }
}

enum OutcomeSource {
    SenderClose,
    Registered(HandlerFn),
}

async fn dispatch_command(inner: &Arc<ServerInner>, cmd: CommandMessage) {
    let Some(sender_id) = cmd.sender_id.clone() else {
        if cmd.command == SENDER_CREATE {
            tokio::spawn(handle_sender_create(Arc::clone(inner), cmd));
            return;
        }
        debug!(txn = %cmd.txn, command = %cmd.command, "command without a sender id");
        send_nack(inner, &cmd, NackReason::BadMessage).await;
        return;
    };

    let (source, max_timeout, events) = {
        let mut state = inner.state.lock().await;
        let known = state.active.contains_key(&sender_id) || state.closing.contains_key(&sender_id);
        if !known {
            drop(state);
            send_nack(inner, &cmd, NackReason::NoSender).await;
            return;
        }
        let duplicate = state
            .active
            .get(&sender_id)
            .or_else(|| state.closing.get(&sender_id))
            .is_some_and(|manager| manager.has(&cmd.txn));
        if duplicate {
            debug!(command = %cmd.command, txn = %cmd.txn, "duplicate command transaction dropped");
            return;
        }

        let (source, max_timeout) = if cmd.command == SENDER_CLOSE {
            (OutcomeSource::SenderClose, None)
        } else {
            match state.handlers.get(&cmd.command) {
                Some(config) => (
                    OutcomeSource::Registered(Arc::clone(&config.handler)),
                    config.max_timeout,
                ),
                None => {
                    drop(state);
                    send_nack(inner, &cmd, NackReason::NoCommand).await;
                    return;
                }
            }
        };

        let (listener, events) = mpsc::unbounded_channel();
        if let Some(manager) = state.active.get_mut(&sender_id) {
            manager.start(&cmd.txn, listener);
        } else if let Some(manager) = state.closing.get_mut(&sender_id) {
            manager.start(&cmd.txn, listener);
        }
        state
            .intermediate
            .insert(intermediate_key(&sender_id, &cmd.txn), IntermediateState::default());
        (source, max_timeout, events)
    };

    inner.monitor.refresh(&sender_id).await;

    let ack = AckMessage {
        ack: cmd.command.clone(),
        sender_id: Some(sender_id.clone()),
        txn: cmd.txn.clone(),
        inter_modifier: None,
        timeout: max_timeout,
    };
    send_reply(inner, Message::Ack(ack)).await;

    tokio::spawn(run_command(Arc::clone(inner), cmd, source, events));
}

/// Runs the handler and drives its status through the retry engine
/// until the issuing side acknowledges or the budget runs out.
async fn run_command(
    inner: Arc<ServerInner>,
    cmd: CommandMessage,
    source: OutcomeSource,
    mut events: mpsc::UnboundedReceiver<ReceiverTxnEvent>,
) {
    let sender_id = match &cmd.sender_id {
        Some(sender_id) => sender_id.clone(),
        None => return,
    };
    let key = intermediate_key(&sender_id, &cmd.txn);

    let outcome = match source {
        OutcomeSource::SenderClose => sender_close_outcome(&inner, &sender_id).await,
        OutcomeSource::Registered(handler) => {
            let intermediates = IntermediateSender {
                inner: Arc::clone(&inner),
                sender_id: sender_id.clone(),
                txn: cmd.txn.clone(),
            };
            handler(cmd.clone(), intermediates).await
        }
    };

    let status = match outcome {
        HandlerOutcome::Success(data) => StatusMessage::Success {
            sender_id: sender_id.clone(),
            txn: cmd.txn.clone(),
            data,
        },
        HandlerOutcome::Fail(error) => StatusMessage::Fail {
            sender_id: sender_id.clone(),
            txn: cmd.txn.clone(),
            error,
        },
    };

    let encoded = match serde_json::to_string(&Message::Status(status)) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(error = %err, command = %cmd.command, "failed to encode status");
            cleanup_command(&inner, &sender_id, &cmd.txn, &key).await;
            return;
        }
    };

    let timeout_inner = Arc::clone(&inner);
    let timeout_sender = sender_id.clone();
    let timeout_txn = cmd.txn.clone();
    let sent = inner
        .base
        .send_with_retry(
            encoded,
            Box::pin(async move {
                let mut state = timeout_inner.state.lock().await;
                if let Some(manager) = state.active.get_mut(&timeout_sender) {
                    manager.timeout(&timeout_txn);
                } else if let Some(manager) = state.closing.get_mut(&timeout_sender) {
                    manager.timeout(&timeout_txn);
                }
            }),
        )
        .await;
    let retry = match sent {
        Ok(handle) => handle,
        Err(err) => {
            warn!(error = %err, command = %cmd.command, "failed to send status");
            cleanup_command(&inner, &sender_id, &cmd.txn, &key).await;
            return;
        }
    };

    match events.recv().await {
        Some(ReceiverTxnEvent::Ack) | Some(ReceiverTxnEvent::Nack) => retry.stop_retry(),
        Some(ReceiverTxnEvent::TimedOut) => {
            debug!(command = %cmd.command, "no acknowledgement for status");
        }
        None => {}
    }
    inner.state.lock().await.intermediate.remove(&key);
}

async fn cleanup_command(inner: &Arc<ServerInner>, sender_id: &str, txn: &str, key: &str) {
    let mut state = inner.state.lock().await;
    if let Some(manager) = state.active.get_mut(sender_id) {
        manager.remove(txn);
    } else if let Some(manager) = state.closing.get_mut(sender_id) {
        manager.remove(txn);
    }
    state.intermediate.remove(key);
}

/// Built-in session close: the session moves from active to closing so
/// in-flight retries can still resolve, and an inactivity entry drops
/// the closing record once the window elapses.
async fn sender_close_outcome(inner: &Arc<ServerInner>, sender_id: &str) -> HandlerOutcome {
    let moved = {
        let mut state = inner.state.lock().await;
        match state.active.remove(sender_id) {
            Some(manager) => {
                state.closing.insert(sender_id.to_string(), manager);
                true
            }
            None => false,
        }
    };
    if !moved {
        return HandlerOutcome::Fail(ErrorDetail::unexpected(format!(
            "could not find a relevant connection to close for {sender_id}"
        )));
    }

    let closing_inner = Arc::clone(inner);
    let closing_id = sender_id.to_string();
    inner
        .monitor
        .register(sender_id, move || {
            let inner = Arc::clone(&closing_inner);
            let id = closing_id.clone();
            async move {
                inner.state.lock().await.closing.remove(&id);
            }
        })
        .await;
    HandlerOutcome::Success(json!({}))
}

/// Session creation: ACK immediately, allocate an id, register the
/// session and its eviction timer, then deliver the id in a success
/// status carrying the inactivity window.
async fn handle_sender_create(inner: Arc<ServerInner>, cmd: CommandMessage) {
    let ack = AckMessage {
        ack: SENDER_CREATE.to_string(),
        sender_id: None,
        txn: cmd.txn.clone(),
        inter_modifier: None,
        timeout: Some(SENDER_CREATE_ACK_TIMEOUT_MS),
    };
    send_reply(&inner, Message::Ack(ack)).await;

    let (listener, mut events) = mpsc::unbounded_channel();
    let sender_id = {
        let mut state = inner.state.lock().await;
        let mut attempts = 0u32;
        let sender_id = loop {
            let candidate = (state.session_ids)();
            attempts += 1;
            if !state.active.contains_key(&candidate) {
                break candidate;
            }
            if attempts > MAX_ID_COLLISIONS {
                error!("session id generator exhausted, dropping senderCreate");
                return;
            }
        };
        let mut manager = ReceiverTxnManager::new();
        manager.start(&cmd.txn, listener);
        state.active.insert(sender_id.clone(), manager);
        sender_id
    };

    let evict_inner = Arc::clone(&inner);
    let evict_id = sender_id.clone();
    inner
        .monitor
        .register(&sender_id, move || {
            let inner = Arc::clone(&evict_inner);
            let id = evict_id.clone();
            async move {
                debug!(sender_id = %id, "evicting inactive sender");
                inner.state.lock().await.active.remove(&id);
            }
        })
        .await;

    let status = StatusMessage::Success {
        sender_id: sender_id.clone(),
        txn: cmd.txn.clone(),
        data: json!({ "inactivity": inner.max_sender_inactivity_ms }),
    };
    let encoded = match serde_json::to_string(&Message::Status(status)) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(error = %err, "failed to encode senderCreate status");
            return;
        }
    };

    let timeout_inner = Arc::clone(&inner);
    let timeout_id = sender_id.clone();
    let timeout_txn = cmd.txn.clone();
    let sent = inner
        .base
        .send_with_retry(
            encoded,
            Box::pin(async move {
                let mut state = timeout_inner.state.lock().await;
                if let Some(manager) = state.active.get_mut(&timeout_id) {
                    manager.timeout(&timeout_txn);
                }
            }),
        )
        .await;
    let retry = match sent {
        Ok(handle) => handle,
        Err(err) => {
            warn!(error = %err, "failed to send senderCreate status");
            inner.state.lock().await.active.remove(&sender_id);
            return;
        }
    };

    match events.recv().await {
        Some(ReceiverTxnEvent::Ack) => retry.stop_retry(),
        Some(ReceiverTxnEvent::Nack) => {
            retry.stop_retry();
            debug!(sender_id = %sender_id, "NACK for senderCreate status, dropping session");
            inner.state.lock().await.active.remove(&sender_id);
        }
        Some(ReceiverTxnEvent::TimedOut) => {
            debug!(sender_id = %sender_id, "no acknowledgement for senderCreate status, dropping session");
            inner.state.lock().await.active.remove(&sender_id);
        }
        None => {}
    }
}

async fn send_nack(inner: &Arc<ServerInner>, cmd: &CommandMessage, reason: NackReason) {
    let nack = NackMessage {
        nack: cmd.command.clone(),
        sender_id: cmd.sender_id.clone(),
        txn: cmd.txn.clone(),
        inter_modifier: None,
        reason,
    };
    send_reply(inner, Message::Nack(nack)).await;
}

async fn send_reply(inner: &Arc<ServerInner>, message: Message) {
    let encoded = match serde_json::to_string(&message) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(error = %err, "failed to encode reply");
            return;
        }
    };
    if let Err(err) = inner.base.send_no_retry(encoded).await {
        debug!(error = %err, "failed to send reply");
    }
}
