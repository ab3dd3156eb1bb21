use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use courier_protocol::{IdGenerator, NackReason, StatusMessage, TxnId, int_generator};

use crate::error::CommandError;

const MAX_ID_COLLISIONS: u32 = 100;

/// Delivered to the task awaiting a command's outcome.
#[derive(Debug)]
pub enum SenderTxnEvent {
    Ack,
    Nack(Option<NackReason>),
    Status(StatusMessage),
    TimedOut,
}

struct SenderTxn {
    listener: mpsc::UnboundedSender<SenderTxnEvent>,
    /// Inter-modifiers already surfaced for this transaction, so a
    /// retransmitted intermediate status is delivered exactly once.
    seen_modifiers: HashSet<String>,
}

/// Tracks transactions on the issuing side of the conversation.
///
/// Generates its own transaction ids; statuses keep the transaction open
/// until a terminal one (or a nack/timeout) arrives.
pub struct SenderTxnManager {
    txns: HashMap<TxnId, SenderTxn>,
    id_generator: IdGenerator,
}

impl SenderTxnManager {
    pub fn new(id_generator: Option<IdGenerator>) -> Self {
        Self {
            txns: HashMap::new(),
            id_generator: id_generator.unwrap_or_else(int_generator),
        }
    }

    /// Allocates a fresh transaction id and registers the listener.
    /// Collisions against live transactions are retried up to a bounded
    /// count before failing fatally.
    pub fn create(
        &mut self,
        listener: mpsc::UnboundedSender<SenderTxnEvent>,
    ) -> Result<TxnId, CommandError> {
        let mut attempts = 0u32;
        let txn = loop {
            let candidate = (self.id_generator)();
            attempts += 1;
            if !self.txns.contains_key(&candidate) {
                break candidate;
            }
            if attempts > MAX_ID_COLLISIONS {
                return Err(CommandError::IdExhausted);
            }
        };
        self.txns.insert(
            txn.clone(),
            SenderTxn {
                listener,
                seen_modifiers: HashSet::new(),
            },
        );
        Ok(txn)
    }

    /// The peer took ownership of completing the operation; the
    /// transaction stays open for its status.
    pub fn ack(&self, txn: &str) {
        if let Some(entry) = self.txns.get(txn) {
            let _ = entry.listener.send(SenderTxnEvent::Ack);
        }
    }

    pub fn nack(&mut self, txn: &str, reason: Option<NackReason>) {
        if let Some(entry) = self.txns.remove(txn) {
            let _ = entry.listener.send(SenderTxnEvent::Nack(reason));
        }
    }

    /// Routes a status to its transaction. Terminal statuses resolve and
    /// remove it; intermediate statuses are deduplicated by modifier and
    /// leave it open.
    pub fn status(&mut self, txn: &str, msg: StatusMessage) {
        match msg.inter_modifier() {
            None => {
                if let Some(entry) = self.txns.remove(txn) {
                    let _ = entry.listener.send(SenderTxnEvent::Status(msg));
                }
            }
            Some(modifier) => {
                if let Some(entry) = self.txns.get_mut(txn) {
                    if entry.seen_modifiers.insert(modifier.to_string()) {
                        let _ = entry.listener.send(SenderTxnEvent::Status(msg));
                    }
                }
            }
        }
    }

    /// Abandons a transaction whose retry budget was exhausted.
    pub fn timeout(&mut self, txn: &str) {
        if let Some(entry) = self.txns.remove(txn) {
            let _ = entry.listener.send(SenderTxnEvent::TimedOut);
        }
    }

    pub fn remove(&mut self, txn: &str) -> bool {
        self.txns.remove(txn).is_some()
    }

    /// Drops every pending transaction without an event. Waiting tasks
    /// observe the dropped listener channel instead.
    pub fn clear(&mut self) {
        self.txns.clear();
    }

    pub fn has(&self, txn: &str) -> bool {
        self.txns.contains_key(txn)
    }

    pub fn count(&self) -> usize {
        self.txns.len()
    }
}
