use std::collections::HashMap;

use tokio::sync::mpsc;

use courier_protocol::TxnId;

/// Delivered to the task driving a command's status exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverTxnEvent {
    Ack,
    Nack,
    TimedOut,
}

/// Tracks transactions on the handling side of the conversation.
///
/// Transaction ids arrive from the peer; refusing to `start` an id a
/// second time is what drops duplicate retransmitted commands.
#[derive(Default)]
pub struct ReceiverTxnManager {
    txns: HashMap<TxnId, mpsc::UnboundedSender<ReceiverTxnEvent>>,
}

impl ReceiverTxnManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for an externally supplied id. Returns
    /// false (and leaves the existing listener untouched) if the id is
    /// already tracked.
    pub fn start(&mut self, txn: &str, listener: mpsc::UnboundedSender<ReceiverTxnEvent>) -> bool {
        if self.txns.contains_key(txn) {
            return false;
        }
        self.txns.insert(txn.to_string(), listener);
        true
    }

    pub fn ack(&mut self, txn: &str) {
        if let Some(listener) = self.txns.remove(txn) {
            let _ = listener.send(ReceiverTxnEvent::Ack);
        }
    }

    pub fn nack(&mut self, txn: &str) {
        if let Some(listener) = self.txns.remove(txn) {
            let _ = listener.send(ReceiverTxnEvent::Nack);
        }
    }

    /// Abandons a transaction whose outbound status send was given up.
    pub fn timeout(&mut self, txn: &str) {
        if let Some(listener) = self.txns.remove(txn) {
            let _ = listener.send(ReceiverTxnEvent::TimedOut);
        }
    }

    pub fn remove(&mut self, txn: &str) -> bool {
        self.txns.remove(txn).is_some()
    }

    pub fn has(&self, txn: &str) -> bool {
        self.txns.contains_key(txn)
    }

    pub fn count(&self) -> usize {
        self.txns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_start_is_refused() {
        let mut mgr = ReceiverTxnManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        assert!(mgr.start("5", tx1));
        assert!(!mgr.start("5", tx2));
        assert_eq!(mgr.count(), 1);

        // the original listener is still the registered one
        mgr.ack("5");
        assert!(matches!(rx1.recv().await, Some(ReceiverTxnEvent::Ack)));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn ack_nack_timeout_all_remove() {
        let mut mgr = ReceiverTxnManager::new();
        for (txn, event) in [
            ("a", ReceiverTxnEvent::Ack),
            ("b", ReceiverTxnEvent::Nack),
            ("c", ReceiverTxnEvent::TimedOut),
        ] {
            let (tx, mut rx) = mpsc::unbounded_channel();
            mgr.start(txn, tx);
            match event {
                ReceiverTxnEvent::Ack => mgr.ack(txn),
                ReceiverTxnEvent::Nack => mgr.nack(txn),
                ReceiverTxnEvent::TimedOut => mgr.timeout(txn),
            }
            assert_eq!(rx.recv().await, Some(event));
            assert!(!mgr.has(txn));
        }
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn unknown_ids_are_no_ops() {
        let mut mgr = ReceiverTxnManager::new();
        mgr.ack("missing");
        mgr.nack("missing");
        mgr.timeout("missing");
        assert!(!mgr.remove("missing"));
        assert!(!mgr.has("missing"));
    }
}
