//! In-memory connection pairs for exercising the protocol without a
//! real transport.
//!
//! [`pair`] cross-wires two [`PairedConnection`]s: a message sent on one
//! side arrives as a [`ConnectionEvent::Message`] on the other. Loss and
//! failure injection cover the unreliable-transport paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courier_protocol::{Connection, ConnectionError, ConnectionEvent};
use tokio::sync::mpsc;

type DropFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// One end of an in-memory duplex link.
pub struct PairedConnection {
    open: AtomicBool,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    peer_events_tx: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
    sent: Mutex<Vec<String>>,
    drop_filter: Mutex<Option<DropFilter>>,
}

/// Creates two cross-wired connections.
pub fn pair() -> (Arc<PairedConnection>, Arc<PairedConnection>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a = Arc::new(PairedConnection::new(a_tx.clone(), a_rx, b_tx.clone()));
    let b = Arc::new(PairedConnection::new(b_tx, b_rx, a_tx));
    (a, b)
}

impl PairedConnection {
    fn new(
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
        events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        peer_events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            peer_events_tx: Mutex::new(Some(peer_events_tx)),
            sent: Mutex::new(Vec::new()),
            drop_filter: Mutex::new(None),
        }
    }

    /// Every message this side attempted to send, including ones the
    /// drop filter discarded.
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().expect("sent lock").clear();
    }

    /// Installs a loss filter: sends for which it returns `true` report
    /// success but never reach the peer.
    pub fn set_drop_filter(&self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) {
        *self.drop_filter.lock().expect("drop filter lock") = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *self.drop_filter.lock().expect("drop filter lock") = None;
    }

    /// When set, every send returns an error without reaching the peer.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Injects an inbound message as if the peer had sent it.
    pub fn inject_incoming(&self, msg: impl Into<String>) {
        let _ = self.events_tx.send(ConnectionEvent::Message(msg.into()));
    }

    /// Injects a transport-level error event.
    pub fn inject_error(&self, err: impl Into<String>) {
        let _ = self.events_tx.send(ConnectionEvent::Error(err.into()));
    }
}

#[async_trait]
impl Connection for PairedConnection {
    async fn open(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(&self, msg: String) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotOpen);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ConnectionError::Send("injected send failure".to_string()));
        }
        self.sent.lock().expect("sent lock").push(msg.clone());
        if let Some(filter) = self.drop_filter.lock().expect("drop filter lock").as_ref() {
            if filter(&msg) {
                return Ok(());
            }
        }
        if let Some(peer) = self.peer_events_tx.lock().expect("peer lock").as_ref() {
            let _ = peer.send(ConnectionEvent::Message(msg));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.events_tx.send(ConnectionEvent::Closed);
        if let Some(peer) = self.peer_events_tx.lock().expect("peer lock").take() {
            let _ = peer.send(ConnectionEvent::Closed);
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.lock().expect("events lock").take()
    }
}
