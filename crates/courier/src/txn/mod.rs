//! Transaction correlation.
//!
//! Each side of the conversation keeps a map of pending operations keyed
//! by transaction id. Completion is delivered over a per-transaction
//! event channel; terminal events remove the map entry, so an operation
//! resolves at most once.

mod receiver;
mod sender;

pub use receiver::{ReceiverTxnEvent, ReceiverTxnManager};
pub use sender::{SenderTxnEvent, SenderTxnManager};
