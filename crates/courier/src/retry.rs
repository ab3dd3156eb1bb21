//! The retry-send primitive shared by client and server.
//!
//! Every protocol-significant message goes out through [`MsgSender`]:
//! either fire-and-forget (ACK/NACK replies) or with a bounded,
//! cancellable retransmission schedule that fires a timeout action when
//! the budget is exhausted.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use courier_protocol::{Connection, ConnectionError};

/// Handle returned by [`MsgSender::send_with_retry`].
///
/// Dropping the handle does not cancel the schedule; call
/// [`stop_retry`](RetryHandle::stop_retry) when an ACK/NACK/status makes
/// further retransmission redundant. Idempotent, and safe after the
/// schedule already timed out.
#[derive(Clone)]
pub struct RetryHandle {
    cancel: CancellationToken,
}

impl RetryHandle {
    pub fn stop_retry(&self) {
        self.cancel.cancel();
    }
}

pub(crate) struct MsgSender {
    connection: Arc<dyn Connection>,
    ack_retry_delay: Duration,
    max_ack_retries: u32,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl MsgSender {
    pub(crate) fn new(
        connection: Arc<dyn Connection>,
        ack_retry_delay: Duration,
        max_ack_retries: u32,
    ) -> Self {
        Self {
            connection,
            ack_retry_delay,
            max_ack_retries,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Sends `msg` now and schedules up to `max_ack_retries` resends at
    /// `ack_retry_delay` intervals (total attempts = retries + 1).
    ///
    /// The first send's failure is reported to the caller; failures of
    /// scheduled resends are logged and the schedule continues, since
    /// the schedule itself is the recovery strategy. `on_timeout` runs
    /// exactly once if the budget is exhausted without `stop_retry`,
    /// and also when the sender is closed with the schedule still armed.
    pub(crate) async fn send_with_retry(
        &self,
        msg: String,
        on_timeout: BoxFuture<'static, ()>,
    ) -> Result<RetryHandle, ConnectionError> {
        self.connection.send_message(msg.clone()).await?;

        let cancel = CancellationToken::new();
        let handle = RetryHandle {
            cancel: cancel.clone(),
        };
        let shutdown = self.shutdown.clone();
        let connection = Arc::clone(&self.connection);
        let delay = self.ack_retry_delay;
        let max_retries = self.max_ack_retries;

        self.tracker.spawn(async move {
            let mut attempts = 0u32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = shutdown.cancelled() => {
                        on_timeout.await;
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {
                        attempts += 1;
                        if attempts > max_retries {
                            debug!("no ACK received, retry budget exhausted");
                            on_timeout.await;
                            return;
                        }
                        if let Err(err) = connection.send_message(msg.clone()).await {
                            debug!(error = %err, "send error during retry");
                        }
                    }
                }
            }
        });

        Ok(handle)
    }

    /// Fire-and-forget send, used for ACK/NACK replies. These are
    /// themselves not reliably delivered; duplicates are tolerated by
    /// idempotent handling upstream.
    pub(crate) async fn send_no_retry(&self, msg: String) -> Result<(), ConnectionError> {
        self.connection.send_message(msg).await
    }

    /// Drains every outstanding retry schedule (each fires its timeout
    /// action) and, for an explicit close, closes the connection.
    /// Idempotent; the forced-close path calls this with `explicit =
    /// false` when the connection reports its own closure.
    pub(crate) async fn close(&self, explicit: bool) -> Result<(), ConnectionError> {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if explicit {
            self.connection.close().await?;
        }
        Ok(())
    }
}
