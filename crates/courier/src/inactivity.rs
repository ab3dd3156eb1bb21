//! Per-session idle timers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

type InactiveHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct MonitorEntry {
    handler: InactiveHandler,
    timer: JoinHandle<()>,
}

/// Arms a one-shot timer per id; firing evicts the id and runs its
/// handler. Timers are re-armed by [`refresh`](InactivityMonitor::refresh)
/// only while still armed, so a fired or unregistered id stays gone.
pub struct InactivityMonitor {
    window: Duration,
    entries: Arc<Mutex<HashMap<String, MonitorEntry>>>,
}

impl InactivityMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers `id` and arms its timer. Re-registering replaces the
    /// handler and restarts the window.
    pub async fn register<F, Fut>(&self, id: impl Into<String>, on_inactive: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let handler: InactiveHandler =
            Arc::new(move || Box::pin(on_inactive()) as BoxFuture<'static, ()>);
        let timer = arm(Arc::clone(&self.entries), id.clone(), self.window);
        let mut entries = self.entries.lock().await;
        if let Some(previous) = entries.insert(id, MonitorEntry { handler, timer }) {
            previous.timer.abort();
        }
    }

    /// Restarts the window for `id` if a timer is currently armed; a
    /// no-op for unregistered or already-fired ids.
    pub async fn refresh(&self, id: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.timer.abort();
            entry.timer = arm(Arc::clone(&self.entries), id.to_string(), self.window);
        }
    }

    /// Cancels and removes without firing.
    pub async fn unregister(&self, id: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(id) {
            entry.timer.abort();
        }
    }

    /// Fires every still-armed handler immediately (simulating
    /// inactivity) and clears all state. Used to force-clean remaining
    /// sessions when the owning server shuts down.
    pub async fn close(&self) {
        let drained: Vec<MonitorEntry> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.timer.abort();
            (entry.handler)().await;
        }
    }

    pub async fn number_active(&self) -> usize {
        self.entries.lock().await.len()
    }
}

fn arm(
    entries: Arc<Mutex<HashMap<String, MonitorEntry>>>,
    id: String,
    window: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(window).await;
        // Remove under the lock before invoking so refresh/unregister
        // cannot race a concurrent fire.
        let handler = {
            let mut entries = entries.lock().await;
            entries.remove(&id).map(|entry| entry.handler)
        };
        if let Some(handler) = handler {
            handler().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> BoxFuture<'static, ()>) {
        let count = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&count);
        (count, move || {
            let cloned = Arc::clone(&cloned);
            Box::pin(async move {
                cloned.fetch_add(1, Ordering::SeqCst);
            }) as BoxFuture<'static, ()>
        })
    }

    #[tokio::test]
    async fn fires_after_window_and_evicts() {
        let monitor = InactivityMonitor::new(Duration::from_millis(30));
        let (count, handler) = counter();
        monitor.register("s1", handler).await;
        assert_eq!(monitor.number_active().await, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.number_active().await, 0);

        // refreshing a fired id has no effect
        monitor.refresh("s1").await;
        assert_eq!(monitor.number_active().await, 0);
    }

    #[tokio::test]
    async fn refresh_postpones_eviction() {
        let monitor = InactivityMonitor::new(Duration::from_millis(60));
        let (count, handler) = counter();
        monitor.register("s1", handler).await;

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            monitor.refresh("s1").await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.number_active().await, 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregister_cancels_without_firing() {
        let monitor = InactivityMonitor::new(Duration::from_millis(30));
        let (count, handler) = counter();
        monitor.register("s1", handler).await;
        monitor.unregister("s1").await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.number_active().await, 0);
    }

    #[tokio::test]
    async fn close_fires_every_armed_handler() {
        let monitor = InactivityMonitor::new(Duration::from_secs(60));
        let (count_a, handler_a) = counter();
        let (count_b, handler_b) = counter();
        monitor.register("a", handler_a).await;
        monitor.register("b", handler_b).await;

        monitor.close().await;
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.number_active().await, 0);
    }

    #[tokio::test]
    async fn reregister_replaces_handler() {
        let monitor = InactivityMonitor::new(Duration::from_millis(40));
        let (stale, stale_handler) = counter();
        let (fresh, fresh_handler) = counter();
        monitor.register("s1", stale_handler).await;
        monitor.register("s1", fresh_handler).await;
        assert_eq!(monitor.number_active().await, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stale.load(Ordering::SeqCst), 0);
        assert_eq!(fresh.load(Ordering::SeqCst), 1);
    }
}
