use tokio::sync::broadcast;

use crate::watcher::{Unsubscribe, WatchEvent, Watcher, EVENT_CAPACITY};

/// Watcher that never fires.
///
/// For production runs: units keep their call sites and nothing reloads.
pub struct NoopWatcher {
    sender: broadcast::Sender<WatchEvent>,
}

impl NoopWatcher {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }
}

impl Default for NoopWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Watcher for NoopWatcher {
    fn watch(&self, _id: &str) -> anyhow::Result<Unsubscribe> {
        Ok(Unsubscribe::noop())
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }
}
