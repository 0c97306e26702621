use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::watcher::{Unsubscribe, WatchEvent, Watcher, EVENT_CAPACITY};

/// Watcher driven by the host.
///
/// Useful when change detection lives elsewhere (an IPC command, a build
/// server) and in tests.
pub struct ManualWatcher {
    sender: broadcast::Sender<WatchEvent>,
    watched: Arc<Mutex<HashMap<String, usize>>>,
}

impl ManualWatcher {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sender,
            watched: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Announce that `ids` changed; returns the number of subscribers reached
    pub fn trigger<I, S>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        debug!("🔔 Manual change notification: {:?}", ids);
        self.sender.send(WatchEvent::Update(ids)).unwrap_or(0)
    }

    pub fn is_watching(&self, id: &str) -> bool {
        self.watched.lock().contains_key(id)
    }

    pub fn watched_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.watched.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for ManualWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Watcher for ManualWatcher {
    fn watch(&self, id: &str) -> anyhow::Result<Unsubscribe> {
        *self.watched.lock().entry(id.to_string()).or_insert(0) += 1;

        let watched = Arc::clone(&self.watched);
        let id = id.to_string();
        Ok(Unsubscribe::new(move || {
            let mut watched = watched.lock();
            if let Some(count) = watched.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    watched.remove(&id);
                }
            }
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers() {
        let watcher = ManualWatcher::new();
        assert_eq!(watcher.trigger(["a"]), 0);

        let mut rx = watcher.subscribe();
        assert_eq!(watcher.trigger(["a", "b"]), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.ids(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_watch_bookkeeping() {
        let watcher = ManualWatcher::new();
        let first = watcher.watch("a").unwrap();
        let second = watcher.watch("a").unwrap();
        let other = watcher.watch("b").unwrap();
        assert_eq!(watcher.watched_ids(), vec!["a".to_string(), "b".to_string()]);

        first.unsubscribe();
        first.unsubscribe();
        assert!(watcher.is_watching("a"));

        second.unsubscribe();
        other.unsubscribe();
        assert!(watcher.watched_ids().is_empty());
    }
}
