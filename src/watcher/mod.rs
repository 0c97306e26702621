//! Change notification sources.
//!
//! The runtime only needs two things from a watcher: start observing an id,
//! and a stream of `Update` events naming changed ids.

use parking_lot::Mutex;
use std::fmt;
use tokio::sync::broadcast;

pub mod fs;
pub mod manual;
pub mod noop;

pub use fs::{FsWatcher, WatchConfig};
pub use manual::ManualWatcher;
pub use noop::NoopWatcher;

/// Capacity of the broadcast channel behind every bundled watcher
pub(crate) const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// One or more watched ids changed
    Update(Vec<String>),
}

impl WatchEvent {
    pub fn ids(&self) -> &[String] {
        match self {
            WatchEvent::Update(ids) => ids,
        }
    }
}

pub trait Watcher: Send + Sync {
    /// Begin observing `id`. The returned handle stops observing it.
    fn watch(&self, id: &str) -> anyhow::Result<Unsubscribe>;

    /// Receiver for change notifications
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;
}

type StopFn = Box<dyn FnOnce() + Send>;

/// Stops a single watch. Only the first call has an effect.
pub struct Unsubscribe {
    stop: Mutex<Option<StopFn>>,
}

impl Unsubscribe {
    pub fn new<F>(stop: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            stop: Mutex::new(Some(Box::new(stop))),
        }
    }

    pub fn noop() -> Self {
        Self {
            stop: Mutex::new(None),
        }
    }

    pub fn unsubscribe(&self) {
        let stop = self.stop.lock().take();
        if let Some(stop) = stop {
            stop();
        }
    }

    pub fn is_active(&self) -> bool {
        self.stop.lock().is_some()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.is_active())
            .finish()
    }
}
