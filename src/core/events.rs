use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Why an update was published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCause {
    /// The unit's code changed and it was reloaded
    CodeChanged,
    /// The unit body asked to signal that its output changed
    SelfEmitted,
}

/// Published after every completed reload and on every `emit_update`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    pub ids: Vec<String>,
    pub cause: UpdateCause,
}

impl UpdateEvent {
    pub fn code_changed(id: impl Into<String>) -> Self {
        Self {
            ids: vec![id.into()],
            cause: UpdateCause::CodeChanged,
        }
    }

    pub fn self_emitted(id: impl Into<String>) -> Self {
        Self {
            ids: vec![id.into()],
            cause: UpdateCause::SelfEmitted,
        }
    }

    pub fn concerns(&self, id: &str) -> bool {
        self.ids.iter().any(|i| i == id)
    }
}

/// Handle returned by `on`/`once`, used to remove the listener again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&UpdateEvent) + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    listener: Listener,
    once: bool,
}

struct BusInner {
    sender: broadcast::Sender<UpdateEvent>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_id: AtomicU64,
}

/// Per-runtime publish/subscribe channel for update events.
///
/// Channel subscribers get every event published after they subscribed;
/// callback listeners are invoked synchronously on the publishing task.
#[derive(Clone)]
pub(crate) struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                sender,
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.inner.sender.subscribe()
    }

    pub(crate) fn on(&self, listener: Listener, once: bool) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push(ListenerEntry { id, listener, once });
        id
    }

    pub(crate) fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    pub(crate) fn publish(&self, event: UpdateEvent) {
        trace!("📣 Publishing update: {:?}", event);

        // Listeners may call on/off themselves, so they run without the lock held
        let to_call: Vec<Listener> = {
            let mut listeners = self.inner.listeners.lock();
            let calls = listeners.iter().map(|e| Arc::clone(&e.listener)).collect();
            listeners.retain(|entry| !entry.once);
            calls
        };

        // No receivers is not an error
        let _ = self.inner.sender.send(event.clone());

        for listener in to_call {
            listener(&event);
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

/// Callback handed to a unit body so it can announce that its output changed
/// without a code change. Never triggers a reload.
#[derive(Clone)]
pub struct UpdateEmitter {
    id: Arc<str>,
    bus: EventBus,
}

impl UpdateEmitter {
    pub(crate) fn new(id: &str, bus: EventBus) -> Self {
        Self {
            id: Arc::from(id),
            bus,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn emit(&self) {
        self.bus.publish(UpdateEvent::self_emitted(self.id.as_ref()));
    }
}

impl fmt::Debug for UpdateEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateEmitter").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_channel_subscribers_receive_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(UpdateEvent::code_changed("a"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.ids, vec!["a".to_string()]);
        assert_eq!(event.cause, UpdateCause::CodeChanged);
        assert!(event.concerns("a"));
        assert!(!event.concerns("b"));
    }

    #[test]
    fn test_once_listener_fires_once() {
        let bus = EventBus::new(16);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        bus.on(
            Arc::new(move |_: &UpdateEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );

        bus.publish(UpdateEvent::code_changed("a"));
        bus.publish(UpdateEvent::code_changed("a"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_off_removes_listener() {
        let bus = EventBus::new(16);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let id = bus.on(
            Arc::new(move |_: &UpdateEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        );

        bus.publish(UpdateEvent::code_changed("a"));
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.publish(UpdateEvent::code_changed("a"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emitter_publishes_self_emitted() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let emitter = UpdateEmitter::new("./b", bus.clone());

        emitter.emit();

        let event = rx.try_recv().unwrap();
        assert_eq!(event, UpdateEvent::self_emitted("./b"));
        assert_eq!(emitter.id(), "./b");
    }
}
