use anyhow::Context;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use crate::watcher::{Unsubscribe, WatchEvent, Watcher, EVENT_CAPACITY};

/// File watcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period after the last change before an update is announced
    pub debounce_ms: u64,
    /// Poll interval for back ends without native notifications
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            poll_interval_ms: 100,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

type PathResolver = Arc<dyn Fn(&str) -> anyhow::Result<PathBuf> + Send + Sync>;

fn resolve_as_path(id: &str) -> anyhow::Result<PathBuf> {
    std::fs::canonicalize(id).with_context(|| format!("Cannot watch {}: no such file", id))
}

/// Watches unit files on disk.
///
/// Bursts of writes to a file (a compiler emitting a library in several
/// steps) collapse into a single `Update` once the file has been quiet for
/// the debounce window.
pub struct FsWatcher {
    config: WatchConfig,
    resolver: PathResolver,
    sender: broadcast::Sender<WatchEvent>,
}

impl FsWatcher {
    pub fn new(config: WatchConfig) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            resolver: Arc::new(resolve_as_path),
            sender,
        }
    }

    /// Map ids to files with a custom function (ids are paths by default)
    pub fn with_resolver<R>(mut self, resolver: R) -> Self
    where
        R: Fn(&str) -> anyhow::Result<PathBuf> + Send + Sync + 'static,
    {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    fn is_target(target: &Path, path: &Path) -> bool {
        target == path || (target.file_name().is_some() && path.file_name() == target.file_name())
    }
}

impl Watcher for FsWatcher {
    fn watch(&self, id: &str) -> anyhow::Result<Unsubscribe> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("File watching requires a running tokio runtime")?;

        let target = (self.resolver)(id)?;
        let directory = target
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("{:?} has no parent directory", target))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let filter_target = target.clone();
        let mut watcher = <RecommendedWatcher as notify::Watcher>::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => match event.kind {
                    EventKind::Modify(_) | EventKind::Create(_) => {
                        if event
                            .paths
                            .iter()
                            .any(|path| FsWatcher::is_target(&filter_target, path))
                        {
                            let _ = tx.send(());
                        }
                    }
                    _ => {}
                },
                Err(e) => error!("File watch error: {}", e),
            },
            NotifyConfig::default().with_poll_interval(self.config.poll_interval()),
        )?;

        notify::Watcher::watch(&mut watcher, &directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch directory {:?}", directory))?;
        info!("👀 Watching {} at {:?}", id, target);

        let sender = self.sender.clone();
        let debounce = self.config.debounce();
        let unit = id.to_string();
        let task = runtime.spawn(async move {
            while rx.recv().await.is_some() {
                // Trailing edge: wait until the file has been quiet for a full window
                loop {
                    match tokio::time::timeout(debounce, rx.recv()).await {
                        Ok(Some(())) => debug!("🔍 Change to {} debounced", unit),
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }

                info!("📁 Module file changed: {}", unit);
                let _ = sender.send(WatchEvent::Update(vec![unit.clone()]));
            }
        });

        let id = id.to_string();
        Ok(Unsubscribe::new(move || {
            drop(watcher);
            task.abort();
            debug!("🛑 Stopped watching {}", id);
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }
}
