use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::events::UpdateCause;
use crate::core::runtime::HmrRuntime;
use crate::loader::{DylibLoader, Loader};
use crate::watcher::{FsWatcher, NoopWatcher, Watcher};

/// Change source used by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WatcherKind {
    /// Watch unit files on disk
    #[default]
    Fs,
    /// Never reload
    Noop,
}

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    /// Entry unit: a library path or a bare library name
    pub file: String,
    /// Explicit config file; the platform default is used when it exists
    pub config_path: Option<String>,
    pub watcher: WatcherKind,
    pub no_watch: bool,
    pub debounce_ms: Option<u64>,
}

pub struct Daemon {
    entry: String,
    config: Config,
    runtime: HmrRuntime,
}

impl Daemon {
    pub async fn new(options: DaemonOptions) -> Result<Self> {
        let mut config = Self::load_config(options.config_path.as_deref()).await?;
        if options.no_watch {
            config.runtime.watch_disabled = true;
        }
        if let Some(debounce_ms) = options.debounce_ms {
            config.watcher.debounce_ms = debounce_ms;
        }

        let base_dir = std::env::current_dir()?;
        info!("📚 Resolving units from {:?}", base_dir);
        let loader = Arc::new(DylibLoader::new(base_dir));

        let watcher: Arc<dyn Watcher> = match options.watcher {
            WatcherKind::Fs => {
                info!("👀 Using file watcher ({}ms debounce)", config.watcher.debounce_ms);
                let resolver = Arc::clone(&loader);
                Arc::new(
                    FsWatcher::new(config.watcher.clone())
                        .with_resolver(move |id| resolver.resolve(id).map(PathBuf::from)),
                )
            }
            WatcherKind::Noop => {
                info!("💤 Reloading disabled (noop watcher)");
                Arc::new(NoopWatcher::new())
            }
        };

        let runtime = HmrRuntime::new(loader, Some(watcher), config.runtime.clone());

        Ok(Self {
            entry: options.file,
            config,
            runtime,
        })
    }

    async fn load_config(explicit: Option<&str>) -> Result<Config> {
        if let Some(path) = explicit {
            info!("📄 Loading configuration from: {}", path);
            return Config::load(path).await;
        }

        match Config::default_path() {
            Some(path) if path.exists() => Config::load(&path.to_string_lossy()).await,
            _ => {
                debug!("📋 No configuration file found, using defaults");
                Ok(Config::default())
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self) -> &HmrRuntime {
        &self.runtime
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("🚀 Starting hotmod daemon for {}", self.entry);

        let mut updates = self.runtime.subscribe();
        let cell = match self.runtime.import(&self.entry).await {
            Ok(cell) => cell,
            Err(e) => {
                error!("❌ Failed to import {}: {}", self.entry, e);
                return Err(e.into());
            }
        };
        info!("✅ Module {} loaded (exports v{})", self.entry, cell.version());

        info!("🔄 Waiting for changes");
        loop {
            tokio::select! {
                event = updates.recv() => {
                    match event {
                        Ok(event) => match event.cause {
                            UpdateCause::CodeChanged => {
                                info!("🔥 Reloaded {:?} (exports v{})", event.ids, cell.version());
                            }
                            UpdateCause::SelfEmitted => {
                                info!("📣 {:?} published new output", event.ids);
                            }
                        },
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("⚠️  Missed {} update events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = signal::ctrl_c() => {
                    info!("🛑 Received shutdown signal");
                    break;
                }
            }
        }

        self.runtime.close_all();
        self.runtime.unimport(&self.entry).await;
        info!("👋 hotmod daemon stopped");
        Ok(())
    }
}
