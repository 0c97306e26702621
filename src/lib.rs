//! hotmod - hot module reloading for long-running Rust hosts
//!
//! A unit of code is described by a [`HotModule`]: a [`PersistManager`] that
//! owns state meant to survive reloads, and a [`Runner`] that turns that state
//! into the unit's exports. [`HmrRuntime`] loads units through a
//! [`Loader`](loader::Loader), re-runs them whenever a
//! [`Watcher`](watcher::Watcher) reports a change, and keeps each unit's
//! latest exports in a stable [`ExportCell`].

pub mod config;
pub mod core;
pub mod loader;
pub mod watcher;

// Re-export commonly used types
pub use crate::config::{Config, RuntimeConfig};
pub use crate::core::{
    create_module, AsyncRunner, Daemon, DaemonOptions, ExportCell, Exports, HmrError, HmrRuntime,
    HotModule, HotModuleBuilder, ImmediateRunner, ListenerId, PersistManager, Persistent, Result,
    Runner, RunnerKind, RuntimeStats, TransitionStage, UpdateCause, UpdateEmitter, UpdateEvent,
    WatcherKind,
};
pub use crate::loader::{DylibLoader, Loader, SyntheticLoader};
pub use crate::watcher::{FsWatcher, ManualWatcher, NoopWatcher, WatchConfig, WatchEvent, Watcher};
