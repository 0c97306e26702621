pub mod cell;
pub mod daemon;
pub mod error;
pub mod events;
pub mod module;
pub mod runtime;

pub use cell::ExportCell;
pub use daemon::{Daemon, DaemonOptions, WatcherKind};
pub use error::{HmrError, Result, TransitionStage};
pub use events::{ListenerId, UpdateCause, UpdateEmitter, UpdateEvent};
pub use module::{
    create_module, AsyncRunner, Exports, HotModule, HotModuleBuilder, ImmediateRunner,
    PersistManager, Persistent, Runner, RunnerKind,
};
pub use runtime::{HmrRuntime, RuntimeStats};
