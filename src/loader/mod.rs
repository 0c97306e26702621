//! Loaders turn unit ids into freshly loaded code artifacts.
//!
//! Every loader keeps a private artifact cache keyed by canonical key, so
//! repeated loads of an unchanged unit are cheap. `invalidate` drops the cached
//! entry and the next `load` goes back to the underlying primitive.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

pub mod dylib;
pub mod synthetic;

pub use dylib::{resident_libraries, DylibLoader, ModuleEntry, MODULE_SYMBOL};
pub use synthetic::SyntheticLoader;

/// A loaded code artifact. Only artifacts that are a `HotModule` are accepted
/// by the runtime.
pub type Artifact = Arc<dyn Any + Send + Sync>;

/// Loader-specific canonical name of a unit (a resolved path for file loaders)
pub type CanonicalKey = String;

/// Artifact cache that can be shared between loaders or inspected by the host
pub type SharedArtifactCache = Arc<Mutex<HashMap<CanonicalKey, Artifact>>>;

pub fn shared_cache() -> SharedArtifactCache {
    Arc::new(Mutex::new(HashMap::new()))
}

#[async_trait]
pub trait Loader: Send + Sync {
    /// Canonical key for `id`
    fn resolve(&self, id: &str) -> anyhow::Result<CanonicalKey>;

    /// Current artifact for `id`; fresh whenever its key was invalidated since
    /// the last load
    async fn load(&self, id: &str) -> anyhow::Result<Artifact>;

    /// Forget the cached artifact for `key`
    fn invalidate(&self, key: &str);
}
