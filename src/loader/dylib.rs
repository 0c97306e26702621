//! Shared-library loader.
//!
//! A unit is a `cdylib` exporting [`MODULE_SYMBOL`] (see
//! [`export_hot_module!`](crate::export_hot_module)). The platform loader
//! caches libraries by path, so every load opens a private copy of the file
//! instead of the file itself.
//!
//! Opened libraries are never unloaded. Values built by a unit (its persistent
//! state, its exports, clones held by readers) carry code from the library
//! that built them and may outlive every module of that unit.

use anyhow::Context;
use async_trait::async_trait;
use libloading::{Library, Symbol};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tracing::{debug, info};

use crate::core::module::HotModule;
use crate::loader::{Artifact, CanonicalKey, Loader};

/// Symbol every unit library must export
pub const MODULE_SYMBOL: &[u8] = b"hotmod_module\0";

/// Signature of the exported entry point
pub type ModuleEntry = fn() -> HotModule;

/// Declares the entry point of a unit library.
///
/// ```ignore
/// fn module() -> hotmod::HotModule { /* ... */ }
/// hotmod::export_hot_module!(module);
/// ```
///
/// Host and unit must be built by the same compiler, against the same
/// version of this crate.
#[macro_export]
macro_rules! export_hot_module {
    ($constructor:expr) => {
        #[no_mangle]
        pub fn hotmod_module() -> $crate::HotModule {
            let constructor: fn() -> $crate::HotModule = $constructor;
            constructor()
        }
    };
}

/// Every library opened in this process
static RESIDENT: Mutex<Vec<Library>> = parking_lot::const_mutex(Vec::new());

/// Number of unit libraries mapped into the process
pub fn resident_libraries() -> usize {
    RESIDENT.lock().len()
}

/// Private copy of a unit library, removed with the last module built from it
struct LibraryCopy {
    shadow: TempPath,
    source: PathBuf,
}

impl Drop for LibraryCopy {
    fn drop(&mut self) {
        debug!("Removing library copy of {:?}: {:?}", self.source, self.shadow);
    }
}

/// Loads units from shared libraries
pub struct DylibLoader {
    base_dir: PathBuf,
    shadow_dir: PathBuf,
    cache: Mutex<HashMap<CanonicalKey, Artifact>>,
}

impl DylibLoader {
    /// Relative ids resolve against `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            shadow_dir: std::env::temp_dir(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Directory receiving the private library copies
    pub fn with_shadow_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shadow_dir = dir.into();
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Platform file name of a library called `name`
    pub fn library_file_name(name: &str) -> String {
        if cfg!(target_os = "windows") {
            format!("{}.dll", name)
        } else if cfg!(target_os = "macos") {
            format!("lib{}.dylib", name)
        } else {
            format!("lib{}.so", name)
        }
    }

    fn candidate_path(&self, id: &str) -> PathBuf {
        let direct = Path::new(id);
        let is_bare_name = direct.extension().is_none() && direct.components().count() == 1;

        let path = if is_bare_name {
            PathBuf::from(Self::library_file_name(id))
        } else {
            direct.to_path_buf()
        };

        if path.is_absolute() {
            path
        } else {
            self.base_dir.join(path)
        }
    }

    fn open_fresh(source: &Path, shadow_dir: &Path) -> anyhow::Result<Artifact> {
        let extension = source.extension().and_then(|e| e.to_str()).unwrap_or("so");
        let shadow = tempfile::Builder::new()
            .prefix("hotmod-")
            .suffix(&format!(".{}", extension))
            .tempfile_in(shadow_dir)
            .with_context(|| format!("Failed to create library copy in {:?}", shadow_dir))?;
        std::fs::copy(source, shadow.path())
            .with_context(|| format!("Failed to copy library {:?}", source))?;
        let shadow = shadow.into_temp_path();

        // SAFETY: opening a library runs its initialisers; units are trusted
        // code built for this host.
        let library = unsafe { Library::new(&*shadow) }
            .with_context(|| format!("Failed to load library {:?}", source))?;

        // SAFETY: the symbol is generated by `export_hot_module!` with the
        // `ModuleEntry` signature.
        let module = unsafe {
            let entry: Symbol<ModuleEntry> = library.get(MODULE_SYMBOL).with_context(|| {
                format!("Symbol hotmod_module not found in {:?}", source)
            })?;
            entry()
        };

        RESIDENT.lock().push(library);

        let anchor = LibraryCopy {
            shadow,
            source: source.to_path_buf(),
        };
        Ok(module.with_anchor(Arc::new(anchor)).into_artifact())
    }
}

#[async_trait]
impl Loader for DylibLoader {
    fn resolve(&self, id: &str) -> anyhow::Result<CanonicalKey> {
        let path = self.candidate_path(id);
        let canonical = std::fs::canonicalize(&path)
            .with_context(|| format!("Cannot resolve unit {} at {:?}", id, path))?;
        Ok(canonical.to_string_lossy().into_owned())
    }

    async fn load(&self, id: &str) -> anyhow::Result<Artifact> {
        let key = self.resolve(id)?;

        let cached = self.cache.lock().get(&key).cloned();
        if let Some(artifact) = cached {
            return Ok(artifact);
        }

        let source = PathBuf::from(&key);
        let shadow_dir = self.shadow_dir.clone();
        let artifact = tokio::task::spawn_blocking(move || Self::open_fresh(&source, &shadow_dir))
            .await
            .context("Library loading task failed")??;

        info!("📚 Loaded module library: {}", key);
        self.cache.lock().insert(key, Arc::clone(&artifact));
        Ok(artifact)
    }

    fn invalidate(&self, key: &str) {
        if self.cache.lock().remove(key).is_some() {
            debug!("🗑️ Invalidated module library: {}", key);
        }
    }
}
