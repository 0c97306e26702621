use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::module::Exports;

struct CellInner {
    id: String,
    exports: RwLock<Option<Exports>>,
    version: AtomicU64,
}

/// Identity-stable holder of a unit's current exports.
///
/// Every clone points at the same slot, so a host that keeps the cell from
/// its first `import` always sees the output of the latest successful reload.
/// Only the runtime writes to it.
#[derive(Clone)]
pub struct ExportCell {
    inner: Arc<CellInner>,
}

impl ExportCell {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            inner: Arc::new(CellInner {
                id: id.to_string(),
                exports: RwLock::new(None),
                version: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current exports, `None` until the first successful run
    pub fn get(&self) -> Option<Exports> {
        self.inner.exports.read().clone()
    }

    /// Current exports downcast to the unit's export type
    pub fn get_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get().and_then(|exports| exports.downcast::<T>().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.exports.read().is_none()
    }

    /// Number of times the exports have been replaced
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &ExportCell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn replace(&self, exports: Exports) {
        *self.inner.exports.write() = Some(exports);
        self.inner.version.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ExportCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportCell")
            .field("id", &self.inner.id)
            .field("version", &self.version())
            .field("empty", &self.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_starts_empty() {
        let cell = ExportCell::new("a");
        assert!(cell.is_empty());
        assert_eq!(cell.version(), 0);
        assert!(cell.get_as::<String>().is_none());
    }

    #[test]
    fn test_clones_observe_replacement() {
        let cell = ExportCell::new("a");
        let held_by_host = cell.clone();

        cell.replace(Arc::new("v1".to_string()));
        cell.replace(Arc::new("v2".to_string()));

        assert!(held_by_host.ptr_eq(&cell));
        assert_eq!(held_by_host.version(), 2);
        assert_eq!(held_by_host.get_as::<String>().unwrap().as_str(), "v2");
        // Wrong type yields nothing rather than panicking
        assert!(held_by_host.get_as::<u32>().is_none());
    }
}
