use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::loader::{shared_cache, Artifact, CanonicalKey, Loader, SharedArtifactCache};

type LoadFn = Arc<dyn Fn(&str) -> anyhow::Result<Artifact> + Send + Sync>;
type ResolveFn = Arc<dyn Fn(&str) -> anyhow::Result<CanonicalKey> + Send + Sync>;

fn resolve_identity(id: &str) -> anyhow::Result<CanonicalKey> {
    Ok(id.to_string())
}

/// Loader built over an arbitrary `(id) -> artifact` function.
///
/// Lets hosts plug in back ends other than shared libraries: scripted units,
/// units generated at runtime, or a static table of modules in tests. Ids
/// resolve to themselves unless a resolver is supplied.
#[derive(Clone)]
pub struct SyntheticLoader {
    load_fn: LoadFn,
    resolve_fn: ResolveFn,
    cache: SharedArtifactCache,
}

impl SyntheticLoader {
    pub fn new<F>(load_fn: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<Artifact> + Send + Sync + 'static,
    {
        Self {
            load_fn: Arc::new(load_fn),
            resolve_fn: Arc::new(resolve_identity),
            cache: shared_cache(),
        }
    }

    pub fn with_resolver<R>(mut self, resolve_fn: R) -> Self
    where
        R: Fn(&str) -> anyhow::Result<CanonicalKey> + Send + Sync + 'static,
    {
        self.resolve_fn = Arc::new(resolve_fn);
        self
    }

    /// Use an externally owned cache instead of the private one
    pub fn with_cache(mut self, cache: SharedArtifactCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> SharedArtifactCache {
        Arc::clone(&self.cache)
    }
}

#[async_trait]
impl Loader for SyntheticLoader {
    fn resolve(&self, id: &str) -> anyhow::Result<CanonicalKey> {
        (self.resolve_fn)(id)
    }

    async fn load(&self, id: &str) -> anyhow::Result<Artifact> {
        let key = self.resolve(id)?;

        let cached = self.cache.lock().get(&key).cloned();
        if let Some(artifact) = cached {
            return Ok(artifact);
        }

        debug!("📦 Loading {} ({})", id, key);
        let artifact = (self.load_fn)(id)?;
        self.cache.lock().insert(key, Arc::clone(&artifact));
        Ok(artifact)
    }

    fn invalidate(&self, key: &str) {
        if self.cache.lock().remove(key).is_some() {
            debug!("🗑️ Invalidated cached artifact: {}", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_loader() -> (SyntheticLoader, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let loader = SyntheticLoader::new(move |id| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Arc::new(format!("{id}#{n}")) as Artifact)
        });
        (loader, calls)
    }

    #[tokio::test]
    async fn test_load_is_cached_until_invalidated() {
        let (loader, calls) = counting_loader();

        let first = loader.load("a").await.unwrap();
        let second = loader.load("a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        loader.invalidate("a");
        let third = loader.load("a").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.downcast_ref::<String>().unwrap(), "a#2");
    }

    #[tokio::test]
    async fn test_resolver_and_shared_cache() {
        let cache = shared_cache();
        let (loader, calls) = counting_loader();
        let loader = loader
            .with_resolver(|id| Ok(id.trim_start_matches("./").to_string()))
            .with_cache(Arc::clone(&cache));

        loader.load("./a").await.unwrap();
        loader.load("a").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.lock().contains_key("a"));
        assert_eq!(loader.resolve("./a").unwrap(), "a");
    }

    #[tokio::test]
    async fn test_load_errors_are_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let loader = SyntheticLoader::new(move |id| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("cannot find module {}", id))
        });

        assert!(loader.load("missing").await.is_err());
        assert!(loader.load("missing").await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(loader.cache().lock().is_empty());
    }
}
