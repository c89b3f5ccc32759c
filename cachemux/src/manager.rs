//! Lifecycle owner for one or more named caches.

use dashmap::DashMap;

use crate::cache::Cache;
use crate::config::ManagerConfig;
use crate::error::Error;

/// Creates, looks up, and tears down named `Cache` instances.
#[derive(Default)]
pub struct CacheManager {
    caches: DashMap<String, Cache>,
}

impl CacheManager {
    pub fn new() -> Self {
        CacheManager {
            caches: DashMap::new(),
        }
    }

    /// Build and register a cache under `name`. Replaces (and shuts down)
    /// any existing cache registered under the same name.
    pub async fn create_cache(&self, name: impl Into<String>, config: ManagerConfig) -> Result<(), Error> {
        let cache = Cache::new(config).await?;
        let name = name.into();
        if let Some((_, old)) = self.caches.remove(&name) {
            old.shutdown().await;
        }
        self.caches.insert(name, cache);
        Ok(())
    }

    pub fn remove_cache(&self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Run `f` against the named cache, if registered.
    pub fn with_cache<R>(&self, name: &str, f: impl FnOnce(&Cache) -> R) -> Option<R> {
        self.caches.get(name).map(|entry| f(entry.value()))
    }

    pub fn names(&self) -> Vec<String> {
        self.caches.iter().map(|e| e.key().clone()).collect()
    }

    /// Shut down every registered cache.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.names();
        for name in names {
            if let Some((_, cache)) = self.caches.remove(&name) {
                cache.shutdown().await;
            }
        }
    }
}
