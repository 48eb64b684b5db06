use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use syncline_core::prelude::*;

#[derive(Debug, Default)]
struct CacheData {
    values: HashMap<CacheKey, Vec<Record>>,
    stale: HashSet<CacheKey>,
    invalidations: HashMap<CacheKey, u32>,
}

/// An in-memory reactive query cache.
///
/// Invalidated keys keep their value but are marked stale until the next write, and every
/// invalidation is counted so tests can assert refetch volume.
#[derive(Clone, Debug, Default)]
pub struct InMemoryQueryCache(Arc<Mutex<CacheData>>);

impl InMemoryQueryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryQueryCache");
        Self::default()
    }

    /// Sets the value of `key` directly.
    pub async fn seed(&self, key: CacheKey, records: Vec<Record>) {
        let mut data = self.0.lock().await;
        data.stale.remove(&key);
        data.values.insert(key, records);
    }

    /// How many times `key` was invalidated.
    pub async fn invalidation_count(&self, key: &CacheKey) -> u32 {
        self.0
            .lock()
            .await
            .invalidations
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Invalidations over all keys.
    pub async fn total_invalidations(&self) -> u32 {
        self.0.lock().await.invalidations.values().sum()
    }

    /// Whether `key` was invalidated since it was last written.
    pub async fn is_stale(&self, key: &CacheKey) -> bool {
        self.0.lock().await.stale.contains(key)
    }
}

#[async_trait]
impl QueryCache for InMemoryQueryCache {
    async fn read(&self, key: &CacheKey) -> Option<Vec<Record>> {
        self.0.lock().await.values.get(key).cloned()
    }

    async fn write(&self, key: &CacheKey, updater: CacheUpdater) {
        let mut data = self.0.lock().await;
        let current = data.values.remove(key);
        let next = updater(current);
        log::debug!("InMemoryQueryCache: {:?} now holds {} records", key, next.len());
        data.values.insert(key.clone(), next);
        data.stale.remove(key);
    }

    async fn invalidate(&self, key: &CacheKey) {
        let mut data = self.0.lock().await;
        *data.invalidations.entry(key.clone()).or_default() += 1;
        data.stale.insert(key.clone());
        log::debug!("InMemoryQueryCache: invalidated {:?}", key);
    }
}
