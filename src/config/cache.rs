//! Shared configuration cache keyed by tenant, entity and role set.

use crate::config::EntityConfiguration;
use crate::error::EngineError;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant: String,
    pub entity: String,
    /// Sorted and de-duplicated.
    pub roles: Vec<String>,
}

impl CacheKey {
    pub fn new(tenant: impl Into<String>, entity: impl Into<String>, roles: &[String]) -> Self {
        let mut roles = roles.to_vec();
        roles.sort();
        roles.dedup();
        CacheKey {
            tenant: tenant.into(),
            entity: entity.into(),
            roles,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Storage reads performed (misses plus uncached loads).
    pub loads: u64,
    pub entries: usize,
}

/// Removes the in-flight lock when the load finishes or its future is dropped.
struct InflightEntry<'a> {
    map: &'a DashMap<CacheKey, Arc<Mutex<()>>>,
    key: &'a CacheKey,
    lock: Arc<Mutex<()>>,
}

impl Drop for InflightEntry<'_> {
    fn drop(&mut self) {
        self.map.remove_if(self.key, |_, v| Arc::ptr_eq(v, &self.lock));
    }
}

#[derive(Default)]
pub struct ConfigCache {
    entries: DashMap<CacheKey, Arc<EntityConfiguration>>,
    inflight: DashMap<CacheKey, Arc<Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<EntityConfiguration>> {
        let hit = self.entries.get(key).map(|e| Arc::clone(e.value()));
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Return the cached configuration or run `load` once for concurrent misses on the same key.
    /// A failed load caches nothing.
    pub async fn get_or_load<F, Fut>(&self, key: CacheKey, load: F) -> Result<Arc<EntityConfiguration>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<EntityConfiguration, EngineError>>,
    {
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }
        let lock = self.inflight.entry(key.clone()).or_default().clone();
        let _held = Arc::clone(&lock).lock_owned().await;
        let _inflight = InflightEntry {
            map: &self.inflight,
            key: &key,
            lock,
        };
        // Another caller may have finished the load while we waited.
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.loads.fetch_add(1, Ordering::Relaxed);
        let result = load().await.map(Arc::new);
        if let Ok(config) = &result {
            self.entries.insert(key.clone(), Arc::clone(config));
        }
        result
    }

    /// Count a load that bypassed the cache.
    pub(crate) fn record_uncached_load(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evict(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Evict every tenant and role variant of `entity`. Returns the number removed.
    pub fn evict_entity(&self, entity: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| k.entity != entity);
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}
