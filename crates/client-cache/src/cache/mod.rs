//! Bounded LRU of live clients, plus the clone sub-cache.
//!
//! The cache is the authoritative holder of live sessions: every removal —
//! explicit, capacity overflow, prune, or purge — funnels through one
//! eviction path that invokes the registered callback synchronously with
//! no cache lock held. The callback (owned by the factory) must stop the
//! client's watcher and queue the asynchronous teardown; it must not
//! re-enter the cache for the same key.
//!
//! Namespace clones live in a separate sub-cache keyed by [`CloneKey`].
//! Evicting a parent locates its clones by parent key and evicts them in
//! the same sweep, so a clone never outlives its parent's session.

use crate::client::VaultClient;
use crate::core::key::{CacheKey, CloneKey};
use crate::metrics::Metrics;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// Invoked for every evicted client. The second argument is false when the
/// caller asked to skip reconciler-facing removal callbacks (the client is
/// still closed and its persisted record still pruned).
pub type EvictionCallback = Arc<dyn Fn(Arc<VaultClient>, bool) + Send + Sync>;

/// Point-in-time cache occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCacheStats {
    /// Live primary entries
    pub len: usize,
    /// Primary capacity
    pub capacity: usize,
    /// Live clone entries
    pub clone_len: usize,
}

struct Inner {
    primary: LruCache<CacheKey, Arc<VaultClient>>,
    clones: LruCache<CloneKey, Arc<VaultClient>>,
}

/// Capacity-bounded cache of live clients
pub struct ClientCache {
    inner: Mutex<Inner>,
    on_evict: Option<EvictionCallback>,
    metrics: Arc<Metrics>,
}

impl ClientCache {
    /// A cache holding at most `capacity` primary clients and an equal
    /// number of clones
    pub fn new(
        capacity: NonZeroUsize,
        on_evict: Option<EvictionCallback>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                primary: LruCache::new(capacity),
                clones: LruCache::new(capacity),
            }),
            on_evict,
            metrics,
        }
    }

    /// Look up a client, marking it most-recently-used
    pub fn get(&self, key: &CacheKey) -> Option<Arc<VaultClient>> {
        let found = self.inner.lock().primary.get(key).cloned();
        self.metrics.record_cache_lookup(found.is_some());
        found
    }

    /// Look up a namespace clone
    pub fn get_clone(&self, key: &CloneKey) -> Option<Arc<VaultClient>> {
        let found = self.inner.lock().clones.get(key).cloned();
        self.metrics.record_clone_lookup(found.is_some());
        found
    }

    /// Look up a client without touching recency or the hit/miss counters
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<VaultClient>> {
        self.inner.lock().primary.peek(key).cloned()
    }

    /// Insert a client under its own key.
    ///
    /// Clones land in the clone sub-cache. On capacity overflow the
    /// least-recently-used entry is evicted (callback fired) and its key
    /// returned.
    pub fn add(&self, client: Arc<VaultClient>) -> Result<Option<CacheKey>, crate::ClientError> {
        if let Some(clone_key) = client.clone_key().cloned() {
            let displaced = {
                let mut inner = self.inner.lock();
                inner.clones.push(clone_key.clone(), client)
            };
            let evicted = displaced.filter(|(k, _)| *k != clone_key);
            if let Some((_, old)) = &evicted {
                self.metrics.record_clone_eviction();
                self.run_callback(Arc::clone(old), true);
            }
            return Ok(None);
        }

        let key = client.cache_key()?.clone();
        let (evicted, orphaned_clones) = {
            let mut inner = self.inner.lock();
            let displaced = inner.primary.push(key.clone(), client);
            let evicted = displaced.filter(|(k, _)| *k != key);
            let clones = evicted
                .as_ref()
                .map(|(k, _)| take_clones_of(&mut inner, k))
                .unwrap_or_default();
            (evicted, clones)
        };
        if let Some((evicted_key, old)) = evicted {
            debug!(cache_key = %evicted_key, "capacity eviction");
            self.metrics.record_cache_eviction();
            self.run_callback(old, true);
            self.evict_clones(orphaned_clones, true);
            return Ok(Some(evicted_key));
        }
        Ok(None)
    }

    /// Deterministically remove a client (and its clones), firing the
    /// eviction callback. Returns false when the key was absent.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.remove_inner(key, true)
    }

    pub(crate) fn remove_inner(&self, key: &CacheKey, fire_handlers: bool) -> bool {
        let (removed, clones) = {
            let mut inner = self.inner.lock();
            let removed = inner.primary.pop(key);
            let clones = if removed.is_some() {
                take_clones_of(&mut inner, key)
            } else {
                Vec::new()
            };
            (removed, clones)
        };
        match removed {
            Some(client) => {
                self.metrics.record_cache_eviction();
                self.run_callback(client, fire_handlers);
                self.evict_clones(clones, fire_handlers);
                true
            }
            None => false,
        }
    }

    /// Remove a single clone entry
    pub fn remove_clone(&self, key: &CloneKey) -> bool {
        let removed = self.inner.lock().clones.pop(key);
        match removed {
            Some(client) => {
                self.metrics.record_clone_eviction();
                self.run_callback(client, true);
                true
            }
            None => false,
        }
    }

    /// Evict every primary client the filter selects; returns the evicted
    /// clients. `fire_handlers` is forwarded to the eviction callback.
    pub fn prune<F>(&self, filter: F, fire_handlers: bool) -> Vec<Arc<VaultClient>>
    where
        F: Fn(&Arc<VaultClient>) -> bool,
    {
        let (evicted, clones) = {
            let mut inner = self.inner.lock();
            let keys: Vec<CacheKey> = inner
                .primary
                .iter()
                .filter(|(_, c)| filter(c))
                .map(|(k, _)| k.clone())
                .collect();
            let mut evicted = Vec::with_capacity(keys.len());
            let mut clones = Vec::new();
            for key in keys {
                if let Some(client) = inner.primary.pop(&key) {
                    clones.extend(take_clones_of(&mut inner, &key));
                    evicted.push(client);
                }
            }
            (evicted, clones)
        };
        for client in &evicted {
            self.metrics.record_cache_eviction();
            self.run_callback(Arc::clone(client), fire_handlers);
        }
        self.evict_clones(clones, fire_handlers);
        evicted
    }

    /// Evict everything
    pub fn purge(&self) -> Vec<Arc<VaultClient>> {
        self.prune(|_| true, true)
    }

    /// Primary keys, most-recently-used first
    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner
            .lock()
            .primary
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Primary clients, most-recently-used first
    pub fn values(&self) -> Vec<Arc<VaultClient>> {
        self.inner
            .lock()
            .primary
            .iter()
            .map(|(_, c)| Arc::clone(c))
            .collect()
    }

    /// Live primary entry count
    pub fn len(&self) -> usize {
        self.inner.lock().primary.len()
    }

    /// Whether the primary cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Occupancy snapshot
    pub fn stats(&self) -> ClientCacheStats {
        let inner = self.inner.lock();
        ClientCacheStats {
            len: inner.primary.len(),
            capacity: inner.primary.cap().get(),
            clone_len: inner.clones.len(),
        }
    }

    fn evict_clones(&self, clones: Vec<Arc<VaultClient>>, fire_handlers: bool) {
        for clone in clones {
            self.metrics.record_clone_eviction();
            self.run_callback(clone, fire_handlers);
        }
    }

    fn run_callback(&self, client: Arc<VaultClient>, fire_handlers: bool) {
        if let Some(cb) = &self.on_evict {
            cb(client, fire_handlers);
        }
    }
}

/// Pop every clone belonging to `parent`. Caller holds the lock.
fn take_clones_of(inner: &mut Inner, parent: &CacheKey) -> Vec<Arc<VaultClient>> {
    let keys: Vec<CloneKey> = inner
        .clones
        .iter()
        .filter(|(k, _)| k.is_child_of(parent))
        .map(|(k, _)| k.clone())
        .collect();
    keys.iter()
        .filter_map(|k| inner.clones.pop(k))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestContext};
    use pretty_assertions::assert_eq;

    fn cache_with_sink(capacity: usize) -> (Arc<ClientCache>, Arc<Mutex<Vec<(String, bool)>>>) {
        let ctx = TestContext::new();
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let cb: EvictionCallback = Arc::new(move |client, fire| {
            sink.lock().push((client.id().to_string(), fire));
        });
        let cache = Arc::new(ClientCache::new(
            NonZeroUsize::new(capacity).unwrap(),
            Some(cb),
            Arc::clone(&ctx.metrics),
        ));
        (cache, evicted)
    }

    #[tokio::test]
    async fn get_returns_cached_client() {
        let ctx = TestContext::new();
        let (cache, _) = cache_with_sink(4);
        let client = testing::initialized_client(&ctx, 0).await;
        let key = client.cache_key().unwrap().clone();

        assert!(cache.get(&key).is_none());
        cache.add(Arc::clone(&client)).unwrap();
        assert_eq!(cache.len(), 1);
        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.id(), client.id());
    }

    #[tokio::test]
    async fn capacity_overflow_evicts_lru() {
        let ctx = TestContext::new();
        let (cache, evicted) = cache_with_sink(2);
        let a = testing::initialized_client(&ctx, 0).await;
        let b = testing::initialized_client(&ctx, 1).await;
        let c = testing::initialized_client(&ctx, 2).await;

        cache.add(Arc::clone(&a)).unwrap();
        cache.add(Arc::clone(&b)).unwrap();
        // Touch `a` so `b` is the LRU entry.
        cache.get(a.cache_key().unwrap());
        let out = cache.add(Arc::clone(&c)).unwrap();

        assert_eq!(out.as_ref(), Some(b.cache_key().unwrap()));
        assert_eq!(cache.len(), 2);
        assert_eq!(evicted.lock().as_slice(), &[(b.id().to_string(), true)]);
    }

    #[tokio::test]
    async fn replacing_same_key_is_not_an_eviction() {
        let ctx = TestContext::new();
        let (cache, evicted) = cache_with_sink(2);
        let a = testing::initialized_client(&ctx, 0).await;
        let a2 = testing::initialized_client(&ctx, 0).await;

        cache.add(Arc::clone(&a)).unwrap();
        let out = cache.add(Arc::clone(&a2)).unwrap();
        assert!(out.is_none());
        assert!(evicted.lock().is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn remove_fires_callback_and_reports_absence() {
        let ctx = TestContext::new();
        let (cache, evicted) = cache_with_sink(4);
        let a = testing::initialized_client(&ctx, 0).await;
        let key = a.cache_key().unwrap().clone();

        cache.add(Arc::clone(&a)).unwrap();
        assert!(cache.remove(&key));
        assert!(!cache.remove(&key));
        assert_eq!(evicted.lock().len(), 1);
    }

    #[tokio::test]
    async fn removing_parent_evicts_its_clones() {
        let ctx = TestContext::new();
        let (cache, evicted) = cache_with_sink(4);
        let parent = testing::logged_in_client(&ctx).await;
        let key = parent.cache_key().unwrap().clone();
        let clone_a = parent.clone_for_namespace("tenant-a").unwrap();
        let clone_b = parent.clone_for_namespace("tenant-b").unwrap();

        cache.add(Arc::clone(&parent)).unwrap();
        cache.add(Arc::clone(&clone_a)).unwrap();
        cache.add(Arc::clone(&clone_b)).unwrap();
        assert_eq!(cache.stats().clone_len, 2);

        assert!(cache.remove(&key));
        assert_eq!(cache.stats().clone_len, 0);
        // Parent plus both clones.
        assert_eq!(evicted.lock().len(), 3);
        assert!(cache.get_clone(clone_a.clone_key().unwrap()).is_none());
    }

    #[tokio::test]
    async fn clone_lookup_round_trip() {
        let ctx = TestContext::new();
        let (cache, _) = cache_with_sink(4);
        let parent = testing::logged_in_client(&ctx).await;
        let clone = parent.clone_for_namespace("tenant-a").unwrap();
        let clone_key = clone.clone_key().unwrap().clone();

        cache.add(Arc::clone(&parent)).unwrap();
        cache.add(Arc::clone(&clone)).unwrap();
        let hit = cache.get_clone(&clone_key).unwrap();
        assert_eq!(hit.id(), clone.id());
    }

    #[tokio::test]
    async fn prune_honors_filter_and_handler_flag() {
        let ctx = TestContext::new();
        let (cache, evicted) = cache_with_sink(8);
        let a = testing::initialized_client(&ctx, 0).await;
        let b = testing::initialized_client(&ctx, 1).await;
        cache.add(Arc::clone(&a)).unwrap();
        cache.add(Arc::clone(&b)).unwrap();

        let target = a.id().to_string();
        let out = cache.prune(|c| c.id() == target, false);
        assert_eq!(out.len(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(evicted.lock().as_slice(), &[(target, false)]);
    }

    #[tokio::test]
    async fn purge_empties_everything() {
        let ctx = TestContext::new();
        let (cache, evicted) = cache_with_sink(8);
        for i in 0..3 {
            cache
                .add(testing::initialized_client(&ctx, i).await)
                .unwrap();
        }
        let out = cache.purge();
        assert_eq!(out.len(), 3);
        assert!(cache.is_empty());
        assert_eq!(evicted.lock().len(), 3);
    }
}
