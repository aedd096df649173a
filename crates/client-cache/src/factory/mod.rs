//! The client factory: resolve a custom resource to an authenticated
//! Vault client, caching, persisting, reference-counting, and pruning
//! along the way.
//!
//! `get` is the hot path: derive the cache key, serialize per-key access,
//! then fall through in-memory cache → persistent store → fresh login.
//! Two background tasks run for the factory's lifetime: the callback
//! dispatcher (tears down evicted clients and fans lifecycle events out
//! to reconcilers) and the orphan pruner (evicts cached clients no live
//! CR references anymore). Both stop when the root cancellation token
//! fires.

/// Reconciler-facing lifecycle callbacks
pub mod callback;
/// Single-shot shutdown coordination
pub mod shutdown;

pub use callback::{ClientCallbackFn, ClientCallbackHandler};
pub use shutdown::{ShutdownCoordinator, ShutdownMode, ShutdownStatus};

use crate::cache::{ClientCache, EvictionCallback};
use crate::client::{ClientEvent, LifecycleEvent, VaultClient};
use crate::config::{VaultAuthConfig, VaultConnectionConfig, merge_auth};
use crate::core::error::{ConfigError, FactoryError, StorageError};
use crate::core::key::{CacheKey, CacheKeyInputs, CloneKey};
use crate::core::obj::{ObjectRef, ResourceResolver, SyncableObject, VaultClientMeta};
use crate::event::{Event, EventRecorder, LogEventRecorder, reason};
use crate::metrics::Metrics;
use crate::providers::{CredentialProvider, CredentialSource};
use crate::storage::{
    ClientCacheStorage, RestoreRequest, SecretsBackend, StoreRequest, TransitCodec,
};
use callback::CallbackRegistry;
use dashmap::DashMap;
use prometheus_client::registry::Registry;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default bound on live clients
const DEFAULT_CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(10_000).unwrap();

/// Minimum age before an unreferenced client may be pruned
const DEFAULT_PRUNE_ORPHAN_AGE: Duration = Duration::from_secs(60);

/// How often the orphan pruner wakes without a hint
const DEFAULT_ORPHAN_PRUNE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Capacity of the lifecycle channel feeding the dispatcher
const LIFECYCLE_CHANNEL_CAPACITY: usize = 1024;

/// Where the storage-encryption client authenticates
#[derive(Debug, Clone)]
pub struct StorageEncryptionConfig {
    /// Name of the VaultAuth used only for transit
    pub auth_ref: String,
    /// Namespace holding that VaultAuth (the operator namespace)
    pub namespace: String,
    /// Transit mount path
    pub mount: String,
    /// Transit key name
    pub key_name: String,
}

/// Factory policy knobs
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Bound on live primary clients
    pub cache_capacity: NonZeroUsize,
    /// Persist sessions to the operator namespace
    pub persist: bool,
    /// Refuse to persist unencrypted records
    pub enforce_encryption: bool,
    /// Transit setup for encrypting persisted records
    pub storage_encryption: Option<StorageEncryptionConfig>,
    /// Revoke tokens when clients leave the cache
    pub revoke_on_evict: bool,
    /// Delete persisted records when clients leave the cache
    pub prune_storage_on_evict: bool,
    /// Grace age before an unreferenced client is pruned
    pub prune_orphan_age: Duration,
    /// Orphan pruner wake interval
    pub orphan_prune_interval: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            persist: false,
            enforce_encryption: false,
            storage_encryption: None,
            revoke_on_evict: false,
            prune_storage_on_evict: true,
            prune_orphan_age: DEFAULT_PRUNE_ORPHAN_AGE,
            orphan_prune_interval: DEFAULT_ORPHAN_PRUNE_INTERVAL,
        }
    }
}

/// Select cached clients for [`CachingClientFactory::prune`]
#[derive(Clone)]
pub struct ClientCachePruneRequest {
    /// Clients the filter selects are evicted
    pub filter: Arc<dyn Fn(&Arc<VaultClient>) -> bool + Send + Sync>,
    /// Suppress reconciler-facing removal callbacks (teardown still runs)
    pub skip_client_callbacks: bool,
    /// Also delete the evicted clients' persisted records
    pub prune_storage: bool,
}

impl ClientCachePruneRequest {
    /// Evict clients the filter selects
    pub fn new<F>(filter: F) -> Self
    where
        F: Fn(&Arc<VaultClient>) -> bool + Send + Sync + 'static,
    {
        Self {
            filter: Arc::new(filter),
            skip_client_callbacks: false,
            prune_storage: true,
        }
    }

    /// Evict clients authenticated through the given VaultAuth
    pub fn for_auth_uid(uid: impl Into<String>) -> Self {
        let uid = uid.into();
        Self::new(move |client| {
            client
                .identity_ref()
                .is_some_and(|i| i.auth().uid == uid)
        })
    }

    /// Evict clients connected through the given VaultConnection
    pub fn for_connection_uid(uid: impl Into<String>) -> Self {
        let uid = uid.into();
        Self::new(move |client| {
            client
                .identity_ref()
                .is_some_and(|i| i.connection().uid == uid)
        })
    }

    /// Suppress reconciler-facing removal callbacks
    pub fn skip_client_callbacks(mut self, skip: bool) -> Self {
        self.skip_client_callbacks = skip;
        self
    }
}

/// Ask the factory to shut down
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownRequest {
    /// Revoke every cached token and purge persisted records
    pub revoke: bool,
}

/// Builder for [`CachingClientFactory`]
pub struct ClientFactoryBuilder {
    config: FactoryConfig,
    resolver: Option<Arc<dyn ResourceResolver>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    recorder: Arc<dyn EventRecorder>,
    backend: Option<Arc<dyn SecretsBackend>>,
    metrics: Option<Arc<Metrics>>,
    cancel: CancellationToken,
}

impl ClientFactoryBuilder {
    fn new() -> Self {
        Self {
            config: FactoryConfig::default(),
            resolver: None,
            credentials: None,
            recorder: Arc::new(LogEventRecorder),
            backend: None,
            metrics: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Policy knobs
    pub fn config(mut self, config: FactoryConfig) -> Self {
        self.config = config;
        self
    }

    /// The auth/connection resolver (required)
    pub fn resolver(mut self, resolver: Arc<dyn ResourceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// The credential material source (required)
    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Event publication; defaults to the tracing-backed recorder
    pub fn recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Secrets backend for the persistent store (required when
    /// `config.persist` is set)
    pub fn backend(mut self, backend: Arc<dyn SecretsBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Metrics handle; defaults to a private registry (tests)
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Root cancellation token stopping the background tasks
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the factory and spawn its background tasks. Must run inside
    /// a tokio runtime.
    pub fn build(self) -> Result<Arc<CachingClientFactory>, FactoryError> {
        let resolver = self
            .resolver
            .ok_or(ConfigError::MissingRequired { field: "resolver" })?;
        let credentials = self
            .credentials
            .ok_or(ConfigError::MissingRequired {
                field: "credentials",
            })?;
        if self.config.persist && self.backend.is_none() {
            return Err(ConfigError::MissingRequired { field: "backend" }.into());
        }
        let metrics = self
            .metrics
            .unwrap_or_else(|| Metrics::new(&mut Registry::default()));
        metrics.set_storage_config(self.config.persist, self.config.enforce_encryption);

        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(LIFECYCLE_CHANNEL_CAPACITY);
        let (orphan_tx, orphan_rx) = mpsc::channel(16);

        let evict_tx = lifecycle_tx.clone();
        let on_evict: EvictionCallback = Arc::new(move |client, fire_handlers| {
            // Synchronous part only: stop the watcher and queue teardown.
            client.stop();
            let event = if fire_handlers {
                LifecycleEvent::new(ClientEvent::CACHE_REMOVAL, client)
            } else {
                LifecycleEvent::silent(ClientEvent::CACHE_REMOVAL, client)
            };
            if evict_tx.try_send(event).is_err() {
                warn!("lifecycle channel saturated; dropping cache-removal event");
            }
        });

        let cache = Arc::new(ClientCache::new(
            self.config.cache_capacity,
            Some(on_evict),
            Arc::clone(&metrics),
        ));
        let storage = self.backend.map(|backend| {
            Arc::new(ClientCacheStorage::new(
                backend,
                self.config.enforce_encryption,
                Arc::clone(&metrics),
            ))
        });

        let factory = Arc::new(CachingClientFactory {
            cache,
            storage,
            resolver,
            credentials,
            recorder: self.recorder,
            metrics,
            registry: CallbackRegistry::new(),
            persist: self.config.persist,
            storage_encryption: self.config.storage_encryption,
            revoke_on_evict: AtomicBool::new(self.config.revoke_on_evict),
            prune_storage_on_evict: AtomicBool::new(self.config.prune_storage_on_evict),
            shut_down: AtomicBool::new(false),
            key_locks: DashMap::new(),
            lifecycle_tx,
            orphan_tx,
            encryption_client: tokio::sync::Mutex::new(None),
            prune_orphan_age: self.config.prune_orphan_age,
            cancel: self.cancel.clone(),
        });

        let dispatcher = Arc::downgrade(&factory);
        let cancel = self.cancel.clone();
        let _ = tokio::spawn(async move {
            run_dispatcher(dispatcher, lifecycle_rx, cancel).await;
        });
        let pruner = Arc::downgrade(&factory);
        let cancel = self.cancel;
        let interval = self.config.orphan_prune_interval;
        let _ = tokio::spawn(async move {
            run_orphan_pruner(pruner, orphan_rx, cancel, interval).await;
        });

        Ok(factory)
    }
}

/// Process-wide, shared factory of authenticated Vault clients
pub struct CachingClientFactory {
    cache: Arc<ClientCache>,
    storage: Option<Arc<ClientCacheStorage>>,
    resolver: Arc<dyn ResourceResolver>,
    credentials: Arc<dyn CredentialSource>,
    recorder: Arc<dyn EventRecorder>,
    metrics: Arc<Metrics>,
    registry: CallbackRegistry,
    persist: bool,
    storage_encryption: Option<StorageEncryptionConfig>,
    revoke_on_evict: AtomicBool,
    prune_storage_on_evict: AtomicBool,
    shut_down: AtomicBool,
    key_locks: DashMap<String, Arc<tokio::sync::RwLock<()>>>,
    lifecycle_tx: mpsc::Sender<LifecycleEvent>,
    orphan_tx: mpsc::Sender<()>,
    encryption_client: tokio::sync::Mutex<Option<Arc<VaultClient>>>,
    prune_orphan_age: Duration,
    cancel: CancellationToken,
}

impl CachingClientFactory {
    /// Start building a factory
    pub fn builder() -> ClientFactoryBuilder {
        ClientFactoryBuilder::new()
    }

    /// The in-memory cache (read-mostly; exposed for metrics and tests)
    pub fn cache(&self) -> &Arc<ClientCache> {
        &self.cache
    }

    /// The persistent store, when persistence is configured
    pub fn storage(&self) -> Option<&Arc<ClientCacheStorage>> {
        self.storage.as_ref()
    }

    /// Whether `shutdown` was called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// The root token that stops the factory's background tasks
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Register a lifecycle callback handler
    pub fn register_client_callback_handler(&self, handler: ClientCallbackHandler) {
        self.registry.register(handler);
    }

    /// Resolve `obj` to a validated, logged-in client.
    ///
    /// Cache hit → validate and hand out; miss → restore from the
    /// persistent store; else a fresh login. Concurrent calls for the
    /// same cache key serialize on a per-key lock, so at most one login
    /// per key is in flight.
    pub async fn get(
        &self,
        obj: &dyn SyncableObject,
    ) -> Result<Arc<VaultClient>, FactoryError> {
        let _timer = self.metrics.factory_timer();
        let result = self.get_inner(obj).await;
        self.metrics.record_factory_request(result.is_err());
        if let Err(e) = &result {
            self.record_failure(&obj.object_ref(), e);
        }
        self.update_cache_gauges();
        result
    }

    async fn get_inner(&self, obj: &dyn SyncableObject) -> Result<Arc<VaultClient>, FactoryError> {
        if self.is_shut_down() {
            return Err(FactoryError::Disabled);
        }

        let (auth, conn) = self.resolve_configs(obj).await?;
        let provider = CredentialProvider::new(
            auth.auth_method()?,
            obj.namespace(),
            Arc::clone(&self.credentials),
        )
        .await?;
        let cache_key = derive_key(&auth, &conn, &provider)?;

        let lock = self.key_lock(&cache_key);
        let _guard = lock.write().await;

        let prev_meta = obj.vault_client_meta();
        let vault_namespace = obj.vault_namespace().filter(|ns| !ns.is_empty());

        if let Some(client) = self.cache.get(&cache_key) {
            match client.validate() {
                Ok(()) => {
                    let out = self.namespaced_client(&client, vault_namespace)?;
                    self.update_client_stats_after_get(prev_meta, &cache_key, &client);
                    return Ok(out);
                }
                Err(e) => {
                    debug!(cache_key = %cache_key, error = %e, "cached client failed validation");
                    self.cache.remove(&cache_key);
                }
            }
        }

        if let Some(client) = self
            .restore_client(&cache_key, &auth, &conn, provider.clone(), false, Some(obj))
            .await?
        {
            self.cache_insert(&client)?;
            let out = self.namespaced_client(&client, vault_namespace)?;
            self.update_client_stats_after_get(prev_meta, &cache_key, &client);
            info!(cache_key = %cache_key, client_id = %client.id(), "client restored from storage");
            return Ok(out);
        }

        let client = VaultClient::new(self.lifecycle_tx.clone(), Arc::clone(&self.metrics));
        client.init_with_provider(auth, conn, provider)?;
        client.login().await?;
        self.recorder.record(
            &obj.object_ref(),
            Event::normal(
                reason::CLIENT_LOGIN,
                format!("new vault client {} logged in", client.id()),
            ),
        );
        self.cache_insert(&client)?;
        self.persist_client(&client).await;

        let out = self.namespaced_client(&client, vault_namespace)?;
        self.update_client_stats_after_get(prev_meta, &cache_key, &client);
        Ok(out)
    }

    /// Explicit restore path used at operator startup: `Ok(None)` when no
    /// record exists, an error when a record exists but cannot be
    /// trusted.
    pub async fn restore(
        &self,
        obj: &dyn SyncableObject,
    ) -> Result<Option<Arc<VaultClient>>, FactoryError> {
        if self.is_shut_down() {
            return Err(FactoryError::Disabled);
        }
        let (auth, conn) = self.resolve_configs(obj).await?;
        let provider = CredentialProvider::new(
            auth.auth_method()?,
            obj.namespace(),
            Arc::clone(&self.credentials),
        )
        .await?;
        let cache_key = derive_key(&auth, &conn, &provider)?;

        let lock = self.key_lock(&cache_key);
        let _guard = lock.write().await;

        if let Some(client) = self.cache.get(&cache_key) {
            return Ok(Some(client));
        }
        match self
            .restore_client(&cache_key, &auth, &conn, provider, true, Some(obj))
            .await?
        {
            Some(client) => {
                self.cache_insert(&client)?;
                Ok(Some(client))
            }
            None => Ok(None),
        }
    }

    /// Evict every cached client the request selects, optionally deleting
    /// their persisted records. Used by the VaultAuth/VaultConnection
    /// reconcilers when descriptors change.
    pub async fn prune(
        &self,
        trigger: &ObjectRef,
        req: ClientCachePruneRequest,
    ) -> Result<usize, FactoryError> {
        let filter = Arc::clone(&req.filter);
        let evicted = self
            .cache
            .prune(move |client| filter(client), !req.skip_client_callbacks);
        info!(trigger = %trigger, evicted = evicted.len(), "pruned client cache");

        if req.prune_storage {
            if let Some(storage) = &self.storage {
                for client in &evicted {
                    if let Err(e) = storage.prune_client(client).await {
                        warn!(client_id = %client.id(), error = %e, "storage prune failed");
                    }
                }
            }
        }
        self.update_cache_gauges();
        Ok(evicted.len())
    }

    /// Drop the reference a deleted CR held on its client
    pub async fn unregister_object_ref(&self, obj: &dyn SyncableObject) {
        let Some(meta) = obj.vault_client_meta() else {
            return;
        };
        let Some(key) = meta.cache_key else { return };
        if let Some(client) = self.cache.peek(&key) {
            let refs = client.stats().decrement_ref();
            debug!(cache_key = %key, refs, "unregistered object reference");
        }
        let _ = self.orphan_tx.try_send(());
        self.update_cache_gauges();
    }

    /// Disable the factory and tear the cache down. With `revoke`, every
    /// client's token is revoked and all persisted records are purged.
    /// Idempotent.
    pub async fn shutdown(&self, req: ShutdownRequest) -> Result<(), FactoryError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(revoke = req.revoke, "shutting down client factory");
        if req.revoke {
            self.revoke_on_evict.store(true, Ordering::SeqCst);
            self.prune_storage_on_evict.store(true, Ordering::SeqCst);
        }

        let evicted = self.cache.purge();
        for client in &evicted {
            client.close(req.revoke).await;
            if req.revoke {
                if let Some(storage) = &self.storage {
                    if let Err(e) = storage.prune_client(client).await {
                        warn!(client_id = %client.id(), error = %e, "storage prune failed");
                    }
                }
            }
        }
        if req.revoke {
            if let Some(storage) = &self.storage {
                storage.purge().await?;
            }
        }
        self.update_cache_gauges();
        Ok(())
    }

    /// One orphan-pruner sweep: evict cached clients no live CR
    /// references, once they are older than the grace age.
    pub async fn prune_orphans(&self) -> Result<usize, FactoryError> {
        let referenced = self.resolver.referenced_cache_keys().await?;
        let encryption_key = {
            let slot = self.encryption_client.lock().await;
            slot.as_ref()
                .and_then(|c| c.cache_key().ok().cloned())
        };
        let age = self.prune_orphan_age;
        let evicted = self.cache.prune(
            move |client| {
                let Ok(key) = client.cache_key() else {
                    return false;
                };
                if encryption_key.as_ref() == Some(key) || referenced.contains(key) {
                    return false;
                }
                client.stats().age() >= age
            },
            true,
        );
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "pruned orphaned clients");
            if self.prune_storage_on_evict.load(Ordering::SeqCst) {
                if let Some(storage) = &self.storage {
                    for client in &evicted {
                        if let Err(e) = storage.prune_client(client).await {
                            warn!(client_id = %client.id(), error = %e, "storage prune failed");
                        }
                    }
                }
            }
        }
        self.update_cache_gauges();
        Ok(evicted.len())
    }

    // ── internals ──────────────────────────────────────────────────────

    fn key_lock(&self, key: &CacheKey) -> Arc<tokio::sync::RwLock<()>> {
        self.key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::RwLock::new(())))
            .clone()
    }

    async fn resolve_configs(
        &self,
        obj: &dyn SyncableObject,
    ) -> Result<(VaultAuthConfig, VaultConnectionConfig), FactoryError> {
        let local = self
            .resolver
            .vault_auth(obj.namespace(), obj.vault_auth_ref())
            .await?;
        let global = self.resolver.global_vault_auth().await?;
        let auth = merge_auth(&local, global.as_ref())?;
        auth.check_namespace(obj.namespace())?;
        let conn = self
            .resolver
            .vault_connection(&auth.namespace, auth.connection_ref.as_deref())
            .await?;
        conn.validate()?;
        Ok((auth, conn))
    }

    /// Try the persistent store. `propagate` controls whether trust
    /// failures surface (explicit restore) or fall through to a fresh
    /// login (the `get` path); either way the record itself was already
    /// quarantined by the store.
    async fn restore_client(
        &self,
        cache_key: &CacheKey,
        auth: &VaultAuthConfig,
        conn: &VaultConnectionConfig,
        provider: CredentialProvider,
        propagate: bool,
        obj: Option<&dyn SyncableObject>,
    ) -> Result<Option<Arc<VaultClient>>, FactoryError> {
        if !self.persist {
            return Ok(None);
        }
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        let transit = self.transit_codec().await?;
        let result = storage
            .restore(RestoreRequest {
                cache_key,
                transit: transit.as_ref(),
                no_prune_on_error: false,
            })
            .await;

        match result {
            Ok(record) => {
                let client =
                    VaultClient::new(self.lifecycle_tx.clone(), Arc::clone(&self.metrics));
                client.init_with_provider(auth.clone(), conn.clone(), provider)?;
                client.restore(record.secret)?;
                if let Err(e) = client.validate() {
                    // The record round-tripped but the session inside it is
                    // no longer usable; drop it and log in fresh.
                    warn!(cache_key = %cache_key, error = %e, "restored session is stale");
                    client.stop();
                    if let Err(del) = storage.prune_client(&client).await {
                        warn!(cache_key = %cache_key, error = %del, "stale record prune failed");
                    }
                    return Ok(None);
                }
                Ok(Some(client))
            }
            Err(StorageError::EntryNotFound { .. }) => Ok(None),
            Err(e) => {
                warn!(cache_key = %cache_key, error = %e, "persisted client restore failed");
                if let Some(obj) = obj {
                    self.recorder.record(
                        &obj.object_ref(),
                        Event::warning(
                            reason::CACHE_RESTORE_FAILED,
                            format!("persisted vault client could not be restored: {e}"),
                        ),
                    );
                }
                if propagate {
                    Err(e.into())
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn persist_client(&self, client: &Arc<VaultClient>) {
        if !self.persist {
            return;
        }
        let Some(storage) = &self.storage else {
            return;
        };
        let transit = match self.transit_codec().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "storage encryption unavailable; session not persisted");
                return;
            }
        };
        let result = storage
            .store(StoreRequest {
                client,
                transit: transit.as_ref(),
            })
            .await;
        match result {
            Ok(record) => debug!(name = %record.name, "session persisted"),
            // The client stays usable in-memory either way.
            Err(e) => warn!(client_id = %client.id(), error = %e, "session persist failed"),
        }
    }

    /// The transit codec over the storage-encryption client, when
    /// configured
    async fn transit_codec(&self) -> Result<Option<TransitCodec>, FactoryError> {
        let Some(cfg) = &self.storage_encryption else {
            return Ok(None);
        };
        let client = self.storage_encryption_client(cfg).await?;
        Ok(Some(TransitCodec::new(
            client,
            cfg.mount.clone(),
            cfg.key_name.clone(),
            cfg.auth_ref.clone(),
        )))
    }

    /// The singleton client used only to encrypt/decrypt the persistent
    /// store. Never itself persisted; recreated on expiry.
    async fn storage_encryption_client(
        &self,
        cfg: &StorageEncryptionConfig,
    ) -> Result<Arc<VaultClient>, FactoryError> {
        let mut slot = self.encryption_client.lock().await;
        if let Some(client) = slot.as_ref() {
            if client.validate().is_ok() {
                return Ok(Arc::clone(client));
            }
            if let Ok(key) = client.cache_key() {
                self.cache.remove_inner(key, false);
            }
            *slot = None;
        }

        let local = self
            .resolver
            .vault_auth(&cfg.namespace, Some(&cfg.auth_ref))
            .await?;
        let global = self.resolver.global_vault_auth().await?;
        let auth = merge_auth(&local, global.as_ref())?;
        let conn = self
            .resolver
            .vault_connection(&auth.namespace, auth.connection_ref.as_deref())
            .await?;
        let provider = CredentialProvider::new(
            auth.auth_method()?,
            &cfg.namespace,
            Arc::clone(&self.credentials),
        )
        .await?;

        let client = VaultClient::new(self.lifecycle_tx.clone(), Arc::clone(&self.metrics));
        client.init_with_provider(auth, conn, provider)?;
        client.login().await?;
        self.cache_insert(&client)?;
        info!(client_id = %client.id(), "storage encryption client ready");
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    fn namespaced_client(
        &self,
        client: &Arc<VaultClient>,
        vault_namespace: Option<&str>,
    ) -> Result<Arc<VaultClient>, FactoryError> {
        let Some(ns) = vault_namespace else {
            return Ok(Arc::clone(client));
        };
        if client.namespace() == Some(ns) {
            return Ok(Arc::clone(client));
        }
        let clone_key = CloneKey::new(client.cache_key()?, ns)?;
        if let Some(clone) = self.cache.get_clone(&clone_key) {
            return Ok(clone);
        }
        let clone = client.clone_for_namespace(ns)?;
        self.cache_insert(&clone)?;
        debug!(clone_key = %clone_key, "derived namespace clone");
        Ok(clone)
    }

    fn cache_insert(&self, client: &Arc<VaultClient>) -> Result<(), FactoryError> {
        self.cache
            .add(Arc::clone(client))
            .map(|_| ())
            .map_err(FactoryError::Client)
    }

    /// Ref-count housekeeping after a successful `get`, driven by the
    /// cache-key transition recorded in the CR's status.
    fn update_client_stats_after_get(
        &self,
        prev: Option<VaultClientMeta>,
        new_key: &CacheKey,
        client: &Arc<VaultClient>,
    ) {
        match prev.and_then(|m| m.cache_key) {
            Some(old) if old == *new_key => client.stats().touch(),
            Some(old) => {
                client.stats().increment_ref();
                if let Some(previous) = self.cache.peek(&old) {
                    previous.stats().decrement_ref();
                }
                // The old client may have just become orphaned.
                let _ = self.orphan_tx.try_send(());
            }
            None => {
                client.stats().increment_ref();
            }
        }
    }

    async fn handle_lifecycle_event(&self, event: LifecycleEvent) {
        let client = &event.client;
        if client.is_clone() {
            // Clones share the parent's token: never revoke, never fan out.
            client.close(false).await;
            return;
        }

        if event.on.intersects(ClientEvent::WATCHER_DONE) {
            if let Ok(key) = client.cache_key() {
                let cached = self.cache.peek(key);
                if cached.is_some_and(|c| Arc::ptr_eq(&c, client)) {
                    // Removal queues the CACHE_REMOVAL teardown for this
                    // same client; handlers still see WATCHER_DONE below.
                    self.cache.remove(key);
                } else {
                    client.close(false).await;
                }
            }
        }

        if event.on.intersects(ClientEvent::CACHE_REMOVAL) {
            let revoke = self.revoke_on_evict.load(Ordering::SeqCst);
            client.close(revoke).await;
            if self.prune_storage_on_evict.load(Ordering::SeqCst) {
                if let Some(storage) = &self.storage {
                    if let Err(e) = storage.prune_client(client).await {
                        warn!(client_id = %client.id(), error = %e, "storage prune failed");
                    }
                }
            }
        }

        if event.deliver {
            self.registry.dispatch(&event);
        }
        self.update_cache_gauges();
    }

    fn record_failure(&self, obj: &ObjectRef, err: &FactoryError) {
        let reason = match err {
            FactoryError::Disabled => reason::FACTORY_DISABLED,
            FactoryError::Key(_) | FactoryError::Config(_) => reason::INVALID_CLIENT_CONFIG,
            FactoryError::Credentials(_) | FactoryError::Client(_) => reason::LOGIN_FAILED,
            FactoryError::Storage(_) => reason::CACHE_RESTORE_FAILED,
        };
        self.recorder
            .record(obj, Event::warning(reason, err.to_string()));
    }

    fn update_cache_gauges(&self) {
        let stats = self.cache.stats();
        let values = self.cache.values();
        let tainted = values.iter().filter(|c| c.tainted()).count();
        let refs: i64 = values.iter().map(|c| c.stats().ref_count()).sum();
        self.metrics
            .set_cache_gauges(stats.len, stats.capacity, tainted, refs);
    }
}

fn derive_key(
    auth: &VaultAuthConfig,
    conn: &VaultConnectionConfig,
    provider: &CredentialProvider,
) -> Result<CacheKey, FactoryError> {
    Ok(CacheKey::derive(&CacheKeyInputs {
        method: provider.method(),
        auth_uid: &auth.uid,
        auth_generation: auth.generation,
        connection_uid: &conn.uid,
        connection_generation: conn.generation,
        provider_uid: provider.uid(),
    })?)
}

async fn run_dispatcher(
    factory: std::sync::Weak<CachingClientFactory>,
    mut rx: mpsc::Receiver<LifecycleEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(factory) = factory.upgrade() else {
            break;
        };
        factory.handle_lifecycle_event(event).await;
    }
    debug!("lifecycle dispatcher stopped");
}

async fn run_orphan_pruner(
    factory: std::sync::Weak<CachingClientFactory>,
    mut rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; consume it so the loop waits.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            hint = rx.recv() => {
                if hint.is_none() {
                    break;
                }
            }
        }
        let Some(factory) = factory.upgrade() else {
            break;
        };
        if let Err(e) = factory.prune_orphans().await {
            warn!(error = %e, "orphan prune sweep failed");
        }
    }
    debug!("orphan pruner stopped");
}
