//! Process-wide cache of authenticated Vault clients.
//!
//! The secrets operator authenticates to Vault once per distinct
//! (auth, connection, credential-provider) triple and shares the resulting
//! session across every custom resource that references it. This crate owns
//! that sharing: a capacity-bounded in-memory cache of live clients, an
//! encrypted persistent cache of session tokens (Kubernetes Secrets with
//! HMAC tamper detection), a token-renewal watcher per client, reference
//! counting driven by CR statuses with orphan pruning, lazy derivation of
//! Vault-namespace clones, and graceful shutdown with optional token
//! revocation.
//!
//! Entry point is [`factory::CachingClientFactory`]: reconcilers call
//! `get` with their custom resource and receive a validated, logged-in
//! [`client::VaultClient`].

/// Bounded LRU of live clients plus the clone sub-cache
pub mod cache;
/// The per-session Vault client and its lifetime watcher
pub mod client;
/// Auth/connection descriptors, global-default merging, validation
pub mod config;
/// Cache keys, error taxonomy, client stats, CR-facing traits
pub mod core;
/// Kubernetes Event publication seam
pub mod event;
/// The client factory: resolve, cache, persist, prune, shut down
pub mod factory;
/// Prometheus metrics, registered into a caller-supplied registry
pub mod metrics;
/// Credential providers for the supported login methods
pub mod providers;
/// Encrypted persistent cache of session tokens
pub mod storage;
/// Test fixtures and stubs shared by the unit and integration suites
pub mod testing;

// ── Root re-exports ─────────────────────────────────────────────────────────
// Commonly-used types available directly as `vso_client_cache::TypeName`.

pub use crate::cache::ClientCache;
pub use crate::client::{ClientEvent, LifecycleEvent, VaultClient};
pub use crate::core::error::{
    CacheKeyError, ClientError, ConfigError, FactoryError, ProviderError, StorageError,
};
pub use crate::core::key::{CacheKey, CloneKey};
pub use crate::core::obj::{ObjectRef, SyncableObject, VaultClientMeta};
pub use crate::factory::{
    CachingClientFactory, ClientCallbackHandler, FactoryConfig, ShutdownCoordinator,
    ShutdownRequest,
};

/// Commonly used types and traits
pub mod prelude {
    pub use crate::cache::ClientCache;
    pub use crate::client::{ClientEvent, LifecycleEvent, VaultClient};
    pub use crate::config::{
        GlobalVaultAuthConfig, MergeStrategy, VaultAuthConfig, VaultConnectionConfig,
    };
    pub use crate::core::error::{
        CacheKeyError, ClientError, ConfigError, FactoryError, ProviderError, StorageError,
    };
    pub use crate::core::key::{CacheKey, CloneKey};
    pub use crate::core::obj::{ObjectRef, ResourceResolver, SyncableObject, VaultClientMeta};
    pub use crate::event::{Event, EventRecorder, EventType};
    pub use crate::factory::{
        CachingClientFactory, ClientCallbackHandler, FactoryConfig, ShutdownCoordinator,
        ShutdownRequest,
    };
    pub use crate::providers::{CredentialProvider, CredentialSource};
    pub use crate::storage::{ClientCacheStorage, MemorySecretsBackend, SecretsBackend};
}
