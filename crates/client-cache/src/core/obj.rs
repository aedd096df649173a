//! The custom-resource surface the factory consumes.
//!
//! The factory never sees concrete CRD types. Reconcilers hand it anything
//! implementing [`SyncableObject`] plus a [`ResourceResolver`] that can
//! materialize the referenced auth and connection descriptors. This keeps
//! the CRD schemas (and the controller runtime) entirely outside this
//! crate.

use crate::config::{GlobalVaultAuthConfig, VaultAuthConfig, VaultConnectionConfig};
use crate::core::error::ConfigError;
use crate::core::key::CacheKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Identity of a Kubernetes object, enough to address Events and statuses
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Resource kind (e.g. `VaultStaticSecret`)
    pub kind: String,
    /// Kubernetes namespace
    pub namespace: String,
    /// Resource name
    pub name: String,
    /// Object UID
    pub uid: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// The slice of CR status the factory reads and reconcilers write back
/// after a successful `get`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultClientMeta {
    /// Cache key of the client last handed to this CR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<CacheKey>,
    /// Client id (assigned at client creation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Client creation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// A custom resource that consumes Vault clients
pub trait SyncableObject: Send + Sync {
    /// Identity for Events and logging
    fn object_ref(&self) -> ObjectRef;

    /// The object's Kubernetes namespace
    fn namespace(&self) -> &str;

    /// Name of the referenced VaultAuth; `None` selects the default
    fn vault_auth_ref(&self) -> Option<&str>;

    /// Target Vault namespace; `None` or empty uses the connection default
    fn vault_namespace(&self) -> Option<&str>;

    /// Previously recorded client metadata from `status.vaultClientMeta`
    fn vault_client_meta(&self) -> Option<VaultClientMeta>;
}

/// Resolves referenced auth/connection descriptors and enumerates live
/// client references. Implemented over the controller's caches; a stub
/// suffices for tests.
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    /// Resolve a VaultAuth by namespace and name; `None` selects the
    /// operator default for that namespace
    async fn vault_auth(
        &self,
        namespace: &str,
        name: Option<&str>,
    ) -> Result<VaultAuthConfig, ConfigError>;

    /// Resolve a VaultConnection by namespace and name; `None` selects the
    /// operator default for that namespace
    async fn vault_connection(
        &self,
        namespace: &str,
        name: Option<&str>,
    ) -> Result<VaultConnectionConfig, ConfigError>;

    /// The global auth defaults to merge under a resolved auth, if any
    async fn global_vault_auth(&self) -> Result<Option<GlobalVaultAuthConfig>, ConfigError>;

    /// Cache keys referenced by live CR statuses; feeds the orphan pruner
    async fn referenced_cache_keys(&self) -> Result<HashSet<CacheKey>, ConfigError>;
}
