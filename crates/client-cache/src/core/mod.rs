//! Core types shared across the crate: cache keys, the error taxonomy,
//! client statistics, and the traits reconcilers implement.

/// Error taxonomy
pub mod error;
/// Cache key and clone key derivation
pub mod key;
/// Per-client statistics
pub mod meta;
/// The CR-facing surface the factory consumes
pub mod obj;

pub use error::{
    BackendError, CacheKeyError, ClientError, ConfigError, FactoryError, MacError, ProviderError,
    StorageError,
};
pub use key::{CacheKey, CloneKey};
pub use meta::ClientStats;
pub use obj::{ObjectRef, ResourceResolver, SyncableObject, VaultClientMeta};
