//! Error types for the client cache.
//!
//! Each concern carries its own enum; [`FactoryError`] sits at the top and
//! wraps the others via `From` so the factory's `get` path propagates with
//! `?`. Reconcilers branch on the variant to decide between re-queueing
//! with backoff and giving up until the CR changes.

use thiserror::Error;
use vault_api::VaultError;

/// Cache key derivation failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheKeyError {
    /// The auth method name is empty
    #[error("auth method cannot be empty")]
    EmptyAuthMethod,

    /// A UID is not the canonical 36-byte Kubernetes form
    #[error("invalid {which} uid length {len}, expected 36")]
    InvalidUidLength {
        /// Which UID was rejected
        which: &'static str,
        /// The offending length
        len: usize,
    },

    /// Two of the three UIDs are identical
    #[error("auth, connection, and provider uids must be distinct")]
    DuplicateUid,

    /// The rendered key exceeds the Kubernetes resource-name limit
    #[error("cache key length {len} exceeds the 63 character limit")]
    KeyLengthExceeded {
        /// Rendered key length
        len: usize,
    },

    /// Clone keys require a Vault namespace
    #[error("clone namespace cannot be empty")]
    EmptyNamespace,

    /// A clone key can never itself be cloned
    #[error("cannot derive a clone key from a clone")]
    AlreadyClone,
}

/// Auth/connection configuration failures
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A referenced resource does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind
        kind: &'static str,
        /// Kubernetes namespace
        namespace: String,
        /// Resource name
        name: String,
    },

    /// The referring object's namespace is excluded by the auth allow-list
    #[error("namespace {namespace:?} is not allowed by auth {auth:?}")]
    NamespaceNotAllowed {
        /// The auth resource enforcing the list
        auth: String,
        /// The excluded namespace
        namespace: String,
    },

    /// A required field is unset after merging
    #[error("missing required field {field:?}")]
    MissingRequired {
        /// Field name
        field: &'static str,
    },

    /// A field holds an unusable value
    #[error("invalid value for {field:?}: {reason}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Credential provider failures
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Backing material (service account, secret) does not exist
    #[error("{kind} {namespace}/{name} not found")]
    MaterialNotFound {
        /// Material kind
        kind: &'static str,
        /// Kubernetes namespace
        namespace: String,
        /// Resource name
        name: String,
    },

    /// The credential source failed to produce material
    #[error("failed to acquire credentials for {what}")]
    Acquisition {
        /// What was being fetched
        what: String,
        /// Underlying failure
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The auth configuration is incomplete for this method
    #[error("auth method {method:?} is missing {field:?}")]
    IncompleteConfig {
        /// Login method
        method: &'static str,
        /// Missing field
        field: &'static str,
    },
}

/// Vault client (session) failures
#[derive(Debug, Error)]
pub enum ClientError {
    /// Operation before `init`
    #[error("client is not initialized")]
    NotInitialized,

    /// Operation before a successful login or restore
    #[error("client is not logged in")]
    NotLoggedIn,

    /// Operation on a closed client
    #[error("client is closed")]
    Closed,

    /// The session token has passed its renewal horizon
    #[error("client token is expired")]
    Expired,

    /// A restore payload without an auth section cannot seat a session
    #[error("auth response has no auth section")]
    MissingAuth,

    /// Login against the auth mount failed
    #[error("vault login failed")]
    Login(#[source] VaultError),

    /// Token renewal failed
    #[error("vault token renewal failed")]
    Renewal(#[source] VaultError),

    /// The lifetime watcher terminated with this error
    #[error("lifetime watcher terminated: {0}")]
    WatcherTerminated(String),

    /// Pass-through Vault API failure from read/write
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Key derivation during init/clone
    #[error(transparent)]
    Key(#[from] CacheKeyError),

    /// Connection/auth configuration rejected during init
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Credential acquisition during login
    #[error(transparent)]
    Credentials(#[from] ProviderError),
}

impl ClientError {
    /// True for failures worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Login(e) | Self::Renewal(e) | Self::Vault(e) => e.is_retryable(),
            Self::Expired => true,
            _ => false,
        }
    }
}

/// Secrets-backend failures (Kubernetes API or in-memory stand-in)
#[derive(Debug, Error)]
pub enum BackendError {
    /// Create raced an existing record
    #[error("secret {name:?} already exists")]
    AlreadyExists {
        /// Record name
        name: String,
    },

    /// The record does not exist
    #[error("secret {name:?} not found")]
    NotFound {
        /// Record name
        name: String,
    },

    /// Kubernetes API failure
    #[error("kubernetes api error")]
    Kube(#[source] kube::Error),
}

/// Message authenticator failures
#[derive(Debug, Error)]
pub enum MacError {
    /// The stored HKDF key has the wrong length
    #[error("invalid hkdf key length {len}, expected {expected}")]
    InvalidKeyLength {
        /// Stored length
        len: usize,
        /// Required length
        expected: usize,
    },

    /// The key secret lacks its data field
    #[error("hkdf key secret is missing the {field:?} field")]
    MissingKeyField {
        /// Expected data key
        field: &'static str,
    },

    /// HKDF expansion or HMAC keying failed
    #[error("key derivation failed: {0}")]
    Derive(String),

    /// Fetching or creating the key secret failed
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Persistent-store failures
#[derive(Debug, Error)]
pub enum StorageError {
    /// No record exists for the requested cache key
    #[error("cache record {name:?} not found")]
    EntryNotFound {
        /// Record name
        name: String,
    },

    /// The record's MAC does not authenticate its contents
    #[error("message MAC verification failed for record {name:?}")]
    InvalidMac {
        /// Record name
        name: String,
    },

    /// A required data key or label is absent
    #[error("record {name:?} is missing required field {field:?}")]
    MissingField {
        /// Record name
        name: String,
        /// Missing data key or label
        field: &'static str,
    },

    /// Policy requires encryption but no transit codec was supplied
    #[error("storage encryption is required but not configured")]
    EncryptionRequired,

    /// Transit encrypt/decrypt failed
    #[error("transit {operation} failed")]
    Transit {
        /// "encrypt" or "decrypt"
        operation: &'static str,
        /// Underlying client failure
        #[source]
        source: Box<ClientError>,
    },

    /// A transit payload could not be decoded
    #[error("transit payload decode failed: {0}")]
    TransitDecode(String),

    /// Listing records failed
    #[error("failed to list cache records")]
    List(#[source] BackendError),

    /// Some prune deletions failed; the rest were applied
    #[error("{failed} of {total} prune deletions failed")]
    Prune {
        /// Failed deletions
        failed: usize,
        /// Attempted deletions
        total: usize,
    },

    /// Record (de)serialization failed
    #[error("failed to serialize cache record")]
    Serde(#[from] serde_json::Error),

    /// Message authenticator failure
    #[error(transparent)]
    Mac(#[from] MacError),

    /// Raw backend failure
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Top-level factory failures
#[derive(Debug, Error)]
pub enum FactoryError {
    /// The factory is shut down; terminal for the current call
    #[error("client factory is disabled")]
    Disabled,

    /// Cache key derivation failed; retrying is pointless until the CR or
    /// its referenced resources change
    #[error(transparent)]
    Key(#[from] CacheKeyError),

    /// Auth/connection resolution failed
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Credential acquisition failed
    #[error(transparent)]
    Credentials(#[from] ProviderError),

    /// The Vault session failed
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The persistent store failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl FactoryError {
    /// True for failures the reconciler should re-queue with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Client(e) => e.is_retryable(),
            Self::Credentials(_) | Self::Storage(_) | Self::Config(ConfigError::NotFound { .. }) => {
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_error_messages() {
        assert_eq!(
            CacheKeyError::EmptyAuthMethod.to_string(),
            "auth method cannot be empty"
        );
        assert_eq!(
            CacheKeyError::InvalidUidLength {
                which: "auth",
                len: 4
            }
            .to_string(),
            "invalid auth uid length 4, expected 36"
        );
        assert_eq!(
            CacheKeyError::KeyLengthExceeded { len: 64 }.to_string(),
            "cache key length 64 exceeds the 63 character limit"
        );
    }

    #[test]
    fn factory_error_wraps_sub_errors() {
        let err: FactoryError = CacheKeyError::DuplicateUid.into();
        assert!(matches!(err, FactoryError::Key(_)));
        assert!(!err.is_retryable());

        let err: FactoryError = ConfigError::NotFound {
            kind: "VaultAuth",
            namespace: "tenant".into(),
            name: "default".into(),
        }
        .into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("VaultAuth tenant/default"));
    }

    #[test]
    fn disabled_is_terminal() {
        assert!(!FactoryError::Disabled.is_retryable());
    }

    #[test]
    fn login_retryability_follows_vault_error() {
        let err = ClientError::Login(VaultError::Api {
            code: 503,
            errors: vec!["sealed".into()],
        });
        assert!(err.is_retryable());

        let err = ClientError::Login(VaultError::Api {
            code: 403,
            errors: vec!["permission denied".into()],
        });
        assert!(!err.is_retryable());
    }
}
