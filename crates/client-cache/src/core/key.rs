//! Cache key derivation.
//!
//! A cache key identifies one authenticated Vault session:
//! `"<method>-<22 hex>"`, where the hex digest is taken from SHA-256 over
//! the auth, connection, and credential-provider identities
//! (`auth_uid-auth_gen.conn_uid-conn_gen.provider_uid`). The rendered key
//! doubles as a Kubernetes resource-name fragment, so it must stay within
//! 63 characters. Clone keys append the target Vault namespace and are
//! never themselves cloned.

use crate::core::error::CacheKeyError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Kubernetes resource names cap at 63 characters
const MAX_KEY_LEN: usize = 63;

/// Canonical length of a Kubernetes object UID
const UID_LEN: usize = 36;

/// Leading/trailing bytes of the SHA-256 digest kept in the fingerprint
const DIGEST_HEAD: usize = 7;
const DIGEST_TAIL: usize = 4;

/// Identity inputs for a cache key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyInputs<'a> {
    /// Login method name (e.g. "kubernetes")
    pub method: &'a str,
    /// UID of the auth resource
    pub auth_uid: &'a str,
    /// Generation of the auth resource
    pub auth_generation: i64,
    /// UID of the connection resource
    pub connection_uid: &'a str,
    /// Generation of the connection resource
    pub connection_generation: i64,
    /// UID reported by the credential provider
    pub provider_uid: &'a str,
}

/// Stable identifier for one authenticated Vault session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from validated identity inputs
    pub fn derive(inputs: &CacheKeyInputs<'_>) -> Result<Self, CacheKeyError> {
        if inputs.method.is_empty() {
            return Err(CacheKeyError::EmptyAuthMethod);
        }
        for (which, uid) in [
            ("auth", inputs.auth_uid),
            ("connection", inputs.connection_uid),
            ("provider", inputs.provider_uid),
        ] {
            if uid.len() != UID_LEN {
                return Err(CacheKeyError::InvalidUidLength {
                    which,
                    len: uid.len(),
                });
            }
        }
        if inputs.auth_uid == inputs.connection_uid
            || inputs.auth_uid == inputs.provider_uid
            || inputs.connection_uid == inputs.provider_uid
        {
            return Err(CacheKeyError::DuplicateUid);
        }

        let rendered = format!(
            "{}-{}",
            inputs.method.to_lowercase(),
            fingerprint(
                inputs.auth_uid,
                inputs.auth_generation,
                inputs.connection_uid,
                inputs.connection_generation,
                inputs.provider_uid
            )
        );
        if rendered.len() > MAX_KEY_LEN {
            return Err(CacheKeyError::KeyLengthExceeded {
                len: rendered.len(),
            });
        }
        Ok(Self(rendered))
    }

    /// The rendered key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The 22-hex-character identity fingerprint: first 7 and last 4 bytes of
/// SHA-256 over `auth_uid-auth_gen.conn_uid-conn_gen.provider_uid`.
pub fn fingerprint(
    auth_uid: &str,
    auth_generation: i64,
    connection_uid: &str,
    connection_generation: i64,
    provider_uid: &str,
) -> String {
    let message = format!(
        "{auth_uid}-{auth_generation}.{connection_uid}-{connection_generation}.{provider_uid}"
    );
    let digest = Sha256::digest(message.as_bytes());
    let mut out = hex::encode(&digest[..DIGEST_HEAD]);
    out.push_str(&hex::encode(&digest[digest.len() - DIGEST_TAIL..]));
    out
}

/// A cache key scoped to an alternate Vault namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CloneKey {
    parent: CacheKey,
    namespace: String,
}

impl CloneKey {
    /// Derive the clone key for `parent` in `namespace`
    pub fn new(parent: &CacheKey, namespace: &str) -> Result<Self, CacheKeyError> {
        if namespace.is_empty() {
            return Err(CacheKeyError::EmptyNamespace);
        }
        Ok(Self {
            parent: parent.clone(),
            namespace: namespace.to_string(),
        })
    }

    /// The key of the parent client
    pub fn parent(&self) -> &CacheKey {
        &self.parent
    }

    /// The Vault namespace the clone is scoped to
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether this clone belongs to the given parent
    pub fn is_child_of(&self, parent: &CacheKey) -> bool {
        &self.parent == parent
    }
}

impl fmt::Display for CloneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.parent, self.namespace)
    }
}
