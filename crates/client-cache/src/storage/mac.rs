//! HMAC authentication of persisted cache records.
//!
//! The MAC key is derived once per cluster: 64 bytes of CSPRNG material
//! pushed through HKDF-SHA256 down to a 16-byte key, stored in an
//! immutable Secret in the operator namespace. Every persisted record
//! carries an HMAC-SHA256 over `name || cacheKey || secret`, verified in
//! constant time before a record is trusted.

use crate::core::error::MacError;
use crate::storage::backend::SecretsBackend;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::RngCore;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::OnceCell;
use tracing::info;

/// Name of the Secret holding the derived MAC key
pub const HKDF_SECRET_NAME: &str = "vso-cc-storage-hkdf-key";

/// Data key inside the HKDF secret
const HKDF_KEY_FIELD: &str = "key";

/// Derived key length
const MAC_KEY_LEN: usize = 16;

/// CSPRNG input length fed to HKDF
const IKM_LEN: usize = 64;

/// HKDF info string binding the key to its purpose
const HKDF_INFO: &[u8] = b"vso-client-cache-storage-mac";

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies persisted cache records
pub struct MessageAuthenticator {
    backend: Arc<dyn SecretsBackend>,
    key: OnceCell<Vec<u8>>,
}

impl MessageAuthenticator {
    /// Authenticator keyed from (or creating) the process-wide HKDF secret
    pub fn new(backend: Arc<dyn SecretsBackend>) -> Self {
        Self {
            backend,
            key: OnceCell::new(),
        }
    }

    /// Load the MAC key, creating the backing secret on first use
    pub async fn ensure_key(&self) -> Result<&[u8], MacError> {
        self.key
            .get_or_try_init(|| async { self.load_or_create_key().await })
            .await
            .map(Vec::as_slice)
    }

    async fn load_or_create_key(&self) -> Result<Vec<u8>, MacError> {
        if let Some(secret) = self.backend.get(HKDF_SECRET_NAME).await? {
            return extract_key(&secret);
        }

        let key = derive_key()?;
        let secret = key_secret(&key);
        match self.backend.create(&secret).await {
            Ok(_) => {
                info!(name = HKDF_SECRET_NAME, "created storage mac key secret");
                Ok(key)
            }
            // Lost the creation race: take the winner's key.
            Err(crate::core::error::BackendError::AlreadyExists { .. }) => {
                let secret = self.backend.get(HKDF_SECRET_NAME).await?.ok_or(
                    MacError::MissingKeyField {
                        field: HKDF_KEY_FIELD,
                    },
                )?;
                extract_key(&secret)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// HMAC-SHA256 over `message`
    pub async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, MacError> {
        let key = self.ensure_key().await?;
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| MacError::Derive(e.to_string()))?;
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Constant-time verification of `mac` against `message`
    pub async fn verify(&self, message: &[u8], mac: &[u8]) -> Result<bool, MacError> {
        let expected = self.sign(message).await?;
        Ok(expected.ct_eq(mac).into())
    }
}

fn derive_key() -> Result<Vec<u8>, MacError> {
    let mut ikm = [0u8; IKM_LEN];
    rand::thread_rng().fill_bytes(&mut ikm);
    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = vec![0u8; MAC_KEY_LEN];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|e| MacError::Derive(e.to_string()))?;
    Ok(okm)
}

fn extract_key(secret: &Secret) -> Result<Vec<u8>, MacError> {
    let data = secret.data.as_ref().ok_or(MacError::MissingKeyField {
        field: HKDF_KEY_FIELD,
    })?;
    let key = data
        .get(HKDF_KEY_FIELD)
        .ok_or(MacError::MissingKeyField {
            field: HKDF_KEY_FIELD,
        })?
        .0
        .clone();
    if key.len() != MAC_KEY_LEN {
        return Err(MacError::InvalidKeyLength {
            len: key.len(),
            expected: MAC_KEY_LEN,
        });
    }
    Ok(key)
}

fn key_secret(key: &[u8]) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(HKDF_KEY_FIELD.to_string(), ByteString(key.to_vec()));
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        "vault-secrets-operator".to_string(),
    );
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        "client-cache-storage-verification".to_string(),
    );
    Secret {
        metadata: ObjectMeta {
            name: Some(HKDF_SECRET_NAME.to_string()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        immutable: Some(true),
        data: Some(data),
        ..Secret::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemorySecretsBackend;

    fn authenticator() -> (Arc<MemorySecretsBackend>, MessageAuthenticator) {
        let backend = Arc::new(MemorySecretsBackend::new());
        let mac = MessageAuthenticator::new(Arc::clone(&backend) as Arc<dyn SecretsBackend>);
        (backend, mac)
    }

    #[tokio::test]
    async fn ensure_key_creates_immutable_secret() {
        let (backend, mac) = authenticator();
        let key = mac.ensure_key().await.unwrap().to_vec();
        assert_eq!(key.len(), MAC_KEY_LEN);

        let stored = backend.get(HKDF_SECRET_NAME).await.unwrap().unwrap();
        assert_eq!(stored.immutable, Some(true));
        assert_eq!(stored.data.unwrap().get(HKDF_KEY_FIELD).unwrap().0, key);
    }

    #[tokio::test]
    async fn second_authenticator_reuses_stored_key() {
        let (backend, first) = authenticator();
        let sig = first.sign(b"message").await.unwrap();

        let second = MessageAuthenticator::new(backend as Arc<dyn SecretsBackend>);
        assert!(second.verify(b"message", &sig).await.unwrap());
    }

    #[tokio::test]
    async fn sign_verify_round_trip() {
        let (_, mac) = authenticator();
        let sig = mac.sign(b"name-key-payload").await.unwrap();
        assert_eq!(sig.len(), 32);
        assert!(mac.verify(b"name-key-payload", &sig).await.unwrap());
    }

    #[tokio::test]
    async fn bit_flips_fail_verification() {
        let (_, mac) = authenticator();
        let sig = mac.sign(b"payload").await.unwrap();

        let mut flipped_mac = sig.clone();
        flipped_mac[0] ^= 0x01;
        assert!(!mac.verify(b"payload", &flipped_mac).await.unwrap());

        assert!(!mac.verify(b"pavload", &sig).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_length_stored_key_is_rejected() {
        let (backend, _) = authenticator();
        backend.create(&key_secret(&[0u8; 8])).await.unwrap();

        let mac = MessageAuthenticator::new(backend as Arc<dyn SecretsBackend>);
        let err = mac.ensure_key().await.unwrap_err();
        assert!(matches!(
            err,
            MacError::InvalidKeyLength {
                len: 8,
                expected: MAC_KEY_LEN
            }
        ));
    }

    #[tokio::test]
    async fn missing_key_field_is_rejected() {
        let (backend, _) = authenticator();
        let mut secret = key_secret(&[0u8; MAC_KEY_LEN]);
        secret.data = None;
        backend.create(&secret).await.unwrap();

        let mac = MessageAuthenticator::new(backend as Arc<dyn SecretsBackend>);
        assert!(matches!(
            mac.ensure_key().await.unwrap_err(),
            MacError::MissingKeyField { .. }
        ));
    }
}
