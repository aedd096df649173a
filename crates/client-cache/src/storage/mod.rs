//! Encrypted persistent cache of Vault session tokens.
//!
//! Each live client's last auth response is persisted as an immutable
//! Kubernetes Secret named `vso-cc-<cacheKey>` in the operator namespace,
//! so a restarted operator resumes sessions instead of re-authenticating
//! the whole fleet. Records carry an HMAC over `name || cacheKey ||
//! secret` and are optionally encrypted through Vault's transit engine;
//! a record that fails verification is quarantined (deleted, unless the
//! caller opts out) and never trusted.
//!
//! Updates are delete-then-create: records are immutable by design.

/// The Kubernetes/in-memory backend seam
pub mod backend;
/// HMAC authentication of records
pub mod mac;
/// Transit encryption of record payloads
pub mod transit;

pub use backend::{KubeSecretsBackend, MemorySecretsBackend, SecretsBackend};
pub use mac::{HKDF_SECRET_NAME, MessageAuthenticator};
pub use transit::TransitCodec;

use crate::client::VaultClient;
use crate::core::error::{BackendError, StorageError};
use crate::core::key::CacheKey;
use crate::metrics::Metrics;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use vault_api::VaultSecret;

/// Name prefix of every persisted cache record
pub const RECORD_PREFIX: &str = "vso-cc-";

const DATA_KEY_SECRET: &str = "secret";
const DATA_KEY_MAC: &str = "messageMAC";

const LABEL_APP_NAME: &str = "app.kubernetes.io/name";
const LABEL_APP_NAME_VALUE: &str = "vault-secrets-operator";
const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
const LABEL_COMPONENT_VALUE: &str = "client-cache-storage";
const LABEL_CACHE_KEY: &str = "cacheKey";
const LABEL_AUTH_REF: &str = "vaultAuthRefUIDGen";
const LABEL_CONNECTION_REF: &str = "vaultConnectionRefUIDGen";
const LABEL_ENCRYPTED: &str = "encrypted";
const LABEL_TRANSIT_REF: &str = "vaultTransitRef";

/// Selector matching every cache record (and nothing else)
pub fn common_selector() -> String {
    format!("{LABEL_APP_NAME}={LABEL_APP_NAME_VALUE},{LABEL_COMPONENT}={LABEL_COMPONENT_VALUE}")
}

/// Selector matching records for one auth resource generation
pub fn auth_selector(uid: &str, generation: i64) -> String {
    format!("{},{LABEL_AUTH_REF}={uid}_{generation}", common_selector())
}

/// Selector matching records for one connection resource generation
pub fn connection_selector(uid: &str, generation: i64) -> String {
    format!(
        "{},{LABEL_CONNECTION_REF}={uid}_{generation}",
        common_selector()
    )
}

/// The record name for a client (clone records carry the namespace suffix)
pub fn record_name(client: &VaultClient) -> Result<String, StorageError> {
    let key_label = record_key_label(client)?;
    Ok(format!("{RECORD_PREFIX}{key_label}"))
}

fn record_key_label(client: &VaultClient) -> Result<String, StorageError> {
    if let Some(clone_key) = client.clone_key() {
        return Ok(clone_key.to_string());
    }
    client
        .cache_key()
        .map(ToString::to_string)
        .map_err(|_| StorageError::MissingField {
            name: String::new(),
            field: "client.cacheKey",
        })
}

/// A verified record pulled from storage
#[derive(Debug, Clone)]
pub struct StoredRecord {
    /// Record name
    pub name: String,
    /// The cache key label on the record
    pub cache_key: String,
    /// The restored auth response
    pub secret: VaultSecret,
    /// Whether the payload was transit-encrypted at rest
    pub encrypted: bool,
}

/// Store a client's session
pub struct StoreRequest<'a> {
    /// The client to persist; must hold a login response
    pub client: &'a Arc<VaultClient>,
    /// Encrypt the payload with this codec
    pub transit: Option<&'a TransitCodec>,
}

/// Restore one record by cache key
pub struct RestoreRequest<'a> {
    /// The cache key to restore
    pub cache_key: &'a CacheKey,
    /// Decrypt encrypted records with this codec
    pub transit: Option<&'a TransitCodec>,
    /// Leave tampered records in place instead of deleting them
    pub no_prune_on_error: bool,
}

/// Restore every record
pub struct RestoreAllRequest<'a> {
    /// Decrypt encrypted records with this codec
    pub transit: Option<&'a TransitCodec>,
    /// Leave tampered records in place instead of deleting them
    pub no_prune_on_error: bool,
}

/// Delete records matching a selector
pub struct PruneRequest<'a> {
    /// Equality-based label selector
    pub label_selector: String,
    /// Records the filter returns true for survive the prune
    pub retain: Option<&'a (dyn Fn(&Secret) -> bool + Send + Sync)>,
}

/// The persistent store
pub struct ClientCacheStorage {
    backend: Arc<dyn SecretsBackend>,
    mac: MessageAuthenticator,
    enforce_encryption: bool,
    metrics: Arc<Metrics>,
}

impl ClientCacheStorage {
    /// A store over `backend`. With `enforce_encryption`, unencrypted
    /// store requests are refused.
    pub fn new(
        backend: Arc<dyn SecretsBackend>,
        enforce_encryption: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mac = MessageAuthenticator::new(Arc::clone(&backend));
        Self {
            backend,
            mac,
            enforce_encryption,
            metrics,
        }
    }

    /// Whether unencrypted records are refused
    pub fn enforce_encryption(&self) -> bool {
        self.enforce_encryption
    }

    /// Persist the client's current auth response
    pub async fn store(&self, req: StoreRequest<'_>) -> Result<StoredRecord, StorageError> {
        let result = self.store_inner(&req).await;
        self.metrics.record_storage_request(result.is_err());
        result
    }

    async fn store_inner(&self, req: &StoreRequest<'_>) -> Result<StoredRecord, StorageError> {
        let key_label = record_key_label(req.client)?;
        let name = format!("{RECORD_PREFIX}{key_label}");

        let auth = req
            .client
            .last_auth()
            .ok_or_else(|| StorageError::MissingField {
                name: name.clone(),
                field: "authSecret",
            })?;
        if self.enforce_encryption && req.transit.is_none() {
            return Err(StorageError::EncryptionRequired);
        }

        let plain = serde_json::to_vec(&auth)?;
        let payload = match req.transit {
            Some(codec) => codec.encrypt(&plain).await?,
            None => plain,
        };
        let mac = self
            .mac
            .sign(&mac_message(&name, &key_label, &payload))
            .await?;

        let record = self.build_record(req, &name, &key_label, payload, mac)?;
        match self.backend.create(&record).await {
            Ok(_) => {}
            // Records are immutable: replace is delete-then-create.
            Err(BackendError::AlreadyExists { .. }) => {
                debug!(name = %name, "replacing existing cache record");
                self.delete_record(&name).await?;
                self.backend.create(&record).await?;
            }
            Err(e) => {
                self.metrics.record_storage_operation("store", true);
                return Err(e.into());
            }
        }
        self.metrics.record_storage_operation("store", false);
        Ok(StoredRecord {
            name,
            cache_key: key_label,
            secret: auth,
            encrypted: req.transit.is_some(),
        })
    }

    fn build_record(
        &self,
        req: &StoreRequest<'_>,
        name: &str,
        key_label: &str,
        payload: Vec<u8>,
        mac: Vec<u8>,
    ) -> Result<Secret, StorageError> {
        let identity = req
            .client
            .identity_ref()
            .ok_or_else(|| StorageError::MissingField {
                name: name.to_string(),
                field: "client.identity",
            })?;

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_APP_NAME.to_string(), LABEL_APP_NAME_VALUE.to_string());
        labels.insert(
            LABEL_COMPONENT.to_string(),
            LABEL_COMPONENT_VALUE.to_string(),
        );
        labels.insert(LABEL_CACHE_KEY.to_string(), key_label.to_string());
        labels.insert(
            LABEL_AUTH_REF.to_string(),
            format!("{}_{}", identity.auth().uid, identity.auth().generation),
        );
        labels.insert(
            LABEL_CONNECTION_REF.to_string(),
            format!(
                "{}_{}",
                identity.connection().uid,
                identity.connection().generation
            ),
        );
        labels.insert(
            LABEL_ENCRYPTED.to_string(),
            req.transit.is_some().to_string(),
        );
        if let Some(codec) = req.transit {
            labels.insert(LABEL_TRANSIT_REF.to_string(), codec.ref_name().to_string());
        }

        let mut data = BTreeMap::new();
        data.insert(DATA_KEY_SECRET.to_string(), ByteString(payload));
        data.insert(DATA_KEY_MAC.to_string(), ByteString(mac));

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            immutable: Some(true),
            data: Some(data),
            ..Secret::default()
        })
    }

    /// Restore one record by cache key; verifies the MAC and decrypts
    /// before anything is trusted
    pub async fn restore(&self, req: RestoreRequest<'_>) -> Result<StoredRecord, StorageError> {
        let result = self.restore_inner(&req).await;
        self.metrics
            .record_storage_operation("restore", result.is_err());
        self.metrics.record_storage_request(result.is_err());
        result
    }

    async fn restore_inner(&self, req: &RestoreRequest<'_>) -> Result<StoredRecord, StorageError> {
        let name = format!("{RECORD_PREFIX}{}", req.cache_key);
        let secret = self
            .backend
            .get(&name)
            .await?
            .ok_or_else(|| StorageError::EntryNotFound { name: name.clone() })?;
        self.decode_record(&secret, req.transit, req.no_prune_on_error)
            .await
    }

    /// Restore every record; individually bad records are quarantined and
    /// skipped rather than failing the whole restore
    pub async fn restore_all(
        &self,
        req: RestoreAllRequest<'_>,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        let secrets = self
            .backend
            .list(&common_selector())
            .await
            .map_err(StorageError::List)?;
        self.metrics.record_storage_operation("list", false);

        let mut records = Vec::with_capacity(secrets.len());
        for secret in &secrets {
            match self
                .decode_record(secret, req.transit, req.no_prune_on_error)
                .await
            {
                Ok(record) => records.push(record),
                Err(e) => {
                    let name = secret.metadata.name.as_deref().unwrap_or_default();
                    warn!(name, error = %e, "skipping unrestorable cache record");
                }
            }
        }
        Ok(records)
    }

    async fn decode_record(
        &self,
        secret: &Secret,
        transit: Option<&TransitCodec>,
        no_prune_on_error: bool,
    ) -> Result<StoredRecord, StorageError> {
        let name = secret
            .metadata
            .name
            .clone()
            .ok_or_else(|| StorageError::MissingField {
                name: String::new(),
                field: "metadata.name",
            })?;
        let result = self.verify_and_decrypt(secret, &name, transit).await;
        if let Err(e) = &result {
            if quarantines(e) && !no_prune_on_error {
                warn!(name = %name, error = %e, "quarantining tampered cache record");
                if let Err(del) = self.delete_record(&name).await {
                    warn!(name = %name, error = %del, "failed to delete quarantined record");
                }
            }
        }
        result
    }

    async fn verify_and_decrypt(
        &self,
        secret: &Secret,
        name: &str,
        transit: Option<&TransitCodec>,
    ) -> Result<StoredRecord, StorageError> {
        let missing = |field: &'static str| StorageError::MissingField {
            name: name.to_string(),
            field,
        };
        let labels = secret.metadata.labels.clone().unwrap_or_default();
        let key_label = labels
            .get(LABEL_CACHE_KEY)
            .ok_or(missing("labels.cacheKey"))?
            .clone();
        let data = secret.data.as_ref().ok_or(missing("data"))?;
        let payload = &data.get(DATA_KEY_SECRET).ok_or(missing("data.secret"))?.0;
        let mac = &data.get(DATA_KEY_MAC).ok_or(missing("data.messageMAC"))?.0;

        let verified = self
            .mac
            .verify(&mac_message(name, &key_label, payload), mac)
            .await?;
        if !verified {
            return Err(StorageError::InvalidMac {
                name: name.to_string(),
            });
        }

        let encrypted = labels
            .get(LABEL_ENCRYPTED)
            .is_some_and(|v| v == "true");
        let plain = if encrypted {
            let codec = transit.ok_or(StorageError::EncryptionRequired)?;
            codec.decrypt(payload).await?
        } else {
            payload.clone()
        };
        let auth: VaultSecret = serde_json::from_slice(&plain)?;
        Ok(StoredRecord {
            name: name.to_string(),
            cache_key: key_label,
            secret: auth,
            encrypted,
        })
    }

    /// Delete the persisted record for one client. Idempotent.
    pub async fn prune_client(&self, client: &Arc<VaultClient>) -> Result<(), StorageError> {
        let name = record_name(client)?;
        self.delete_record(&name).await
    }

    /// Delete every record the selector matches and the retain filter does
    /// not save. Individual delete failures are counted, not fatal.
    pub async fn prune(&self, req: PruneRequest<'_>) -> Result<usize, StorageError> {
        let secrets = self
            .backend
            .list(&req.label_selector)
            .await
            .map_err(StorageError::List)?;

        let total = secrets.len();
        let mut deleted = 0usize;
        let mut failed = 0usize;
        for secret in secrets {
            if req.retain.is_some_and(|keep| keep(&secret)) {
                continue;
            }
            let Some(name) = secret.metadata.name.as_deref() else {
                continue;
            };
            match self.delete_record(name).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    failed += 1;
                    warn!(name, error = %e, "prune deletion failed");
                }
            }
        }
        if failed > 0 {
            return Err(StorageError::Prune { failed, total });
        }
        Ok(deleted)
    }

    /// Delete every record
    pub async fn purge(&self) -> Result<usize, StorageError> {
        self.prune(PruneRequest {
            label_selector: common_selector(),
            retain: None,
        })
        .await
    }

    /// Number of persisted records
    pub async fn len(&self) -> Result<usize, StorageError> {
        let secrets = self
            .backend
            .list(&common_selector())
            .await
            .map_err(StorageError::List)?;
        let n = secrets.len();
        self.metrics.set_storage_length(n as i64);
        Ok(n)
    }

    async fn delete_record(&self, name: &str) -> Result<(), StorageError> {
        let result = self.backend.delete(name).await;
        self.metrics
            .record_storage_operation("delete", result.is_err());
        result.map_err(Into::into)
    }
}

fn mac_message(name: &str, key_label: &str, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(name.len() + key_label.len() + payload.len());
    message.extend_from_slice(name.as_bytes());
    message.extend_from_slice(key_label.as_bytes());
    message.extend_from_slice(payload);
    message
}

/// Whether this failure means the record can never be trusted again
fn quarantines(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::InvalidMac { .. }
            | StorageError::TransitDecode(_)
            | StorageError::Serde(_)
            | StorageError::MissingField { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestContext};
    use pretty_assertions::assert_eq;
    use prometheus_client::registry::Registry;

    fn store_over(
        backend: Arc<MemorySecretsBackend>,
        enforce: bool,
    ) -> ClientCacheStorage {
        let metrics = crate::metrics::Metrics::new(&mut Registry::default());
        ClientCacheStorage::new(backend as Arc<dyn SecretsBackend>, enforce, metrics)
    }

    #[tokio::test]
    async fn store_then_restore_round_trips() {
        let ctx = TestContext::new();
        let backend = Arc::new(MemorySecretsBackend::new());
        let storage = store_over(Arc::clone(&backend), false);
        let client = testing::logged_in_client(&ctx).await;
        let key = client.cache_key().unwrap().clone();

        let stored = storage
            .store(StoreRequest {
                client: &client,
                transit: None,
            })
            .await
            .unwrap();
        assert_eq!(stored.name, format!("{RECORD_PREFIX}{key}"));
        assert!(!stored.encrypted);

        let restored = storage
            .restore(RestoreRequest {
                cache_key: &key,
                transit: None,
                no_prune_on_error: false,
            })
            .await
            .unwrap();
        assert_eq!(restored.cache_key, key.to_string());
        assert_eq!(
            restored.secret.auth.unwrap().client_token,
            "hvs.fixture"
        );
    }

    #[tokio::test]
    async fn record_is_immutable_and_labelled() {
        let ctx = TestContext::new();
        let backend = Arc::new(MemorySecretsBackend::new());
        let storage = store_over(Arc::clone(&backend), false);
        let client = testing::logged_in_client(&ctx).await;

        let stored = storage
            .store(StoreRequest {
                client: &client,
                transit: None,
            })
            .await
            .unwrap();
        let raw = backend.get(&stored.name).await.unwrap().unwrap();
        assert_eq!(raw.immutable, Some(true));
        let labels = raw.metadata.labels.unwrap();
        assert_eq!(labels.get(LABEL_APP_NAME).unwrap(), LABEL_APP_NAME_VALUE);
        assert_eq!(labels.get(LABEL_ENCRYPTED).unwrap(), "false");
        assert_eq!(labels.get(LABEL_CACHE_KEY).unwrap(), &stored.cache_key);
        assert!(labels.get(LABEL_AUTH_REF).unwrap().ends_with("_0"));
    }

    #[tokio::test]
    async fn second_store_replaces_existing_record() {
        let ctx = TestContext::new();
        let backend = Arc::new(MemorySecretsBackend::new());
        let storage = store_over(Arc::clone(&backend), false);
        let client = testing::logged_in_client(&ctx).await;

        storage
            .store(StoreRequest {
                client: &client,
                transit: None,
            })
            .await
            .unwrap();
        client
            .restore(testing::auth_secret("hvs.second", 3600, false))
            .unwrap();
        storage
            .store(StoreRequest {
                client: &client,
                transit: None,
            })
            .await
            .unwrap();

        assert_eq!(backend.len(), 2); // record + hkdf key secret
        let restored = storage
            .restore(RestoreRequest {
                cache_key: client.cache_key().unwrap(),
                transit: None,
                no_prune_on_error: false,
            })
            .await
            .unwrap();
        assert_eq!(restored.secret.auth.unwrap().client_token, "hvs.second");
    }

    #[tokio::test]
    async fn tampered_record_is_deleted_by_default() {
        let ctx = TestContext::new();
        let backend = Arc::new(MemorySecretsBackend::new());
        let storage = store_over(Arc::clone(&backend), false);
        let client = testing::logged_in_client(&ctx).await;
        let key = client.cache_key().unwrap().clone();

        let stored = storage
            .store(StoreRequest {
                client: &client,
                transit: None,
            })
            .await
            .unwrap();

        // Flip one bit of the payload behind the MAC's back.
        let mut raw = backend.get(&stored.name).await.unwrap().unwrap();
        if let Some(data) = raw.data.as_mut() {
            let mut payload = data.get(DATA_KEY_SECRET).unwrap().0.clone();
            payload[0] ^= 0x01;
            data.insert(DATA_KEY_SECRET.to_string(), ByteString(payload));
        }
        backend.delete(&stored.name).await.unwrap();
        backend.create(&raw).await.unwrap();

        let err = storage
            .restore(RestoreRequest {
                cache_key: &key,
                transit: None,
                no_prune_on_error: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidMac { .. }));
        assert!(backend.get(&stored.name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_prune_on_error_keeps_tampered_record() {
        let ctx = TestContext::new();
        let backend = Arc::new(MemorySecretsBackend::new());
        let storage = store_over(Arc::clone(&backend), false);
        let client = testing::logged_in_client(&ctx).await;
        let key = client.cache_key().unwrap().clone();

        let stored = storage
            .store(StoreRequest {
                client: &client,
                transit: None,
            })
            .await
            .unwrap();
        let mut raw = backend.get(&stored.name).await.unwrap().unwrap();
        if let Some(data) = raw.data.as_mut() {
            let mut mac = data.get(DATA_KEY_MAC).unwrap().0.clone();
            mac[4] ^= 0xFF;
            data.insert(DATA_KEY_MAC.to_string(), ByteString(mac));
        }
        backend.delete(&stored.name).await.unwrap();
        backend.create(&raw).await.unwrap();

        let err = storage
            .restore(RestoreRequest {
                cache_key: &key,
                transit: None,
                no_prune_on_error: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidMac { .. }));
        assert!(backend.get(&stored.name).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn enforce_encryption_refuses_plain_store() {
        let ctx = TestContext::new();
        let backend = Arc::new(MemorySecretsBackend::new());
        let storage = store_over(backend, true);
        let client = testing::logged_in_client(&ctx).await;

        let err = storage
            .store(StoreRequest {
                client: &client,
                transit: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::EncryptionRequired));
    }

    #[tokio::test]
    async fn store_requires_login_response() {
        let ctx = TestContext::new();
        let backend = Arc::new(MemorySecretsBackend::new());
        let storage = store_over(backend, false);
        let client = testing::initialized_client(&ctx, 0).await;

        let err = storage
            .store(StoreRequest {
                client: &client,
                transit: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::MissingField {
                field: "authSecret",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn restore_missing_record_reports_not_found() {
        let ctx = TestContext::new();
        let backend = Arc::new(MemorySecretsBackend::new());
        let storage = store_over(backend, false);
        let client = testing::initialized_client(&ctx, 7).await;

        let err = storage
            .restore(RestoreRequest {
                cache_key: client.cache_key().unwrap(),
                transit: None,
                no_prune_on_error: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::EntryNotFound { .. }));
    }

    #[tokio::test]
    async fn restore_all_quarantines_bad_records() {
        let ctx = TestContext::new();
        let backend = Arc::new(MemorySecretsBackend::new());
        let storage = store_over(Arc::clone(&backend), false);

        let good = testing::logged_in_client(&ctx).await;
        storage
            .store(StoreRequest {
                client: &good,
                transit: None,
            })
            .await
            .unwrap();

        let bad = testing::initialized_client(&ctx, 1).await;
        bad.restore(testing::auth_secret("hvs.bad", 60, false))
            .unwrap();
        let bad_record = storage
            .store(StoreRequest {
                client: &bad,
                transit: None,
            })
            .await
            .unwrap();
        let mut raw = backend.get(&bad_record.name).await.unwrap().unwrap();
        if let Some(data) = raw.data.as_mut() {
            data.insert(DATA_KEY_MAC.to_string(), ByteString(vec![0u8; 32]));
        }
        backend.delete(&bad_record.name).await.unwrap();
        backend.create(&raw).await.unwrap();

        let records = storage
            .restore_all(RestoreAllRequest {
                transit: None,
                no_prune_on_error: false,
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cache_key, good.cache_key().unwrap().to_string());
        // The bad record was quarantined.
        assert!(backend.get(&bad_record.name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_honors_retain_filter() {
        let ctx = TestContext::new();
        let backend = Arc::new(MemorySecretsBackend::new());
        let storage = store_over(Arc::clone(&backend), false);

        for i in 0..3u64 {
            let client = testing::initialized_client(&ctx, i).await;
            client
                .restore(testing::auth_secret("hvs.n", 60, false))
                .unwrap();
            storage
                .store(StoreRequest {
                    client: &client,
                    transit: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(storage.len().await.unwrap(), 3);

        let keep = testing::initialized_client(&ctx, 0).await;
        let keep_name = record_name(&keep).unwrap();
        let retain = move |s: &Secret| s.metadata.name.as_deref() == Some(keep_name.as_str());
        let deleted = storage
            .prune(PruneRequest {
                label_selector: common_selector(),
                retain: Some(&retain),
            })
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(storage.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn purge_leaves_hkdf_secret_alone() {
        let ctx = TestContext::new();
        let backend = Arc::new(MemorySecretsBackend::new());
        let storage = store_over(Arc::clone(&backend), false);
        let client = testing::logged_in_client(&ctx).await;
        storage
            .store(StoreRequest {
                client: &client,
                transit: None,
            })
            .await
            .unwrap();

        let purged = storage.purge().await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(storage.len().await.unwrap(), 0);
        // The MAC key secret survives a purge.
        assert!(backend.get(HKDF_SECRET_NAME).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clone_records_carry_namespace_suffix() {
        let ctx = TestContext::new();
        let backend = Arc::new(MemorySecretsBackend::new());
        let storage = store_over(backend, false);
        let parent = testing::logged_in_client(&ctx).await;
        let clone = parent.clone_for_namespace("tenant-a").unwrap();

        let stored = storage
            .store(StoreRequest {
                client: &clone,
                transit: None,
            })
            .await
            .unwrap();
        assert!(stored.name.ends_with("-tenant-a"));
        assert_eq!(
            stored.name,
            format!("{RECORD_PREFIX}{}-tenant-a", parent.cache_key().unwrap())
        );
    }
}
